//! Restricted evaluator for declarative policy conditions.
//!
//! The grammar is intentionally closed: literals, boolean `and`/`or`/`not`,
//! the comparisons `== != > >= < <= in not in`, parentheses, and dotted
//! attribute access on names present in the evaluation context (`document`,
//! `result`). Anything else is rejected at parse time.

use mongoclaw_core::{Error, Result};
use serde_json::Value as JsonValue;

pub fn evaluate_condition(condition: &str, context: &JsonValue) -> Result<bool> {
    let tokens = tokenize(condition)?;
    let mut parser = Parser {
        tokens,
        position: 0,
    };
    let expr = parser.parse_or()?;
    parser.expect_end()?;
    Ok(truthy(&eval(&expr, context)?))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(f64),
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Dot,
    LParen,
    RParen,
}

fn invalid(message: impl Into<String>) -> Error {
    Error::Validation(format!("policy condition: {}", message.into()))
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&'\\') => {
                            if let Some(&escaped) = chars.get(i + 1) {
                                value.push(escaped);
                                i += 2;
                            } else {
                                return Err(invalid("unterminated escape"));
                            }
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                        None => return Err(invalid("unterminated string literal")),
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == 'e')
                {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let number = raw
                    .parse()
                    .map_err(|_| invalid(format!("bad number literal '{raw}'")))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(invalid(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(JsonValue),
    Name(String),
    Attr(Box<Expr>, String),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Compare {
        left: Box<Expr>,
        ops: Vec<(CmpOp, Expr)>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    In,
    NotIn,
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(word)) if word == keyword)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn expect_end(&self) -> Result<()> {
        if self.position == self.tokens.len() {
            Ok(())
        } else {
            Err(invalid("trailing tokens after expression"))
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut operands = vec![self.parse_and()?];
        while self.eat_keyword("or") {
            operands.push(self.parse_and()?);
        }
        Ok(if operands.len() == 1 {
            operands.pop().expect("non-empty")
        } else {
            Expr::Or(operands)
        })
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut operands = vec![self.parse_not()?];
        while self.peek_keyword("and") {
            self.position += 1;
            operands.push(self.parse_not()?);
        }
        Ok(if operands.len() == 1 {
            operands.pop().expect("non-empty")
        } else {
            Expr::And(operands)
        })
    }

    fn parse_not(&mut self) -> Result<Expr> {
        // "not in" belongs to comparison parsing, so only treat a leading
        // "not" as negation.
        if self.eat_keyword("not") {
            Ok(Expr::Not(Box::new(self.parse_not()?)))
        } else {
            self.parse_comparison()
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_operand()?;
        let mut ops = Vec::new();
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => Some(CmpOp::Eq),
                Some(Token::Ne) => Some(CmpOp::Ne),
                Some(Token::Gt) => Some(CmpOp::Gt),
                Some(Token::Ge) => Some(CmpOp::Ge),
                Some(Token::Lt) => Some(CmpOp::Lt),
                Some(Token::Le) => Some(CmpOp::Le),
                Some(Token::Ident(word)) if word == "in" => Some(CmpOp::In),
                Some(Token::Ident(word)) if word == "not" => {
                    if matches!(self.tokens.get(self.position + 1), Some(Token::Ident(next)) if next == "in")
                    {
                        Some(CmpOp::NotIn)
                    } else {
                        None
                    }
                }
                _ => None,
            };
            let Some(op) = op else { break };
            self.position += if op == CmpOp::NotIn { 2 } else { 1 };
            ops.push((op, self.parse_operand()?));
        }
        Ok(if ops.is_empty() {
            left
        } else {
            Expr::Compare {
                left: Box::new(left),
                ops,
            }
        })
    }

    fn parse_operand(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(invalid("expected ')'")),
                }
            }
            Some(Token::Str(value)) => Ok(Expr::Literal(JsonValue::String(value))),
            Some(Token::Number(value)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(value)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null),
            )),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" | "True" => Ok(Expr::Literal(JsonValue::Bool(true))),
                "false" | "False" => Ok(Expr::Literal(JsonValue::Bool(false))),
                "null" | "None" => Ok(Expr::Literal(JsonValue::Null)),
                "and" | "or" | "not" | "in" => Err(invalid(format!(
                    "keyword '{word}' cannot be used as a value"
                ))),
                _ => {
                    let mut expr = Expr::Name(word);
                    while self.peek() == Some(&Token::Dot) {
                        self.position += 1;
                        match self.advance() {
                            Some(Token::Ident(attr)) => {
                                expr = Expr::Attr(Box::new(expr), attr);
                            }
                            _ => return Err(invalid("expected attribute name after '.'")),
                        }
                    }
                    Ok(expr)
                }
            },
            other => Err(invalid(format!("unexpected token {other:?}"))),
        }
    }
}

fn eval(expr: &Expr, context: &JsonValue) -> Result<JsonValue> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Name(name) => context
            .get(name)
            .cloned()
            .ok_or_else(|| invalid(format!("unknown symbol '{name}'"))),
        Expr::Attr(base, attr) => {
            let base = eval(base, context)?;
            Ok(base.get(attr).cloned().unwrap_or(JsonValue::Null))
        }
        Expr::Not(inner) => Ok(JsonValue::Bool(!truthy(&eval(inner, context)?))),
        Expr::And(operands) => {
            for operand in operands {
                if !truthy(&eval(operand, context)?) {
                    return Ok(JsonValue::Bool(false));
                }
            }
            Ok(JsonValue::Bool(true))
        }
        Expr::Or(operands) => {
            for operand in operands {
                if truthy(&eval(operand, context)?) {
                    return Ok(JsonValue::Bool(true));
                }
            }
            Ok(JsonValue::Bool(false))
        }
        Expr::Compare { left, ops } => {
            let mut current = eval(left, context)?;
            for (op, right_expr) in ops {
                let right = eval(right_expr, context)?;
                if !compare(*op, &current, &right) {
                    return Ok(JsonValue::Bool(false));
                }
                current = right;
            }
            Ok(JsonValue::Bool(true))
        }
    }
}

fn truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(items) => !items.is_empty(),
        JsonValue::Object(map) => !map.is_empty(),
    }
}

fn numbers(a: &JsonValue, b: &JsonValue) -> Option<(f64, f64)> {
    Some((a.as_f64()?, b.as_f64()?))
}

fn loose_eq(a: &JsonValue, b: &JsonValue) -> bool {
    if let Some((x, y)) = numbers(a, b) {
        return x == y;
    }
    a == b
}

fn compare(op: CmpOp, left: &JsonValue, right: &JsonValue) -> bool {
    match op {
        CmpOp::Eq => loose_eq(left, right),
        CmpOp::Ne => !loose_eq(left, right),
        CmpOp::Gt | CmpOp::Ge | CmpOp::Lt | CmpOp::Le => {
            let ordering = match (left, right) {
                (JsonValue::String(a), JsonValue::String(b)) => a.partial_cmp(b),
                _ => numbers(left, right).and_then(|(a, b)| a.partial_cmp(&b)),
            };
            match ordering {
                Some(ordering) => match op {
                    CmpOp::Gt => ordering.is_gt(),
                    CmpOp::Ge => ordering.is_ge(),
                    CmpOp::Lt => ordering.is_lt(),
                    CmpOp::Le => ordering.is_le(),
                    _ => unreachable!(),
                },
                None => false,
            }
        }
        CmpOp::In => membership(left, right),
        CmpOp::NotIn => !membership(left, right),
    }
}

fn membership(needle: &JsonValue, haystack: &JsonValue) -> bool {
    match haystack {
        JsonValue::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        JsonValue::String(s) => needle.as_str().map(|n| s.contains(n)).unwrap_or(false),
        JsonValue::Object(map) => needle.as_str().map(|n| map.contains_key(n)).unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> JsonValue {
        json!({
            "document": {"priority": 7, "status": "new", "customer": {"tier": "gold"}},
            "result": {"category": "billing", "confidence": 0.92, "tags": ["urgent", "payment"]},
        })
    }

    #[test]
    fn comparisons() {
        assert!(evaluate_condition("document.priority > 5", &ctx()).unwrap());
        assert!(evaluate_condition("document.priority >= 7", &ctx()).unwrap());
        assert!(!evaluate_condition("document.priority < 7", &ctx()).unwrap());
        assert!(evaluate_condition("result.category == 'billing'", &ctx()).unwrap());
        assert!(evaluate_condition("result.category != 'refund'", &ctx()).unwrap());
    }

    #[test]
    fn boolean_connectives() {
        assert!(evaluate_condition(
            "document.status == 'new' and result.confidence > 0.9",
            &ctx()
        )
        .unwrap());
        assert!(evaluate_condition(
            "document.status == 'closed' or result.category == 'billing'",
            &ctx()
        )
        .unwrap());
        assert!(evaluate_condition("not document.archived", &ctx()).unwrap());
        assert!(evaluate_condition(
            "(document.priority > 9 or result.confidence > 0.9) and document.status == 'new'",
            &ctx()
        )
        .unwrap());
    }

    #[test]
    fn membership() {
        assert!(evaluate_condition("'urgent' in result.tags", &ctx()).unwrap());
        assert!(evaluate_condition("'spam' not in result.tags", &ctx()).unwrap());
        assert!(evaluate_condition("'ill' in result.category", &ctx()).unwrap());
        assert!(evaluate_condition("'tier' in document.customer", &ctx()).unwrap());
    }

    #[test]
    fn dotted_access_and_missing_attrs() {
        assert!(evaluate_condition("document.customer.tier == 'gold'", &ctx()).unwrap());
        // Missing attribute evaluates to null, not an error.
        assert!(!evaluate_condition("document.customer.missing == 'x'", &ctx()).unwrap());
        assert!(evaluate_condition("document.customer.missing == null", &ctx()).unwrap());
    }

    #[test]
    fn chained_comparison() {
        assert!(evaluate_condition("1 < document.priority <= 7", &ctx()).unwrap());
        assert!(!evaluate_condition("1 < document.priority < 5", &ctx()).unwrap());
    }

    #[test]
    fn unknown_symbols_are_rejected() {
        assert!(evaluate_condition("payload.x == 1", &ctx()).is_err());
    }

    #[test]
    fn out_of_grammar_input_is_rejected() {
        assert!(evaluate_condition("document.priority + 1 > 2", &ctx()).is_err());
        assert!(evaluate_condition("__import__('os')", &ctx()).is_err());
        assert!(evaluate_condition("document.priority >", &ctx()).is_err());
        assert!(evaluate_condition("document.priority == 1 extra", &ctx()).is_err());
        assert!(evaluate_condition("'unterminated", &ctx()).is_err());
    }

    #[test]
    fn python_style_literals() {
        assert!(evaluate_condition("True", &ctx()).unwrap());
        assert!(!evaluate_condition("False or None", &ctx()).unwrap());
    }
}

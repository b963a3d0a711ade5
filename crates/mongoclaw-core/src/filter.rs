use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use tracing::warn;

/// Evaluate a MongoDB-style filter document against a JSON document.
///
/// Supports field equality, the comparison operators `$eq $ne $gt $gte $lt
/// $lte $in $nin $exists $type $regex`, the logical operators `$and $or $not
/// $nor`, dot paths and array-index paths. Unknown operators are logged and
/// treated as trivially true so stored rules stay forward compatible.
pub fn matches_filter(document: &JsonValue, filter: &JsonValue) -> bool {
    let Some(clauses) = filter.as_object() else {
        return true;
    };
    clauses.iter().all(|(key, value)| {
        if key.starts_with('$') {
            eval_logical(key, value, document)
        } else {
            matches_field(document, key, value)
        }
    })
}

fn matches_field(document: &JsonValue, field: &str, expected: &JsonValue) -> bool {
    let actual = field_value(document, field);
    match expected {
        JsonValue::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => ops
            .iter()
            .all(|(op, value)| eval_comparison(op, actual, value)),
        _ => actual == Some(expected),
    }
}

/// Dot-path lookup with array indices, e.g. `items.0.sku`.
pub fn field_value<'a>(document: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut current = document;
    for part in path.split('.') {
        current = match current {
            JsonValue::Object(map) => map.get(part)?,
            JsonValue::Array(items) => {
                let idx: usize = part.parse().ok()?;
                items.get(idx)?
            }
            _ => return None,
        };
    }
    Some(current)
}

fn eval_logical(op: &str, value: &JsonValue, document: &JsonValue) -> bool {
    match op {
        "$and" => as_clauses(value)
            .iter()
            .all(|clause| matches_filter(document, clause)),
        "$or" => as_clauses(value)
            .iter()
            .any(|clause| matches_filter(document, clause)),
        "$not" => !matches_filter(document, value),
        "$nor" => !as_clauses(value)
            .iter()
            .any(|clause| matches_filter(document, clause)),
        other => {
            warn!(operator = other, "unknown top-level filter operator");
            true
        }
    }
}

fn as_clauses(value: &JsonValue) -> Vec<&JsonValue> {
    match value {
        JsonValue::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn eval_comparison(op: &str, actual: Option<&JsonValue>, expected: &JsonValue) -> bool {
    match op {
        "$eq" => actual == Some(expected),
        "$ne" => actual != Some(expected),
        "$gt" => ordered(actual, expected).is_some_and(|o| o == Ordering::Greater),
        "$gte" => ordered(actual, expected).is_some_and(|o| o != Ordering::Less),
        "$lt" => ordered(actual, expected).is_some_and(|o| o == Ordering::Less),
        "$lte" => ordered(actual, expected).is_some_and(|o| o != Ordering::Greater),
        "$in" => contains(expected, actual),
        "$nin" => !contains(expected, actual),
        "$exists" => actual.is_some() == expected.as_bool().unwrap_or(true),
        "$type" => check_type(actual, expected),
        "$regex" => eval_regex(actual, expected),
        other => {
            warn!(operator = other, "unknown filter operator");
            true
        }
    }
}

fn ordered(actual: Option<&JsonValue>, expected: &JsonValue) -> Option<Ordering> {
    let actual = actual?;
    match (actual, expected) {
        (JsonValue::Number(a), JsonValue::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (JsonValue::String(a), JsonValue::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}

fn contains(haystack: &JsonValue, needle: Option<&JsonValue>) -> bool {
    let Some(needle) = needle else {
        return false;
    };
    match haystack {
        JsonValue::Array(items) => items.iter().any(|item| item == needle),
        other => other == needle,
    }
}

fn check_type(actual: Option<&JsonValue>, expected: &JsonValue) -> bool {
    let Some(actual) = actual else {
        return false;
    };
    let name = match expected {
        JsonValue::String(s) => s.as_str(),
        // BSON type numbers
        JsonValue::Number(n) => match n.as_i64() {
            Some(1) => "double",
            Some(2) => "string",
            Some(3) => "object",
            Some(4) => "array",
            Some(8) => "bool",
            Some(10) => "null",
            Some(16) | Some(18) => "int",
            _ => return false,
        },
        _ => return false,
    };
    match name {
        "double" => actual.is_f64() || actual.is_number(),
        "string" => actual.is_string(),
        "object" => actual.is_object(),
        "array" => actual.is_array(),
        "bool" => actual.is_boolean(),
        "null" => actual.is_null(),
        "int" | "long" => actual.is_i64() || actual.is_u64(),
        _ => false,
    }
}

fn eval_regex(actual: Option<&JsonValue>, expected: &JsonValue) -> bool {
    let Some(actual) = actual else {
        return false;
    };
    let (pattern, options) = match expected {
        JsonValue::String(p) => (p.as_str(), ""),
        JsonValue::Object(map) => (
            map.get("$regex").and_then(JsonValue::as_str).unwrap_or(""),
            map.get("$options").and_then(JsonValue::as_str).unwrap_or(""),
        ),
        _ => return false,
    };
    let pattern = if options.contains('i') {
        format!("(?i){pattern}")
    } else {
        pattern.to_string()
    };
    let haystack = match actual {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    };
    match regex::Regex::new(&pattern) {
        Ok(re) => re.is_match(&haystack),
        Err(err) => {
            warn!(error = %err, "invalid $regex pattern");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_equality() {
        let doc = json!({"status": "new", "priority": 3});
        assert!(matches_filter(&doc, &json!({"status": "new"})));
        assert!(!matches_filter(&doc, &json!({"status": "closed"})));
    }

    #[test]
    fn comparison_operators() {
        let doc = json!({"priority": 3, "score": 1.5});
        assert!(matches_filter(&doc, &json!({"priority": {"$gte": 3}})));
        assert!(matches_filter(&doc, &json!({"priority": {"$lt": 5}})));
        assert!(!matches_filter(&doc, &json!({"priority": {"$gt": 3}})));
        assert!(matches_filter(&doc, &json!({"score": {"$gt": 1}})));
        assert!(matches_filter(&doc, &json!({"priority": {"$ne": 4}})));
    }

    #[test]
    fn in_and_nin() {
        let doc = json!({"status": "new"});
        assert!(matches_filter(&doc, &json!({"status": {"$in": ["new", "open"]}})));
        assert!(matches_filter(&doc, &json!({"status": {"$nin": ["closed"]}})));
        assert!(!matches_filter(&doc, &json!({"status": {"$in": ["closed"]}})));
    }

    #[test]
    fn exists_and_type() {
        let doc = json!({"title": "x", "count": 2});
        assert!(matches_filter(&doc, &json!({"title": {"$exists": true}})));
        assert!(matches_filter(&doc, &json!({"missing": {"$exists": false}})));
        assert!(matches_filter(&doc, &json!({"title": {"$type": "string"}})));
        assert!(matches_filter(&doc, &json!({"count": {"$type": "int"}})));
        assert!(!matches_filter(&doc, &json!({"count": {"$type": "string"}})));
    }

    #[test]
    fn regex_operator() {
        let doc = json!({"title": "Card Declined"});
        assert!(matches_filter(&doc, &json!({"title": {"$regex": "declined", "$options": "i"}})));
        assert!(!matches_filter(&doc, &json!({"title": {"$regex": "refund"}})));
    }

    #[test]
    fn logical_operators() {
        let doc = json!({"status": "new", "priority": 7});
        assert!(matches_filter(
            &doc,
            &json!({"$and": [{"status": "new"}, {"priority": {"$gt": 5}}]})
        ));
        assert!(matches_filter(
            &doc,
            &json!({"$or": [{"status": "closed"}, {"priority": 7}]})
        ));
        assert!(matches_filter(&doc, &json!({"$not": {"status": "closed"}})));
        assert!(matches_filter(
            &doc,
            &json!({"$nor": [{"status": "closed"}, {"priority": 0}]})
        ));
    }

    #[test]
    fn dot_and_array_paths() {
        let doc = json!({"customer": {"tier": "gold"}, "items": [{"sku": "a-1"}]});
        assert!(matches_filter(&doc, &json!({"customer.tier": "gold"})));
        assert!(matches_filter(&doc, &json!({"items.0.sku": "a-1"})));
        assert!(!matches_filter(&doc, &json!({"items.1.sku": "a-1"})));
    }

    #[test]
    fn unknown_operator_passes() {
        let doc = json!({"x": 1});
        assert!(matches_filter(&doc, &json!({"x": {"$near": [0, 0]}})));
        assert!(matches_filter(&doc, &json!({"$future": {"x": 1}})));
    }
}

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("secret '{0}' not found")]
    SecretNotFound(String),

    #[error("agent '{0}' already exists")]
    AgentAlreadyExists(String),
    #[error("agent '{0}' not found")]
    AgentNotFound(String),
    #[error("agent '{0}' is disabled")]
    AgentDisabled(String),
    #[error("agent '{agent_id}' config error: {message}")]
    AgentConfig { agent_id: String, message: String },

    #[error("execution timed out after {timeout_seconds}s")]
    ExecutionTimeout {
        agent_id: String,
        work_item_id: String,
        timeout_seconds: f64,
    },
    #[error("max retries ({0}) exceeded")]
    MaxRetriesExceeded(u32),

    #[error("ai provider error: {0}")]
    AiProvider(String),
    #[error("rate limit exceeded for provider '{provider}'")]
    AiRateLimit {
        provider: String,
        retry_after: Option<f64>,
    },
    #[error("authentication failed for provider '{0}'")]
    AiAuth(String),
    #[error("provider connection failed: {0}")]
    AiConnectivity(String),
    #[error("failed to parse ai response: {0}")]
    AiParse(String),
    #[error("failed to render prompt: {0}")]
    PromptRender(String),

    #[error("queue connection error: {0}")]
    QueueConnection(String),
    #[error("queue '{0}' is full")]
    QueueFull(String),
    #[error("poison queue entry: {0}")]
    QueuePoison(String),
    #[error("queue error: {0}")]
    Queue(String),

    #[error("idempotency violation for key '{0}'")]
    Idempotency(String),
    #[error("write conflict ({reason}) for document '{document_id}'")]
    WriteConflict { document_id: String, reason: String },

    #[error("circuit breaker '{0}' is open")]
    CircuitBreakerOpen(String),
    #[error("instance '{0}' is not the leader")]
    NotLeader(String),

    #[error("access denied: {0}")]
    Auth(String),
    #[error("pii detected in field '{0}'")]
    PiiDetected(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Kinds that must never be retried: redelivery cannot change the outcome,
    /// or would repeat a side effect.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::Validation(_)
                | Error::SecretNotFound(_)
                | Error::AgentAlreadyExists(_)
                | Error::AgentNotFound(_)
                | Error::AgentDisabled(_)
                | Error::AgentConfig { .. }
                | Error::AiAuth(_)
                | Error::AiParse(_)
                | Error::PromptRender(_)
                | Error::WriteConflict { .. }
                | Error::Idempotency(_)
                | Error::MaxRetriesExceeded(_)
                | Error::Auth(_)
                | Error::PiiDetected(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        !self.is_terminal()
    }

    /// Short stable label used in metrics and DLQ metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Validation(_) => "validation",
            Error::SecretNotFound(_) => "secret_not_found",
            Error::AgentAlreadyExists(_) => "agent_already_exists",
            Error::AgentNotFound(_) => "agent_not_found",
            Error::AgentDisabled(_) => "agent_disabled",
            Error::AgentConfig { .. } => "agent_config",
            Error::ExecutionTimeout { .. } => "timeout",
            Error::MaxRetriesExceeded(_) => "max_retries_exceeded",
            Error::AiProvider(_) => "ai_provider",
            Error::AiRateLimit { .. } => "ai_rate_limit",
            Error::AiAuth(_) => "ai_auth",
            Error::AiConnectivity(_) => "ai_connectivity",
            Error::AiParse(_) => "ai_parse",
            Error::PromptRender(_) => "prompt_render",
            Error::QueueConnection(_) => "queue_connection",
            Error::QueueFull(_) => "queue_full",
            Error::QueuePoison(_) => "queue_poison",
            Error::Queue(_) => "queue",
            Error::Idempotency(_) => "idempotency",
            Error::WriteConflict { .. } => "write_conflict",
            Error::CircuitBreakerOpen(_) => "circuit_breaker_open",
            Error::NotLeader(_) => "not_leader",
            Error::Auth(_) => "auth",
            Error::PiiDetected(_) => "pii_detected",
            Error::Storage(_) => "storage",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_kinds_are_not_retryable() {
        assert!(Error::AgentNotFound("x".into()).is_terminal());
        assert!(Error::AiAuth("openai".into()).is_terminal());
        assert!(!Error::AiConnectivity("refused".into()).is_terminal());
        assert!(Error::AiRateLimit {
            provider: "openai".into(),
            retry_after: Some(1.0),
        }
        .is_retryable());
    }
}

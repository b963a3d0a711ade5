use mongoclaw_core::{AiRequest, AiResponse, Result};

/// The one capability the runtime needs from an LLM provider. Concrete
/// adapters (OpenAI, Anthropic, …) live outside this crate and are injected
/// at startup.
#[async_trait::async_trait]
pub trait AiProvider: Send + Sync + 'static {
    fn name(&self) -> &str;
    async fn complete(&self, request: AiRequest) -> Result<AiResponse>;
}

/// Returns a fixed body for every completion. Useful for tests and dry runs.
pub struct StaticProvider {
    content: String,
}

impl StaticProvider {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

#[async_trait::async_trait]
impl AiProvider for StaticProvider {
    fn name(&self) -> &str {
        "static"
    }

    async fn complete(&self, request: AiRequest) -> Result<AiResponse> {
        let prompt_tokens = (request.prompt.len() / 4) as u64;
        let completion_tokens = (self.content.len() / 4) as u64;
        Ok(AiResponse {
            content: self.content.clone(),
            model: request.model,
            provider: "static".into(),
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            cost_usd: 0.0,
            latency_ms: 0.0,
            finish_reason: "stop".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_provider_echoes_configured_content() {
        let provider = StaticProvider::new(r#"{"category": "billing"}"#);
        let response = provider
            .complete(AiRequest {
                model: "gpt-4o-mini".into(),
                prompt: "classify".into(),
                system_prompt: None,
                temperature: 0.0,
                max_tokens: 64,
                response_format: None,
                extra_params: Default::default(),
            })
            .await
            .unwrap();
        assert_eq!(response.content, r#"{"category": "billing"}"#);
        assert_eq!(response.model, "gpt-4o-mini");
        assert_eq!(response.finish_reason, "stop");
    }
}

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Request handed to an AI provider's `complete` capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    /// `json_object` when the agent carries a response schema.
    #[serde(default)]
    pub response_format: Option<String>,
    #[serde(default)]
    pub extra_params: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AiResponse {
    pub content: String,
    pub model: String,
    pub provider: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub latency_ms: f64,
    pub finish_reason: String,
}

use crate::errors::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

pub type AgentId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Replace,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "insert",
            ChangeOperation::Update => "update",
            ChangeOperation::Replace => "replace",
            ChangeOperation::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WriteStrategy {
    #[default]
    Merge,
    Replace,
    Append,
    Nested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyMode {
    #[default]
    Eventual,
    StrictPostCommit,
    Shadow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    #[default]
    Enrich,
    Block,
    Tag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FallbackAction {
    #[default]
    Skip,
    Enrich,
}

/// What MongoDB mutations an agent reacts to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    pub database: String,
    pub collection: String,
    #[serde(default = "default_operations")]
    pub operations: Vec<ChangeOperation>,
    #[serde(default)]
    pub filter: Option<JsonValue>,
    #[serde(default)]
    pub projection: Option<Vec<String>>,
}

fn default_operations() -> Vec<ChangeOperation> {
    vec![ChangeOperation::Insert, ChangeOperation::Update]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiSpec {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub response_schema: Option<JsonValue>,
    /// Fail the attempt on schema mismatch instead of log-and-proceed.
    #[serde(default)]
    pub strict_schema: bool,
    #[serde(default)]
    pub extra_params: BTreeMap<String, JsonValue>,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f64 {
    0.7
}
fn default_max_tokens() -> u32 {
    2048
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteConfig {
    #[serde(default)]
    pub strategy: WriteStrategy,
    #[serde(default)]
    pub target_database: Option<String>,
    #[serde(default)]
    pub target_collection: Option<String>,
    /// Response field -> document field mapping.
    #[serde(default)]
    pub fields: Option<BTreeMap<String, String>>,
    /// Nest all mapped output under a single field.
    #[serde(default)]
    pub target_field: Option<String>,
    /// Required for `nested`.
    #[serde(default)]
    pub path: Option<String>,
    /// Required for `append`.
    #[serde(default)]
    pub array_field: Option<String>,
    /// Template for a custom idempotency key.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default = "default_true")]
    pub include_metadata: bool,
    #[serde(default = "default_metadata_field")]
    pub metadata_field: String,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            strategy: WriteStrategy::Merge,
            target_database: None,
            target_collection: None,
            fields: None,
            target_field: None,
            path: None,
            array_field: None,
            idempotency_key: None,
            include_metadata: true,
            metadata_field: default_metadata_field(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_metadata_field() -> String {
    crate::hash::DEFAULT_METADATA_FIELD.into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: f64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_seconds: f64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: f64,
    #[serde(default)]
    pub rate_limit_requests: Option<u32>,
    #[serde(default)]
    pub cost_limit_usd: Option<f64>,
    #[serde(default)]
    pub token_limit: Option<u64>,
    /// 0 = lowest, 10 = highest.
    #[serde(default)]
    pub priority: u8,
    #[serde(default = "default_true")]
    pub deduplicate: bool,
    #[serde(default = "default_dedupe_window")]
    pub deduplicate_window_seconds: u64,
    #[serde(default)]
    pub consistency_mode: ConsistencyMode,
    #[serde(default)]
    pub max_concurrency: Option<u32>,
    #[serde(default)]
    pub require_document_hash_match: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_seconds: default_retry_delay(),
            retry_max_delay_seconds: default_retry_max_delay(),
            timeout_seconds: default_timeout(),
            rate_limit_requests: None,
            cost_limit_usd: None,
            token_limit: None,
            priority: 0,
            deduplicate: true,
            deduplicate_window_seconds: default_dedupe_window(),
            consistency_mode: ConsistencyMode::Eventual,
            max_concurrency: None,
            require_document_hash_match: false,
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> f64 {
    1.0
}
fn default_retry_max_delay() -> f64 {
    60.0
}
fn default_timeout() -> f64 {
    60.0
}
fn default_dedupe_window() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub action: PolicyAction,
    #[serde(default)]
    pub fallback_action: FallbackAction,
    #[serde(default)]
    pub simulation_mode: bool,
    #[serde(default = "default_tag_field")]
    pub tag_field: String,
    #[serde(default = "default_tag_value")]
    pub tag_value: String,
}

fn default_tag_field() -> String {
    "policy_tag".into()
}
fn default_tag_value() -> String {
    "matched".into()
}

/// A versioned enrichment rule: what to watch, what to ask, how to write back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: AgentId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub watch: WatchConfig,
    pub ai: AiSpec,
    #[serde(default)]
    pub write: WriteConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub policy: Option<PolicyConfig>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, JsonValue>,
    #[serde(default = "default_version")]
    pub version: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> u64 {
    1
}

const RESERVED_IDS: &[&str] = &["system", "admin", "root", "default", "all"];

impl AgentConfig {
    pub fn target_database(&self) -> &str {
        self.write
            .target_database
            .as_deref()
            .unwrap_or(&self.watch.database)
    }

    pub fn target_collection(&self) -> &str {
        self.write
            .target_collection
            .as_deref()
            .unwrap_or(&self.watch.collection)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_valid_slug(&self.id) {
            return Err(Error::Validation(format!(
                "agent id '{}' must be a lowercase slug",
                self.id
            )));
        }
        if RESERVED_IDS.contains(&self.id.as_str()) {
            return Err(Error::Validation(format!(
                "agent id '{}' is reserved",
                self.id
            )));
        }
        if self.name.is_empty() {
            return Err(Error::Validation("agent name must not be empty".into()));
        }
        if self.watch.operations.is_empty() {
            return Err(Error::Validation(
                "watch.operations must not be empty".into(),
            ));
        }
        if self.ai.prompt.is_empty() {
            return Err(Error::Validation("ai.prompt must not be empty".into()));
        }
        if !(0.0..=2.0).contains(&self.ai.temperature) {
            return Err(Error::Validation(
                "ai.temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if self.execution.priority > 10 {
            return Err(Error::Validation(
                "execution.priority must be between 0 and 10".into(),
            ));
        }
        if self.execution.retry_delay_seconds > self.execution.retry_max_delay_seconds {
            return Err(Error::Validation(
                "execution.retry_delay_seconds must not exceed retry_max_delay_seconds".into(),
            ));
        }
        match self.write.strategy {
            WriteStrategy::Append if self.write.array_field.is_none() => {
                return Err(Error::Validation(
                    "write.array_field is required for the append strategy".into(),
                ));
            }
            WriteStrategy::Nested if self.write.path.is_none() => {
                return Err(Error::Validation(
                    "write.path is required for the nested strategy".into(),
                ));
            }
            _ => {}
        }
        Ok(())
    }
}

fn is_valid_slug(id: &str) -> bool {
    if id.is_empty() || id.len() > 64 {
        return false;
    }
    let bytes = id.as_bytes();
    let inner_ok = bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-' || *b == b'_');
    let edge = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    inner_ok && edge(bytes[0]) && edge(bytes[bytes.len() - 1])
}

use crate::agent::AgentConfig;
use crate::ai::AiResponse;
use crate::event::ChangeEvent;
use crate::hash::{source_version, stable_document_hash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use ulid::Ulid;

pub type WorkItemId = String;

pub const DELIVERY_AT_LEAST_ONCE: &str = "at_least_once";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DlqInfo {
    pub error: String,
    pub error_kind: String,
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub source_stream: Option<String>,
    pub final_attempt: u32,
    #[serde(default)]
    pub retried_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeliveryMetadata {
    #[serde(default)]
    pub delivery_semantics: String,
    #[serde(default)]
    pub routing_strategy: Option<String>,
    #[serde(default)]
    pub stream: Option<String>,
    #[serde(default)]
    pub partition: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dlq: Option<DlqInfo>,
}

/// Durable unit of work: one mutation for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub agent_id: String,
    pub change_event: ChangeEvent,
    #[serde(default)]
    pub document: JsonValue,
    pub document_id: String,
    pub database: String,
    pub collection: String,
    /// `_mongoclaw_version` observed at dispatch; absent counts as 0.
    #[serde(default)]
    pub source_version: i64,
    #[serde(default)]
    pub source_document_hash: String,
    /// Monotonically non-decreasing across redeliveries.
    #[serde(default)]
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub metadata: DeliveryMetadata,
    #[serde(default)]
    pub trace_id: Option<String>,
}

impl WorkItem {
    pub fn from_event(agent: &AgentConfig, event: &ChangeEvent) -> Self {
        let document = event.full_document.clone().unwrap_or(JsonValue::Null);
        let (version, hash) = match &document {
            JsonValue::Null => (0, String::new()),
            doc => (source_version(doc), stable_document_hash(doc)),
        };
        Self {
            id: Ulid::new().to_string().to_lowercase(),
            agent_id: agent.id.clone(),
            change_event: event.clone(),
            document,
            document_id: event.document_id(),
            database: event.database.clone(),
            collection: event.collection.clone(),
            source_version: version,
            source_document_hash: hash,
            attempt: 0,
            max_attempts: agent.execution.max_retries + 1,
            priority: agent.execution.priority,
            created_at: Utc::now(),
            scheduled_at: None,
            idempotency_key: None,
            metadata: DeliveryMetadata::default(),
            trace_id: None,
        }
    }

    pub fn increment_attempt(&self) -> Self {
        let mut next = self.clone();
        next.attempt += 1;
        next
    }

    pub fn should_retry(&self) -> bool {
        self.attempt + 1 < self.max_attempts
    }

    /// Default key when the agent does not template one: stable across
    /// redeliveries of the same content for the same agent.
    pub fn default_idempotency_key(&self) -> String {
        let hash = if self.source_document_hash.is_empty() {
            stable_document_hash(&self.document)
        } else {
            self.source_document_hash.clone()
        };
        let short = &hash[..hash.len().min(8)];
        format!("{}:{}:{}", self.agent_id, self.document_id, short)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Written,
    WriteSkipped,
    Failed,
}

/// Stable reason codes recorded on terminal outcomes.
pub mod reason {
    pub const WRITTEN: &str = "written";
    pub const SHADOW_MODE: &str = "shadow_mode";
    pub const POLICY_SKIP: &str = "policy_skip";
    pub const POLICY_BLOCK: &str = "policy_block";
    pub const SIMULATION: &str = "simulation_mode";
    pub const STRICT_VERSION_CONFLICT: &str = "strict_version_conflict";
    pub const HASH_CONFLICT: &str = "hash_conflict";
    pub const DOCUMENT_NOT_FOUND: &str = "document_not_found";
    pub const IDEMPOTENCY_DUPLICATE: &str = "idempotency_duplicate";
    pub const AGENT_QUARANTINED: &str = "agent_quarantined";
    pub const TIMEOUT: &str = "timeout";
    pub const FAILED: &str = "failed";
}

/// Terminal outcome of the most recent attempt, upsert-keyed by work item id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub work_item_id: WorkItemId,
    pub agent_id: String,
    pub document_id: String,
    pub status: ExecutionStatus,
    pub lifecycle_state: LifecycleState,
    pub reason: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub attempt: u32,
    pub written: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub ai_response: Option<AiResponse>,
}

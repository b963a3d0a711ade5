use futures::stream::BoxStream;
use mongoclaw_core::{AgentConfig, ExecutionRecord, ExecutionStatus, Result};
use serde_json::Value as JsonValue;

/// Hot-reload notification emitted by the agent store's change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentChange {
    Created(String),
    Updated(String),
    Deleted(String),
}

impl AgentChange {
    pub fn agent_id(&self) -> &str {
        match self {
            AgentChange::Created(id) | AgentChange::Updated(id) | AgentChange::Deleted(id) => id,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AgentListFilter {
    pub enabled_only: bool,
    pub tags: Option<Vec<String>>,
    pub database: Option<String>,
    pub collection: Option<String>,
    pub skip: u64,
    pub limit: i64,
}

impl AgentListFilter {
    pub fn enabled() -> Self {
        Self {
            enabled_only: true,
            limit: 100,
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
pub trait AgentStore: Send + Sync + 'static {
    async fn create(&self, config: AgentConfig) -> Result<AgentConfig>;
    async fn get(&self, agent_id: &str) -> Result<AgentConfig>;
    async fn get_optional(&self, agent_id: &str) -> Result<Option<AgentConfig>>;
    /// Bumps `version` and `updated_at`; matches by id.
    async fn update(&self, config: AgentConfig) -> Result<AgentConfig>;
    async fn delete(&self, agent_id: &str) -> Result<bool>;
    async fn set_enabled(&self, agent_id: &str, enabled: bool) -> Result<bool>;
    async fn list(&self, filter: AgentListFilter) -> Result<Vec<AgentConfig>>;
    async fn count(&self, enabled_only: bool) -> Result<u64>;
    async fn get_by_watch_target(
        &self,
        database: &str,
        collection: &str,
        enabled_only: bool,
    ) -> Result<Vec<AgentConfig>>;
    /// Distinct `(database, collection)` pairs over the watch specs.
    async fn get_all_watch_targets(&self, enabled_only: bool) -> Result<Vec<(String, String)>>;
    /// Stream of create/update/delete notifications over the agents
    /// themselves, used for hot reload.
    async fn change_feed(&self) -> Result<BoxStream<'static, AgentChange>>;
}

#[async_trait::async_trait]
pub trait ResumeTokenStore: Send + Sync + 'static {
    /// Upsert; strictly last-write-wins per namespace.
    async fn save(&self, database: &str, collection: &str, token: &JsonValue) -> Result<()>;
    async fn get(&self, database: &str, collection: &str) -> Result<Option<JsonValue>>;
    async fn delete(&self, database: &str, collection: &str) -> Result<bool>;
    /// Seconds since the token was last written.
    async fn age_seconds(&self, database: &str, collection: &str) -> Result<Option<f64>>;
}

#[async_trait::async_trait]
pub trait ExecutionStore: Send + Sync + 'static {
    /// Upsert keyed by work item id; reflects the most recent attempt.
    async fn record(&self, record: &ExecutionRecord) -> Result<()>;
    async fn get(&self, work_item_id: &str) -> Result<Option<ExecutionRecord>>;
    async fn list(
        &self,
        agent_id: Option<&str>,
        status: Option<ExecutionStatus>,
        limit: i64,
    ) -> Result<Vec<ExecutionRecord>>;
}

#[async_trait::async_trait]
pub trait IdempotencyStore: Send + Sync + 'static {
    async fn seen(&self, key: &str) -> Result<bool>;
    /// Idempotent: a duplicate insert is not an error.
    async fn record(&self, key: &str, agent_id: &str, work_item_id: &str) -> Result<()>;
}

/// Lease primitive backing leader election. At most one unexpired holder per
/// lock name.
#[async_trait::async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// Conditional upsert: succeeds iff no lease exists, the lease is already
    /// held by `holder`, or the lease has expired.
    async fn try_acquire(&self, lock_name: &str, holder: &str, lease_seconds: f64) -> Result<bool>;
    /// Extend an existing lease; fails when `holder` no longer owns it.
    async fn renew(&self, lock_name: &str, holder: &str, lease_seconds: f64) -> Result<bool>;
    async fn release(&self, lock_name: &str, holder: &str) -> Result<bool>;
    async fn current_holder(&self, lock_name: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
}

/// Minimal conditional-update capability of the document store, used by the
/// result writer. The filter and update are Mongo-shaped JSON.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn update_document(
        &self,
        database: &str,
        collection: &str,
        filter: &JsonValue,
        update: &JsonValue,
    ) -> Result<UpdateOutcome>;
    async fn find_document(
        &self,
        database: &str,
        collection: &str,
        filter: &JsonValue,
    ) -> Result<Option<JsonValue>>;
}

use chrono::Utc;
use mongoclaw_core::{DlqInfo, Error, Result, WorkItem};

/// Durable append-only log with consumer groups. Delivery is at-least-once:
/// consumers must tolerate duplicates and only ack after reaching a terminal
/// state (success, retry re-enqueued, or DLQ).
#[async_trait::async_trait]
pub trait Queue: Send + Sync + 'static {
    /// Append; the stream is trimmed approximately to its configured cap.
    async fn enqueue(&self, item: &WorkItem, stream: &str) -> Result<String>;

    /// Read never-delivered entries for this group, creating the group if
    /// absent. Malformed entries are acked in place so they cannot loop.
    async fn dequeue(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<(String, WorkItem)>>;

    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> Result<()>;

    /// Reassign entries idle beyond `min_idle_ms` to `consumer`; `attempt` is
    /// incremented on each claimed item.
    async fn claim_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<(String, WorkItem)>>;

    async fn move_to_dlq(&self, item: &WorkItem, error: &Error, dlq_stream: &str)
        -> Result<String>;

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64>;
    async fn stream_length(&self, stream: &str) -> Result<u64>;

    /// Stream keys matching a glob pattern (used by worker discovery).
    async fn discover_streams(&self, pattern: &str) -> Result<Vec<String>>;

    /// Entries in id order, for DLQ inspection. `start`/`end` accept the
    /// broker's `-` / `+` sentinels.
    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<(String, WorkItem)>>;

    async fn delete_message(&self, stream: &str, message_id: &str) -> Result<bool>;

    /// Drop entries with ids below `min_id`; returns the number removed.
    async fn trim_min_id(&self, stream: &str, min_id: &str) -> Result<u64>;

    async fn ping(&self) -> Result<()>;
}

pub fn serialize_work_item(item: &WorkItem) -> Result<String> {
    serde_json::to_string(item).map_err(|err| Error::Queue(err.to_string()))
}

pub fn deserialize_work_item(payload: &str) -> Result<WorkItem> {
    serde_json::from_str(payload).map_err(|err| Error::QueuePoison(err.to_string()))
}

/// Stamp DLQ metadata onto a copy of the item before it is appended to the
/// dead-letter stream.
pub fn with_dlq_metadata(item: &WorkItem, error: &Error, source_stream: Option<&str>) -> WorkItem {
    let mut dead = item.clone();
    dead.metadata.dlq = Some(DlqInfo {
        error: error.to_string(),
        error_kind: error.kind().to_string(),
        added_at: Utc::now(),
        source_stream: source_stream.map(String::from),
        final_attempt: item.attempt,
        retried_at: None,
    });
    dead
}

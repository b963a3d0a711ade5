use crate::traits::Queue;
use chrono::{DateTime, Duration, Utc};
use mongoclaw_core::{Error, Result, WorkItem};
use std::sync::Arc;
use tracing::info;

pub const DLQ_STREAM: &str = "mongoclaw:dlq";

#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub message_id: String,
    pub work_item_id: String,
    pub agent_id: String,
    pub document_id: String,
    pub attempts: u32,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub added_at: Option<DateTime<Utc>>,
}

/// Admin operations over a dead-letter stream.
pub struct DeadLetterQueue {
    queue: Arc<dyn Queue>,
    stream_name: String,
    retention_days: i64,
}

impl DeadLetterQueue {
    pub fn new(queue: Arc<dyn Queue>) -> Self {
        Self::with_stream(queue, DLQ_STREAM)
    }

    pub fn with_stream(queue: Arc<dyn Queue>, stream_name: impl Into<String>) -> Self {
        Self {
            queue,
            stream_name: stream_name.into(),
            retention_days: 7,
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub async fn add(&self, item: &WorkItem, error: &Error) -> Result<String> {
        self.queue.move_to_dlq(item, error, &self.stream_name).await
    }

    pub async fn list(&self, count: usize) -> Result<Vec<DlqEntry>> {
        let entries = self.queue.range(&self.stream_name, "-", "+", count).await?;
        Ok(entries
            .into_iter()
            .map(|(message_id, item)| {
                let dlq = item.metadata.dlq.as_ref();
                DlqEntry {
                    message_id,
                    work_item_id: item.id.clone(),
                    agent_id: item.agent_id.clone(),
                    document_id: item.document_id.clone(),
                    attempts: item.attempt,
                    error: dlq.map(|d| d.error.clone()),
                    error_kind: dlq.map(|d| d.error_kind.clone()),
                    added_at: dlq.map(|d| d.added_at),
                }
            })
            .collect())
    }

    pub async fn get(&self, message_id: &str) -> Result<Option<WorkItem>> {
        let entries = self
            .queue
            .range(&self.stream_name, message_id, message_id, 1)
            .await?;
        Ok(entries.into_iter().next().map(|(_, item)| item))
    }

    /// Re-enqueue a dead item onto `target_stream` with a reset attempt
    /// counter, then drop it from the DLQ.
    pub async fn retry(&self, message_id: &str, target_stream: &str) -> Result<Option<String>> {
        let Some(mut item) = self.get(message_id).await? else {
            return Ok(None);
        };
        item.attempt = 0;
        if let Some(dlq) = item.metadata.dlq.as_mut() {
            dlq.retried_at = Some(Utc::now());
        }
        let new_message_id = self.queue.enqueue(&item, target_stream).await?;
        self.queue
            .delete_message(&self.stream_name, message_id)
            .await?;
        info!(
            work_item_id = %item.id,
            target_stream,
            new_message_id = %new_message_id,
            "retried DLQ item"
        );
        Ok(Some(new_message_id))
    }

    pub async fn delete(&self, message_id: &str) -> Result<bool> {
        self.queue.delete_message(&self.stream_name, message_id).await
    }

    /// Drop entries older than the cutoff. Stream ids are timestamp-prefixed,
    /// so a MINID trim expresses the age bound.
    pub async fn purge(&self, older_than_days: Option<i64>) -> Result<u64> {
        let days = older_than_days.unwrap_or(self.retention_days);
        let cutoff = Utc::now() - Duration::days(days);
        let min_id = format!("{}-0", cutoff.timestamp_millis());
        self.queue.trim_min_id(&self.stream_name, &min_id).await
    }

    pub async fn count(&self) -> Result<u64> {
        self.queue.stream_length(&self.stream_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::InMemoryQueue;
    use mongoclaw_core::{AgentConfig, ChangeEvent, ChangeOperation};
    use serde_json::json;

    fn work_item() -> WorkItem {
        let agent: AgentConfig = serde_json::from_value(json!({
            "id": "classifier",
            "name": "c",
            "watch": {"database": "support", "collection": "tickets"},
            "ai": {"prompt": "p"},
        }))
        .unwrap();
        let event = ChangeEvent {
            operation: ChangeOperation::Insert,
            database: "support".into(),
            collection: "tickets".into(),
            document_key: json!({"_id": "t1"}),
            full_document: Some(json!({"_id": "t1"})),
            update_description: None,
            resume_token: None,
            cluster_time: None,
            wall_time: chrono::Utc::now(),
        };
        WorkItem::from_event(&agent, &event)
    }

    #[tokio::test]
    async fn list_exposes_error_metadata() {
        let queue = Arc::new(InMemoryQueue::new(100));
        let dlq = DeadLetterQueue::new(queue.clone());
        let mut item = work_item();
        item.attempt = 2;
        dlq.add(&item, &Error::AiProvider("boom".into())).await.unwrap();

        let entries = dlq.list(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempts, 2);
        assert_eq!(entries[0].error_kind.as_deref(), Some("ai_provider"));
        assert_eq!(dlq.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn retry_resets_attempt_and_removes_entry() {
        let queue = Arc::new(InMemoryQueue::new(100));
        let dlq = DeadLetterQueue::new(queue.clone());
        let mut item = work_item();
        item.attempt = 3;
        dlq.add(&item, &Error::AiProvider("boom".into())).await.unwrap();

        let entries = dlq.list(10).await.unwrap();
        let new_id = dlq
            .retry(&entries[0].message_id, "mongoclaw:agent:classifier")
            .await
            .unwrap();
        assert!(new_id.is_some());
        assert_eq!(dlq.count().await.unwrap(), 0);

        let requeued = queue
            .dequeue("mongoclaw:agent:classifier", "g", "c", 1, 10)
            .await
            .unwrap();
        assert_eq!(requeued[0].1.attempt, 0);
        assert!(requeued[0].1.metadata.dlq.as_ref().unwrap().retried_at.is_some());
    }

    #[tokio::test]
    async fn retry_of_missing_entry_is_none() {
        let queue = Arc::new(InMemoryQueue::new(100));
        let dlq = DeadLetterQueue::new(queue);
        assert!(dlq.retry("99-0", "anywhere").await.unwrap().is_none());
    }
}

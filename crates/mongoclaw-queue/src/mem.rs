//! In-memory stream log with consumer groups, mirroring the Redis Streams
//! semantics closely enough to exercise workers and the dispatcher in tests.
//! Payloads are stored as raw strings so malformed entries can be injected.

use crate::traits::{
    deserialize_work_item, serialize_work_item, with_dlq_metadata, Queue,
};
use mongoclaw_core::{Error, Result, WorkItem};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

struct Entry {
    seq: u64,
    payload: String,
}

struct Pending {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Default)]
struct Group {
    last_delivered_seq: u64,
    pending: HashMap<u64, Pending>,
}

#[derive(Default)]
struct StreamState {
    next_seq: u64,
    entries: Vec<Entry>,
    groups: HashMap<String, Group>,
}

#[derive(Clone)]
pub struct InMemoryQueue {
    inner: Arc<Mutex<HashMap<String, StreamState>>>,
    max_len: u64,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(100_000)
    }
}

fn seq_of(message_id: &str) -> Option<u64> {
    message_id.split('-').next()?.parse().ok()
}

fn message_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn glob_match(pattern: &str, key: &str) -> bool {
    // '*' only, which is all the routing patterns use.
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut rest = key;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(pos) => {
                if i == 0 && pos != 0 {
                    return false;
                }
                rest = &rest[pos + part.len()..];
            }
            None => return false,
        }
    }
    if let Some(last) = parts.last() {
        if !last.is_empty() && !pattern.ends_with('*') && !rest.is_empty() {
            return false;
        }
    }
    true
}

impl InMemoryQueue {
    pub fn new(max_len: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            max_len,
        }
    }

    /// Append a raw payload, bypassing serialization. Test hook for poison
    /// entries.
    pub fn push_raw(&self, stream: &str, payload: &str) -> String {
        let mut inner = self.inner.lock();
        let state = inner.entry(stream.to_string()).or_default();
        state.next_seq += 1;
        let seq = state.next_seq;
        state.entries.push(Entry {
            seq,
            payload: payload.to_string(),
        });
        let max = self.max_len as usize;
        if state.entries.len() > max {
            let excess = state.entries.len() - max;
            state.entries.drain(..excess);
        }
        message_id(seq)
    }

    fn take_undelivered(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Vec<(String, std::result::Result<WorkItem, Error>)> {
        let mut inner = self.inner.lock();
        let state = inner.entry(stream.to_string()).or_default();
        let group_state = state.groups.entry(group.to_string()).or_default();

        let mut taken = Vec::new();
        for entry in &state.entries {
            if taken.len() >= count {
                break;
            }
            if entry.seq <= group_state.last_delivered_seq {
                continue;
            }
            group_state.last_delivered_seq = entry.seq;
            group_state.pending.insert(
                entry.seq,
                Pending {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    delivery_count: 1,
                },
            );
            taken.push((message_id(entry.seq), deserialize_work_item(&entry.payload)));
        }
        taken
    }
}

#[async_trait::async_trait]
impl Queue for InMemoryQueue {
    async fn enqueue(&self, item: &WorkItem, stream: &str) -> Result<String> {
        let payload = serialize_work_item(item)?;
        Ok(self.push_raw(stream, &payload))
    }

    async fn dequeue(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<(String, WorkItem)>> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        loop {
            let taken = self.take_undelivered(stream, group, consumer, count);
            let mut items = Vec::new();
            for (id, parsed) in taken {
                match parsed {
                    Ok(item) => items.push((id, item)),
                    Err(err) => {
                        warn!(stream, message_id = %id, error = %err, "dropping undecodable entry");
                        self.ack(stream, group, &id).await?;
                    }
                }
            }
            if !items.is_empty() || Instant::now() >= deadline {
                return Ok(items);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> Result<()> {
        let Some(seq) = seq_of(message_id) else {
            return Ok(());
        };
        let mut inner = self.inner.lock();
        if let Some(group_state) = inner
            .get_mut(stream)
            .and_then(|state| state.groups.get_mut(group))
        {
            group_state.pending.remove(&seq);
        }
        Ok(())
    }

    async fn claim_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<(String, WorkItem)>> {
        let min_idle = Duration::from_millis(min_idle_ms);
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let Some(state) = inner.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let payloads: HashMap<u64, String> = state
            .entries
            .iter()
            .map(|entry| (entry.seq, entry.payload.clone()))
            .collect();
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let mut claimed = Vec::new();
        let mut seqs: Vec<u64> = group_state
            .pending
            .iter()
            .filter(|(_, pending)| now.duration_since(pending.delivered_at) >= min_idle)
            .map(|(seq, _)| *seq)
            .collect();
        seqs.sort_unstable();
        for seq in seqs.into_iter().take(count) {
            let Some(payload) = payloads.get(&seq) else {
                group_state.pending.remove(&seq);
                continue;
            };
            match deserialize_work_item(payload) {
                Ok(mut item) => {
                    item.attempt += 1;
                    if let Some(pending) = group_state.pending.get_mut(&seq) {
                        pending.consumer = consumer.to_string();
                        pending.delivered_at = now;
                        pending.delivery_count += 1;
                    }
                    claimed.push((message_id(seq), item));
                }
                Err(_) => {
                    group_state.pending.remove(&seq);
                }
            }
        }
        Ok(claimed)
    }

    async fn move_to_dlq(
        &self,
        item: &WorkItem,
        error: &Error,
        dlq_stream: &str,
    ) -> Result<String> {
        let source = item.metadata.stream.clone();
        let dead = with_dlq_metadata(item, error, source.as_deref());
        self.enqueue(&dead, dlq_stream).await
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64> {
        let inner = self.inner.lock();
        Ok(inner
            .get(stream)
            .and_then(|state| state.groups.get(group))
            .map(|group_state| group_state.pending.len() as u64)
            .unwrap_or(0))
    }

    async fn stream_length(&self, stream: &str) -> Result<u64> {
        let inner = self.inner.lock();
        Ok(inner
            .get(stream)
            .map(|state| state.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn discover_streams(&self, pattern: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        let mut streams: Vec<String> = inner
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        streams.sort();
        Ok(streams)
    }

    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<(String, WorkItem)>> {
        let lo = if start == "-" { 0 } else { seq_of(start).unwrap_or(0) };
        let hi = if end == "+" {
            u64::MAX
        } else {
            seq_of(end).unwrap_or(u64::MAX)
        };
        let inner = self.inner.lock();
        let Some(state) = inner.get(stream) else {
            return Ok(Vec::new());
        };
        let mut items = Vec::new();
        for entry in &state.entries {
            if items.len() >= count {
                break;
            }
            if entry.seq < lo || entry.seq > hi {
                continue;
            }
            if let Ok(item) = deserialize_work_item(&entry.payload) {
                items.push((message_id(entry.seq), item));
            }
        }
        Ok(items)
    }

    async fn delete_message(&self, stream: &str, message_id: &str) -> Result<bool> {
        let Some(seq) = seq_of(message_id) else {
            return Ok(false);
        };
        let mut inner = self.inner.lock();
        let Some(state) = inner.get_mut(stream) else {
            return Ok(false);
        };
        let before = state.entries.len();
        state.entries.retain(|entry| entry.seq != seq);
        for group_state in state.groups.values_mut() {
            group_state.pending.remove(&seq);
        }
        Ok(state.entries.len() < before)
    }

    async fn trim_min_id(&self, stream: &str, min_id: &str) -> Result<u64> {
        let Some(min_seq) = seq_of(min_id) else {
            return Ok(0);
        };
        let mut inner = self.inner.lock();
        let Some(state) = inner.get_mut(stream) else {
            return Ok(0);
        };
        let before = state.entries.len();
        state.entries.retain(|entry| entry.seq >= min_seq);
        Ok((before - state.entries.len()) as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
            full_document: Some(json!({"_id": "t1", "title": "x"})),
            update_description: None,
            resume_token: None,
            cluster_time: None,
            wall_time: chrono::Utc::now(),
        };
        WorkItem::from_event(&agent, &event)
    }

    #[tokio::test]
    async fn enqueue_dequeue_ack_cycle() {
        let queue = InMemoryQueue::new(1000);
        let item = work_item();
        queue.enqueue(&item, "s").await.unwrap();
        assert_eq!(queue.stream_length("s").await.unwrap(), 1);

        let delivered = queue.dequeue("s", "g", "c1", 10, 10).await.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1.id, item.id);
        assert_eq!(queue.pending_count("s", "g").await.unwrap(), 1);

        queue.ack("s", "g", &delivered[0].0).await.unwrap();
        assert_eq!(queue.pending_count("s", "g").await.unwrap(), 0);

        // Entry stays in the log after ack, like a stream.
        assert_eq!(queue.stream_length("s").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn each_entry_goes_to_one_consumer() {
        let queue = InMemoryQueue::new(1000);
        queue.enqueue(&work_item(), "s").await.unwrap();
        let first = queue.dequeue("s", "g", "c1", 10, 10).await.unwrap();
        let second = queue.dequeue("s", "g", "c2", 10, 10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn claim_pending_bumps_attempt() {
        let queue = InMemoryQueue::new(1000);
        queue.enqueue(&work_item(), "s").await.unwrap();
        let delivered = queue.dequeue("s", "g", "dead-consumer", 10, 10).await.unwrap();
        assert_eq!(delivered[0].1.attempt, 0);

        let claimed = queue.claim_pending("s", "g", "rescuer", 0, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].1.attempt, 1);

        // Not idle long enough -> nothing to claim.
        let again = queue
            .claim_pending("s", "g", "rescuer", 60_000, 10)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn poison_entries_are_acked_not_looped() {
        let queue = InMemoryQueue::new(1000);
        queue.push_raw("s", "{not json");
        queue.enqueue(&work_item(), "s").await.unwrap();

        let delivered = queue.dequeue("s", "g", "c1", 10, 10).await.unwrap();
        assert_eq!(delivered.len(), 1);
        // The poison entry is not pending after being dropped.
        assert_eq!(queue.pending_count("s", "g").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dlq_move_carries_error_metadata() {
        let queue = InMemoryQueue::new(1000);
        let mut item = work_item();
        item.metadata.stream = Some("s".into());
        item.attempt = 3;
        queue
            .move_to_dlq(&item, &Error::AiConnectivity("refused".into()), "dlq")
            .await
            .unwrap();

        let entries = queue.range("dlq", "-", "+", 10).await.unwrap();
        let dlq_info = entries[0].1.metadata.dlq.as_ref().unwrap();
        assert_eq!(dlq_info.error_kind, "ai_connectivity");
        assert_eq!(dlq_info.final_attempt, 3);
        assert_eq!(dlq_info.source_stream.as_deref(), Some("s"));
    }

    #[tokio::test]
    async fn trims_to_max_len() {
        let queue = InMemoryQueue::new(3);
        for _ in 0..5 {
            queue.enqueue(&work_item(), "s").await.unwrap();
        }
        assert_eq!(queue.stream_length("s").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn discovery_matches_patterns() {
        let queue = InMemoryQueue::new(10);
        queue.enqueue(&work_item(), "mongoclaw:agent:a").await.unwrap();
        queue.enqueue(&work_item(), "mongoclaw:agent:b").await.unwrap();
        queue.enqueue(&work_item(), "mongoclaw:work").await.unwrap();

        let agents = queue.discover_streams("mongoclaw:agent:*").await.unwrap();
        assert_eq!(agents, vec!["mongoclaw:agent:a", "mongoclaw:agent:b"]);
        let exact = queue.discover_streams("mongoclaw:work").await.unwrap();
        assert_eq!(exact, vec!["mongoclaw:work"]);
    }
}

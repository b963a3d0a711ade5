use crate::traits::{
    deserialize_work_item, serialize_work_item, with_dlq_metadata, Queue,
};
use mongoclaw_core::{Error, RedisConfig, Result, WorkItem};
use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamMaxlen, StreamPendingCountReply, StreamPendingReply, StreamRangeReply,
    StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use tracing::{debug, warn};

static QUEUE_POISON_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "mongoclaw_queue_poison_total",
        "Malformed stream entries acked to avoid redelivery loops",
        &["stream"]
    )
    .unwrap()
});

fn conn_err(err: redis::RedisError) -> Error {
    Error::QueueConnection(err.to_string())
}

fn queue_err(err: redis::RedisError) -> Error {
    Error::Queue(err.to_string())
}

/// Redis Streams queue backend with consumer groups, approximate trimming and
/// pending recovery.
#[derive(Clone)]
pub struct RedisQueue {
    manager: ConnectionManager,
    stream_max_len: u64,
}

impl RedisQueue {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(conn_err)?;
        let manager = client.get_connection_manager().await.map_err(conn_err)?;
        Ok(Self {
            manager,
            stream_max_len: config.stream_max_len,
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut con = self.conn();
        let created: redis::RedisResult<()> = con.xgroup_create_mkstream(stream, group, "0").await;
        match created {
            Ok(()) => {
                debug!(stream, group, "created consumer group");
                Ok(())
            }
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(queue_err(err)),
        }
    }

    /// Returns decoded items plus the ids of poison entries.
    fn parse_entries(
        &self,
        stream: &str,
        entries: Vec<redis::streams::StreamId>,
        bump_attempt: bool,
    ) -> (Vec<(String, WorkItem)>, Vec<String>) {
        let mut items = Vec::with_capacity(entries.len());
        let mut poison = Vec::new();
        for entry in entries {
            let payload: Option<String> = entry.get("data");
            match payload.as_deref().map(deserialize_work_item) {
                Some(Ok(mut item)) => {
                    if bump_attempt {
                        item.attempt += 1;
                    }
                    items.push((entry.id.clone(), item));
                }
                _ => {
                    warn!(stream, message_id = %entry.id, "dropping undecodable entry");
                    QUEUE_POISON_TOTAL.with_label_values(&[stream]).inc();
                    poison.push(entry.id.clone());
                }
            }
        }
        (items, poison)
    }
}

#[async_trait::async_trait]
impl Queue for RedisQueue {
    async fn enqueue(&self, item: &WorkItem, stream: &str) -> Result<String> {
        let payload = serialize_work_item(item)?;
        let mut con = self.conn();
        let message_id: String = con
            .xadd_maxlen(
                stream,
                StreamMaxlen::Approx(self.stream_max_len as usize),
                "*",
                &[("data", payload.as_str())],
            )
            .await
            .map_err(queue_err)?;
        debug!(stream, message_id = %message_id, work_item_id = %item.id, "enqueued");
        Ok(message_id)
    }

    async fn dequeue(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<(String, WorkItem)>> {
        self.ensure_group(stream, group).await?;
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms as usize);
        let mut con = self.conn();
        let reply: StreamReadReply = match con.xread_options(&[stream], &[">"], &options).await {
            Ok(reply) => reply,
            Err(err) if err.code() == Some("NOGROUP") => {
                self.ensure_group(stream, group).await?;
                return Ok(Vec::new());
            }
            Err(err) => return Err(queue_err(err)),
        };

        let mut items = Vec::new();
        for key in reply.keys {
            let (parsed, poison) = self.parse_entries(stream, key.ids, false);
            items.extend(parsed);
            for message_id in poison {
                self.ack(stream, group, &message_id).await?;
            }
        }
        Ok(items)
    }

    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> Result<()> {
        let mut con = self.conn();
        let _: u64 = con
            .xack(stream, group, &[message_id])
            .await
            .map_err(queue_err)?;
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
        let mut con = self.conn();
        let pending: StreamPendingCountReply =
            match con.xpending_count(stream, group, "-", "+", count).await {
                Ok(reply) => reply,
                Err(err) if err.code() == Some("NOGROUP") => return Ok(Vec::new()),
                Err(err) => return Err(queue_err(err)),
            };

        let ids: Vec<String> = pending
            .ids
            .into_iter()
            .filter(|entry| entry.last_delivered_ms as u64 >= min_idle_ms)
            .map(|entry| entry.id)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: StreamClaimReply = con
            .xclaim(stream, group, consumer, min_idle_ms as usize, &ids)
            .await
            .map_err(queue_err)?;
        let (items, poison) = self.parse_entries(stream, claimed.ids, true);
        for message_id in poison {
            self.ack(stream, group, &message_id).await?;
        }
        Ok(items)
    }

    async fn move_to_dlq(
        &self,
        item: &WorkItem,
        error: &Error,
        dlq_stream: &str,
    ) -> Result<String> {
        let source = item.metadata.stream.clone();
        let dead = with_dlq_metadata(item, error, source.as_deref());
        let message_id = self.enqueue(&dead, dlq_stream).await?;
        warn!(
            work_item_id = %item.id,
            agent_id = %item.agent_id,
            dlq_stream,
            error = %error,
            "moved work item to DLQ"
        );
        Ok(message_id)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64> {
        let mut con = self.conn();
        let reply: StreamPendingReply = match con.xpending(stream, group).await {
            Ok(reply) => reply,
            Err(err) if err.code() == Some("NOGROUP") => return Ok(0),
            Err(err) => return Err(queue_err(err)),
        };
        Ok(match reply {
            StreamPendingReply::Data(data) => data.count as u64,
            StreamPendingReply::Empty => 0,
        })
    }

    async fn stream_length(&self, stream: &str) -> Result<u64> {
        let mut con = self.conn();
        con.xlen(stream).await.map_err(queue_err)
    }

    async fn discover_streams(&self, pattern: &str) -> Result<Vec<String>> {
        let mut con = self.conn();
        let keys: Vec<String> = con.keys(pattern).await.map_err(queue_err)?;
        let mut streams = Vec::new();
        for key in keys {
            let key_type: String = redis::cmd("TYPE")
                .arg(&key)
                .query_async(&mut con)
                .await
                .map_err(queue_err)?;
            if key_type == "stream" {
                streams.push(key);
            }
        }
        Ok(streams)
    }

    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<(String, WorkItem)>> {
        let mut con = self.conn();
        let reply: StreamRangeReply = con
            .xrange_count(stream, start, end, count)
            .await
            .map_err(queue_err)?;
        let (items, _) = self.parse_entries(stream, reply.ids, false);
        Ok(items)
    }

    async fn delete_message(&self, stream: &str, message_id: &str) -> Result<bool> {
        let mut con = self.conn();
        let removed: u64 = con.xdel(stream, &[message_id]).await.map_err(queue_err)?;
        Ok(removed > 0)
    }

    async fn trim_min_id(&self, stream: &str, min_id: &str) -> Result<u64> {
        let mut con = self.conn();
        redis::cmd("XTRIM")
            .arg(stream)
            .arg("MINID")
            .arg(min_id)
            .query_async(&mut con)
            .await
            .map_err(queue_err)
    }

    async fn ping(&self) -> Result<()> {
        let mut con = self.conn();
        let _: String = redis::cmd("PING")
            .query_async(&mut con)
            .await
            .map_err(conn_err)?;
        Ok(())
    }
}

use crate::traits::Queue;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Manages consumer naming and pending-entry recovery for a consumer group.
///
/// Entries claimed from dead consumers are re-enqueued fresh and their stale
/// delivery acked, so they re-enter normal consumption with `attempt` already
/// bumped by the claim.
pub struct ConsumerGroupManager {
    queue: Arc<dyn Queue>,
    group: String,
    prefix: String,
    consumers: Mutex<HashMap<String, String>>,
    claim_interval: Duration,
    min_idle_ms: u64,
}

impl ConsumerGroupManager {
    pub fn new(queue: Arc<dyn Queue>, group: impl Into<String>) -> Self {
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".into());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            queue,
            group: group.into(),
            prefix: format!("{}-{}", hostname, &suffix[..8]),
            consumers: Mutex::new(HashMap::new()),
            claim_interval: Duration::from_secs(30),
            min_idle_ms: 60_000,
        }
    }

    pub fn with_recovery(mut self, claim_interval: Duration, min_idle_ms: u64) -> Self {
        self.claim_interval = claim_interval;
        self.min_idle_ms = min_idle_ms;
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Stable per-stream consumer name: `{host}-{rand8}-{stream tail}`.
    pub fn consumer_name(&self, stream: &str) -> String {
        let mut consumers = self.consumers.lock();
        consumers
            .entry(stream.to_string())
            .or_insert_with(|| {
                let tail: String = stream
                    .rsplit(':')
                    .next()
                    .unwrap_or(stream)
                    .chars()
                    .take(8)
                    .collect();
                format!("{}-{}", self.prefix, tail)
            })
            .clone()
    }

    pub fn unregister(&self, stream: &str) {
        self.consumers.lock().remove(stream);
    }

    /// Periodic reclaim loop over the live stream list; runs until the token
    /// is cancelled.
    pub async fn run(&self, streams: Arc<RwLock<Vec<String>>>, token: CancellationToken) {
        info!(group = %self.group, prefix = %self.prefix, "consumer group manager started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.claim_interval) => {}
            }
            let current = streams.read().clone();
            for stream in current {
                let consumer = self.consumer_name(&stream);
                if let Err(err) = self.reclaim_stream(&stream, &consumer).await {
                    warn!(stream = %stream, error = %err, "pending reclaim failed");
                }
            }
        }
        info!(group = %self.group, "consumer group manager stopped");
    }

    async fn reclaim_stream(&self, stream: &str, consumer: &str) -> mongoclaw_core::Result<()> {
        let claimed = self
            .queue
            .claim_pending(stream, &self.group, consumer, self.min_idle_ms, 10)
            .await?;
        if claimed.is_empty() {
            return Ok(());
        }
        info!(stream = %stream, count = claimed.len(), "claimed pending messages");
        for (message_id, item) in claimed {
            self.queue.enqueue(&item, stream).await?;
            self.queue.ack(stream, &self.group, &message_id).await?;
            debug!(
                stream = %stream,
                work_item_id = %item.id,
                attempt = item.attempt,
                "re-enqueued stale delivery"
            );
        }
        Ok(())
    }
}

use crate::executor::Executor;
use crate::metrics;
use crate::routing::{agent_id_from_stream, dlq_stream_name};
use crate::state::RuntimeState;
use mongoclaw_core::{Config, Error, WorkItem};
use mongoclaw_queue::Queue;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A single worker task: consumes its stream list fairly, runs items through
/// the executor, and performs the terminal queue action (ack, retry
/// re-enqueue, or DLQ) before acking the delivery.
pub struct Worker {
    id: String,
    queue: Arc<dyn Queue>,
    executor: Arc<Executor>,
    state: Arc<RuntimeState>,
    config: Config,
    streams: Arc<RwLock<Vec<String>>>,
    processed: AtomicU64,
    errors: AtomicU64,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<dyn Queue>,
        executor: Arc<Executor>,
        state: Arc<RuntimeState>,
        config: Config,
        streams: Arc<RwLock<Vec<String>>>,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            executor,
            state,
            config,
            streams,
            processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Replace the stream subscription list.
    pub fn update_streams(&self, streams: Vec<String>) {
        *self.streams.write() = streams;
    }

    pub async fn run(&self, token: CancellationToken) {
        info!(worker_id = %self.id, "worker started");
        let mut cursor = 0usize;
        let mut pending_sampled: HashMap<String, Instant> = HashMap::new();
        let mut empty_cycles: HashMap<String, u64> = HashMap::new();

        while !token.is_cancelled() {
            let streams = self.streams.read().clone();
            if streams.is_empty() {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(200)) => continue,
                }
            }

            let ordered = self.next_stream_order(&streams, &mut cursor);
            let stream_count = ordered.len().max(1);
            let effective_block_ms = (self.config.redis.block_ms / stream_count as u64).max(100);
            let dequeue_count = self.dequeue_count_for_cycle();
            let stream_limit = self
                .config
                .worker
                .fair_streams_per_cycle
                .unwrap_or(stream_count)
                .clamp(1, stream_count);

            for stream in ordered.iter().take(stream_limit) {
                if token.is_cancelled() {
                    break;
                }
                self.sample_pending_if_due(stream, &mut pending_sampled).await;
                if self.is_stream_saturated(stream) {
                    continue;
                }

                let dequeued = tokio::select! {
                    _ = token.cancelled() => break,
                    result = self.queue.dequeue(
                        stream,
                        &self.config.redis.consumer_group,
                        &self.id,
                        dequeue_count,
                        effective_block_ms,
                    ) => result,
                };

                let items = match dequeued {
                    Ok(items) => items,
                    // One failing stream must not starve the others.
                    Err(err) => {
                        warn!(worker_id = %self.id, stream = %stream, error = %err, "stream dequeue error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };

                if items.is_empty() {
                    self.record_empty_cycle(stream, &mut empty_cycles);
                    continue;
                }
                empty_cycles.insert(stream.clone(), 0);

                for (message_id, item) in items {
                    if token.is_cancelled() {
                        break;
                    }
                    let inflight = self.state.inflight_inc(stream);
                    self.publish_inflight(stream, inflight);
                    self.process_item(stream, &message_id, item, &token).await;
                    let inflight = self.state.inflight_dec(stream);
                    self.publish_inflight(stream, inflight);
                }
            }
        }
        info!(
            worker_id = %self.id,
            processed = self.processed(),
            errors = self.errors(),
            "worker stopped"
        );
    }

    /// Process one delivered item and perform its terminal queue action. The
    /// delivery is acked on every exit path.
    pub async fn process_item(
        &self,
        stream: &str,
        message_id: &str,
        item: WorkItem,
        token: &CancellationToken,
    ) {
        debug!(
            worker_id = %self.id,
            work_item_id = %item.id,
            agent_id = %item.agent_id,
            document_id = %item.document_id,
            attempt = item.attempt,
            "processing work item"
        );
        if item.attempt > 0 {
            metrics::REPLAYED_DELIVERIES_TOTAL
                .with_label_values(&[&item.agent_id])
                .inc();
        }

        let outcome = self.executor.execute(&item).await;

        if outcome.success {
            self.processed.fetch_add(1, Ordering::Relaxed);
            metrics::QUEUE_PROCESSED_TOTAL
                .with_label_values(&[stream, "success"])
                .inc();
            info!(
                worker_id = %self.id,
                work_item_id = %item.id,
                agent_id = %item.agent_id,
                reason = %outcome.reason,
                duration_ms = outcome.duration_ms,
                "work item completed"
            );
        } else {
            self.errors.fetch_add(1, Ordering::Relaxed);
            metrics::QUEUE_PROCESSED_TOTAL
                .with_label_values(&[stream, "failure"])
                .inc();

            if outcome.retryable && item.should_retry() {
                let retried = item.increment_attempt();
                let delay = self.retry_delay(retried.attempt);
                let retry_reason = if outcome.reason == "timeout" {
                    "timeout"
                } else {
                    "failure"
                };
                metrics::RETRIES_SCHEDULED_TOTAL
                    .with_label_values(&[&item.agent_id, retry_reason])
                    .inc();
                info!(
                    worker_id = %self.id,
                    work_item_id = %item.id,
                    attempt = retried.attempt,
                    delay_seconds = delay.as_secs_f64(),
                    "retrying work item"
                );
                // Delay retries to avoid retry storms under provider pressure;
                // shutdown aborts the wait.
                self.sleep_with_shutdown(delay, token).await;
                if let Err(err) = self.queue.enqueue(&retried, stream).await {
                    warn!(work_item_id = %item.id, error = %err, "retry enqueue failed");
                }
            } else if outcome.retryable {
                let error = outcome
                    .error
                    .unwrap_or(Error::MaxRetriesExceeded(item.max_attempts));
                let dlq_stream = dlq_stream_name(
                    self.config.worker.routing_strategy,
                    Some(&item.agent_id),
                );
                if let Err(err) = self.queue.move_to_dlq(&item, &error, &dlq_stream).await {
                    warn!(work_item_id = %item.id, error = %err, "DLQ move failed");
                }
            } else {
                // Terminal kinds are dropped; the execution record carries
                // the reason.
                warn!(
                    worker_id = %self.id,
                    work_item_id = %item.id,
                    agent_id = %item.agent_id,
                    reason = %outcome.reason,
                    error = outcome.error.as_ref().map(|e| e.to_string()),
                    "work item not retried"
                );
            }
        }

        // Every exit from in-flight acks the delivery; the terminal action
        // above happened first.
        if let Err(err) = self
            .queue
            .ack(stream, &self.config.redis.consumer_group, message_id)
            .await
        {
            warn!(stream = %stream, message_id = %message_id, error = %err, "ack failed");
        }
    }

    fn next_stream_order(&self, streams: &[String], cursor: &mut usize) -> Vec<String> {
        if !self.config.worker.fair_scheduling_enabled || streams.len() <= 1 {
            return streams.to_vec();
        }
        let pivot = *cursor % streams.len();
        let mut ordered = Vec::with_capacity(streams.len());
        ordered.extend_from_slice(&streams[pivot..]);
        ordered.extend_from_slice(&streams[..pivot]);
        *cursor = (pivot + 1) % streams.len();
        ordered
    }

    fn dequeue_count_for_cycle(&self) -> usize {
        if !self.config.worker.fair_scheduling_enabled {
            return self.config.worker.batch_size;
        }
        self.config
            .worker
            .fair_stream_batch_size
            .clamp(1, self.config.worker.batch_size.max(1))
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.config.worker.retry_base_delay;
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = base * 2f64.powi(exponent as i32);
        Duration::from_secs_f64(delay.min(self.config.worker.retry_max_delay))
    }

    async fn sleep_with_shutdown(&self, delay: Duration, token: &CancellationToken) {
        if delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    fn is_stream_saturated(&self, stream: &str) -> bool {
        let Some(cap) = self.config.worker.max_in_flight_per_agent_stream else {
            return false;
        };
        let Some(agent_id) = agent_id_from_stream(stream) else {
            return false;
        };
        let current = self.state.inflight_count(stream);
        if current < cap {
            return false;
        }
        metrics::AGENT_STREAM_SATURATION_SKIPS_TOTAL
            .with_label_values(&[agent_id, stream])
            .inc();
        debug!(
            worker_id = %self.id,
            stream = %stream,
            in_flight = current,
            cap,
            "skipping saturated stream"
        );
        true
    }

    async fn sample_pending_if_due(
        &self,
        stream: &str,
        sampled_at: &mut HashMap<String, Instant>,
    ) {
        let Some(agent_id) = agent_id_from_stream(stream) else {
            return;
        };
        let interval = Duration::from_secs_f64(self.config.worker.pending_metrics_interval_seconds);
        if let Some(last) = sampled_at.get(stream) {
            if last.elapsed() < interval {
                return;
            }
        }
        sampled_at.insert(stream.to_string(), Instant::now());
        match self
            .queue
            .pending_count(stream, &self.config.redis.consumer_group)
            .await
        {
            Ok(pending) => {
                metrics::AGENT_STREAM_PENDING
                    .with_label_values(&[agent_id, stream])
                    .set(pending as i64);
            }
            Err(err) => {
                debug!(worker_id = %self.id, stream = %stream, error = %err, "pending sample failed");
            }
        }
    }

    fn record_empty_cycle(&self, stream: &str, empty_cycles: &mut HashMap<String, u64>) {
        let Some(agent_id) = agent_id_from_stream(stream) else {
            return;
        };
        let cycles = empty_cycles.entry(stream.to_string()).or_insert(0);
        *cycles += 1;
        let threshold = self.config.worker.starvation_cycle_threshold;
        if *cycles >= threshold && *cycles % threshold == 0 {
            metrics::AGENT_STREAM_STARVATION_CYCLES_TOTAL
                .with_label_values(&[agent_id, stream])
                .inc();
        }
    }

    fn publish_inflight(&self, stream: &str, count: u64) {
        if let Some(agent_id) = agent_id_from_stream(stream) {
            metrics::AGENT_STREAM_INFLIGHT
                .with_label_values(&[agent_id, stream])
                .set(count as i64);
        }
    }
}

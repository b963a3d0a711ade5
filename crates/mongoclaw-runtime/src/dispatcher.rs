use crate::metrics;
use crate::prompt::PromptEngine;
use crate::routing::{dlq_stream_name, partition_from_stream, stream_name};
use crate::state::RuntimeState;
use mongoclaw_core::hash::VERSION_FIELD;
use mongoclaw_core::{
    AgentConfig, ChangeEvent, ChangeOperation, Config, Error, OverflowPolicy, Result, WorkItem,
    WorkItemId, DELIVERY_AT_LEAST_ONCE,
};
use mongoclaw_queue::Queue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct DispatcherStats {
    pub dispatched: u64,
    pub deduplicated: u64,
    pub dropped: u64,
    pub deferred: u64,
    pub dead_lettered: u64,
    pub forced_enqueued: u64,
}

/// Builds work items from matched events, deduplicates, routes them to a
/// stream, and applies priority-aware admission control before enqueueing.
pub struct Dispatcher {
    queue: Arc<dyn Queue>,
    config: Config,
    state: Arc<RuntimeState>,
    prompt_engine: PromptEngine,
    dispatched: AtomicU64,
    deduplicated: AtomicU64,
    dropped: AtomicU64,
    deferred: AtomicU64,
    dead_lettered: AtomicU64,
    forced_enqueued: AtomicU64,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn Queue>, config: Config, state: Arc<RuntimeState>) -> Self {
        Self {
            queue,
            config,
            state,
            prompt_engine: PromptEngine::new(),
            dispatched: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            forced_enqueued: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            forced_enqueued: self.forced_enqueued.load(Ordering::Relaxed),
        }
    }

    /// Returns the work item id, or None when the event was deduplicated or
    /// rejected by admission control.
    pub async fn dispatch(
        &self,
        agent: &AgentConfig,
        event: &ChangeEvent,
    ) -> Result<Option<WorkItemId>> {
        if is_enrichment_echo(agent, event) {
            metrics::LOOP_GUARD_SKIPS_TOTAL
                .with_label_values(&[&agent.id])
                .inc();
            debug!(
                agent_id = %agent.id,
                document_id = %event.document_id(),
                "skipping event produced by enrichment write"
            );
            return Ok(None);
        }

        let mut item = WorkItem::from_event(agent, event);

        if agent.execution.deduplicate {
            let key = self.idempotency_key(agent, &item);
            item.idempotency_key = Some(key.clone());
            if self.state.dedup_check_and_insert(&key) {
                self.deduplicated.fetch_add(1, Ordering::Relaxed);
                debug!(
                    agent_id = %agent.id,
                    document_id = %item.document_id,
                    idempotency_key = %key,
                    "deduplicated work item"
                );
                return Ok(None);
            }
        }

        let strategy = self.config.worker.routing_strategy;
        let stream = stream_name(
            strategy,
            &agent.id,
            &item,
            self.config.worker.partition_count,
        );
        item.metadata.delivery_semantics = DELIVERY_AT_LEAST_ONCE.into();
        item.metadata.routing_strategy = Some(strategy.as_str().into());
        item.metadata.stream = Some(stream.clone());
        item.metadata.partition = partition_from_stream(&stream);

        if !self.admit(agent, &item, &stream).await? {
            return Ok(None);
        }

        let message_id = self.queue.enqueue(&item, &stream).await?;
        metrics::DISPATCH_ROUTED_TOTAL
            .with_label_values(&[strategy.as_str(), &stream])
            .inc();
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        info!(
            work_item_id = %item.id,
            agent_id = %agent.id,
            document_id = %item.document_id,
            stream = %stream,
            message_id = %message_id,
            "dispatched work item"
        );
        Ok(Some(item.id))
    }

    fn idempotency_key(&self, agent: &AgentConfig, item: &WorkItem) -> String {
        if let Some(template) = &agent.write.idempotency_key {
            let context =
                PromptEngine::build_context(&item.document, &item.change_event, agent, Some(item));
            match self.prompt_engine.render(template, &context) {
                Ok(rendered) if !rendered.is_empty() => return rendered,
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        agent_id = %agent.id,
                        error = %err,
                        "idempotency key template failed; using default key"
                    );
                }
            }
        }
        item.default_idempotency_key()
    }

    async fn admit(&self, agent: &AgentConfig, item: &WorkItem, stream: &str) -> Result<bool> {
        let worker = &self.config.worker;
        if !worker.dispatch_backpressure_enabled {
            return Ok(true);
        }
        let threshold = worker.dispatch_backpressure_threshold;
        let fullness = self.stream_fullness(stream).await?;
        if fullness < threshold {
            return Ok(true);
        }

        if item.priority >= worker.dispatch_min_priority_when_backpressured {
            metrics::DISPATCH_ADMISSION_TOTAL
                .with_label_values(&[&agent.id, stream, "priority_bypass"])
                .inc();
            info!(
                agent_id = %agent.id,
                stream = %stream,
                priority = item.priority,
                fullness,
                "priority bypass under backpressure"
            );
            return Ok(true);
        }

        match worker.dispatch_overflow_policy {
            OverflowPolicy::Drop => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::DISPATCH_ADMISSION_TOTAL
                    .with_label_values(&[&agent.id, stream, "drop"])
                    .inc();
                warn!(
                    agent_id = %agent.id,
                    stream = %stream,
                    priority = item.priority,
                    fullness,
                    "dropped work item under backpressure"
                );
                Ok(false)
            }
            OverflowPolicy::Dlq => {
                self.dead_lettered.fetch_add(1, Ordering::Relaxed);
                metrics::DISPATCH_ADMISSION_TOTAL
                    .with_label_values(&[&agent.id, stream, "dlq"])
                    .inc();
                let dlq_stream =
                    dlq_stream_name(self.config.worker.routing_strategy, Some(&agent.id));
                self.queue
                    .move_to_dlq(item, &Error::QueueFull(stream.to_string()), &dlq_stream)
                    .await?;
                warn!(
                    agent_id = %agent.id,
                    stream = %stream,
                    "sent work item to DLQ under backpressure"
                );
                Ok(false)
            }
            OverflowPolicy::Defer => {
                self.deferred.fetch_add(1, Ordering::Relaxed);
                metrics::DISPATCH_ADMISSION_TOTAL
                    .with_label_values(&[&agent.id, stream, "defer"])
                    .inc();
                for _ in 0..worker.dispatch_defer_max_attempts {
                    tokio::time::sleep(Duration::from_secs_f64(worker.dispatch_defer_seconds))
                        .await;
                    if self.stream_fullness(stream).await? < threshold {
                        return Ok(true);
                    }
                }
                self.forced_enqueued.fetch_add(1, Ordering::Relaxed);
                metrics::DISPATCH_ADMISSION_TOTAL
                    .with_label_values(&[&agent.id, stream, "defer_forced_enqueue"])
                    .inc();
                warn!(
                    agent_id = %agent.id,
                    stream = %stream,
                    "forced enqueue after defer attempts"
                );
                Ok(true)
            }
        }
    }

    /// Fullness ratio with a short-lived cache to bound broker round trips.
    async fn stream_fullness(&self, stream: &str) -> Result<f64> {
        let ttl = Duration::from_secs_f64(self.config.worker.dispatch_pressure_cache_ttl_seconds);
        if let Some(cached) = self.state.pressure_get(stream, ttl) {
            return Ok(cached);
        }
        let capacity = self.config.redis.stream_max_len.max(1);
        let length = self.queue.stream_length(stream).await?;
        let fullness = (length as f64 / capacity as f64).min(1.0);
        self.state.pressure_set(stream, fullness);
        metrics::DISPATCH_QUEUE_FULLNESS
            .with_label_values(&[stream])
            .set(fullness);
        Ok(fullness)
    }
}

/// True when an update touched only framework fields, i.e. it was produced by
/// our own writeback and must not re-trigger enrichment.
fn is_enrichment_echo(agent: &AgentConfig, event: &ChangeEvent) -> bool {
    if event.operation != ChangeOperation::Update {
        return false;
    }
    let Some(update) = &event.update_description else {
        return false;
    };
    let metadata_field = agent.write.metadata_field.as_str();
    let is_framework = |field: &str| {
        field == VERSION_FIELD
            || field == metadata_field
            || field.starts_with(&format!("{VERSION_FIELD}."))
            || field.starts_with(&format!("{metadata_field}."))
    };
    let mut fields: Vec<&str> = update.removed_fields.iter().map(String::as_str).collect();
    if let Some(updated) = update.updated_fields.as_object() {
        fields.extend(updated.keys().map(String::as_str));
    }
    !fields.is_empty() && fields.iter().all(|field| is_framework(field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongoclaw_core::UpdateDescription;
    use mongoclaw_queue::InMemoryQueue;
    use serde_json::json;

    fn agent(raw: serde_json::Value) -> AgentConfig {
        serde_json::from_value(raw).unwrap()
    }

    fn classifier() -> AgentConfig {
        agent(json!({
            "id": "classifier",
            "name": "c",
            "watch": {"database": "support", "collection": "tickets"},
            "ai": {"prompt": "p"},
        }))
    }

    fn insert_event(document: serde_json::Value) -> ChangeEvent {
        ChangeEvent {
            operation: ChangeOperation::Insert,
            database: "support".into(),
            collection: "tickets".into(),
            document_key: json!({"_id": document["_id"].as_str().unwrap_or("t1")}),
            full_document: Some(document),
            update_description: None,
            resume_token: None,
            cluster_time: None,
            wall_time: chrono::Utc::now(),
        }
    }

    fn dispatcher_with(config: Config) -> (Dispatcher, Arc<InMemoryQueue>) {
        let queue = Arc::new(InMemoryQueue::new(config.redis.stream_max_len));
        let state = Arc::new(RuntimeState::new());
        (
            Dispatcher::new(queue.clone(), config, state),
            queue,
        )
    }

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.worker.dispatch_pressure_cache_ttl_seconds = 0.0;
        config.worker.dispatch_defer_seconds = 0.005;
        config
    }

    #[tokio::test]
    async fn stamps_delivery_metadata() {
        let (dispatcher, queue) = dispatcher_with(fast_config());
        let id = dispatcher
            .dispatch(&classifier(), &insert_event(json!({"_id": "t1", "x": 1})))
            .await
            .unwrap();
        assert!(id.is_some());

        let delivered = queue
            .dequeue("mongoclaw:agent:classifier", "g", "c", 1, 10)
            .await
            .unwrap();
        let item = &delivered[0].1;
        assert_eq!(item.metadata.delivery_semantics, "at_least_once");
        assert_eq!(item.metadata.routing_strategy.as_deref(), Some("by_agent"));
        assert_eq!(
            item.metadata.stream.as_deref(),
            Some("mongoclaw:agent:classifier")
        );
        assert!(item.idempotency_key.is_some());
    }

    #[tokio::test]
    async fn duplicate_content_is_deduplicated() {
        let (dispatcher, _) = dispatcher_with(fast_config());
        let agent = classifier();
        let event = insert_event(json!({"_id": "t1", "x": 1}));

        let first = dispatcher.dispatch(&agent, &event).await.unwrap();
        assert!(first.is_some());
        let second = dispatcher.dispatch(&agent, &event).await.unwrap();
        assert!(second.is_none());
        assert_eq!(dispatcher.stats().deduplicated, 1);
        assert_eq!(dispatcher.stats().dispatched, 1);

        // Different content is not deduplicated.
        let third = dispatcher
            .dispatch(&agent, &insert_event(json!({"_id": "t1", "x": 2})))
            .await
            .unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn dedup_can_be_disabled() {
        let (dispatcher, _) = dispatcher_with(fast_config());
        let agent = agent(json!({
            "id": "nodedupe",
            "name": "n",
            "watch": {"database": "support", "collection": "tickets"},
            "ai": {"prompt": "p"},
            "execution": {"deduplicate": false},
        }));
        let event = insert_event(json!({"_id": "t1"}));
        assert!(dispatcher.dispatch(&agent, &event).await.unwrap().is_some());
        assert!(dispatcher.dispatch(&agent, &event).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn loop_guard_skips_framework_only_updates() {
        let (dispatcher, _) = dispatcher_with(fast_config());
        let agent = classifier();
        let mut event = insert_event(json!({"_id": "t1", "x": 1}));
        event.operation = ChangeOperation::Update;
        event.update_description = Some(UpdateDescription {
            updated_fields: json!({
                "_ai_metadata": {"model": "m"},
                "_mongoclaw_version": 4,
            }),
            removed_fields: vec![],
        });
        assert!(dispatcher.dispatch(&agent, &event).await.unwrap().is_none());

        // A user field in the same update keeps the event eligible.
        let mut event = insert_event(json!({"_id": "t2", "x": 1}));
        event.operation = ChangeOperation::Update;
        event.update_description = Some(UpdateDescription {
            updated_fields: json!({"status": "closed", "_mongoclaw_version": 4}),
            removed_fields: vec![],
        });
        assert!(dispatcher.dispatch(&agent, &event).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn backpressure_drop_policy() {
        let mut config = fast_config();
        config.redis.stream_max_len = 4;
        config.worker.dispatch_overflow_policy = OverflowPolicy::Drop;
        let (dispatcher, queue) = dispatcher_with(config);
        let agent = classifier();

        for i in 0..4 {
            dispatcher
                .dispatch(&agent, &insert_event(json!({"_id": format!("t{i}")})))
                .await
                .unwrap();
        }
        assert_eq!(
            queue.stream_length("mongoclaw:agent:classifier").await.unwrap(),
            4
        );

        let rejected = dispatcher
            .dispatch(&agent, &insert_event(json!({"_id": "overflow"})))
            .await
            .unwrap();
        assert!(rejected.is_none());
        assert_eq!(dispatcher.stats().dropped, 1);
    }

    #[tokio::test]
    async fn high_priority_bypasses_backpressure() {
        let mut config = fast_config();
        config.redis.stream_max_len = 2;
        config.worker.dispatch_overflow_policy = OverflowPolicy::Drop;
        let (dispatcher, _) = dispatcher_with(config);
        let urgent = agent(json!({
            "id": "urgent",
            "name": "u",
            "watch": {"database": "support", "collection": "tickets"},
            "ai": {"prompt": "p"},
            "execution": {"priority": 9},
        }));

        for i in 0..4 {
            let id = dispatcher
                .dispatch(&urgent, &insert_event(json!({"_id": format!("t{i}")})))
                .await
                .unwrap();
            assert!(id.is_some(), "priority >= threshold always admits");
        }
    }

    #[tokio::test]
    async fn backpressure_dlq_policy() {
        let mut config = fast_config();
        config.redis.stream_max_len = 1;
        config.worker.dispatch_overflow_policy = OverflowPolicy::Dlq;
        let (dispatcher, queue) = dispatcher_with(config);
        let agent = classifier();

        dispatcher
            .dispatch(&agent, &insert_event(json!({"_id": "t0"})))
            .await
            .unwrap();
        let rejected = dispatcher
            .dispatch(&agent, &insert_event(json!({"_id": "t1"})))
            .await
            .unwrap();
        assert!(rejected.is_none());

        let dead = queue
            .range("mongoclaw:dlq:agent:classifier", "-", "+", 10)
            .await
            .unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(
            dead[0].1.metadata.dlq.as_ref().unwrap().error_kind,
            "queue_full"
        );
    }

    #[tokio::test]
    async fn defer_forces_enqueue_when_pressure_persists() {
        let mut config = fast_config();
        config.redis.stream_max_len = 1;
        config.worker.dispatch_overflow_policy = OverflowPolicy::Defer;
        config.worker.dispatch_defer_max_attempts = 2;
        let (dispatcher, queue) = dispatcher_with(config);
        let agent = classifier();

        dispatcher
            .dispatch(&agent, &insert_event(json!({"_id": "t0"})))
            .await
            .unwrap();
        // Pressure never subsides, so the defer loop gives up and enqueues.
        let forced = dispatcher
            .dispatch(&agent, &insert_event(json!({"_id": "t1"})))
            .await
            .unwrap();
        assert!(forced.is_some());
        assert_eq!(dispatcher.stats().deferred, 1);
        assert_eq!(dispatcher.stats().forced_enqueued, 1);
        // InMemoryQueue trims to max_len, so length stays capped even after
        // the forced enqueue.
        assert_eq!(
            queue.stream_length("mongoclaw:agent:classifier").await.unwrap(),
            1
        );
    }
}

use crate::executor::Executor;
use crate::routing::{stream_patterns, AGENT_STREAM_PREFIX};
use crate::state::RuntimeState;
use crate::worker::Worker;
use mongoclaw_core::{Config, Result};
use mongoclaw_queue::Queue;
use mongoclaw_storage::{AgentListFilter, AgentStore};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REDISCOVERY_INTERVAL: Duration = Duration::from_secs(30);

/// Owns the worker tasks and the shared stream list they consume. Streams are
/// discovered from the broker by routing-strategy pattern and unioned with the
/// per-enabled-agent streams, then refreshed periodically so new agents start
/// flowing without a restart.
pub struct WorkerPool {
    queue: Arc<dyn Queue>,
    executor: Arc<Executor>,
    agent_store: Arc<dyn AgentStore>,
    state: Arc<RuntimeState>,
    config: Config,
    pool_id: String,
    streams: Arc<RwLock<Vec<String>>>,
    workers: Vec<Arc<Worker>>,
    tasks: Vec<JoinHandle<()>>,
    token: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn Queue>,
        executor: Arc<Executor>,
        agent_store: Arc<dyn AgentStore>,
        state: Arc<RuntimeState>,
        config: Config,
    ) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            queue,
            executor,
            agent_store,
            state,
            config,
            pool_id: format!("pool-{}", &suffix[..8]),
            streams: Arc::new(RwLock::new(Vec::new())),
            workers: Vec::new(),
            tasks: Vec::new(),
            token: CancellationToken::new(),
        }
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    /// Shared live stream list, also consumed by the reclaim loop.
    pub fn streams(&self) -> Arc<RwLock<Vec<String>>> {
        Arc::clone(&self.streams)
    }

    pub async fn start(&mut self) -> Result<()> {
        self.discover_streams().await?;
        info!(
            pool_id = %self.pool_id,
            pool_size = self.config.worker.pool_size,
            streams = self.streams.read().len(),
            "starting worker pool"
        );

        for index in 0..self.config.worker.pool_size {
            let worker = Arc::new(Worker::new(
                format!("{}-worker-{index}", self.pool_id),
                Arc::clone(&self.queue),
                Arc::clone(&self.executor),
                Arc::clone(&self.state),
                self.config.clone(),
                Arc::clone(&self.streams),
            ));
            let token = self.token.clone();
            let task = tokio::spawn({
                let worker = Arc::clone(&worker);
                async move { worker.run(token).await }
            });
            self.workers.push(worker);
            self.tasks.push(task);
        }

        let rediscovery = tokio::spawn({
            let queue = Arc::clone(&self.queue);
            let agent_store = Arc::clone(&self.agent_store);
            let streams = Arc::clone(&self.streams);
            let config = self.config.clone();
            let token = self.token.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(REDISCOVERY_INTERVAL) => {}
                    }
                    match discover(&*queue, &*agent_store, &config).await {
                        Ok(discovered) => {
                            let mut current = streams.write();
                            if *current != discovered {
                                info!(
                                    count = discovered.len(),
                                    "stream discovery updated worker subscriptions"
                                );
                                *current = discovered;
                            }
                        }
                        Err(err) => warn!(error = %err, "stream discovery failed"),
                    }
                }
            }
        });
        self.tasks.push(rediscovery);
        Ok(())
    }

    /// Signal shutdown and allow in-flight items up to `shutdown_timeout` to
    /// reach a terminal state.
    pub async fn shutdown(&mut self) {
        info!(pool_id = %self.pool_id, "shutting down worker pool");
        self.token.cancel();
        let drain = Duration::from_secs_f64(self.config.worker.shutdown_timeout);
        for task in self.tasks.drain(..) {
            if tokio::time::timeout(drain, task).await.is_err() {
                warn!(pool_id = %self.pool_id, "worker did not drain within shutdown timeout");
            }
        }
        let processed: u64 = self.workers.iter().map(|worker| worker.processed()).sum();
        let errors: u64 = self.workers.iter().map(|worker| worker.errors()).sum();
        info!(
            pool_id = %self.pool_id,
            total_processed = processed,
            total_errors = errors,
            "worker pool shutdown complete"
        );
        self.workers.clear();
    }

    async fn discover_streams(&self) -> Result<()> {
        let discovered = discover(&*self.queue, &*self.agent_store, &self.config).await?;
        debug!(count = discovered.len(), "discovered streams");
        *self.streams.write() = discovered;
        Ok(())
    }
}

async fn discover(
    queue: &dyn Queue,
    agent_store: &dyn AgentStore,
    config: &Config,
) -> Result<Vec<String>> {
    let mut streams = BTreeSet::new();
    for pattern in stream_patterns(config.worker.routing_strategy) {
        if pattern.contains('*') {
            streams.extend(queue.discover_streams(pattern).await?);
        } else {
            streams.insert(pattern.to_string());
        }
    }
    // Streams for enabled agents may not exist in the broker yet; subscribe
    // anyway so first dispatches are consumed promptly.
    let enabled = agent_store.list(AgentListFilter::enabled()).await?;
    for agent in enabled {
        streams.insert(format!("{AGENT_STREAM_PREFIX}{}", agent.id));
    }
    Ok(streams.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::StaticProvider;
    use crate::writer::ResultWriter;
    use mongoclaw_core::AgentConfig;
    use mongoclaw_queue::InMemoryQueue;
    use mongoclaw_storage::{
        DocumentStore, InMemoryAgentStore, InMemoryDocumentStore, InMemoryExecutionStore,
        InMemoryIdempotencyStore,
    };
    use serde_json::json;

    async fn seed(agents: &Arc<InMemoryAgentStore>, id: &str) {
        let config: AgentConfig = serde_json::from_value(json!({
            "id": id,
            "name": id,
            "watch": {"database": "support", "collection": "tickets"},
            "ai": {"prompt": "p"},
        }))
        .unwrap();
        agents.create(config).await.unwrap();
    }

    #[tokio::test]
    async fn discovery_unions_patterns_and_enabled_agents() {
        let queue = Arc::new(InMemoryQueue::new(100));
        let agents = Arc::new(InMemoryAgentStore::new());
        seed(&agents, "fresh").await;
        // A stream left over from an agent that already has traffic.
        queue.push_raw("mongoclaw:agent:existing", "{}");

        let config = Config::default();
        let discovered = discover(queue.as_ref(), agents.as_ref(), &config).await.unwrap();
        assert!(discovered.contains(&"mongoclaw:agent:existing".to_string()));
        assert!(discovered.contains(&"mongoclaw:agent:fresh".to_string()));
    }

    #[tokio::test]
    async fn pool_processes_dispatched_items() {
        let queue = Arc::new(InMemoryQueue::new(100));
        let agents = Arc::new(InMemoryAgentStore::new());
        let documents = Arc::new(InMemoryDocumentStore::new());
        let executions = Arc::new(InMemoryExecutionStore::new());
        seed(&agents, "classifier").await;
        documents.insert("support", "tickets", json!({"_id": "t1"}));

        let mut config = Config::default();
        config.worker.pool_size = 2;
        config.redis.block_ms = 100;
        let state = Arc::new(RuntimeState::new());
        let executor = Arc::new(Executor::new(
            agents.clone(),
            executions.clone(),
            ResultWriter::new(
                documents.clone() as Arc<dyn DocumentStore>,
                Arc::new(InMemoryIdempotencyStore::new()),
            ),
            Arc::new(StaticProvider::new(r#"{"x": 1}"#)),
            state.clone(),
            config.worker.clone(),
        ));

        let mut pool = WorkerPool::new(
            queue.clone(),
            executor,
            agents.clone(),
            state,
            config,
        );
        pool.start().await.unwrap();

        let agent = agents.get("classifier").await.unwrap();
        let event = mongoclaw_core::ChangeEvent {
            operation: mongoclaw_core::ChangeOperation::Insert,
            database: "support".into(),
            collection: "tickets".into(),
            document_key: json!({"_id": "t1"}),
            full_document: Some(json!({"_id": "t1"})),
            update_description: None,
            resume_token: None,
            cluster_time: None,
            wall_time: chrono::Utc::now(),
        };
        let item = mongoclaw_core::WorkItem::from_event(&agent, &event);
        queue
            .enqueue(&item, "mongoclaw:agent:classifier")
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while executions.len() < 1 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("pool should process the item");

        pool.shutdown().await;
    }
}

use crate::dispatcher::Dispatcher;
use crate::executor::Executor;
use crate::pool::WorkerPool;
use crate::provider::AiProvider;
use crate::state::RuntimeState;
use crate::watcher::ChangeStreamWatcher;
use crate::writer::ResultWriter;
use futures::StreamExt;
use mongoclaw_core::{Config, Result};
use mongoclaw_queue::{ConsumerGroupManager, Queue, RedisQueue};
use mongoclaw_storage::{
    election::DEFAULT_LOCK_NAME, AgentStore, DocumentStore, LeaderElection, MongoAgentStore,
    MongoDocumentStore, MongoExecutionStore, MongoIdempotencyStore, MongoLeaseStore,
    MongoResumeTokenStore, ResumeTokenStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const IDEMPOTENCY_TTL: Duration = Duration::from_secs(86_400);

/// Wires stores, queue, election, watcher and worker pool together and owns
/// their lifecycles. Shutdown cancels bottom-up: workers drain first, then the
/// watcher, then the election lease is released.
pub struct Runtime {
    config: Config,
    pool: WorkerPool,
    election: Arc<LeaderElection>,
    watcher_token: CancellationToken,
    aux_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    mongo_client: mongodb::Client,
    queue: Arc<dyn Queue>,
}

impl Runtime {
    pub async fn start(config: Config, provider: Arc<dyn AiProvider>) -> Result<Runtime> {
        info!("starting mongoclaw runtime");
        let mongo = &config.mongodb;
        let client = mongoclaw_storage::connect(mongo).await?;

        let agent_store = Arc::new(MongoAgentStore::new(
            &client,
            &mongo.database,
            &mongo.agents_collection,
        ));
        agent_store.initialize().await?;
        let token_store = Arc::new(MongoResumeTokenStore::new(
            &client,
            &mongo.database,
            &mongo.resume_tokens_collection,
        ));
        token_store.initialize().await?;
        let execution_store = Arc::new(MongoExecutionStore::new(
            &client,
            &mongo.database,
            &mongo.executions_collection,
        ));
        execution_store.initialize().await?;
        let idempotency_store = Arc::new(MongoIdempotencyStore::new(
            &client,
            &mongo.database,
            &mongo.idempotency_collection,
            IDEMPOTENCY_TTL,
        ));
        idempotency_store.initialize().await?;
        let lease_store = Arc::new(MongoLeaseStore::new(
            &client,
            &mongo.database,
            &mongo.leader_collection,
        ));
        lease_store.initialize().await?;

        let queue: Arc<dyn Queue> = Arc::new(RedisQueue::connect(&config.redis).await?);
        queue.ping().await?;

        let state = Arc::new(RuntimeState::new());
        let documents: Arc<dyn DocumentStore> = Arc::new(MongoDocumentStore::new(client.clone()));
        let writer = ResultWriter::new(documents, idempotency_store);
        let executor = Arc::new(Executor::new(
            Arc::clone(&agent_store) as Arc<dyn AgentStore>,
            execution_store,
            writer,
            provider,
            Arc::clone(&state),
            config.worker.clone(),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&queue),
            config.clone(),
            Arc::clone(&state),
        ));
        let watcher = Arc::new(ChangeStreamWatcher::new(
            client.clone(),
            Arc::clone(&agent_store) as Arc<dyn AgentStore>,
            Arc::clone(&token_store) as Arc<dyn ResumeTokenStore>,
            dispatcher,
        ));

        let election = Arc::new(LeaderElection::new(lease_store, DEFAULT_LOCK_NAME));
        election.start().await;

        let watcher_token = CancellationToken::new();
        let aux_token = CancellationToken::new();
        let mut tasks = Vec::new();

        // The watcher runs only while this replica holds the lease; demotion
        // cancels its scope and a re-election starts a fresh one.
        tasks.push(tokio::spawn(leader_gated_watcher(
            watcher,
            election.subscribe(),
            watcher_token.clone(),
        )));

        let mut pool = WorkerPool::new(
            Arc::clone(&queue),
            executor.clone(),
            Arc::clone(&agent_store) as Arc<dyn AgentStore>,
            Arc::clone(&state),
            config.clone(),
        );
        pool.start().await?;

        let manager = ConsumerGroupManager::new(
            Arc::clone(&queue),
            config.redis.consumer_group.clone(),
        );
        tasks.push(tokio::spawn({
            let streams = pool.streams();
            let aux_token = aux_token.clone();
            async move { manager.run(streams, aux_token).await }
        }));

        // Hot reload: agent config mutations invalidate the executor cache.
        tasks.push(tokio::spawn({
            let agent_store = Arc::clone(&agent_store) as Arc<dyn AgentStore>;
            let executor = Arc::clone(&executor);
            let aux_token = aux_token.clone();
            async move {
                loop {
                    let mut feed = match agent_store.change_feed().await {
                        Ok(feed) => feed,
                        Err(err) => {
                            warn!(error = %err, "agent feed unavailable");
                            tokio::select! {
                                _ = aux_token.cancelled() => return,
                                _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                            }
                        }
                    };
                    loop {
                        tokio::select! {
                            _ = aux_token.cancelled() => return,
                            change = feed.next() => match change {
                                Some(change) => {
                                    executor.invalidate_agent(Some(change.agent_id()));
                                }
                                None => break,
                            }
                        }
                    }
                    tokio::select! {
                        _ = aux_token.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }));

        info!("mongoclaw runtime started");
        Ok(Runtime {
            config,
            pool,
            election,
            watcher_token,
            aux_token,
            tasks,
            mongo_client: client,
            queue,
        })
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    pub async fn ready(&self) -> bool {
        let mongo_ok = self
            .mongo_client
            .database(&self.config.mongodb.database)
            .run_command(mongodb::bson::doc! {"ping": 1})
            .await
            .is_ok();
        let queue_ok = self.queue.ping().await.is_ok();
        mongo_ok && queue_ok
    }

    /// Graceful shutdown: drain workers, stop the watcher, stop auxiliary
    /// loops, then release leadership.
    pub async fn shutdown(mut self) {
        info!("stopping mongoclaw runtime");
        self.pool.shutdown().await;
        self.watcher_token.cancel();
        self.aux_token.cancel();
        let drain = Duration::from_secs_f64(self.config.worker.shutdown_timeout);
        for task in self.tasks.drain(..) {
            if tokio::time::timeout(drain, task).await.is_err() {
                warn!("runtime task did not stop within shutdown timeout");
            }
        }
        self.election.stop().await;
        info!("mongoclaw runtime stopped");
    }
}

async fn leader_gated_watcher(
    watcher: Arc<ChangeStreamWatcher>,
    mut leadership: tokio::sync::watch::Receiver<bool>,
    token: CancellationToken,
) {
    loop {
        // Wait for election.
        while !*leadership.borrow_and_update() {
            tokio::select! {
                _ = token.cancelled() => return,
                changed = leadership.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        info!("elected leader; starting change stream watcher");
        let scope = token.child_token();
        let run = tokio::spawn({
            let watcher = Arc::clone(&watcher);
            let scope = scope.clone();
            async move { watcher.run(scope).await }
        });

        // Demotion or shutdown ends this leadership period.
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    scope.cancel();
                    let _ = run.await;
                    return;
                }
                changed = leadership.changed() => {
                    if changed.is_err() || !*leadership.borrow_and_update() {
                        info!("demoted; stopping change stream watcher");
                        scope.cancel();
                        let _ = run.await;
                        break;
                    }
                }
            }
        }
    }
}

use crate::dispatcher::Dispatcher;
use crate::matcher::EventMatcher;
use crate::metrics;
use futures::StreamExt;
use mongoclaw_core::{ChangeEvent, ChangeOperation, Result};
use mongoclaw_storage::{AgentStore, ResumeTokenStore};
use mongodb::bson::Document;
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::options::FullDocumentType;
use mongodb::Client;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REFRESH_INTERVAL: Duration = Duration::from_secs(5);
const RECONNECT_BASE_DELAY: f64 = 1.0;
const RECONNECT_MAX_DELAY: f64 = 60.0;
const RECONNECT_MAX_RETRIES: u32 = 5;

/// Tails one change-stream cursor per watched `(database, collection)` pair,
/// persists resume tokens before dispatch, and reconciles the cursor set
/// against the enabled agents. Runs only on the elected leader.
pub struct ChangeStreamWatcher {
    client: Client,
    agent_store: Arc<dyn AgentStore>,
    token_store: Arc<dyn ResumeTokenStore>,
    matcher: EventMatcher,
    dispatcher: Arc<Dispatcher>,
    cursors: Mutex<HashMap<String, (CancellationToken, JoinHandle<()>)>>,
}

impl ChangeStreamWatcher {
    pub fn new(
        client: Client,
        agent_store: Arc<dyn AgentStore>,
        token_store: Arc<dyn ResumeTokenStore>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        let matcher = EventMatcher::new(Arc::clone(&agent_store));
        Self {
            client,
            agent_store,
            token_store,
            matcher,
            dispatcher,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Supervise cursors until the token is cancelled: an initial
    /// reconciliation, a periodic refresh loop, and a tail over the agents
    /// collection that forces reconciliation on any config mutation.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!("change stream watcher started");
        if let Err(err) = self.refresh_watches(&token).await {
            warn!(error = %err, "initial watch refresh failed");
        }

        let feed_task = tokio::spawn({
            let watcher = Arc::clone(&self);
            let token = token.clone();
            async move { watcher.tail_agent_configs(token).await }
        });

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(REFRESH_INTERVAL) => {
                    if let Err(err) = self.refresh_watches(&token).await {
                        warn!(error = %err, "watch refresh failed");
                    }
                }
            }
        }

        feed_task.abort();
        self.stop_all().await;
        info!("change stream watcher stopped");
    }

    /// Open cursors for new watch targets and close cursors for retired ones.
    pub async fn refresh_watches(self: &Arc<Self>, token: &CancellationToken) -> Result<()> {
        let targets = self.agent_store.get_all_watch_targets(true).await?;
        let desired: HashMap<String, (String, String)> = targets
            .into_iter()
            .map(|(database, collection)| {
                (format!("{database}.{collection}"), (database, collection))
            })
            .collect();

        let (to_stop, to_start) = {
            let cursors = self.cursors.lock();
            let stop: Vec<String> = cursors
                .keys()
                .filter(|ns| !desired.contains_key(*ns))
                .cloned()
                .collect();
            let start: Vec<(String, String, String)> = desired
                .iter()
                .filter(|(ns, _)| !cursors.contains_key(*ns))
                .map(|(ns, (database, collection))| {
                    (ns.clone(), database.clone(), collection.clone())
                })
                .collect();
            (stop, start)
        };

        for namespace in &to_stop {
            self.stop_watch(namespace).await;
        }
        for (namespace, database, collection) in &to_start {
            self.start_watch(namespace, database, collection, token);
        }
        if !to_stop.is_empty() || !to_start.is_empty() {
            info!(
                total = desired.len(),
                added = to_start.len(),
                removed = to_stop.len(),
                "refreshed watches"
            );
        }
        Ok(())
    }

    fn start_watch(
        self: &Arc<Self>,
        namespace: &str,
        database: &str,
        collection: &str,
        token: &CancellationToken,
    ) {
        debug!(namespace, "starting watch");
        let cursor_token = token.child_token();
        let task = tokio::spawn({
            let watcher = Arc::clone(self);
            let database = database.to_string();
            let collection = collection.to_string();
            let cursor_token = cursor_token.clone();
            async move {
                watcher
                    .watch_namespace(database, collection, cursor_token)
                    .await;
            }
        });
        self.cursors
            .lock()
            .insert(namespace.to_string(), (cursor_token, task));
    }

    async fn stop_watch(&self, namespace: &str) {
        let entry = self.cursors.lock().remove(namespace);
        if let Some((cursor_token, task)) = entry {
            debug!(namespace, "stopping watch");
            cursor_token.cancel();
            let _ = task.await;
        }
    }

    async fn stop_all(&self) {
        let cursors: Vec<(String, (CancellationToken, JoinHandle<()>))> =
            self.cursors.lock().drain().collect();
        for (_, (cursor_token, task)) in cursors {
            cursor_token.cancel();
            let _ = task.await;
        }
    }

    /// One cursor lifecycle: open (resuming from the saved token when one
    /// exists), consume, and on error reconnect with exponential backoff from
    /// the latest saved token.
    async fn watch_namespace(
        self: Arc<Self>,
        database: String,
        collection: String,
        token: CancellationToken,
    ) {
        let namespace = format!("{database}.{collection}");
        let mut retries = 0u32;

        while !token.is_cancelled() {
            let resume_token = match self.token_store.get(&database, &collection).await {
                Ok(saved) => saved,
                Err(err) => {
                    warn!(namespace = %namespace, error = %err, "resume token load failed");
                    None
                }
            };

            let target = self
                .client
                .database(&database)
                .collection::<Document>(&collection);
            let mut watch = target
                .watch()
                .full_document(FullDocumentType::UpdateLookup);
            if let Some(saved) = resume_token {
                match serde_json::from_value::<ResumeToken>(saved) {
                    Ok(resume) => {
                        info!(namespace = %namespace, "resuming watch from saved token");
                        watch = watch.resume_after(resume);
                    }
                    Err(err) => {
                        warn!(namespace = %namespace, error = %err, "saved resume token unusable");
                    }
                }
            }

            let mut stream = match watch.await {
                Ok(stream) => {
                    retries = 0;
                    info!(namespace = %namespace, "change stream opened");
                    stream
                }
                Err(err) => {
                    retries += 1;
                    if retries > RECONNECT_MAX_RETRIES {
                        error!(namespace = %namespace, error = %err, "change stream retries exhausted");
                        return;
                    }
                    let delay = reconnect_delay(retries);
                    warn!(
                        namespace = %namespace,
                        error = %err,
                        retries,
                        delay_seconds = delay.as_secs_f64(),
                        "change stream open failed; retrying"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => return,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(raw)) => {
                        if let Err(err) = self.handle_change(raw, &database, &collection).await {
                            warn!(namespace = %namespace, error = %err, "change event handling failed");
                        }
                    }
                    Some(Err(err)) => {
                        retries += 1;
                        if retries > RECONNECT_MAX_RETRIES {
                            error!(namespace = %namespace, error = %err, "change stream retries exhausted");
                            return;
                        }
                        let delay = reconnect_delay(retries);
                        warn!(
                            namespace = %namespace,
                            error = %err,
                            retries,
                            delay_seconds = delay.as_secs_f64(),
                            "change stream error; reconnecting"
                        );
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        break;
                    }
                    None => {
                        debug!(namespace = %namespace, "change stream closed; reopening");
                        break;
                    }
                }
            }
        }
    }

    async fn handle_change(
        &self,
        raw: ChangeStreamEvent<Document>,
        database: &str,
        collection: &str,
    ) -> Result<()> {
        let event = parse_change_event(raw, database, collection)?;
        metrics::CHANGE_EVENTS_TOTAL
            .with_label_values(&[database, collection, event.operation.as_str()])
            .inc();
        debug!(
            operation = event.operation.as_str(),
            namespace = %event.namespace(),
            document_id = %event.document_id(),
            "received change event"
        );

        // Persist the token before dispatch: a dispatch failure re-delivers
        // from here on restart instead of losing the event.
        if let Some(resume_token) = &event.resume_token {
            self.token_store
                .save(database, collection, resume_token)
                .await?;
        }

        let matched = self.matcher.match_event(&event).await?;
        if matched.is_empty() {
            return Ok(());
        }
        info!(
            document_id = %event.document_id(),
            agent_count = matched.len(),
            "matched agents"
        );
        for agent in matched {
            if let Err(err) = self.dispatcher.dispatch(&agent, &event).await {
                warn!(
                    agent_id = %agent.id,
                    document_id = %event.document_id(),
                    error = %err,
                    "dispatch failed"
                );
            }
        }
        Ok(())
    }

    /// Tail the agents collection through the store's change feed; any
    /// mutation forces reconciliation so new watch targets open promptly.
    async fn tail_agent_configs(self: Arc<Self>, token: CancellationToken) {
        while !token.is_cancelled() {
            let mut feed = match self.agent_store.change_feed().await {
                Ok(feed) => feed,
                Err(err) => {
                    warn!(error = %err, "agent config feed unavailable");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            };
            info!("agent config watch opened");
            loop {
                let change = tokio::select! {
                    _ = token.cancelled() => return,
                    change = feed.next() => change,
                };
                match change {
                    Some(change) => {
                        debug!(agent_id = change.agent_id(), "agent config changed");
                        if let Err(err) = self.refresh_watches(&token).await {
                            warn!(error = %err, "forced watch refresh failed");
                        }
                    }
                    None => {
                        warn!("agent config feed closed; reopening");
                        break;
                    }
                }
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }
}

fn reconnect_delay(retries: u32) -> Duration {
    let delay = RECONNECT_BASE_DELAY * 2f64.powi(retries.min(16) as i32);
    Duration::from_secs_f64(delay.min(RECONNECT_MAX_DELAY))
}

fn map_operation(operation: &OperationType) -> ChangeOperation {
    match operation {
        OperationType::Insert => ChangeOperation::Insert,
        OperationType::Update => ChangeOperation::Update,
        OperationType::Replace => ChangeOperation::Replace,
        OperationType::Delete => ChangeOperation::Delete,
        // Unknown operation kinds are coerced to update so stored rules keep
        // working against newer server versions.
        _ => ChangeOperation::Update,
    }
}

fn parse_change_event(
    raw: ChangeStreamEvent<Document>,
    database: &str,
    collection: &str,
) -> Result<ChangeEvent> {
    let to_json = |document: &Document| {
        serde_json::to_value(document).map_err(|err| mongoclaw_core::Error::Storage(err.to_string()))
    };
    let document_key = raw
        .document_key
        .as_ref()
        .map(&to_json)
        .transpose()?
        .unwrap_or_else(|| serde_json::json!({}));
    let full_document = raw.full_document.as_ref().map(&to_json).transpose()?;
    let update_description = raw
        .update_description
        .as_ref()
        .map(|update| {
            Ok::<_, mongoclaw_core::Error>(mongoclaw_core::UpdateDescription {
                updated_fields: to_json(&update.updated_fields)?,
                removed_fields: update.removed_fields.clone(),
            })
        })
        .transpose()?;
    let resume_token = serde_json::to_value(&raw.id).ok();

    Ok(ChangeEvent {
        operation: map_operation(&raw.operation_type),
        database: database.to_string(),
        collection: collection.to_string(),
        document_key,
        full_document,
        update_description,
        resume_token,
        cluster_time: None,
        wall_time: chrono::Utc::now(),
    })
}

//! In-memory implementations of the storage traits, used by tests and by
//! components that need a queue-of-record-free harness.

use crate::traits::{
    AgentChange, AgentListFilter, AgentStore, DocumentStore, ExecutionStore, IdempotencyStore,
    LeaseStore, ResumeTokenStore, UpdateOutcome,
};
use chrono::{DateTime, Duration, Utc};
use futures::stream::{BoxStream, StreamExt};
use mongoclaw_core::filter::matches_filter;
use mongoclaw_core::{AgentConfig, Error, ExecutionRecord, ExecutionStatus, Result};
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

#[derive(Clone)]
pub struct InMemoryAgentStore {
    inner: Arc<RwLock<HashMap<String, AgentConfig>>>,
    feed: broadcast::Sender<AgentChange>,
}

impl Default for InMemoryAgentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAgentStore {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            feed,
        }
    }

    fn notify(&self, change: AgentChange) {
        let _ = self.feed.send(change);
    }
}

#[async_trait::async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn create(&self, mut config: AgentConfig) -> Result<AgentConfig> {
        config.validate()?;
        config.version = 1;
        config.created_at = Utc::now();
        config.updated_at = config.created_at;
        {
            let mut inner = self.inner.write();
            if inner.contains_key(&config.id) {
                return Err(Error::AgentAlreadyExists(config.id));
            }
            inner.insert(config.id.clone(), config.clone());
        }
        self.notify(AgentChange::Created(config.id.clone()));
        Ok(config)
    }

    async fn get(&self, agent_id: &str) -> Result<AgentConfig> {
        self.get_optional(agent_id)
            .await?
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))
    }

    async fn get_optional(&self, agent_id: &str) -> Result<Option<AgentConfig>> {
        Ok(self.inner.read().get(agent_id).cloned())
    }

    async fn update(&self, mut config: AgentConfig) -> Result<AgentConfig> {
        config.validate()?;
        config.version += 1;
        config.updated_at = Utc::now();
        {
            let mut inner = self.inner.write();
            if !inner.contains_key(&config.id) {
                return Err(Error::AgentNotFound(config.id));
            }
            inner.insert(config.id.clone(), config.clone());
        }
        self.notify(AgentChange::Updated(config.id.clone()));
        Ok(config)
    }

    async fn delete(&self, agent_id: &str) -> Result<bool> {
        let removed = self.inner.write().remove(agent_id).is_some();
        if removed {
            self.notify(AgentChange::Deleted(agent_id.to_string()));
        }
        Ok(removed)
    }

    async fn set_enabled(&self, agent_id: &str, enabled: bool) -> Result<bool> {
        let updated = {
            let mut inner = self.inner.write();
            match inner.get_mut(agent_id) {
                Some(config) => {
                    config.enabled = enabled;
                    config.version += 1;
                    config.updated_at = Utc::now();
                    true
                }
                None => false,
            }
        };
        if updated {
            self.notify(AgentChange::Updated(agent_id.to_string()));
        }
        Ok(updated)
    }

    async fn list(&self, filter: AgentListFilter) -> Result<Vec<AgentConfig>> {
        let inner = self.inner.read();
        let mut agents: Vec<AgentConfig> = inner
            .values()
            .filter(|a| !filter.enabled_only || a.enabled)
            .filter(|a| {
                filter
                    .tags
                    .as_ref()
                    .map(|tags| tags.iter().any(|t| a.tags.contains(t)))
                    .unwrap_or(true)
            })
            .filter(|a| {
                filter
                    .database
                    .as_ref()
                    .map(|db| &a.watch.database == db)
                    .unwrap_or(true)
            })
            .filter(|a| {
                filter
                    .collection
                    .as_ref()
                    .map(|coll| &a.watch.collection == coll)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        agents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let limit = if filter.limit > 0 {
            filter.limit as usize
        } else {
            100
        };
        Ok(agents
            .into_iter()
            .skip(filter.skip as usize)
            .take(limit)
            .collect())
    }

    async fn count(&self, enabled_only: bool) -> Result<u64> {
        let inner = self.inner.read();
        Ok(inner
            .values()
            .filter(|a| !enabled_only || a.enabled)
            .count() as u64)
    }

    async fn get_by_watch_target(
        &self,
        database: &str,
        collection: &str,
        enabled_only: bool,
    ) -> Result<Vec<AgentConfig>> {
        let inner = self.inner.read();
        let mut agents: Vec<AgentConfig> = inner
            .values()
            .filter(|a| a.watch.database == database && a.watch.collection == collection)
            .filter(|a| !enabled_only || a.enabled)
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(agents)
    }

    async fn get_all_watch_targets(&self, enabled_only: bool) -> Result<Vec<(String, String)>> {
        let inner = self.inner.read();
        let mut targets: Vec<(String, String)> = inner
            .values()
            .filter(|a| !enabled_only || a.enabled)
            .map(|a| (a.watch.database.clone(), a.watch.collection.clone()))
            .collect();
        targets.sort();
        targets.dedup();
        Ok(targets)
    }

    async fn change_feed(&self) -> Result<BoxStream<'static, AgentChange>> {
        let stream = BroadcastStream::new(self.feed.subscribe())
            .filter_map(|change| async move { change.ok() });
        Ok(Box::pin(stream))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryResumeTokenStore {
    inner: Arc<RwLock<HashMap<(String, String), (JsonValue, DateTime<Utc>)>>>,
}

impl InMemoryResumeTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ResumeTokenStore for InMemoryResumeTokenStore {
    async fn save(&self, database: &str, collection: &str, token: &JsonValue) -> Result<()> {
        self.inner.write().insert(
            (database.to_string(), collection.to_string()),
            (token.clone(), Utc::now()),
        );
        Ok(())
    }

    async fn get(&self, database: &str, collection: &str) -> Result<Option<JsonValue>> {
        Ok(self
            .inner
            .read()
            .get(&(database.to_string(), collection.to_string()))
            .map(|(token, _)| token.clone()))
    }

    async fn delete(&self, database: &str, collection: &str) -> Result<bool> {
        Ok(self
            .inner
            .write()
            .remove(&(database.to_string(), collection.to_string()))
            .is_some())
    }

    async fn age_seconds(&self, database: &str, collection: &str) -> Result<Option<f64>> {
        Ok(self
            .inner
            .read()
            .get(&(database.to_string(), collection.to_string()))
            .map(|(_, updated)| (Utc::now() - *updated).num_milliseconds() as f64 / 1000.0))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryExecutionStore {
    inner: Arc<RwLock<HashMap<String, ExecutionRecord>>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[async_trait::async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn record(&self, record: &ExecutionRecord) -> Result<()> {
        self.inner
            .write()
            .insert(record.work_item_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, work_item_id: &str) -> Result<Option<ExecutionRecord>> {
        Ok(self.inner.read().get(work_item_id).cloned())
    }

    async fn list(
        &self,
        agent_id: Option<&str>,
        status: Option<ExecutionStatus>,
        limit: i64,
    ) -> Result<Vec<ExecutionRecord>> {
        let inner = self.inner.read();
        let mut records: Vec<ExecutionRecord> = inner
            .values()
            .filter(|r| agent_id.map(|id| r.agent_id == id).unwrap_or(true))
            .filter(|r| status.map(|s| r.status == s).unwrap_or(true))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        records.truncate(limit.max(1) as usize);
        Ok(records)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryIdempotencyStore {
    inner: Arc<RwLock<HashMap<String, (String, String)>>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[async_trait::async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn seen(&self, key: &str) -> Result<bool> {
        Ok(self.inner.read().contains_key(key))
    }

    async fn record(&self, key: &str, agent_id: &str, work_item_id: &str) -> Result<()> {
        self.inner.write().entry(key.to_string()).or_insert_with(|| {
            (agent_id.to_string(), work_item_id.to_string())
        });
        Ok(())
    }
}

struct LeaseEntry {
    holder: String,
    expires_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct InMemoryLeaseStore {
    inner: Arc<RwLock<HashMap<String, LeaseEntry>>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_acquire(&self, lock_name: &str, holder: &str, lease_seconds: f64) -> Result<bool> {
        let now = Utc::now();
        let expires_at = now + Duration::milliseconds((lease_seconds * 1000.0) as i64);
        let mut inner = self.inner.write();
        match inner.get_mut(lock_name) {
            Some(entry) if entry.holder != holder && entry.expires_at >= now => Ok(false),
            Some(entry) => {
                entry.holder = holder.to_string();
                entry.expires_at = expires_at;
                Ok(true)
            }
            None => {
                inner.insert(
                    lock_name.to_string(),
                    LeaseEntry {
                        holder: holder.to_string(),
                        expires_at,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn renew(&self, lock_name: &str, holder: &str, lease_seconds: f64) -> Result<bool> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        match inner.get_mut(lock_name) {
            Some(entry) if entry.holder == holder => {
                entry.expires_at = now + Duration::milliseconds((lease_seconds * 1000.0) as i64);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, lock_name: &str, holder: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        match inner.get(lock_name) {
            Some(entry) if entry.holder == holder => {
                inner.remove(lock_name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current_holder(&self, lock_name: &str) -> Result<Option<String>> {
        let inner = self.inner.read();
        Ok(inner
            .get(lock_name)
            .filter(|entry| entry.expires_at >= Utc::now())
            .map(|entry| entry.holder.clone()))
    }
}

/// Documents keyed by `(database, collection)` then `_id` string. Applies the
/// update-operator subset the result writer emits.
#[derive(Clone, Default)]
pub struct InMemoryDocumentStore {
    inner: Arc<RwLock<HashMap<(String, String), HashMap<String, JsonValue>>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, database: &str, collection: &str, document: JsonValue) {
        let id = document
            .get("_id")
            .map(value_to_id)
            .unwrap_or_default();
        self.inner
            .write()
            .entry((database.to_string(), collection.to_string()))
            .or_default()
            .insert(id, document);
    }

    pub fn get(&self, database: &str, collection: &str, id: &str) -> Option<JsonValue> {
        self.inner
            .read()
            .get(&(database.to_string(), collection.to_string()))
            .and_then(|docs| docs.get(id).cloned())
    }
}

fn value_to_id(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn apply_update(document: &mut JsonValue, update: &JsonValue) {
    let Some(ops) = update.as_object() else {
        return;
    };
    for (op, spec) in ops {
        let Some(fields) = spec.as_object() else {
            continue;
        };
        match op.as_str() {
            "$set" => {
                for (path, value) in fields {
                    set_path(document, path, value.clone());
                }
            }
            "$inc" => {
                for (path, delta) in fields {
                    let current = mongoclaw_core::filter::field_value(document, path)
                        .and_then(JsonValue::as_i64)
                        .unwrap_or(0);
                    let delta = delta.as_i64().unwrap_or(0);
                    set_path(document, path, JsonValue::from(current + delta));
                }
            }
            "$push" => {
                for (path, spec) in fields {
                    let items: Vec<JsonValue> = match spec.get("$each") {
                        Some(JsonValue::Array(each)) => each.clone(),
                        _ => vec![spec.clone()],
                    };
                    let existing = mongoclaw_core::filter::field_value(document, path).cloned();
                    let mut array = match existing {
                        Some(JsonValue::Array(items)) => items,
                        _ => Vec::new(),
                    };
                    array.extend(items);
                    set_path(document, path, JsonValue::Array(array));
                }
            }
            _ => {}
        }
    }
}

fn set_path(document: &mut JsonValue, path: &str, value: JsonValue) {
    let mut current = document;
    let parts: Vec<&str> = path.split('.').collect();
    for part in &parts[..parts.len() - 1] {
        if !current.is_object() {
            *current = JsonValue::Object(Default::default());
        }
        let Some(map) = current.as_object_mut() else {
            return;
        };
        current = map
            .entry(part.to_string())
            .or_insert_with(|| JsonValue::Object(Default::default()));
    }
    if !current.is_object() {
        *current = JsonValue::Object(Default::default());
    }
    if let Some(map) = current.as_object_mut() {
        map.insert(parts[parts.len() - 1].to_string(), value);
    }
}

#[async_trait::async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn update_document(
        &self,
        database: &str,
        collection: &str,
        filter: &JsonValue,
        update: &JsonValue,
    ) -> Result<UpdateOutcome> {
        let mut inner = self.inner.write();
        let Some(docs) = inner.get_mut(&(database.to_string(), collection.to_string())) else {
            return Ok(UpdateOutcome::default());
        };
        for document in docs.values_mut() {
            if matches_filter(document, filter) {
                apply_update(document, update);
                return Ok(UpdateOutcome {
                    matched: 1,
                    modified: 1,
                });
            }
        }
        Ok(UpdateOutcome::default())
    }

    async fn find_document(
        &self,
        database: &str,
        collection: &str,
        filter: &JsonValue,
    ) -> Result<Option<JsonValue>> {
        let inner = self.inner.read();
        Ok(inner
            .get(&(database.to_string(), collection.to_string()))
            .and_then(|docs| {
                docs.values()
                    .find(|document| matches_filter(document, filter))
                    .cloned()
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn agent(id: &str, enabled: bool) -> AgentConfig {
        let mut config: AgentConfig = serde_json::from_value(json!({
            "id": id,
            "name": id,
            "watch": {"database": "support", "collection": "tickets"},
            "ai": {"prompt": "p"},
        }))
        .unwrap();
        config.enabled = enabled;
        config
    }

    #[tokio::test]
    async fn agent_store_crud() {
        let store = InMemoryAgentStore::new();
        store.create(agent("one", true)).await.unwrap();
        assert!(matches!(
            store.create(agent("one", true)).await,
            Err(Error::AgentAlreadyExists(_))
        ));

        let mut fetched = store.get("one").await.unwrap();
        assert_eq!(fetched.version, 1);
        fetched.name = "renamed".into();
        let updated = store.update(fetched).await.unwrap();
        assert_eq!(updated.version, 2);

        assert!(store.set_enabled("one", false).await.unwrap());
        assert_eq!(store.count(true).await.unwrap(), 0);
        assert!(store.delete("one").await.unwrap());
        assert!(matches!(store.get("one").await, Err(Error::AgentNotFound(_))));
    }

    #[tokio::test]
    async fn watch_targets_are_distinct_pairs() {
        let store = InMemoryAgentStore::new();
        store.create(agent("a", true)).await.unwrap();
        store.create(agent("b", true)).await.unwrap();
        let mut disabled = agent("c", false);
        disabled.watch.collection = "orders".into();
        store.create(disabled).await.unwrap();

        let targets = store.get_all_watch_targets(true).await.unwrap();
        assert_eq!(targets, vec![("support".into(), "tickets".into())]);
        let all = store.get_all_watch_targets(false).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn change_feed_emits_mutations() {
        let store = InMemoryAgentStore::new();
        let mut feed = store.change_feed().await.unwrap();
        store.create(agent("one", true)).await.unwrap();
        assert_eq!(feed.next().await, Some(AgentChange::Created("one".into())));
        store.set_enabled("one", false).await.unwrap();
        assert_eq!(feed.next().await, Some(AgentChange::Updated("one".into())));
    }

    #[tokio::test]
    async fn resume_tokens_are_last_write_wins() {
        let store = InMemoryResumeTokenStore::new();
        store
            .save("support", "tickets", &json!({"_data": "a"}))
            .await
            .unwrap();
        store
            .save("support", "tickets", &json!({"_data": "b"}))
            .await
            .unwrap();
        assert_eq!(
            store.get("support", "tickets").await.unwrap(),
            Some(json!({"_data": "b"}))
        );
        assert!(store.age_seconds("support", "tickets").await.unwrap().is_some());
        assert!(store.delete("support", "tickets").await.unwrap());
        assert_eq!(store.get("support", "tickets").await.unwrap(), None);
    }

    #[tokio::test]
    async fn lease_store_is_exclusive() {
        let store = InMemoryLeaseStore::new();
        assert!(store.try_acquire("lock", "a", 30.0).await.unwrap());
        assert!(!store.try_acquire("lock", "b", 30.0).await.unwrap());
        // Re-acquire by the holder is a renewal.
        assert!(store.try_acquire("lock", "a", 30.0).await.unwrap());
        assert_eq!(store.current_holder("lock").await.unwrap(), Some("a".into()));
        assert!(store.release("lock", "a").await.unwrap());
        assert!(store.try_acquire("lock", "b", 30.0).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_stolen() {
        let store = InMemoryLeaseStore::new();
        assert!(store.try_acquire("lock", "a", -1.0).await.unwrap());
        assert!(store.try_acquire("lock", "b", 30.0).await.unwrap());
        assert_eq!(store.current_holder("lock").await.unwrap(), Some("b".into()));
    }

    #[tokio::test]
    async fn document_store_applies_update_operators() {
        let store = InMemoryDocumentStore::new();
        store.insert("support", "tickets", json!({"_id": "t1", "status": "new"}));

        store
            .update_document(
                "support",
                "tickets",
                &json!({"_id": "t1"}),
                &json!({
                    "$set": {"ai.category": "billing"},
                    "$inc": {"_mongoclaw_version": 1},
                    "$push": {"history": {"$each": [{"event": "enriched"}]}},
                }),
            )
            .await
            .unwrap();

        let doc = store.get("support", "tickets", "t1").unwrap();
        assert_eq!(doc["ai"]["category"], "billing");
        assert_eq!(doc["_mongoclaw_version"], 1);
        assert_eq!(doc["history"][0]["event"], "enriched");
    }

    #[tokio::test]
    async fn document_store_honors_version_predicate() {
        let store = InMemoryDocumentStore::new();
        store.insert(
            "support",
            "tickets",
            json!({"_id": "t1", "_mongoclaw_version": 4}),
        );
        let outcome = store
            .update_document(
                "support",
                "tickets",
                &json!({"_id": "t1", "_mongoclaw_version": 3}),
                &json!({"$set": {"x": 1}}),
            )
            .await
            .unwrap();
        assert_eq!(outcome.matched, 0);
    }
}

use crate::traits::{
    AgentChange, AgentListFilter, AgentStore, DocumentStore, ExecutionStore, IdempotencyStore,
    LeaseStore, ResumeTokenStore, UpdateOutcome,
};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use mongoclaw_core::{AgentConfig, Error, ExecutionRecord, ExecutionStatus, MongoConfig, Result};
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::change_stream::event::OperationType;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, Collection, IndexModel};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::warn;

pub(crate) fn storage_err<E: std::fmt::Display>(err: E) -> Error {
    Error::Storage(err.to_string())
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    if let ErrorKind::Write(WriteFailure::WriteError(write_error)) = &*err.kind {
        write_error.code == 11000
    } else {
        false
    }
}

/// Parse a document id, accepting both plain strings and 24-hex object ids.
pub fn parse_document_id(id: &str) -> Bson {
    if id.len() == 24 {
        if let Ok(oid) = bson::oid::ObjectId::parse_str(id) {
            return Bson::ObjectId(oid);
        }
    }
    Bson::String(id.to_string())
}

pub async fn connect(config: &MongoConfig) -> Result<Client> {
    let mut options = ClientOptions::parse(&config.uri).await.map_err(storage_err)?;
    options.max_pool_size = Some(config.max_pool_size);
    options.min_pool_size = Some(config.min_pool_size);
    options.server_selection_timeout =
        Some(Duration::from_millis(config.server_selection_timeout_ms));
    Client::with_options(options).map_err(storage_err)
}

fn agent_to_doc(config: &AgentConfig) -> Result<Document> {
    let mut doc = bson::to_document(config).map_err(storage_err)?;
    if let Some(id) = doc.remove("id") {
        doc.insert("_id", id);
    }
    Ok(doc)
}

fn agent_from_doc(mut doc: Document) -> Result<AgentConfig> {
    if let Some(id) = doc.remove("_id") {
        doc.insert("id", id);
    }
    bson::from_document(doc).map_err(storage_err)
}

#[derive(Clone)]
pub struct MongoAgentStore {
    collection: Collection<Document>,
}

impl MongoAgentStore {
    pub fn new(client: &Client, database: &str, collection: &str) -> Self {
        Self {
            collection: client.database(database).collection(collection),
        }
    }

    pub async fn initialize(&self) -> Result<()> {
        let indexes = vec![
            IndexModel::builder().keys(doc! {"enabled": 1}).build(),
            IndexModel::builder()
                .keys(doc! {"watch.database": 1, "watch.collection": 1})
                .build(),
            IndexModel::builder().keys(doc! {"tags": 1}).build(),
            IndexModel::builder().keys(doc! {"created_at": -1}).build(),
        ];
        self.collection
            .create_indexes(indexes)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    fn list_query(filter: &AgentListFilter) -> Document {
        let mut query = Document::new();
        if filter.enabled_only {
            query.insert("enabled", true);
        }
        if let Some(tags) = &filter.tags {
            query.insert("tags", doc! {"$in": tags.clone()});
        }
        if let Some(database) = &filter.database {
            query.insert("watch.database", database.clone());
        }
        if let Some(collection) = &filter.collection {
            query.insert("watch.collection", collection.clone());
        }
        query
    }
}

#[async_trait::async_trait]
impl AgentStore for MongoAgentStore {
    async fn create(&self, mut config: AgentConfig) -> Result<AgentConfig> {
        config.validate()?;
        config.version = 1;
        config.created_at = chrono::Utc::now();
        config.updated_at = config.created_at;
        let doc = agent_to_doc(&config)?;
        match self.collection.insert_one(doc).await {
            Ok(_) => Ok(config),
            Err(err) if is_duplicate_key(&err) => Err(Error::AgentAlreadyExists(config.id)),
            Err(err) => Err(storage_err(err)),
        }
    }

    async fn get(&self, agent_id: &str) -> Result<AgentConfig> {
        self.get_optional(agent_id)
            .await?
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))
    }

    async fn get_optional(&self, agent_id: &str) -> Result<Option<AgentConfig>> {
        let doc = self
            .collection
            .find_one(doc! {"_id": agent_id})
            .await
            .map_err(storage_err)?;
        doc.map(agent_from_doc).transpose()
    }

    async fn update(&self, mut config: AgentConfig) -> Result<AgentConfig> {
        config.validate()?;
        config.version += 1;
        config.updated_at = chrono::Utc::now();
        let mut doc = agent_to_doc(&config)?;
        doc.remove("_id");
        let result = self
            .collection
            .update_one(doc! {"_id": &config.id}, doc! {"$set": doc})
            .await
            .map_err(storage_err)?;
        if result.matched_count == 0 {
            return Err(Error::AgentNotFound(config.id));
        }
        Ok(config)
    }

    async fn delete(&self, agent_id: &str) -> Result<bool> {
        let result = self
            .collection
            .delete_one(doc! {"_id": agent_id})
            .await
            .map_err(storage_err)?;
        Ok(result.deleted_count > 0)
    }

    async fn set_enabled(&self, agent_id: &str, enabled: bool) -> Result<bool> {
        let now = chrono::Utc::now().to_rfc3339();
        let result = self
            .collection
            .update_one(
                doc! {"_id": agent_id},
                doc! {
                    "$set": {"enabled": enabled, "updated_at": now},
                    "$inc": {"version": 1},
                },
            )
            .await
            .map_err(storage_err)?;
        Ok(result.matched_count > 0)
    }

    async fn list(&self, filter: AgentListFilter) -> Result<Vec<AgentConfig>> {
        let query = Self::list_query(&filter);
        let limit = if filter.limit > 0 { filter.limit } else { 100 };
        let mut cursor = self
            .collection
            .find(query)
            .sort(doc! {"created_at": -1})
            .skip(filter.skip)
            .limit(limit)
            .await
            .map_err(storage_err)?;
        let mut agents = Vec::new();
        while let Some(doc) = cursor.try_next().await.map_err(storage_err)? {
            agents.push(agent_from_doc(doc)?);
        }
        Ok(agents)
    }

    async fn count(&self, enabled_only: bool) -> Result<u64> {
        let query = if enabled_only {
            doc! {"enabled": true}
        } else {
            Document::new()
        };
        self.collection
            .count_documents(query)
            .await
            .map_err(storage_err)
    }

    async fn get_by_watch_target(
        &self,
        database: &str,
        collection: &str,
        enabled_only: bool,
    ) -> Result<Vec<AgentConfig>> {
        let mut query = doc! {
            "watch.database": database,
            "watch.collection": collection,
        };
        if enabled_only {
            query.insert("enabled", true);
        }
        let mut cursor = self.collection.find(query).await.map_err(storage_err)?;
        let mut agents = Vec::new();
        while let Some(doc) = cursor.try_next().await.map_err(storage_err)? {
            agents.push(agent_from_doc(doc)?);
        }
        Ok(agents)
    }

    async fn get_all_watch_targets(&self, enabled_only: bool) -> Result<Vec<(String, String)>> {
        let mut pipeline = Vec::new();
        if enabled_only {
            pipeline.push(doc! {"$match": {"enabled": true}});
        }
        pipeline.push(doc! {
            "$group": {
                "_id": {
                    "database": "$watch.database",
                    "collection": "$watch.collection",
                }
            }
        });
        pipeline.push(doc! {"$sort": {"_id.database": 1, "_id.collection": 1}});

        let mut cursor = self
            .collection
            .aggregate(pipeline)
            .await
            .map_err(storage_err)?;
        let mut targets = Vec::new();
        while let Some(doc) = cursor.try_next().await.map_err(storage_err)? {
            let id = doc.get_document("_id").map_err(storage_err)?;
            let database = id.get_str("database").map_err(storage_err)?;
            let collection = id.get_str("collection").map_err(storage_err)?;
            targets.push((database.to_string(), collection.to_string()));
        }
        Ok(targets)
    }

    async fn change_feed(&self) -> Result<BoxStream<'static, AgentChange>> {
        let mut stream = self.collection.watch().await.map_err(storage_err)?;
        let feed = async_stream::stream! {
            while let Some(event) = stream.next().await {
                match event {
                    Ok(event) => {
                        let agent_id = event
                            .document_key
                            .as_ref()
                            .and_then(|key| key.get_str("_id").ok())
                            .unwrap_or_default()
                            .to_string();
                        if agent_id.is_empty() {
                            continue;
                        }
                        let change = match event.operation_type {
                            OperationType::Insert => AgentChange::Created(agent_id),
                            OperationType::Delete => AgentChange::Deleted(agent_id),
                            _ => AgentChange::Updated(agent_id),
                        };
                        yield change;
                    }
                    Err(err) => {
                        warn!(error = %err, "agent change feed error");
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(feed))
    }
}

#[derive(Clone)]
pub struct MongoResumeTokenStore {
    collection: Collection<Document>,
}

impl MongoResumeTokenStore {
    pub fn new(client: &Client, database: &str, collection: &str) -> Self {
        Self {
            collection: client.database(database).collection(collection),
        }
    }

    pub async fn initialize(&self) -> Result<()> {
        let indexes = vec![
            IndexModel::builder()
                .keys(doc! {"database": 1, "collection": 1})
                .options(IndexOptions::builder().unique(true).build())
                .build(),
            IndexModel::builder().keys(doc! {"updated_at": 1}).build(),
        ];
        self.collection
            .create_indexes(indexes)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResumeTokenStore for MongoResumeTokenStore {
    async fn save(&self, database: &str, collection: &str, token: &JsonValue) -> Result<()> {
        let token = bson::to_bson(token).map_err(storage_err)?;
        let now = bson::DateTime::now();
        self.collection
            .update_one(
                doc! {"database": database, "collection": collection},
                doc! {
                    "$set": {"token": token, "updated_at": now},
                    "$setOnInsert": {"created_at": now},
                },
            )
            .upsert(true)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get(&self, database: &str, collection: &str) -> Result<Option<JsonValue>> {
        let doc = self
            .collection
            .find_one(doc! {"database": database, "collection": collection})
            .await
            .map_err(storage_err)?;
        match doc.as_ref().and_then(|d| d.get("token")) {
            Some(token) => serde_json::to_value(token).map(Some).map_err(storage_err),
            None => Ok(None),
        }
    }

    async fn delete(&self, database: &str, collection: &str) -> Result<bool> {
        let result = self
            .collection
            .delete_one(doc! {"database": database, "collection": collection})
            .await
            .map_err(storage_err)?;
        Ok(result.deleted_count > 0)
    }

    async fn age_seconds(&self, database: &str, collection: &str) -> Result<Option<f64>> {
        let doc = self
            .collection
            .find_one(doc! {"database": database, "collection": collection})
            .await
            .map_err(storage_err)?;
        Ok(doc.and_then(|d| d.get_datetime("updated_at").ok().copied()).map(|updated| {
            let age_ms = bson::DateTime::now().timestamp_millis() - updated.timestamp_millis();
            age_ms.max(0) as f64 / 1000.0
        }))
    }
}

#[derive(Clone)]
pub struct MongoExecutionStore {
    collection: Collection<Document>,
}

impl MongoExecutionStore {
    pub fn new(client: &Client, database: &str, collection: &str) -> Self {
        Self {
            collection: client.database(database).collection(collection),
        }
    }

    pub async fn initialize(&self) -> Result<()> {
        let indexes = vec![
            IndexModel::builder().keys(doc! {"agent_id": 1, "completed_at": -1}).build(),
            IndexModel::builder().keys(doc! {"status": 1}).build(),
        ];
        self.collection
            .create_indexes(indexes)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ExecutionStore for MongoExecutionStore {
    async fn record(&self, record: &ExecutionRecord) -> Result<()> {
        let doc = bson::to_document(record).map_err(storage_err)?;
        self.collection
            .update_one(doc! {"_id": &record.work_item_id}, doc! {"$set": doc})
            .upsert(true)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn get(&self, work_item_id: &str) -> Result<Option<ExecutionRecord>> {
        let doc = self
            .collection
            .find_one(doc! {"_id": work_item_id})
            .await
            .map_err(storage_err)?;
        doc.map(|mut d| {
            d.remove("_id");
            bson::from_document(d).map_err(storage_err)
        })
        .transpose()
    }

    async fn list(
        &self,
        agent_id: Option<&str>,
        status: Option<ExecutionStatus>,
        limit: i64,
    ) -> Result<Vec<ExecutionRecord>> {
        let mut query = Document::new();
        if let Some(agent_id) = agent_id {
            query.insert("agent_id", agent_id);
        }
        if let Some(status) = status {
            let status = bson::to_bson(&status).map_err(storage_err)?;
            query.insert("status", status);
        }
        let mut cursor = self
            .collection
            .find(query)
            .sort(doc! {"completed_at": -1})
            .limit(limit.max(1))
            .await
            .map_err(storage_err)?;
        let mut records = Vec::new();
        while let Some(mut doc) = cursor.try_next().await.map_err(storage_err)? {
            doc.remove("_id");
            records.push(bson::from_document(doc).map_err(storage_err)?);
        }
        Ok(records)
    }
}

#[derive(Clone)]
pub struct MongoIdempotencyStore {
    collection: Collection<Document>,
    ttl: Duration,
}

impl MongoIdempotencyStore {
    pub fn new(client: &Client, database: &str, collection: &str, ttl: Duration) -> Self {
        Self {
            collection: client.database(database).collection(collection),
            ttl,
        }
    }

    pub async fn initialize(&self) -> Result<()> {
        let indexes = vec![
            IndexModel::builder()
                .keys(doc! {"key": 1})
                .options(IndexOptions::builder().unique(true).build())
                .build(),
            IndexModel::builder()
                .keys(doc! {"created_at": 1})
                .options(IndexOptions::builder().expire_after(self.ttl).build())
                .build(),
        ];
        self.collection
            .create_indexes(indexes)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl IdempotencyStore for MongoIdempotencyStore {
    async fn seen(&self, key: &str) -> Result<bool> {
        let doc = self
            .collection
            .find_one(doc! {"key": key})
            .await
            .map_err(storage_err)?;
        Ok(doc.is_some())
    }

    async fn record(&self, key: &str, agent_id: &str, work_item_id: &str) -> Result<()> {
        let doc = doc! {
            "key": key,
            "agent_id": agent_id,
            "work_item_id": work_item_id,
            "created_at": bson::DateTime::now(),
        };
        match self.collection.insert_one(doc).await {
            Ok(_) => Ok(()),
            // Lost a race with another writer; the key is recorded either way.
            Err(err) if is_duplicate_key(&err) => Ok(()),
            Err(err) => Err(storage_err(err)),
        }
    }
}

#[derive(Clone)]
pub struct MongoLeaseStore {
    collection: Collection<Document>,
}

impl MongoLeaseStore {
    pub fn new(client: &Client, database: &str, collection: &str) -> Self {
        Self {
            collection: client.database(database).collection(collection),
        }
    }

    pub async fn initialize(&self) -> Result<()> {
        let indexes = vec![
            IndexModel::builder()
                .keys(doc! {"lock_name": 1})
                .options(IndexOptions::builder().unique(true).build())
                .build(),
            IndexModel::builder()
                .keys(doc! {"expires_at": 1})
                .options(IndexOptions::builder().expire_after(Duration::ZERO).build())
                .build(),
        ];
        self.collection
            .create_indexes(indexes)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    fn expiry(lease_seconds: f64) -> bson::DateTime {
        let now = bson::DateTime::now();
        bson::DateTime::from_millis(now.timestamp_millis() + (lease_seconds * 1000.0) as i64)
    }
}

#[async_trait::async_trait]
impl LeaseStore for MongoLeaseStore {
    async fn try_acquire(&self, lock_name: &str, holder: &str, lease_seconds: f64) -> Result<bool> {
        let now = bson::DateTime::now();
        let expires_at = Self::expiry(lease_seconds);
        let result = self
            .collection
            .update_one(
                doc! {
                    "lock_name": lock_name,
                    "$or": [
                        {"holder": holder},
                        {"expires_at": {"$lt": now}},
                    ],
                },
                doc! {
                    "$set": {"holder": holder, "expires_at": expires_at, "acquired_at": now},
                    "$setOnInsert": {"lock_name": lock_name},
                },
            )
            .upsert(true)
            .await;
        match result {
            Ok(outcome) => Ok(outcome.modified_count > 0 || outcome.upserted_id.is_some()),
            // Unexpired lease held elsewhere; the upsert insert collides.
            Err(err) if is_duplicate_key(&err) => Ok(false),
            Err(err) => Err(storage_err(err)),
        }
    }

    async fn renew(&self, lock_name: &str, holder: &str, lease_seconds: f64) -> Result<bool> {
        let result = self
            .collection
            .update_one(
                doc! {"lock_name": lock_name, "holder": holder},
                doc! {"$set": {
                    "expires_at": Self::expiry(lease_seconds),
                    "renewed_at": bson::DateTime::now(),
                }},
            )
            .await
            .map_err(storage_err)?;
        Ok(result.matched_count > 0)
    }

    async fn release(&self, lock_name: &str, holder: &str) -> Result<bool> {
        let result = self
            .collection
            .delete_one(doc! {"lock_name": lock_name, "holder": holder})
            .await
            .map_err(storage_err)?;
        Ok(result.deleted_count > 0)
    }

    async fn current_holder(&self, lock_name: &str) -> Result<Option<String>> {
        let doc = self
            .collection
            .find_one(doc! {
                "lock_name": lock_name,
                "expires_at": {"$gt": bson::DateTime::now()},
            })
            .await
            .map_err(storage_err)?;
        Ok(doc.and_then(|d| d.get_str("holder").ok().map(String::from)))
    }
}

#[derive(Clone)]
pub struct MongoDocumentStore {
    client: Client,
}

impl MongoDocumentStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn to_filter(filter: &JsonValue) -> Result<Document> {
        let mut doc = bson::to_document(filter).map_err(storage_err)?;
        if let Some(Bson::String(id)) = doc.get("_id").cloned() {
            doc.insert("_id", parse_document_id(&id));
        }
        Ok(doc)
    }
}

#[async_trait::async_trait]
impl DocumentStore for MongoDocumentStore {
    async fn update_document(
        &self,
        database: &str,
        collection: &str,
        filter: &JsonValue,
        update: &JsonValue,
    ) -> Result<UpdateOutcome> {
        let target: Collection<Document> = self.client.database(database).collection(collection);
        let filter = Self::to_filter(filter)?;
        let update = bson::to_document(update).map_err(storage_err)?;
        let result = target
            .update_one(filter, update)
            .await
            .map_err(storage_err)?;
        Ok(UpdateOutcome {
            matched: result.matched_count,
            modified: result.modified_count,
        })
    }

    async fn find_document(
        &self,
        database: &str,
        collection: &str,
        filter: &JsonValue,
    ) -> Result<Option<JsonValue>> {
        let target: Collection<Document> = self.client.database(database).collection(collection);
        let filter = Self::to_filter(filter)?;
        let doc = target.find_one(filter).await.map_err(storage_err)?;
        doc.map(|d| serde_json::to_value(&d).map_err(storage_err))
            .transpose()
    }
}

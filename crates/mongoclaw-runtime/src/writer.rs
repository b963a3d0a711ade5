use crate::metrics;
use chrono::Utc;
use mongoclaw_core::hash::{stable_document_hash, VERSION_FIELD};
use mongoclaw_core::{reason, AgentConfig, AiResponse, ConsistencyMode, Result, WorkItem, WriteStrategy};
use mongoclaw_storage::{DocumentStore, IdempotencyStore};
use serde_json::{json, Map, Value as JsonValue};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Writes enrichment output back into the document store with idempotency and
/// the configured consistency guards.
pub struct ResultWriter {
    documents: Arc<dyn DocumentStore>,
    idempotency: Arc<dyn IdempotencyStore>,
}

impl ResultWriter {
    pub fn new(documents: Arc<dyn DocumentStore>, idempotency: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            documents,
            idempotency,
        }
    }

    /// Returns `(written, reason)`. A refused write (conflict, duplicate,
    /// missing document) is not an error: the decision is recorded and the
    /// item is not retried.
    pub async fn write(
        &self,
        agent: &AgentConfig,
        item: &WorkItem,
        content: &JsonValue,
        response: &AiResponse,
    ) -> Result<(bool, &'static str)> {
        if let Some(key) = &item.idempotency_key {
            if self.idempotency.seen(key).await? {
                debug!(
                    agent_id = %agent.id,
                    document_id = %item.document_id,
                    idempotency_key = %key,
                    "skipping duplicate write"
                );
                return Ok((false, reason::IDEMPOTENCY_DUPLICATE));
            }
        }

        let database = agent.target_database();
        let collection = agent.target_collection();
        let strict = agent.execution.consistency_mode == ConsistencyMode::StrictPostCommit;

        if strict && agent.execution.require_document_hash_match {
            let current = self
                .documents
                .find_document(database, collection, &json!({"_id": item.document_id}))
                .await?;
            let matches = current
                .as_ref()
                .map(|doc| stable_document_hash(doc) == item.source_document_hash)
                .unwrap_or(false);
            if !matches {
                metrics::HASH_CONFLICTS_TOTAL
                    .with_label_values(&[&agent.id])
                    .inc();
                warn!(
                    agent_id = %agent.id,
                    document_id = %item.document_id,
                    "document hash changed since dispatch; refusing write"
                );
                return Ok((false, reason::HASH_CONFLICT));
            }
        }

        let update = build_update(agent, item, content, response, strict);
        let filter = build_filter(item, strict);

        let outcome = self
            .documents
            .update_document(database, collection, &filter, &update)
            .await?;

        if outcome.matched == 0 {
            if strict {
                metrics::VERSION_CONFLICTS_TOTAL
                    .with_label_values(&[&agent.id])
                    .inc();
                warn!(
                    agent_id = %agent.id,
                    document_id = %item.document_id,
                    source_version = item.source_version,
                    "stale write refused by version predicate"
                );
                return Ok((false, reason::STRICT_VERSION_CONFLICT));
            }
            warn!(
                agent_id = %agent.id,
                document_id = %item.document_id,
                "document not found for update"
            );
            return Ok((false, reason::DOCUMENT_NOT_FOUND));
        }

        if let Some(key) = &item.idempotency_key {
            self.idempotency.record(key, &agent.id, &item.id).await?;
        }

        info!(
            agent_id = %agent.id,
            document_id = %item.document_id,
            work_item_id = %item.id,
            modified = outcome.modified > 0,
            "wrote enrichment result"
        );
        Ok((true, reason::WRITTEN))
    }
}

fn build_filter(item: &WorkItem, strict: bool) -> JsonValue {
    let mut filter = Map::new();
    filter.insert("_id".into(), JsonValue::String(item.document_id.clone()));
    if strict {
        if item.source_version == 0 {
            filter.insert(
                "$or".into(),
                json!([
                    {VERSION_FIELD: 0},
                    {VERSION_FIELD: {"$exists": false}},
                ]),
            );
        } else {
            filter.insert(VERSION_FIELD.into(), json!(item.source_version));
        }
    }
    JsonValue::Object(filter)
}

fn build_update(
    agent: &AgentConfig,
    item: &WorkItem,
    content: &JsonValue,
    response: &AiResponse,
    strict: bool,
) -> JsonValue {
    let write = &agent.write;
    let mapped = map_content(agent, content);

    let mut update = Map::new();
    let mut set = Map::new();
    match write.strategy {
        WriteStrategy::Merge | WriteStrategy::Replace => {
            if let Some(fields) = mapped.as_object() {
                for (field, value) in fields {
                    set.insert(field.clone(), value.clone());
                }
            }
        }
        WriteStrategy::Append => {
            let array_field = write.array_field.as_deref().unwrap_or("results");
            update.insert(
                "$push".into(),
                json!({array_field: {"$each": [mapped.clone()]}}),
            );
        }
        WriteStrategy::Nested => {
            let path = write.path.as_deref().unwrap_or("ai");
            if let Some(fields) = mapped.as_object() {
                for (field, value) in fields {
                    set.insert(format!("{path}.{field}"), value.clone());
                }
            } else {
                set.insert(path.to_string(), mapped.clone());
            }
        }
    }

    if write.include_metadata {
        set.insert(
            write.metadata_field.clone(),
            json!({
                "processed_at": Utc::now().to_rfc3339(),
                "work_item_id": item.id,
                "source_agent_id": agent.id,
                "model": response.model,
                "provider": response.provider,
                "tokens": response.total_tokens,
                "cost_usd": response.cost_usd,
                "latency_ms": response.latency_ms,
            }),
        );
    }

    if !set.is_empty() {
        update.insert("$set".into(), JsonValue::Object(set));
    }
    if strict {
        update.insert("$inc".into(), json!({VERSION_FIELD: 1}));
    }
    JsonValue::Object(update)
}

/// Apply the agent's field map and optional `target_field` nesting. Content
/// that is not an object is wrapped so every strategy has fields to work
/// with.
fn map_content(agent: &AgentConfig, content: &JsonValue) -> JsonValue {
    let write = &agent.write;
    let object = match content.as_object() {
        Some(object) => object.clone(),
        None => {
            let mut wrapped = Map::new();
            wrapped.insert("content".into(), content.clone());
            wrapped
        }
    };
    let mapped = match &write.fields {
        Some(field_map) => {
            let mut mapped = Map::new();
            for (source, target) in field_map {
                if let Some(value) = object.get(source) {
                    mapped.insert(target.clone(), value.clone());
                }
            }
            mapped
        }
        None => object,
    };
    match &write.target_field {
        Some(target_field) => json!({target_field: JsonValue::Object(mapped)}),
        None => JsonValue::Object(mapped),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongoclaw_core::{ChangeEvent, ChangeOperation};
    use mongoclaw_storage::{InMemoryDocumentStore, InMemoryIdempotencyStore};
    use serde_json::json;

    fn agent(write: JsonValue, execution: JsonValue) -> AgentConfig {
        serde_json::from_value(json!({
            "id": "classifier",
            "name": "c",
            "watch": {"database": "support", "collection": "tickets"},
            "ai": {"prompt": "p"},
            "write": write,
            "execution": execution,
        }))
        .unwrap()
    }

    fn item_for(agent: &AgentConfig, document: JsonValue) -> WorkItem {
        let event = ChangeEvent {
            operation: ChangeOperation::Insert,
            database: "support".into(),
            collection: "tickets".into(),
            document_key: json!({"_id": document["_id"].as_str().unwrap_or("t1")}),
            full_document: Some(document),
            update_description: None,
            resume_token: None,
            cluster_time: None,
            wall_time: Utc::now(),
        };
        WorkItem::from_event(agent, &event)
    }

    fn response() -> AiResponse {
        AiResponse {
            content: String::new(),
            model: "gpt-4o-mini".into(),
            provider: "static".into(),
            total_tokens: 42,
            ..Default::default()
        }
    }

    fn writer(documents: &Arc<InMemoryDocumentStore>) -> (ResultWriter, Arc<InMemoryIdempotencyStore>) {
        let idempotency = Arc::new(InMemoryIdempotencyStore::new());
        (
            ResultWriter::new(documents.clone() as Arc<dyn DocumentStore>, idempotency.clone()),
            idempotency,
        )
    }

    #[tokio::test]
    async fn merge_with_field_map_and_metadata() {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let doc = json!({"_id": "t1", "title": "Card declined", "status": "new"});
        documents.insert("support", "tickets", doc.clone());
        let agent = agent(
            json!({"fields": {"category": "ai_category", "priority": "ai_priority"}}),
            json!({}),
        );
        let (writer, _) = writer(&documents);
        let item = item_for(&agent, doc);

        let (written, why) = writer
            .write(
                &agent,
                &item,
                &json!({"category": "billing", "priority": "high", "ignored": "x"}),
                &response(),
            )
            .await
            .unwrap();
        assert!(written);
        assert_eq!(why, "written");

        let updated = documents.get("support", "tickets", "t1").unwrap();
        assert_eq!(updated["ai_category"], "billing");
        assert_eq!(updated["ai_priority"], "high");
        assert!(updated.get("ignored").is_none());
        assert_eq!(updated["_ai_metadata"]["model"], "gpt-4o-mini");
        assert_eq!(updated["_ai_metadata"]["tokens"], 42);
        // Title untouched by merge.
        assert_eq!(updated["title"], "Card declined");
    }

    #[tokio::test]
    async fn append_strategy_pushes_to_array() {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let doc = json!({"_id": "t1"});
        documents.insert("support", "tickets", doc.clone());
        let agent = agent(
            json!({"strategy": "append", "array_field": "enrichments", "include_metadata": false}),
            json!({}),
        );
        let (writer, _) = writer(&documents);
        let item = item_for(&agent, doc);

        writer
            .write(&agent, &item, &json!({"summary": "s"}), &response())
            .await
            .unwrap();
        writer
            .write(&agent, &item, &json!({"summary": "s2"}), &response())
            .await
            .unwrap();

        let updated = documents.get("support", "tickets", "t1").unwrap();
        assert_eq!(updated["enrichments"][0]["summary"], "s");
        assert_eq!(updated["enrichments"][1]["summary"], "s2");
    }

    #[tokio::test]
    async fn nested_strategy_writes_under_path() {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let doc = json!({"_id": "t1"});
        documents.insert("support", "tickets", doc.clone());
        let agent = agent(
            json!({"strategy": "nested", "path": "ai.out", "include_metadata": false}),
            json!({}),
        );
        let (writer, _) = writer(&documents);
        let item = item_for(&agent, doc);

        writer
            .write(&agent, &item, &json!({"category": "billing"}), &response())
            .await
            .unwrap();
        let updated = documents.get("support", "tickets", "t1").unwrap();
        assert_eq!(updated["ai"]["out"]["category"], "billing");
    }

    #[tokio::test]
    async fn target_field_nests_mapped_output() {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let doc = json!({"_id": "t1"});
        documents.insert("support", "tickets", doc.clone());
        let agent = agent(
            json!({"target_field": "enrichment", "include_metadata": false}),
            json!({}),
        );
        let (writer, _) = writer(&documents);
        let item = item_for(&agent, doc);

        writer
            .write(&agent, &item, &json!({"category": "billing"}), &response())
            .await
            .unwrap();
        let updated = documents.get("support", "tickets", "t1").unwrap();
        assert_eq!(updated["enrichment"]["category"], "billing");
    }

    #[tokio::test]
    async fn strict_mode_bumps_version_and_refuses_stale_writes() {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let doc = json!({"_id": "t1", "_mongoclaw_version": 3});
        documents.insert("support", "tickets", doc.clone());
        let agent = agent(json!({}), json!({"consistency_mode": "strict_post_commit"}));
        let (writer, _) = writer(&documents);
        let item = item_for(&agent, doc);
        assert_eq!(item.source_version, 3);

        let (written, _) = writer
            .write(&agent, &item, &json!({"x": 1}), &response())
            .await
            .unwrap();
        assert!(written);
        let updated = documents.get("support", "tickets", "t1").unwrap();
        assert_eq!(updated["_mongoclaw_version"], 4);

        // A second write from the same dispatch snapshot is stale now.
        let mut stale = item.clone();
        stale.idempotency_key = None;
        let (written, why) = writer
            .write(&agent, &stale, &json!({"x": 2}), &response())
            .await
            .unwrap();
        assert!(!written);
        assert_eq!(why, "strict_version_conflict");
    }

    #[tokio::test]
    async fn strict_mode_matches_absent_version_as_zero() {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let doc = json!({"_id": "t1", "title": "x"});
        documents.insert("support", "tickets", doc.clone());
        let agent = agent(json!({}), json!({"consistency_mode": "strict_post_commit"}));
        let (writer, _) = writer(&documents);
        let item = item_for(&agent, doc);
        assert_eq!(item.source_version, 0);

        let (written, _) = writer
            .write(&agent, &item, &json!({"y": 1}), &response())
            .await
            .unwrap();
        assert!(written);
        assert_eq!(
            documents.get("support", "tickets", "t1").unwrap()["_mongoclaw_version"],
            1
        );
    }

    #[tokio::test]
    async fn hash_guard_refuses_mutated_documents() {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let doc = json!({"_id": "t1", "status": "new"});
        documents.insert("support", "tickets", doc.clone());
        let agent = agent(
            json!({}),
            json!({
                "consistency_mode": "strict_post_commit",
                "require_document_hash_match": true,
            }),
        );
        let (writer, _) = writer(&documents);
        let item = item_for(&agent, doc);

        // Concurrent user edit between dispatch and write.
        documents.insert("support", "tickets", json!({"_id": "t1", "status": "closed"}));
        let (written, why) = writer
            .write(&agent, &item, &json!({"x": 1}), &response())
            .await
            .unwrap();
        assert!(!written);
        assert_eq!(why, "hash_conflict");
    }

    #[tokio::test]
    async fn recorded_idempotency_key_suppresses_rewrite() {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let doc = json!({"_id": "t1"});
        documents.insert("support", "tickets", doc.clone());
        let agent = agent(json!({"include_metadata": false}), json!({}));
        let (writer, idempotency) = writer(&documents);
        let mut item = item_for(&agent, doc);
        item.idempotency_key = Some(item.default_idempotency_key());

        let (written, _) = writer
            .write(&agent, &item, &json!({"n": 1}), &response())
            .await
            .unwrap();
        assert!(written);
        assert_eq!(idempotency.len(), 1);

        // Redelivery of the acked item must not write again.
        let (written, why) = writer
            .write(&agent, &item, &json!({"n": 2}), &response())
            .await
            .unwrap();
        assert!(!written);
        assert_eq!(why, "idempotency_duplicate");
        assert_eq!(documents.get("support", "tickets", "t1").unwrap()["n"], 1);
    }

    #[tokio::test]
    async fn missing_document_is_reported() {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let agent = agent(json!({}), json!({}));
        let (writer, _) = writer(&documents);
        let item = item_for(&agent, json!({"_id": "ghost"}));
        let (written, why) = writer
            .write(&agent, &item, &json!({"x": 1}), &response())
            .await
            .unwrap();
        assert!(!written);
        assert_eq!(why, "document_not_found");
    }
}

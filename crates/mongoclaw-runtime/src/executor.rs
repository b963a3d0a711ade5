use crate::metrics;
use crate::parser::ResponseParser;
use crate::policy::evaluate_condition;
use crate::prompt::PromptEngine;
use crate::provider::AiProvider;
use crate::state::RuntimeState;
use crate::writer::ResultWriter;
use chrono::{DateTime, Utc};
use mongoclaw_core::{
    reason, AgentConfig, AiRequest, AiResponse, Error, ExecutionRecord, ExecutionStatus,
    FallbackAction, LifecycleState, PolicyAction, Result, WorkItem, WorkerConfig,
};
use mongoclaw_storage::{AgentStore, ExecutionStore};
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const AGENT_CACHE_TTL: Duration = Duration::from_secs(10);

/// Terminal result of one execution attempt, as seen by the worker.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub status: ExecutionStatus,
    pub lifecycle_state: LifecycleState,
    pub reason: String,
    pub written: bool,
    /// Whether the worker may re-enqueue on failure.
    pub retryable: bool,
    pub ai_response: Option<AiResponse>,
    pub error: Option<Error>,
    pub duration_ms: f64,
}

struct PipelineResult {
    written: bool,
    lifecycle_state: LifecycleState,
    reason: &'static str,
    ai_response: Option<AiResponse>,
}

/// Runs the enrichment pipeline for work items: load agent, quarantine and
/// concurrency gates, deadline, prompt, provider, parse, policy, writeback,
/// record.
pub struct Executor {
    agent_store: Arc<dyn AgentStore>,
    executions: Arc<dyn ExecutionStore>,
    writer: ResultWriter,
    provider: Arc<dyn AiProvider>,
    prompt_engine: PromptEngine,
    state: Arc<RuntimeState>,
    config: WorkerConfig,
    agent_cache: Mutex<HashMap<String, (AgentConfig, Instant)>>,
}

impl Executor {
    pub fn new(
        agent_store: Arc<dyn AgentStore>,
        executions: Arc<dyn ExecutionStore>,
        writer: ResultWriter,
        provider: Arc<dyn AiProvider>,
        state: Arc<RuntimeState>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            agent_store,
            executions,
            writer,
            provider,
            prompt_engine: PromptEngine::new(),
            state,
            config,
            agent_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn invalidate_agent(&self, agent_id: Option<&str>) {
        let mut cache = self.agent_cache.lock();
        match agent_id {
            Some(agent_id) => {
                cache.remove(agent_id);
            }
            None => cache.clear(),
        }
    }

    pub async fn execute(&self, item: &WorkItem) -> ExecutionOutcome {
        let started_at = Utc::now();
        let timer = Instant::now();

        let agent = match self.load_agent(&item.agent_id).await {
            Ok(agent) => agent,
            Err(err) => {
                return self
                    .finish_failure(item, started_at, timer, err, ExecutionStatus::Failed)
                    .await;
            }
        };
        if !agent.enabled {
            return self
                .finish_failure(
                    item,
                    started_at,
                    timer,
                    Error::AgentDisabled(agent.id.clone()),
                    ExecutionStatus::Failed,
                )
                .await;
        }

        if self.state.is_quarantined(&agent.id) {
            debug!(agent_id = %agent.id, work_item_id = %item.id, "agent quarantined");
            let outcome = ExecutionOutcome {
                success: false,
                status: ExecutionStatus::Skipped,
                lifecycle_state: LifecycleState::Failed,
                reason: reason::AGENT_QUARANTINED.into(),
                written: false,
                retryable: true,
                ai_response: None,
                error: None,
                duration_ms: timer.elapsed().as_secs_f64() * 1000.0,
            };
            // A quarantine skip is not an agent failure; no budget accounting.
            self.record(&agent, item, started_at, &outcome).await;
            return outcome;
        }

        let _permit = match agent.execution.max_concurrency {
            Some(cap) => {
                let semaphore = self.state.agent_semaphore(&agent.id, cap);
                match Arc::clone(&semaphore).try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        metrics::AGENT_CONCURRENCY_WAITS_TOTAL
                            .with_label_values(&[&agent.id])
                            .inc();
                        match semaphore.acquire_owned().await {
                            Ok(permit) => Some(permit),
                            Err(_) => None,
                        }
                    }
                }
            }
            None => None,
        };

        let timeout = Duration::from_secs_f64(agent.execution.timeout_seconds.max(0.001));
        let outcome = match tokio::time::timeout(timeout, self.run_pipeline(&agent, item)).await {
            Ok(Ok(result)) => ExecutionOutcome {
                success: true,
                status: if result.written {
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::Skipped
                },
                lifecycle_state: result.lifecycle_state,
                reason: result.reason.into(),
                written: result.written,
                retryable: false,
                ai_response: result.ai_response,
                error: None,
                duration_ms: timer.elapsed().as_secs_f64() * 1000.0,
            },
            Ok(Err(err)) => {
                return self
                    .finish_failure(item, started_at, timer, err, ExecutionStatus::Failed)
                    .await;
            }
            Err(_) => {
                let err = Error::ExecutionTimeout {
                    agent_id: agent.id.clone(),
                    work_item_id: item.id.clone(),
                    timeout_seconds: agent.execution.timeout_seconds,
                };
                return self
                    .finish_failure(item, started_at, timer, err, ExecutionStatus::Failed)
                    .await;
            }
        };

        self.record(&agent, item, started_at, &outcome).await;
        outcome
    }

    async fn run_pipeline(&self, agent: &AgentConfig, item: &WorkItem) -> Result<PipelineResult> {
        let context =
            PromptEngine::build_context(&item.document, &item.change_event, agent, Some(item));
        let prompt = self.prompt_engine.render(&agent.ai.prompt, &context)?;
        let system_prompt = agent
            .ai
            .system_prompt
            .as_ref()
            .map(|template| self.prompt_engine.render(template, &context))
            .transpose()?;

        let response = self
            .provider
            .complete(AiRequest {
                model: agent.ai.model.clone(),
                prompt,
                system_prompt,
                temperature: agent.ai.temperature,
                max_tokens: agent.ai.max_tokens,
                response_format: agent
                    .ai
                    .response_schema
                    .is_some()
                    .then(|| "json_object".to_string()),
                extra_params: agent.ai.extra_params.clone(),
            })
            .await?;

        metrics::AI_TOKENS_TOTAL
            .with_label_values(&[&response.provider, &response.model, "prompt"])
            .inc_by(response.prompt_tokens);
        metrics::AI_TOKENS_TOTAL
            .with_label_values(&[&response.provider, &response.model, "completion"])
            .inc_by(response.completion_tokens);
        metrics::AI_COST_TOTAL
            .with_label_values(&[&response.provider, &response.model])
            .inc_by(response.cost_usd);

        let parser = ResponseParser::new(agent.ai.strict_schema);
        let mut result = parser.parse(&response.content, agent.ai.response_schema.as_ref())?;

        let mut simulated = false;
        if let Some(policy) = &agent.policy {
            if let Some(condition) = &policy.condition {
                let policy_context = json!({"document": item.document, "result": result});
                let matched = evaluate_condition(condition, &policy_context)?;
                let action = if matched {
                    match policy.action {
                        PolicyAction::Enrich => "enrich",
                        PolicyAction::Block => "block",
                        PolicyAction::Tag => "tag",
                    }
                } else {
                    match policy.fallback_action {
                        FallbackAction::Skip => "skip",
                        FallbackAction::Enrich => "enrich",
                    }
                };
                metrics::POLICY_DECISIONS_TOTAL
                    .with_label_values(&[&agent.id, action, if matched { "true" } else { "false" }])
                    .inc();

                match action {
                    "block" | "skip" => {
                        return Ok(PipelineResult {
                            written: false,
                            lifecycle_state: LifecycleState::WriteSkipped,
                            reason: if action == "block" {
                                reason::POLICY_BLOCK
                            } else {
                                reason::POLICY_SKIP
                            },
                            ai_response: Some(response),
                        });
                    }
                    "tag" => {
                        if let Some(map) = result.as_object_mut() {
                            map.insert(
                                policy.tag_field.clone(),
                                JsonValue::String(policy.tag_value.clone()),
                            );
                        }
                    }
                    _ => {}
                }
                simulated = policy.simulation_mode;
            }
        }

        if simulated {
            return Ok(PipelineResult {
                written: false,
                lifecycle_state: LifecycleState::WriteSkipped,
                reason: reason::SIMULATION,
                ai_response: Some(response),
            });
        }

        if agent.execution.consistency_mode == mongoclaw_core::ConsistencyMode::Shadow {
            metrics::SHADOW_WRITES_SKIPPED_TOTAL
                .with_label_values(&[&agent.id])
                .inc();
            return Ok(PipelineResult {
                written: false,
                lifecycle_state: LifecycleState::WriteSkipped,
                reason: reason::SHADOW_MODE,
                ai_response: Some(response),
            });
        }

        let (written, write_reason) = self.writer.write(agent, item, &result, &response).await?;
        Ok(PipelineResult {
            written,
            lifecycle_state: if written {
                LifecycleState::Written
            } else {
                LifecycleState::WriteSkipped
            },
            reason: write_reason,
            ai_response: Some(response),
        })
    }

    async fn finish_failure(
        &self,
        item: &WorkItem,
        started_at: DateTime<Utc>,
        timer: Instant,
        err: Error,
        status: ExecutionStatus,
    ) -> ExecutionOutcome {
        let reason_code = match &err {
            Error::ExecutionTimeout { .. } => reason::TIMEOUT,
            _ => reason::FAILED,
        };
        let outcome = ExecutionOutcome {
            success: false,
            status,
            lifecycle_state: LifecycleState::Failed,
            reason: reason_code.into(),
            written: false,
            retryable: err.is_retryable(),
            ai_response: None,
            error: Some(err),
            duration_ms: timer.elapsed().as_secs_f64() * 1000.0,
        };

        // Budget accounting happens against the agent when we can name it.
        if let Ok(Some(agent)) = self.agent_store.get_optional(&item.agent_id).await {
            let quarantined = self.state.record_failure(
                &agent.id,
                Duration::from_secs_f64(self.config.agent_failure_window_seconds),
                self.config.agent_failure_max,
                Duration::from_secs_f64(self.config.quarantine_seconds),
            );
            if quarantined {
                metrics::AGENT_QUARANTINE_EVENTS_TOTAL
                    .with_label_values(&[&agent.id])
                    .inc();
                warn!(agent_id = %agent.id, "failure budget exhausted; agent quarantined");
            }
            self.record(&agent, item, started_at, &outcome).await;
        } else {
            self.record_without_agent(item, started_at, &outcome).await;
        }
        outcome
    }

    async fn record(
        &self,
        agent: &AgentConfig,
        item: &WorkItem,
        started_at: DateTime<Utc>,
        outcome: &ExecutionOutcome,
    ) {
        let status_label = if outcome.success { "success" } else { "failure" };
        metrics::AGENT_EXECUTIONS_TOTAL
            .with_label_values(&[&agent.id, status_label])
            .inc();
        metrics::AGENT_EXECUTION_DURATION
            .with_label_values(&[&agent.id])
            .observe(outcome.duration_ms / 1000.0);
        if outcome.duration_ms > self.config.latency_slo_ms {
            metrics::AGENT_LATENCY_SLO_VIOLATIONS_TOTAL
                .with_label_values(&[&agent.id])
                .inc();
        }
        self.record_without_agent(item, started_at, outcome).await;
    }

    async fn record_without_agent(
        &self,
        item: &WorkItem,
        started_at: DateTime<Utc>,
        outcome: &ExecutionOutcome,
    ) {
        let record = ExecutionRecord {
            work_item_id: item.id.clone(),
            agent_id: item.agent_id.clone(),
            document_id: item.document_id.clone(),
            status: outcome.status,
            lifecycle_state: outcome.lifecycle_state,
            reason: outcome.reason.clone(),
            started_at,
            completed_at: Utc::now(),
            duration_ms: outcome.duration_ms,
            attempt: item.attempt,
            written: outcome.written,
            error: outcome.error.as_ref().map(|err| err.to_string()),
            ai_response: outcome.ai_response.clone(),
        };
        if let Err(err) = self.executions.record(&record).await {
            warn!(work_item_id = %item.id, error = %err, "failed to record execution");
        }
    }

    async fn load_agent(&self, agent_id: &str) -> Result<AgentConfig> {
        {
            let cache = self.agent_cache.lock();
            if let Some((agent, cached_at)) = cache.get(agent_id) {
                if cached_at.elapsed() < AGENT_CACHE_TTL {
                    return Ok(agent.clone());
                }
            }
        }
        let agent = self
            .agent_store
            .get_optional(agent_id)
            .await?
            .ok_or_else(|| Error::AgentNotFound(agent_id.to_string()))?;
        self.agent_cache
            .lock()
            .insert(agent_id.to_string(), (agent.clone(), Instant::now()));
        Ok(agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongoclaw_core::{ChangeEvent, ChangeOperation, Config};
    use mongoclaw_storage::{
        DocumentStore, InMemoryAgentStore, InMemoryDocumentStore, InMemoryExecutionStore,
        InMemoryIdempotencyStore,
    };
    use serde_json::json;

    struct SlowProvider;

    #[async_trait::async_trait]
    impl crate::provider::AiProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }
        async fn complete(&self, _request: AiRequest) -> Result<AiResponse> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(AiResponse::default())
        }
    }

    struct Harness {
        agents: Arc<InMemoryAgentStore>,
        documents: Arc<InMemoryDocumentStore>,
        executions: Arc<InMemoryExecutionStore>,
        state: Arc<RuntimeState>,
        executor: Executor,
    }

    fn harness(provider: Arc<dyn crate::provider::AiProvider>) -> Harness {
        let agents = Arc::new(InMemoryAgentStore::new());
        let documents = Arc::new(InMemoryDocumentStore::new());
        let executions = Arc::new(InMemoryExecutionStore::new());
        let idempotency = Arc::new(InMemoryIdempotencyStore::new());
        let state = Arc::new(RuntimeState::new());
        let writer = ResultWriter::new(
            documents.clone() as Arc<dyn DocumentStore>,
            idempotency,
        );
        let executor = Executor::new(
            agents.clone(),
            executions.clone(),
            writer,
            provider,
            state.clone(),
            Config::default().worker,
        );
        Harness {
            agents,
            documents,
            executions,
            state,
            executor,
        }
    }

    async fn seed_agent(harness: &Harness, raw: serde_json::Value) -> AgentConfig {
        let config: AgentConfig = serde_json::from_value(raw).unwrap();
        harness.agents.create(config.clone()).await.unwrap();
        config
    }

    fn item_for(agent: &AgentConfig, document: serde_json::Value) -> WorkItem {
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

    #[tokio::test]
    async fn happy_path_writes_and_records() {
        let harness = harness(Arc::new(crate::provider::StaticProvider::new(
            r#"{"category": "billing", "priority": "high", "summary": "s"}"#,
        )));
        let agent = seed_agent(
            &harness,
            json!({
                "id": "ticket-classifier",
                "name": "Ticket classifier",
                "watch": {"database": "support", "collection": "tickets"},
                "ai": {"prompt": "Classify {{ document.title }}"},
                "write": {"fields": {
                    "category": "ai_category",
                    "priority": "ai_priority",
                    "summary": "ai_summary",
                }},
            }),
        )
        .await;
        let document = json!({"_id": "t1", "title": "Card declined", "status": "new"});
        harness.documents.insert("support", "tickets", document.clone());

        let outcome = harness.executor.execute(&item_for(&agent, document)).await;
        assert!(outcome.success);
        assert!(outcome.written);
        assert_eq!(outcome.reason, "written");
        assert_eq!(outcome.lifecycle_state, LifecycleState::Written);

        let updated = harness.documents.get("support", "tickets", "t1").unwrap();
        assert_eq!(updated["ai_category"], "billing");
        assert_eq!(updated["ai_priority"], "high");
        assert_eq!(updated["ai_summary"], "s");
        assert!(updated["_ai_metadata"]["model"].is_string());

        let record = harness
            .executions
            .list(Some("ticket-classifier"), None, 10)
            .await
            .unwrap()
            .remove(0);
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert!(record.written);
        assert_eq!(record.reason, "written");
    }

    #[tokio::test]
    async fn missing_agent_is_terminal() {
        let harness = harness(Arc::new(crate::provider::StaticProvider::new("{}")));
        let phantom: AgentConfig = serde_json::from_value(json!({
            "id": "phantom",
            "name": "p",
            "watch": {"database": "support", "collection": "tickets"},
            "ai": {"prompt": "p"},
        }))
        .unwrap();
        let outcome = harness
            .executor
            .execute(&item_for(&phantom, json!({"_id": "t1"})))
            .await;
        assert!(!outcome.success);
        assert!(!outcome.retryable);
        assert!(matches!(outcome.error, Some(Error::AgentNotFound(_))));
    }

    #[tokio::test]
    async fn disabled_agent_is_terminal() {
        let harness = harness(Arc::new(crate::provider::StaticProvider::new("{}")));
        let agent = seed_agent(
            &harness,
            json!({
                "id": "off",
                "name": "o",
                "watch": {"database": "support", "collection": "tickets"},
                "ai": {"prompt": "p"},
            }),
        )
        .await;
        harness.agents.set_enabled("off", false).await.unwrap();
        harness.executor.invalidate_agent(Some("off"));
        let outcome = harness
            .executor
            .execute(&item_for(&agent, json!({"_id": "t1"})))
            .await;
        assert!(!outcome.retryable);
        assert!(matches!(outcome.error, Some(Error::AgentDisabled(_))));
    }

    #[tokio::test]
    async fn quarantined_agent_short_circuits() {
        let harness = harness(Arc::new(crate::provider::StaticProvider::new("{}")));
        let agent = seed_agent(
            &harness,
            json!({
                "id": "flaky",
                "name": "f",
                "watch": {"database": "support", "collection": "tickets"},
                "ai": {"prompt": "p"},
            }),
        )
        .await;
        harness.state.quarantine("flaky", Duration::from_secs(60));

        let outcome = harness
            .executor
            .execute(&item_for(&agent, json!({"_id": "t1"})))
            .await;
        assert!(!outcome.success);
        assert!(outcome.retryable);
        assert_eq!(outcome.reason, "agent_quarantined");
        assert_eq!(outcome.status, ExecutionStatus::Skipped);
        // No AI call was made, so no response is attached.
        assert!(outcome.ai_response.is_none());
    }

    #[tokio::test]
    async fn timeout_is_retryable() {
        let harness = harness(Arc::new(SlowProvider));
        let agent = seed_agent(
            &harness,
            json!({
                "id": "slowpoke",
                "name": "s",
                "watch": {"database": "support", "collection": "tickets"},
                "ai": {"prompt": "p"},
                "execution": {"timeout_seconds": 0.05},
            }),
        )
        .await;
        let outcome = harness
            .executor
            .execute(&item_for(&agent, json!({"_id": "t1"})))
            .await;
        assert!(!outcome.success);
        assert!(outcome.retryable);
        assert_eq!(outcome.reason, "timeout");
        assert!(matches!(outcome.error, Some(Error::ExecutionTimeout { .. })));
    }

    #[tokio::test]
    async fn shadow_mode_suppresses_write() {
        let harness = harness(Arc::new(crate::provider::StaticProvider::new(
            r#"{"category": "billing"}"#,
        )));
        let agent = seed_agent(
            &harness,
            json!({
                "id": "shadow",
                "name": "s",
                "watch": {"database": "support", "collection": "tickets"},
                "ai": {"prompt": "p"},
                "execution": {"consistency_mode": "shadow"},
            }),
        )
        .await;
        let document = json!({"_id": "t1", "title": "x"});
        harness.documents.insert("support", "tickets", document.clone());

        let outcome = harness.executor.execute(&item_for(&agent, document)).await;
        assert!(outcome.success);
        assert!(!outcome.written);
        assert_eq!(outcome.reason, "shadow_mode");
        assert_eq!(outcome.lifecycle_state, LifecycleState::WriteSkipped);
        let untouched = harness.documents.get("support", "tickets", "t1").unwrap();
        assert!(untouched.get("category").is_none());
        assert!(untouched.get("_ai_metadata").is_none());
    }

    #[tokio::test]
    async fn policy_block_and_tag() {
        let harness = harness(Arc::new(crate::provider::StaticProvider::new(
            r#"{"category": "spam", "confidence": 0.99}"#,
        )));
        let blocker = seed_agent(
            &harness,
            json!({
                "id": "blocker",
                "name": "b",
                "watch": {"database": "support", "collection": "tickets"},
                "ai": {"prompt": "p"},
                "policy": {"condition": "result.category == 'spam'", "action": "block"},
            }),
        )
        .await;
        let document = json!({"_id": "t1"});
        harness.documents.insert("support", "tickets", document.clone());

        let outcome = harness
            .executor
            .execute(&item_for(&blocker, document.clone()))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.reason, "policy_block");
        assert!(!outcome.written);

        let tagger = seed_agent(
            &harness,
            json!({
                "id": "tagger",
                "name": "t",
                "watch": {"database": "support", "collection": "tickets"},
                "ai": {"prompt": "p"},
                "policy": {
                    "condition": "result.confidence > 0.9",
                    "action": "tag",
                    "tag_field": "review",
                    "tag_value": "auto",
                },
            }),
        )
        .await;
        let outcome = harness.executor.execute(&item_for(&tagger, document)).await;
        assert!(outcome.written);
        let updated = harness.documents.get("support", "tickets", "t1").unwrap();
        assert_eq!(updated["review"], "auto");
    }

    #[tokio::test]
    async fn simulation_mode_skips_write_but_keeps_accounting() {
        let harness = harness(Arc::new(crate::provider::StaticProvider::new(
            r#"{"category": "billing"}"#,
        )));
        let agent = seed_agent(
            &harness,
            json!({
                "id": "dry-run",
                "name": "d",
                "watch": {"database": "support", "collection": "tickets"},
                "ai": {"prompt": "p"},
                "policy": {
                    "condition": "result.category == 'billing'",
                    "action": "enrich",
                    "simulation_mode": true,
                },
            }),
        )
        .await;
        let document = json!({"_id": "t1"});
        harness.documents.insert("support", "tickets", document.clone());

        let outcome = harness.executor.execute(&item_for(&agent, document)).await;
        assert!(outcome.success);
        assert!(!outcome.written);
        assert_eq!(outcome.reason, "simulation_mode");
    }

    #[tokio::test]
    async fn strict_version_conflict_is_terminal_success() {
        let harness = harness(Arc::new(crate::provider::StaticProvider::new(
            r#"{"x": 1}"#,
        )));
        let agent = seed_agent(
            &harness,
            json!({
                "id": "strict",
                "name": "s",
                "watch": {"database": "support", "collection": "tickets"},
                "ai": {"prompt": "p"},
                "execution": {"consistency_mode": "strict_post_commit"},
            }),
        )
        .await;
        let document = json!({"_id": "t1", "_mongoclaw_version": 3});
        harness.documents.insert("support", "tickets", document.clone());
        let item = item_for(&agent, document);

        // Concurrent writer bumps the version between dispatch and write.
        harness
            .documents
            .insert("support", "tickets", json!({"_id": "t1", "_mongoclaw_version": 4}));

        let outcome = harness.executor.execute(&item).await;
        assert!(outcome.success);
        assert!(!outcome.written);
        assert_eq!(outcome.reason, "strict_version_conflict");
        assert!(!outcome.retryable);

        let record = harness.executions.get(&item.id).await.unwrap().unwrap();
        assert_eq!(record.lifecycle_state, LifecycleState::WriteSkipped);
        assert!(!record.written);
    }

    #[tokio::test]
    async fn failure_budget_quarantines_agent() {
        struct AlwaysFails;
        #[async_trait::async_trait]
        impl crate::provider::AiProvider for AlwaysFails {
            fn name(&self) -> &str {
                "fails"
            }
            async fn complete(&self, _request: AiRequest) -> Result<AiResponse> {
                Err(Error::AiConnectivity("connection refused".into()))
            }
        }

        let harness = harness(Arc::new(AlwaysFails));
        let mut config = Config::default().worker;
        config.agent_failure_max = 2;
        let executor = Executor::new(
            harness.agents.clone(),
            harness.executions.clone(),
            ResultWriter::new(
                harness.documents.clone() as Arc<dyn DocumentStore>,
                Arc::new(InMemoryIdempotencyStore::new()),
            ),
            Arc::new(AlwaysFails),
            harness.state.clone(),
            config,
        );
        let agent = seed_agent(
            &harness,
            json!({
                "id": "budget",
                "name": "b",
                "watch": {"database": "support", "collection": "tickets"},
                "ai": {"prompt": "p"},
            }),
        )
        .await;

        let first = executor.execute(&item_for(&agent, json!({"_id": "a"}))).await;
        assert!(!first.success);
        assert!(!harness.state.is_quarantined("budget"));
        let second = executor.execute(&item_for(&agent, json!({"_id": "b"}))).await;
        assert!(!second.success);
        assert!(harness.state.is_quarantined("budget"));

        let third = executor.execute(&item_for(&agent, json!({"_id": "c"}))).await;
        assert_eq!(third.reason, "agent_quarantined");
    }
}

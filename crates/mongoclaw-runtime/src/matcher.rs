use mongoclaw_core::filter::matches_filter;
use mongoclaw_core::{AgentConfig, ChangeEvent, Result};
use mongoclaw_storage::AgentStore;
use std::sync::Arc;
use tracing::debug;

/// Matches change events to the enabled agents whose watch spec covers them.
pub struct EventMatcher {
    agent_store: Arc<dyn AgentStore>,
}

impl EventMatcher {
    pub fn new(agent_store: Arc<dyn AgentStore>) -> Self {
        Self { agent_store }
    }

    pub async fn match_event(&self, event: &ChangeEvent) -> Result<Vec<AgentConfig>> {
        let agents = self
            .agent_store
            .get_by_watch_target(&event.database, &event.collection, true)
            .await?;
        Ok(agents
            .into_iter()
            .filter(|agent| Self::matches(event, agent))
            .collect())
    }

    fn matches(event: &ChangeEvent, agent: &AgentConfig) -> bool {
        let watch = &agent.watch;
        if !watch.operations.contains(&event.operation) {
            debug!(
                agent_id = %agent.id,
                operation = event.operation.as_str(),
                "operation mismatch"
            );
            return false;
        }
        if let Some(filter) = &watch.filter {
            match &event.full_document {
                Some(document) => {
                    if !matches_filter(document, filter) {
                        return false;
                    }
                }
                // A filter cannot be evaluated without the document; deletes
                // arrive without one.
                None => {
                    debug!(
                        agent_id = %agent.id,
                        operation = event.operation.as_str(),
                        "filter-bearing agent skipped without full document"
                    );
                    return false;
                }
            }
        }
        true
    }
}

use chrono::Utc;
use mongoclaw_core::hash::blake3_hex;
use mongoclaw_core::{AgentConfig, ChangeEvent, Error, Result, WorkItem};
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use tera::Tera;

const TEMPLATE_CACHE_CAP: usize = 100;

/// Template rendering for prompts, system prompts and idempotency keys.
/// Compiled templates are cached by content hash.
pub struct PromptEngine {
    tera: Mutex<Tera>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        Self {
            tera: Mutex::new(Tera::default()),
        }
    }

    pub fn render(&self, template: &str, context: &JsonValue) -> Result<String> {
        let digest = blake3_hex(template.as_bytes());
        let name = format!("tpl-{}", &digest[..16]);
        let context = tera::Context::from_serialize(context)
            .map_err(|err| Error::PromptRender(err.to_string()))?;

        let mut tera = self.tera.lock();
        if !tera.get_template_names().any(|registered| registered == name) {
            if tera.get_template_names().count() >= TEMPLATE_CACHE_CAP {
                *tera = Tera::default();
            }
            tera.add_raw_template(&name, template)
                .map_err(|err| Error::PromptRender(err.to_string()))?;
        }
        let rendered = tera
            .render(&name, &context)
            .map_err(|err| Error::PromptRender(render_error(&err)))?;
        Ok(rendered.trim().to_string())
    }

    /// Context available to all agent templates.
    pub fn build_context(
        document: &JsonValue,
        event: &ChangeEvent,
        agent: &AgentConfig,
        item: Option<&WorkItem>,
    ) -> JsonValue {
        let now = Utc::now();
        json!({
            "document": document,
            "doc": document,
            "event": event,
            "operation": event.operation.as_str(),
            "agent": {
                "id": agent.id,
                "name": agent.name,
                "tags": agent.tags,
                "version": agent.version,
            },
            "work_item": item.map(|i| json!({
                "id": i.id,
                "attempt": i.attempt,
                "document_id": i.document_id,
            })),
            "now": now.to_rfc3339(),
            "timestamp": now.timestamp(),
        })
    }
}

fn render_error(err: &tera::Error) -> String {
    use std::error::Error as _;
    // Tera nests the useful message one level down.
    match err.source() {
        Some(source) => format!("{err}: {source}"),
        None => err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongoclaw_core::ChangeOperation;
    use serde_json::json;

    fn agent() -> AgentConfig {
        serde_json::from_value(json!({
            "id": "classifier",
            "name": "Classifier",
            "watch": {"database": "support", "collection": "tickets"},
            "ai": {"prompt": "p"},
        }))
        .unwrap()
    }

    fn event(document: JsonValue) -> ChangeEvent {
        ChangeEvent {
            operation: ChangeOperation::Insert,
            database: "support".into(),
            collection: "tickets".into(),
            document_key: json!({"_id": "t1"}),
            full_document: Some(document),
            update_description: None,
            resume_token: None,
            cluster_time: None,
            wall_time: Utc::now(),
        }
    }

    #[test]
    fn renders_document_fields() {
        let engine = PromptEngine::new();
        let document = json!({"title": "Card declined", "status": "new"});
        let context =
            PromptEngine::build_context(&document, &event(document.clone()), &agent(), None);
        let rendered = engine
            .render(
                "Classify the ticket titled {{ document.title }} ({{ operation }})",
                &context,
            )
            .unwrap();
        assert_eq!(rendered, "Classify the ticket titled Card declined (insert)");
    }

    #[test]
    fn rejects_bad_templates() {
        let engine = PromptEngine::new();
        let context = PromptEngine::build_context(
            &json!({}),
            &event(json!({})),
            &agent(),
            None,
        );
        let err = engine.render("{{ unclosed", &context).unwrap_err();
        assert!(matches!(err, Error::PromptRender(_)));
    }

    #[test]
    fn missing_variables_fail_the_render() {
        let engine = PromptEngine::new();
        let context =
            PromptEngine::build_context(&json!({}), &event(json!({})), &agent(), None);
        assert!(engine.render("{{ nope.some.field }}", &context).is_err());
    }

    #[test]
    fn template_cache_is_reused() {
        let engine = PromptEngine::new();
        let context =
            PromptEngine::build_context(&json!({"x": 1}), &event(json!({})), &agent(), None);
        for _ in 0..3 {
            assert_eq!(engine.render("{{ document.x }}", &context).unwrap(), "1");
        }
    }
}

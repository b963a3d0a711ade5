use mongoclaw_core::{RoutingStrategy, WorkItem};

pub const DEFAULT_STREAM: &str = "mongoclaw:work";
pub const DLQ_STREAM: &str = "mongoclaw:dlq";
pub const AGENT_STREAM_PREFIX: &str = "mongoclaw:agent:";
pub const PARTITION_STREAM_PREFIX: &str = "mongoclaw:partition:";

pub fn stream_name(
    strategy: RoutingStrategy,
    agent_id: &str,
    item: &WorkItem,
    num_partitions: u32,
) -> String {
    match strategy {
        RoutingStrategy::ByAgent => format!("{AGENT_STREAM_PREFIX}{agent_id}"),
        RoutingStrategy::ByCollection => {
            format!("mongoclaw:collection:{}:{}", item.database, item.collection)
        }
        RoutingStrategy::Single => DEFAULT_STREAM.to_string(),
        RoutingStrategy::Partitioned => {
            let partition = hash_partition(&item.document_id, num_partitions);
            format!("{PARTITION_STREAM_PREFIX}{partition}")
        }
        RoutingStrategy::ByPriority => format!("mongoclaw:priority:{}", item.priority),
    }
}

pub fn dlq_stream_name(strategy: RoutingStrategy, agent_id: Option<&str>) -> String {
    match (strategy, agent_id) {
        (RoutingStrategy::ByAgent, Some(agent_id)) => format!("mongoclaw:dlq:agent:{agent_id}"),
        _ => DLQ_STREAM.to_string(),
    }
}

/// Discovery patterns scanned by the worker pool for a strategy.
pub fn stream_patterns(strategy: RoutingStrategy) -> Vec<&'static str> {
    match strategy {
        RoutingStrategy::ByAgent => vec!["mongoclaw:agent:*"],
        RoutingStrategy::ByCollection => vec!["mongoclaw:collection:*"],
        RoutingStrategy::Single => vec![DEFAULT_STREAM],
        RoutingStrategy::Partitioned => vec!["mongoclaw:partition:*"],
        RoutingStrategy::ByPriority => vec!["mongoclaw:priority:*"],
    }
}

pub fn hash_partition(key: &str, num_partitions: u32) -> u32 {
    if key.is_empty() || num_partitions == 0 {
        return 0;
    }
    let digest = blake3::hash(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    (u64::from_be_bytes(prefix) % num_partitions as u64) as u32
}

/// Agent id for `mongoclaw:agent:<id>` streams; None for other shapes.
pub fn agent_id_from_stream(stream: &str) -> Option<&str> {
    stream
        .strip_prefix(AGENT_STREAM_PREFIX)
        .filter(|id| !id.is_empty())
}

pub fn partition_from_stream(stream: &str) -> Option<u32> {
    stream
        .strip_prefix(PARTITION_STREAM_PREFIX)
        .and_then(|n| n.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongoclaw_core::{AgentConfig, ChangeEvent, ChangeOperation};
    use serde_json::json;

    fn item(priority: u8) -> WorkItem {
        let agent: AgentConfig = serde_json::from_value(json!({
            "id": "classifier",
            "name": "c",
            "watch": {"database": "support", "collection": "tickets"},
            "ai": {"prompt": "p"},
            "execution": {"priority": priority},
        }))
        .unwrap();
        let event = ChangeEvent {
            operation: ChangeOperation::Insert,
            database: "support".into(),
            collection: "tickets".into(),
            document_key: json!({"_id": "t1"}),
            full_document: Some(json!({"_id": "t1"})),
            update_description: None,
            resume_token: None,
            cluster_time: None,
            wall_time: chrono::Utc::now(),
        };
        WorkItem::from_event(&agent, &event)
    }

    #[test]
    fn stream_names_per_strategy() {
        let item = item(7);
        assert_eq!(
            stream_name(RoutingStrategy::ByAgent, "classifier", &item, 8),
            "mongoclaw:agent:classifier"
        );
        assert_eq!(
            stream_name(RoutingStrategy::ByCollection, "classifier", &item, 8),
            "mongoclaw:collection:support:tickets"
        );
        assert_eq!(
            stream_name(RoutingStrategy::Single, "classifier", &item, 8),
            "mongoclaw:work"
        );
        assert_eq!(
            stream_name(RoutingStrategy::ByPriority, "classifier", &item, 8),
            "mongoclaw:priority:7"
        );
        let partitioned = stream_name(RoutingStrategy::Partitioned, "classifier", &item, 8);
        assert!(partitioned.starts_with("mongoclaw:partition:"));
        assert!(partition_from_stream(&partitioned).unwrap() < 8);
    }

    #[test]
    fn partitioning_is_stable_and_bounded() {
        let a = hash_partition("doc-1", 8);
        assert_eq!(a, hash_partition("doc-1", 8));
        for i in 0..100 {
            assert!(hash_partition(&format!("doc-{i}"), 8) < 8);
        }
        assert_eq!(hash_partition("", 8), 0);
    }

    #[test]
    fn dlq_names() {
        assert_eq!(
            dlq_stream_name(RoutingStrategy::ByAgent, Some("classifier")),
            "mongoclaw:dlq:agent:classifier"
        );
        assert_eq!(dlq_stream_name(RoutingStrategy::Single, None), "mongoclaw:dlq");
    }

    #[test]
    fn agent_id_extraction() {
        assert_eq!(
            agent_id_from_stream("mongoclaw:agent:classifier"),
            Some("classifier")
        );
        assert_eq!(agent_id_from_stream("mongoclaw:work"), None);
        assert_eq!(agent_id_from_stream("mongoclaw:agent:"), None);
    }
}

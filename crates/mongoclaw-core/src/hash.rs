use blake3::Hasher;
use serde_json::Value as JsonValue;

/// Field carrying the writeback anti-loop counter.
pub const VERSION_FIELD: &str = "_mongoclaw_version";
/// Default field for execution metadata attached on writeback.
pub const DEFAULT_METADATA_FIELD: &str = "_ai_metadata";

pub fn blake3_hex(data: &[u8]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize().to_hex().to_string()
}

/// Content hash over all non-framework fields, stable under key ordering.
///
/// `serde_json` maps are BTree-backed, so serializing the normalized value is
/// already canonical; framework fields are stripped at every nesting level so
/// the hash is invariant under enrichment writes.
pub fn stable_document_hash(document: &JsonValue) -> String {
    let normalized = normalize(document);
    let serialized = serde_json::to_string(&normalized).unwrap_or_default();
    blake3_hex(serialized.as_bytes())
}

fn normalize(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .filter(|(k, _)| k.as_str() != VERSION_FIELD && !is_metadata_field(k))
                .map(|(k, v)| (k.clone(), normalize(v)))
                .collect(),
        ),
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

fn is_metadata_field(key: &str) -> bool {
    key == DEFAULT_METADATA_FIELD
}

/// `_mongoclaw_version` as observed on a document; absent counts as 0.
pub fn source_version(document: &JsonValue) -> i64 {
    document
        .get(VERSION_FIELD)
        .and_then(JsonValue::as_i64)
        .unwrap_or(0)
}

use crate::agent::ChangeOperation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdateDescription {
    #[serde(default)]
    pub updated_fields: JsonValue,
    #[serde(default)]
    pub removed_fields: Vec<String>,
}

/// A single observed mutation. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub operation: ChangeOperation,
    pub database: String,
    pub collection: String,
    pub document_key: JsonValue,
    #[serde(default)]
    pub full_document: Option<JsonValue>,
    #[serde(default)]
    pub update_description: Option<UpdateDescription>,
    #[serde(default)]
    pub resume_token: Option<JsonValue>,
    #[serde(default)]
    pub cluster_time: Option<DateTime<Utc>>,
    pub wall_time: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }

    /// The document `_id` as a string. Handles plain strings as well as
    /// extended-JSON `{"$oid": "..."}` object ids.
    pub fn document_id(&self) -> String {
        document_id_from_key(&self.document_key)
    }
}

pub fn document_id_from_key(document_key: &JsonValue) -> String {
    match document_key.get("_id") {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Object(map)) => match map.get("$oid") {
            Some(JsonValue::String(oid)) => oid.clone(),
            _ => serde_json::to_string(map).unwrap_or_default(),
        },
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

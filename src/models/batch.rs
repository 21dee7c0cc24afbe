use crate::state_machine::BatchStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// A unit of work comprising many work items, with its own lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: Uuid,
    pub sequence_number: i64,
    pub name: String,
    /// Opaque to the engine
    pub metadata: Value,
    pub status: BatchStatus,
    pub configuration_snapshot: Option<ConfigurationSnapshot>,
    pub total_item_count: i64,
    pub processed_item_count: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency counter, bumped by every accepted transition
    pub version: i64,
}

/// New batch for creation (without generated fields)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBatch {
    pub name: String,
    pub metadata: Value,
}

impl NewBatch {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Immutable copy of the batch configuration captured at staging time
///
/// Holds the resolved connections, prompts and documents so that in-flight
/// and completed batches are unaffected by later configuration edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigurationSnapshot(BTreeMap<String, Value>);

impl ConfigurationSnapshot {
    pub const DOCUMENTS: &'static str = "documents";
    pub const CONNECTIONS: &'static str = "connections";
    pub const PROMPTS: &'static str = "prompts";
    pub const STAGED_AT: &'static str = "staged_at";

    pub fn new(entries: BTreeMap<String, Value>) -> Self {
        Self(entries)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn entries(&self) -> &BTreeMap<String, Value> {
        &self.0
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.0.clone().into_iter().collect())
    }

    pub fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map.into_iter().collect())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_json_conversion() {
        let mut entries = BTreeMap::new();
        entries.insert(ConfigurationSnapshot::PROMPTS.to_string(), json!([{"id": "p1"}]));
        let snapshot = ConfigurationSnapshot::new(entries);

        let value = snapshot.to_json();
        assert_eq!(value, json!({"prompts": [{"id": "p1"}]}));
        assert_eq!(ConfigurationSnapshot::from_json(value), Some(snapshot));
        assert_eq!(ConfigurationSnapshot::from_json(json!([1, 2])), None);
    }

    #[test]
    fn test_new_batch_defaults_to_empty_metadata() {
        let batch = NewBatch::new("invoices");
        assert_eq!(batch.metadata, json!({}));
        let batch = batch.with_metadata(json!({"owner": "ops"}));
        assert_eq!(batch.metadata["owner"], "ops");
    }
}

//! # Staging
//!
//! Staging turns a saved batch into concrete work items. Resolving which
//! documents, connections and prompts belong to a batch is the job of an
//! external [`ConfigurationResolver`]; this module only multiplies the
//! resolved plan out into one work item per document x connection x prompt and
//! freezes the plan into a [`ConfigurationSnapshot`].

use crate::models::{Batch, ConfigurationSnapshot, NewWorkItem};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// One resolved document, connection or prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingEntry {
    pub id: String,
    /// Opaque attributes forwarded to the inference collaborator
    #[serde(default)]
    pub attributes: Value,
}

impl StagingEntry {
    pub fn new(id: impl Into<String>, attributes: Value) -> Self {
        Self {
            id: id.into(),
            attributes,
        }
    }
}

/// Everything staging needs to build the work items of a batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagingPlan {
    pub documents: Vec<StagingEntry>,
    pub connections: Vec<StagingEntry>,
    pub prompts: Vec<StagingEntry>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StagingError {
    #[error("Documents could not be resolved: {0}")]
    Unresolvable(String),
    #[error("Staging plan produces no work items ({documents} documents, {connections} connections, {prompts} prompts)")]
    EmptyPlan {
        documents: usize,
        connections: usize,
        prompts: usize,
    },
    #[error("Configuration snapshot is missing or malformed: {0}")]
    InvalidSnapshot(String),
}

pub type StagingResult<T> = Result<T, StagingError>;

/// External collaborator that resolves a batch's configuration at staging time
#[async_trait]
pub trait ConfigurationResolver: Send + Sync + std::fmt::Debug {
    async fn resolve(&self, batch: &Batch) -> StagingResult<StagingPlan>;
}

impl StagingPlan {
    pub fn item_count(&self) -> usize {
        self.documents.len() * self.connections.len() * self.prompts.len()
    }

    /// Reject plans that would stage a batch with nothing to do
    pub fn ensure_not_empty(&self) -> StagingResult<()> {
        if self.item_count() == 0 {
            return Err(StagingError::EmptyPlan {
                documents: self.documents.len(),
                connections: self.connections.len(),
                prompts: self.prompts.len(),
            });
        }
        Ok(())
    }

    /// Cartesian product of documents, connections and prompts
    pub fn build_work_items(&self) -> Vec<NewWorkItem> {
        let mut items = Vec::with_capacity(self.item_count());
        for document in &self.documents {
            for connection in &self.connections {
                for prompt in &self.prompts {
                    items.push(NewWorkItem {
                        document_id: document.id.clone(),
                        connection_id: connection.id.clone(),
                        prompt_id: prompt.id.clone(),
                        payload: json!({
                            "document": document,
                            "connection": connection,
                            "prompt": prompt,
                        }),
                    });
                }
            }
        }
        items
    }

    pub fn to_snapshot(&self, staged_at: DateTime<Utc>) -> StagingResult<ConfigurationSnapshot> {
        let encode = |entries: &Vec<StagingEntry>| {
            serde_json::to_value(entries).map_err(|e| StagingError::InvalidSnapshot(e.to_string()))
        };

        let mut entries = BTreeMap::new();
        entries.insert(
            ConfigurationSnapshot::DOCUMENTS.to_string(),
            encode(&self.documents)?,
        );
        entries.insert(
            ConfigurationSnapshot::CONNECTIONS.to_string(),
            encode(&self.connections)?,
        );
        entries.insert(
            ConfigurationSnapshot::PROMPTS.to_string(),
            encode(&self.prompts)?,
        );
        entries.insert(
            ConfigurationSnapshot::STAGED_AT.to_string(),
            Value::String(staged_at.to_rfc3339()),
        );
        Ok(ConfigurationSnapshot::new(entries))
    }

    /// Rebuild the plan frozen into a snapshot, used by `rerun`
    pub fn from_snapshot(snapshot: &ConfigurationSnapshot) -> StagingResult<Self> {
        let decode = |key: &str| -> StagingResult<Vec<StagingEntry>> {
            let value = snapshot
                .get(key)
                .ok_or_else(|| StagingError::InvalidSnapshot(format!("missing key '{key}'")))?;
            serde_json::from_value(value.clone())
                .map_err(|e| StagingError::InvalidSnapshot(format!("key '{key}': {e}")))
        };

        Ok(Self {
            documents: decode(ConfigurationSnapshot::DOCUMENTS)?,
            connections: decode(ConfigurationSnapshot::CONNECTIONS)?,
            prompts: decode(ConfigurationSnapshot::PROMPTS)?,
        })
    }
}

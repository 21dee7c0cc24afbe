use async_trait::async_trait;
use batchflow_core::models::Batch;
use batchflow_core::staging::{
    ConfigurationResolver, StagingEntry, StagingError, StagingPlan, StagingResult,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;

/// Resolver that returns the same plan for every batch
///
/// The plan can be swapped between stagings to simulate configuration edits.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    plan: Arc<Mutex<StagingPlan>>,
}

impl StaticResolver {
    pub fn new(plan: StagingPlan) -> Self {
        Self {
            plan: Arc::new(Mutex::new(plan)),
        }
    }

    /// One connection and one prompt per document
    pub fn documents(document_ids: &[&str]) -> Self {
        Self::new(plan(document_ids, &["conn-a"], &["prompt-a"]))
    }

    pub fn replace_plan(&self, plan: StagingPlan) {
        *self.plan.lock() = plan;
    }
}

#[async_trait]
impl ConfigurationResolver for StaticResolver {
    async fn resolve(&self, _batch: &Batch) -> StagingResult<StagingPlan> {
        Ok(self.plan.lock().clone())
    }
}

/// Resolver whose documents can never be resolved
#[derive(Debug, Clone, Default)]
pub struct FailingResolver;

#[async_trait]
impl ConfigurationResolver for FailingResolver {
    async fn resolve(&self, batch: &Batch) -> StagingResult<StagingPlan> {
        Err(StagingError::Unresolvable(format!(
            "document source for '{}' is unreachable",
            batch.name
        )))
    }
}

pub fn plan(documents: &[&str], connections: &[&str], prompts: &[&str]) -> StagingPlan {
    let entries = |ids: &[&str]| {
        ids.iter()
            .map(|id| StagingEntry::new(*id, json!({"label": id})))
            .collect()
    };
    StagingPlan {
        documents: entries(documents),
        connections: entries(connections),
        prompts: entries(prompts),
    }
}

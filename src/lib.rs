#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Batchflow Core
//!
//! Batch orchestration engine that drives documents through external
//! inference calls, one work item per document x connection x prompt.
//!
//! ## Architecture
//!
//! - A **state machine controller** is the only writer of batch status and
//!   work item outcomes. Every batch transition is a compare-and-set on the
//!   batch version.
//! - A **work dispatcher** runs N workers that atomically claim queued items
//!   (lock-and-skip), submit them to an [`inference::InferenceClient`] and
//!   poll each one on its own task, bounded by a global in-flight ceiling.
//! - A **progress aggregator** recomputes processed counts from the store and
//!   completes a batch once every item is terminal.
//! - A **recovery manager** reconciles state left behind by a crash before
//!   the dispatcher starts claiming.
//!
//! ## Module Organization
//!
//! - [`state_machine`] - Batch/work item lifecycles and the controller
//! - [`orchestration`] - Dispatcher, aggregator, recovery manager and core wiring
//! - [`database`] - Persistence contract with PostgreSQL and in-memory stores
//! - [`inference`] - Inference collaborator contract
//! - [`staging`] - Configuration resolution and work item expansion
//! - [`services`] - Read-only batch queries
//! - [`events`] - Lifecycle event broadcast
//! - [`config`] - Layered configuration
//! - [`logging`] / [`metrics`] - Structured logging and OpenTelemetry instruments
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use batchflow_core::config::ConfigManager;
//! use batchflow_core::database::InMemoryBatchStore;
//! use batchflow_core::inference::InferenceClient;
//! use batchflow_core::models::NewBatch;
//! use batchflow_core::orchestration::OrchestrationCore;
//! use batchflow_core::staging::ConfigurationResolver;
//! use batchflow_core::state_machine::{BatchAction, TransitionContext};
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     inference: Arc<dyn InferenceClient>,
//! #     resolver: Arc<dyn ConfigurationResolver>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigManager::load()?.config().clone();
//! batchflow_core::logging::init_structured_logging(&config.telemetry);
//!
//! let store = Arc::new(InMemoryBatchStore::new());
//! let core = OrchestrationCore::new(config, store, inference, resolver)?;
//! core.start().await?;
//!
//! let controller = core.controller();
//! let batch = controller.create_batch(NewBatch::new("quarterly-reports")).await?;
//! for action in [BatchAction::Save, BatchAction::Stage] {
//!     let response = controller
//!         .request_state_change(batch.batch_id, action, TransitionContext::new())
//!         .await?;
//!     assert!(response.accepted);
//! }
//! // STAGED batches start on their first claim; `BatchAction::Run` starts one explicitly
//!
//! let report = core.query_service().get_batch_status(batch.batch_id).await?;
//! println!("{}/{} processed", report.processed_item_count, report.total_item_count);
//!
//! core.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod events;
pub mod inference;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod orchestration;
pub mod services;
pub mod staging;
pub mod state_machine;

pub use config::{ConfigManager, OrchestratorConfig};
pub use database::{BatchStore, InMemoryBatchStore};
#[cfg(feature = "postgres")]
pub use database::PgBatchStore;
pub use error::{BatchflowError, BatchflowResult};
pub use inference::{InferenceClient, InferenceError, PollStatus, TaskHandle};
pub use models::{Batch, BatchTransition, ConfigurationSnapshot, NewBatch, WorkItem};
pub use orchestration::{OrchestrationCore, RecoveryReport};
pub use services::{BatchQueryService, BatchStatusReport};
pub use staging::{ConfigurationResolver, StagingPlan};
pub use state_machine::{
    BatchAction, BatchStatus, StateMachineController, TransitionContext, TransitionResponse,
    WorkItemStatus,
};

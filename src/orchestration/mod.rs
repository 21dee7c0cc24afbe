//! # Orchestration
//!
//! The moving parts of the engine:
//!
//! - [`work_dispatcher`] - claim-and-submit workers and per-item trackers
//! - [`active_tasks`] - in-memory registry of claimed items and in-flight slots
//! - [`progress_aggregator`] - processed counts and batch completion
//! - [`recovery_manager`] - crash reconciliation at startup and on an interval
//! - [`core`] - wiring, startup ordering and shutdown

pub mod active_tasks;
pub mod core;
pub mod progress_aggregator;
pub mod recovery_manager;
pub mod work_dispatcher;

pub use self::core::{OrchestrationCore, OrchestrationStatus};
pub use active_tasks::{ActiveTaskRecord, ActiveTaskRegistry};
pub use progress_aggregator::{ProgressAggregator, ProgressSnapshot};
pub use recovery_manager::{RecoveryManager, RecoveryReport};
pub use work_dispatcher::WorkDispatcher;

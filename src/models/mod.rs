//! # Data Models
//!
//! Records persisted by the [`crate::database::BatchStore`] contract.

pub mod batch;
pub mod transition;
pub mod work_item;

pub use batch::{Batch, ConfigurationSnapshot, NewBatch};
pub use transition::BatchTransition;
pub use work_item::{ErrorDetail, ErrorKind, NewWorkItem, WorkItem, WorkItemResult};

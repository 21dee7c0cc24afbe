//! # Database Operations
//!
//! Persistence for batches, work items and the transition log.
//!
//! ## Key Components
//!
//! - [`store`] - The [`BatchStore`] contract: atomic claim and compare-and-set
//! - [`postgres`] - PostgreSQL implementation on SQLx (feature `postgres`)
//! - [`memory`] - In-process implementation for embedding and tests
//!
//! The rest of the crate only ever holds an `Arc<dyn BatchStore>`.

pub mod errors;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod store;

pub use errors::{StoreError, StoreResult};
pub use memory::InMemoryBatchStore;
#[cfg(feature = "postgres")]
pub use postgres::PgBatchStore;
pub use store::{
    BatchStore, CasOutcome, ClaimRequest, OrphanedItem, ProgressCounts, RequeueOutcome,
    RequeueSelection, StagedItems, StatusUpdate,
};

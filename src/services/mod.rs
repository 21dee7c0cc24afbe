//! Read-only services over the batch store.

pub mod batch_query_service;

pub use batch_query_service::{BatchQueryService, BatchStatusReport};

//! # Lifecycle Events
//!
//! Broadcast of batch transitions and work item outcomes for in-process
//! observers (dashboards, audit sinks, tests). Publishing never blocks and
//! never fails because nobody is listening.

pub mod publisher;

pub use publisher::{EventPublisher, PublishError, PublishedEvent};

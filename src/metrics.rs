//! # Orchestration Metrics
//!
//! OpenTelemetry instruments for the batch engine:
//! - Transition counters (accepted, rejected)
//! - Work item counters (claimed, finished by status, reset by recovery)
//! - Submission and poll duration histograms
//!
//! Instruments come from the global meter provider, so they are no-ops until
//! the host installs one.
//!
//! ## Usage
//!
//! ```rust
//! use batchflow_core::metrics::*;
//! use opentelemetry::KeyValue;
//!
//! work_items_finished_total().add(1, &[KeyValue::new("status", "COMPLETED")]);
//! ```

use opentelemetry::metrics::{Counter, Histogram, Meter};
use std::sync::OnceLock;

static BATCHFLOW_METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    BATCHFLOW_METER.get_or_init(|| opentelemetry::global::meter_provider().meter("batchflow"))
}

// Counters

/// Accepted batch transitions
///
/// Labels:
/// - action: Batch action
/// - to_status: Status the batch moved into
pub fn transitions_accepted_total() -> Counter<u64> {
    meter()
        .u64_counter("batchflow.transitions.accepted.total")
        .with_description("Total number of accepted batch transitions")
        .build()
}

/// Rejected batch transition requests
///
/// Labels:
/// - action: Batch action
/// - reason: invalid_transition, guard_failed, version_conflict
pub fn transitions_rejected_total() -> Counter<u64> {
    meter()
        .u64_counter("batchflow.transitions.rejected.total")
        .with_description("Total number of rejected batch transition requests")
        .build()
}

/// Work items claimed by dispatcher workers
pub fn work_items_claimed_total() -> Counter<u64> {
    meter()
        .u64_counter("batchflow.work_items.claimed.total")
        .with_description("Total number of work items claimed for submission")
        .build()
}

/// Work items that reached a terminal status
///
/// Labels:
/// - status: COMPLETED, FAILED, TIMEOUT
pub fn work_items_finished_total() -> Counter<u64> {
    meter()
        .u64_counter("batchflow.work_items.finished.total")
        .with_description("Total number of work items that reached a terminal status")
        .build()
}

/// Orphaned work items reset to QUEUED by recovery
pub fn work_items_recovered_total() -> Counter<u64> {
    meter()
        .u64_counter("batchflow.work_items.recovered.total")
        .with_description("Total number of orphaned work items reset by recovery")
        .build()
}

// Histograms

/// Duration of a submission call in milliseconds
///
/// Labels:
/// - outcome: submitted, rejected, timeout
pub fn submission_duration() -> Histogram<f64> {
    meter()
        .f64_histogram("batchflow.submission.duration")
        .with_description("Inference submission duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Time from submission to terminal outcome in milliseconds
///
/// Labels:
/// - status: COMPLETED, FAILED, TIMEOUT
pub fn work_item_turnaround() -> Histogram<f64> {
    meter()
        .f64_histogram("batchflow.work_item.turnaround")
        .with_description("Time from submission to terminal outcome in milliseconds")
        .with_unit("ms")
        .build()
}

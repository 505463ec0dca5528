//! Metric instrument factories for batchq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"batchq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for batchq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("batchq")
}

/// Counter: successful lock acquisitions.
/// Labels: `contended` ("true" | "false").
pub fn lock_acquisitions() -> Counter<u64> {
    meter()
        .u64_counter("batchq.lock.acquisitions")
        .with_description("Number of allocation lock acquisitions")
        .build()
}

/// Counter: lock acquisitions that gave up after exhausting retries.
pub fn lock_timeouts() -> Counter<u64> {
    meter()
        .u64_counter("batchq.lock.timeouts")
        .with_description("Number of lock acquisitions that timed out")
        .build()
}

/// Counter: stale lock markers force-reclaimed from a presumed-dead holder.
pub fn stale_locks_reclaimed() -> Counter<u64> {
    meter()
        .u64_counter("batchq.lock.stale_reclaimed")
        .with_description("Number of stale lock markers reclaimed")
        .build()
}

/// Histogram: time spent waiting for the lock, in milliseconds.
pub fn lock_wait_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("batchq.lock.wait_ms")
        .with_description("Time spent acquiring the allocation lock")
        .with_unit("ms")
        .build()
}

/// Counter: identifiers handed out.
/// Labels: `placeholder` ("written" | "failed").
pub fn ids_allocated() -> Counter<u64> {
    meter()
        .u64_counter("batchq.ids.allocated")
        .with_description("Number of identifiers allocated")
        .build()
}

/// Counter: record status transitions.
/// Labels: `from`, `to`.
pub fn record_transitions() -> Counter<u64> {
    meter()
        .u64_counter("batchq.records.transitions")
        .with_description("Number of work record status transitions")
        .build()
}

/// Counter: records repaired by reconciliation.
/// Labels: `kind` ("completed" | "processing_timeout" | "retry_interrupted").
pub fn records_repaired() -> Counter<u64> {
    meter()
        .u64_counter("batchq.records.repaired")
        .with_description("Number of records repaired by reconciliation")
        .build()
}

/// Counter: duplicate identifiers removed across batches.
pub fn duplicates_removed() -> Counter<u64> {
    meter()
        .u64_counter("batchq.duplicates.removed")
        .with_description("Number of duplicate work items removed")
        .build()
}

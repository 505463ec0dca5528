//! Batch operation span helpers.
//!
//! Provides span creation and status-transition recording for work items
//! flowing through a batch.

use tracing::Span;

use crate::model::{Batch, ItemId, Status};

/// Start a span for an operation against one batch.
///
/// The `batch.repaired` field is declared empty and can be filled via
/// [`record_repaired`].
pub fn start_batch_span(operation: &str, batch: &Batch) -> Span {
    tracing::info_span!(
        "batch.operation",
        "batch.operation" = operation,
        "batch.key" = %batch.key,
        "batch.repaired" = tracing::field::Empty,
    )
}

/// Record a status transition event on the given span.
pub fn record_status_transition(span: &Span, id: ItemId, from: Status, to: Status) {
    span.in_scope(|| {
        tracing::info!(id = %id, from = %from, to = %to, "status_transition");
    });
}

/// Record how many records an operation repaired.
pub fn record_repaired(span: &Span, count: usize) {
    span.record("batch.repaired", count as u64);
}

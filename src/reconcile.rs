//! Repair pass for records left in a transient state by a crashed or stalled
//! worker.
//!
//! - `processing` with its primary output on disk becomes `completed`.
//! - `processing` older than the stuck threshold becomes `failed`
//!   ("processing timeout").
//! - `retrying` becomes `failed` ("retry interrupted"); it is never expected
//!   to survive across a scan.
//!
//! Running the pass twice with no activity in between changes nothing the
//! second time. No artifacts are deleted.

use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tracing::{info, warn};

use crate::error::Result;
use crate::model::{Batch, ItemId, PROCESSING_TIMEOUT, RETRY_INTERRUPTED, Status, WorkRecord};
use crate::store::StateStore;
use crate::telemetry::{batch as batch_span, metrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairKind {
    /// Output found for a `processing` record.
    Completed,
    /// `processing` for longer than the stuck threshold without output.
    ProcessingTimeout,
    /// `retrying` observed at scan time.
    RetryInterrupted,
}

impl RepairKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RepairKind::Completed => "completed",
            RepairKind::ProcessingTimeout => "processing_timeout",
            RepairKind::RetryInterrupted => "retry_interrupted",
        }
    }
}

/// One corrected record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repair {
    pub batch: String,
    pub id: ItemId,
    pub kind: RepairKind,
}

/// Result of reconciling several batches.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub repairs: Vec<Repair>,
    /// Batches that could not be reconciled, with the reason.
    pub failed_batches: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ReconciliationScanner {
    store: StateStore,
    stuck_threshold: Duration,
}

impl ReconciliationScanner {
    pub fn new(store: StateStore, stuck_threshold: Duration) -> Self {
        Self {
            store,
            stuck_threshold,
        }
    }

    /// Reconcile one batch. Returns the records that were repaired.
    pub fn reconcile(&self, batch: &Batch) -> Result<Vec<Repair>> {
        self.reconcile_at(batch, Utc::now())
    }

    /// Reconcile one batch as of `now`.
    pub fn reconcile_at(&self, batch: &Batch, now: DateTime<Utc>) -> Result<Vec<Repair>> {
        let span = batch_span::start_batch_span("reconcile", batch);
        let _entered = span.enter();

        let repairs = self.store.update(batch, |set| {
            let mut repairs = Vec::new();
            for (id, record) in set.iter_mut() {
                let Some((kind, to, reason)) = self.diagnose(batch, id, record, now) else {
                    continue;
                };
                match record.transition(to, reason, now) {
                    Ok(from) => {
                        batch_span::record_status_transition(&span, id, from, to);
                        repairs.push(Repair {
                            batch: batch.key.clone(),
                            id,
                            kind,
                        });
                    }
                    Err(e) => {
                        warn!(batch = %batch, id = %id, error = %e, "skipping record during reconciliation");
                    }
                }
            }
            Ok(repairs)
        })?;

        for repair in &repairs {
            metrics::records_repaired().add(1, &[KeyValue::new("kind", repair.kind.as_str())]);
        }
        batch_span::record_repaired(&span, repairs.len());
        if !repairs.is_empty() {
            info!(batch = %batch, repaired = repairs.len(), "reconciled batch");
        }
        Ok(repairs)
    }

    /// Reconcile every batch. A batch that fails is logged and reported; the
    /// remaining batches are still processed.
    pub fn reconcile_all(&self, batches: &[Batch]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let now = Utc::now();
        for batch in batches {
            match self.reconcile_at(batch, now) {
                Ok(mut repairs) => report.repairs.append(&mut repairs),
                Err(e) => {
                    warn!(batch = %batch, error = %e, "reconciliation failed for batch");
                    report.failed_batches.push((batch.key.clone(), e.to_string()));
                }
            }
        }
        report
    }

    fn diagnose(
        &self,
        batch: &Batch,
        id: ItemId,
        record: &WorkRecord,
        now: DateTime<Utc>,
    ) -> Option<(RepairKind, Status, Option<&'static str>)> {
        match record.status {
            Status::Processing if self.store.has_output(batch, id) => {
                Some((RepairKind::Completed, Status::Completed, None))
            }
            Status::Processing if self.is_stuck(record, now) => Some((
                RepairKind::ProcessingTimeout,
                Status::Failed,
                Some(PROCESSING_TIMEOUT),
            )),
            Status::Retrying => Some((
                RepairKind::RetryInterrupted,
                Status::Failed,
                Some(RETRY_INTERRUPTED),
            )),
            _ => None,
        }
    }

    /// A record with no start time cannot be aged and is treated as stuck.
    fn is_stuck(&self, record: &WorkRecord, now: DateTime<Utc>) -> bool {
        match record.assigned_at {
            Some(at) => (now - at)
                .to_std()
                .map(|age| age > self.stuck_threshold)
                .unwrap_or(false),
            None => true,
        }
    }
}

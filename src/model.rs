//! Core data model.
//!
//! A batch is one working root (one day of activity). Inside a batch every
//! work item is keyed by a numeric identifier and carries a record with its
//! source URL, lifecycle status and timestamps.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Failure reason written when a `processing` record outlives the stuck threshold.
pub const PROCESSING_TIMEOUT: &str = "processing timeout";

/// Failure reason written when a `retrying` record is found at scan time.
pub const RETRY_INTERRUPTED: &str = "retry interrupted";

// ---------------------------------------------------------------------------
// Identifier
// ---------------------------------------------------------------------------

/// Identifier of a work item within a batch.
///
/// Ordered numerically. Displayed zero-padded to [`ItemId::WIDTH`] digits,
/// which is also how it appears in artifact file names and record keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(pub u32);

impl ItemId {
    pub const WIDTH: usize = 2;

    /// The following identifier, or `None` when the space is exhausted.
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:0width$}", self.0, width = Self::WIDTH)
    }
}

impl FromStr for ItemId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::Other(format!("invalid identifier: {s:?}")));
        }
        s.parse::<u32>()
            .map(ItemId)
            .map_err(|e| Error::Other(format!("invalid identifier {s:?}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Queued, nobody has started it.
    Pending,
    /// A worker claimed it and is producing output.
    Processing,
    /// Output exists.
    Completed,
    /// Gave up, reason recorded. Eligible for a future retry pass.
    Failed,
    /// A worker is re-running a previously failed item.
    Retrying,
    /// Deliberately not processed (e.g. unsuitable content).
    Skipped,
}

impl Status {
    /// Can a record move from `self` to `to`?
    pub fn can_transition_to(self, to: Status) -> bool {
        use Status::*;
        self == to
            || matches!(
                (self, to),
                (Pending, Processing)
                    | (Pending, Skipped)
                    | (Pending, Failed)
                    | (Processing, Completed)
                    | (Processing, Failed)
                    | (Processing, Skipped)
                    | (Processing, Retrying)
                    | (Retrying, Processing)
                    | (Retrying, Completed)
                    | (Retrying, Failed)
                    | (Failed, Pending)     // retry pass
                    | (Failed, Processing)
                    | (Failed, Retrying)
                    | (Skipped, Pending)
            )
    }

    /// States a worker is expected to leave. Reconciliation targets these.
    pub fn is_transient(self) -> bool {
        matches!(self, Status::Processing | Status::Retrying)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Retrying => "retrying",
            Status::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Status::Pending),
            "processing" => Ok(Status::Processing),
            "completed" => Ok(Status::Completed),
            "failed" => Ok(Status::Failed),
            "retrying" => Ok(Status::Retrying),
            "skipped" => Ok(Status::Skipped),
            _ => Err(Error::Other(format!("unknown status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Persisted status and metadata for one identifier's work item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRecord {
    pub url: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Fields this crate does not interpret, kept verbatim across saves.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,

    /// Loaded from a bare URL string and not modified since.
    #[serde(skip)]
    pub(crate) legacy: bool,
}

impl WorkRecord {
    pub fn new(url: impl Into<String>, status: Status, now: DateTime<Utc>) -> Self {
        let mut record = Self {
            url: url.into(),
            status,
            assigned_at: Some(now),
            completed_at: None,
            failed_at: None,
            error: None,
            extra: serde_json::Map::new(),
            legacy: false,
        };
        match status {
            Status::Completed => record.completed_at = Some(now),
            Status::Failed => record.failed_at = Some(now),
            _ => {}
        }
        record
    }

    /// A record from the older bare-URL format: implicitly completed, no metadata.
    pub fn legacy(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: Status::Completed,
            assigned_at: None,
            completed_at: None,
            failed_at: None,
            error: None,
            extra: serde_json::Map::new(),
            legacy: true,
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    /// Number of times this item has been re-admitted after a failure.
    pub fn retry_count(&self) -> u64 {
        self.extra
            .get("retryCount")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0)
    }

    /// Move to `to`, stamping the matching timestamp. Returns the previous status.
    ///
    /// `reason` is recorded as the error for `failed` and `skipped`.
    pub fn transition(
        &mut self,
        to: Status,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Status> {
        let from = self.status;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }

        self.legacy = false;
        self.status = to;
        match to {
            Status::Pending | Status::Processing | Status::Retrying => {
                self.assigned_at = Some(now);
            }
            Status::Completed => {
                self.completed_at = Some(now);
                self.error = None;
            }
            Status::Failed | Status::Skipped => {
                if to == Status::Failed {
                    self.failed_at = Some(now);
                }
                if let Some(reason) = reason {
                    self.error = Some(reason.to_string());
                }
            }
        }
        Ok(from)
    }

    /// Put a failed or stalled record back into `processing` for another attempt.
    ///
    /// The last error moves to `previousError` and `retryCount` is bumped.
    pub fn reopen(&mut self, now: DateTime<Utc>) -> Result<Status> {
        let previous_error = self.error.take();
        let retries = self.retry_count() + 1;
        let from = match self.transition(Status::Processing, None, now) {
            Ok(from) => from,
            Err(e) => {
                self.error = previous_error;
                return Err(e);
            }
        };
        if let Some(err) = previous_error {
            self.extra
                .insert("previousError".to_string(), serde_json::Value::String(err));
        }
        self.extra
            .insert("retryCount".to_string(), serde_json::Value::from(retries));
        Ok(from)
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// A working root grouping one day's identifiers and records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Batch {
    /// Directory name, e.g. `2025-07-29`.
    pub key: String,
    pub root: PathBuf,
}

impl Batch {
    pub fn new(key: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            root: root.into(),
        }
    }
}

impl std::fmt::Display for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_id_successor_does_not_wrap() {
        assert_eq!(ItemId(9).next(), Some(ItemId(10)));
        assert_eq!(ItemId(u32::MAX).next(), None);
    }

    #[test]
    fn item_id_pads_and_parses() {
        assert_eq!(ItemId(7).to_string(), "07");
        assert_eq!(ItemId(123).to_string(), "123");
        assert_eq!("07".parse::<ItemId>().unwrap(), ItemId(7));
        assert_eq!("7".parse::<ItemId>().unwrap(), ItemId(7));
        assert!("7a".parse::<ItemId>().is_err());
        assert!("".parse::<ItemId>().is_err());
        assert!(ItemId(9) < ItemId(10));
    }

    #[test]
    fn completed_cannot_go_back_to_processing() {
        assert!(!Status::Completed.can_transition_to(Status::Processing));
        assert!(Status::Failed.can_transition_to(Status::Processing));
        assert!(Status::Retrying.can_transition_to(Status::Failed));
    }

    #[test]
    fn reopen_moves_error_and_counts_retries() {
        let now = Utc::now();
        let mut record = WorkRecord::new("https://a.test/x", Status::Processing, now);
        record
            .transition(Status::Failed, Some("net::ERR_TIMED_OUT"), now)
            .unwrap();

        record.reopen(now).unwrap();
        assert_eq!(record.status, Status::Processing);
        assert_eq!(record.error, None);
        assert_eq!(record.retry_count(), 1);
        assert_eq!(
            record.extra.get("previousError").and_then(|v| v.as_str()),
            Some("net::ERR_TIMED_OUT")
        );

        record.transition(Status::Failed, Some("again"), now).unwrap();
        record.reopen(now).unwrap();
        assert_eq!(record.retry_count(), 2);
    }

    #[test]
    fn reopen_rejects_completed_and_keeps_error() {
        let now = Utc::now();
        let mut record = WorkRecord::new("https://a.test/x", Status::Completed, now);
        record.error = Some("kept".to_string());
        assert!(record.reopen(now).is_err());
        assert_eq!(record.error.as_deref(), Some("kept"));
        assert_eq!(record.status, Status::Completed);
    }
}

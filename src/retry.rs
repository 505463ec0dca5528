//! Retry list: URLs of failed items worth another processing pass.

use std::collections::HashSet;
use std::path::Path;

use tracing::{info, warn};

use crate::config::Layout;
use crate::dedup::normalize_url;
use crate::error::Result;
use crate::model::{Batch, Status};
use crate::store::{StateStore, write_atomic};

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Not-found / forbidden style failures. Not auto-recoverable.
    Permanent,
    /// Timeouts, resets, empty responses and anything unrecognized.
    Transient,
}

pub fn classify(layout: &Layout, reason: Option<&str>) -> FailureClass {
    match reason {
        Some(reason) if layout.is_permanent_failure(reason) => FailureClass::Permanent,
        _ => FailureClass::Transient,
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetryList {
    /// De-duplicated, in batch then identifier order.
    pub urls: Vec<String>,
    /// Failed records skipped as permanent failures.
    pub excluded_permanent: usize,
    /// Failed records skipped because the URL completed in some batch.
    pub excluded_completed: usize,
}

#[derive(Debug, Clone)]
pub struct RetryListBuilder {
    store: StateStore,
}

impl RetryListBuilder {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Collect retry-eligible URLs across `batches`. Unreadable batches are
    /// logged and skipped.
    pub fn build(&self, batches: &[Batch]) -> RetryList {
        let layout = self.store.layout();
        let sets: Vec<_> = batches
            .iter()
            .filter_map(|batch| match self.store.load(batch) {
                Ok(set) => Some(set),
                Err(e) => {
                    warn!(batch = %batch, error = %e, "skipping unreadable batch");
                    None
                }
            })
            .collect();

        let completed: HashSet<String> = sets
            .iter()
            .flat_map(|set| set.iter())
            .filter(|(_, record)| record.status == Status::Completed)
            .map(|(_, record)| normalize_url(&record.url))
            .collect();

        let mut list = RetryList::default();
        let mut seen = HashSet::new();
        for (_, record) in sets.iter().flat_map(|set| set.iter()) {
            if record.status != Status::Failed {
                continue;
            }
            let key = normalize_url(&record.url);
            if key.is_empty() {
                continue;
            }
            if classify(layout, record.error.as_deref()) == FailureClass::Permanent {
                list.excluded_permanent += 1;
                continue;
            }
            if completed.contains(&key) {
                list.excluded_completed += 1;
                continue;
            }
            if seen.insert(key) {
                list.urls.push(record.url.clone());
            }
        }

        info!(
            eligible = list.urls.len(),
            permanent = list.excluded_permanent,
            completed_elsewhere = list.excluded_completed,
            "built retry list"
        );
        list
    }
}

/// Write one URL per line, replacing the file atomically.
pub fn write_retry_list(path: &Path, urls: &[String]) -> Result<()> {
    let mut text = urls.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    write_atomic(path, text.as_bytes())
}

//! Coordinator: the single entry point tying workspace, lock, allocation,
//! records, repair, retry and duplicate handling together.

use std::path::{Path, PathBuf};

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{info, warn};

use crate::allocator::{Allocation, NumberAllocator};
use crate::config::Config;
use crate::dedup::{DedupReport, DuplicateResolver, normalize_url};
use crate::error::Result;
use crate::model::{Batch, ItemId, Status, WorkRecord};
use crate::reconcile::{ReconcileReport, ReconciliationScanner};
use crate::retry::{RetryList, RetryListBuilder, write_retry_list};
use crate::store::{RecordSet, StateStore, Transition};
use crate::telemetry::{batch as batch_span, metrics};
use crate::workspace::Workspace;

/// What `admit` did with a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A new identifier was allocated and a `processing` record created.
    Assigned(Allocation),
    /// The batch already tracked this URL; its record was put back into
    /// `processing`.
    Reused { id: ItemId, previous: Status },
    /// This URL is already completed, in the target batch or another one.
    /// Nothing changed; `batch` and `id` locate the completed record.
    AlreadyCompleted { batch: String, id: ItemId },
}

impl Admission {
    pub fn id(&self) -> ItemId {
        match self {
            Admission::Assigned(allocation) => allocation.id,
            Admission::Reused { id, .. } | Admission::AlreadyCompleted { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    config: Config,
    workspace: Workspace,
    store: StateStore,
    allocator: NumberAllocator,
    scanner: ReconciliationScanner,
    retry: RetryListBuilder,
    dedup: DuplicateResolver,
}

impl Coordinator {
    /// Fails with [`Error::Config`](crate::Error::Config) when the layout is invalid.
    pub fn new(config: Config) -> Result<Self> {
        config.layout.validate()?;
        let workspace = Workspace::new(config.content_root.clone(), config.layout.clone());
        let store = StateStore::new(config.layout.clone(), config.lock.clone());
        Ok(Self {
            allocator: NumberAllocator::new(store.clone()),
            scanner: ReconciliationScanner::new(store.clone(), config.stuck_threshold),
            retry: RetryListBuilder::new(store.clone()),
            dedup: DuplicateResolver::new(store.clone()),
            workspace,
            store,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn batch(&self, key: &str) -> Result<Batch> {
        self.workspace.batch(key)
    }

    /// Reserve the next identifier in `batch_key`.
    pub fn next_identifier(&self, batch_key: &str) -> Result<Allocation> {
        let batch = self.batch(batch_key)?;
        self.allocator.next_identifier(&batch)
    }

    /// Register `url` for processing in `batch_key`, allocating an identifier
    /// if the batch has not seen it. Lookup, allocation and the record write
    /// happen under one hold of the batch lock.
    ///
    /// A URL already completed in any other batch is not admitted again.
    pub fn admit(&self, batch_key: &str, url: &str) -> Result<Admission> {
        let batch = self.batch(batch_key)?;
        let span = batch_span::start_batch_span("admit", &batch);
        let _entered = span.enter();

        let admission = self.store.lock_for(&batch).with_lock(|guard| {
            let existing = self.store.load(&batch)?.find_by_url(url).map(|(id, r)| (id, r.status));

            if let Some((id, Status::Completed)) = existing {
                return Ok(Admission::AlreadyCompleted {
                    batch: batch.key.clone(),
                    id,
                });
            }
            if let Some((other, id)) = self.completed_elsewhere(&batch, url)? {
                return Ok(Admission::AlreadyCompleted { batch: other, id });
            }

            match existing {
                Some((id, previous)) => {
                    self.store.update_locked(guard, &batch, |set| {
                        if let Some(record) = set.get_mut(id) {
                            let now = Utc::now();
                            if record.status == Status::Skipped {
                                record.transition(Status::Pending, None, now)?;
                            }
                            record.reopen(now)?;
                        }
                        Ok(())
                    })?;
                    batch_span::record_status_transition(&span, id, previous, Status::Processing);
                    metrics::record_transitions().add(
                        1,
                        &[
                            KeyValue::new("from", previous.as_str()),
                            KeyValue::new("to", Status::Processing.as_str()),
                        ],
                    );
                    Ok(Admission::Reused { id, previous })
                }
                None => {
                    let allocation = self.allocator.reserve_locked(guard, &batch)?;
                    let id = allocation.id;
                    self.store.update_locked(guard, &batch, |set| {
                        set.insert(id, WorkRecord::new(url, Status::Processing, Utc::now()));
                        Ok(())
                    })?;
                    metrics::record_transitions().add(
                        1,
                        &[
                            KeyValue::new("from", "none"),
                            KeyValue::new("to", Status::Processing.as_str()),
                        ],
                    );
                    Ok(Admission::Assigned(allocation))
                }
            }
        })?;

        info!(batch = %batch, id = %admission.id(), url, outcome = ?admission, "admitted url");
        Ok(admission)
    }

    /// First other batch holding a `completed` record for `url`. Other
    /// batches are read without their locks; unreadable ones are skipped.
    fn completed_elsewhere(&self, target: &Batch, url: &str) -> Result<Option<(String, ItemId)>> {
        let wanted = normalize_url(url);
        if wanted.is_empty() {
            return Ok(None);
        }
        for batch in self.workspace.batches()? {
            if batch.key == target.key {
                continue;
            }
            let set = match self.store.load(&batch) {
                Ok(set) => set,
                Err(e) => {
                    warn!(batch = %batch, error = %e, "skipping unreadable batch during admission");
                    continue;
                }
            };
            let completed = set
                .iter()
                .filter(|(_, record)| record.status == Status::Completed)
                .find(|(_, record)| normalize_url(&record.url) == wanted)
                .map(|(id, _)| id);
            if let Some(id) = completed {
                return Ok(Some((batch.key, id)));
            }
        }
        Ok(None)
    }

    /// Record a status change for `id`; see [`StateStore::set_status`].
    pub fn record_status(
        &self,
        batch_key: &str,
        id: ItemId,
        status: Status,
        url: Option<&str>,
        reason: Option<&str>,
    ) -> Result<Transition> {
        let batch = self.batch(batch_key)?;
        self.store.set_status(&batch, id, status, url, reason)
    }

    /// Snapshot of a batch's records.
    pub fn records(&self, batch_key: &str) -> Result<RecordSet> {
        let batch = self.batch(batch_key)?;
        self.store.load(&batch)
    }

    pub fn reconcile(&self, batch_key: &str) -> Result<ReconcileReport> {
        let batch = self.batch(batch_key)?;
        Ok(self.scanner.reconcile_all(std::slice::from_ref(&batch)))
    }

    pub fn reconcile_all(&self) -> Result<ReconcileReport> {
        let batches = self.workspace.batches()?;
        Ok(self.scanner.reconcile_all(&batches))
    }

    pub fn build_retry_list(&self) -> Result<RetryList> {
        let batches = self.workspace.batches()?;
        Ok(self.retry.build(&batches))
    }

    /// Build the retry list and write it to `path`, or to the layout's
    /// default file under the content root.
    pub fn write_retry_list(&self, path: Option<&Path>) -> Result<(PathBuf, RetryList)> {
        let list = self.build_retry_list()?;
        let path = path.map(Path::to_path_buf).unwrap_or_else(|| {
            self.workspace
                .root()
                .join(&self.config.layout.retry_list_file)
        });
        write_retry_list(&path, &list.urls)?;
        info!(path = %path.display(), urls = list.urls.len(), "wrote retry list");
        Ok((path, list))
    }

    pub fn resolve_duplicates(&self, dry_run: bool) -> Result<DedupReport> {
        let batches = self.workspace.batches()?;
        Ok(self.dedup.resolve(&batches, dry_run))
    }
}

//! Cross-batch duplicate detection and removal.
//!
//! Two records are duplicates when their URLs normalize to the same string.
//! The record with the numerically smallest identifier is kept (lower batch
//! key on a tie); every other copy loses its record and artifacts. Removed
//! identifiers keep a placeholder so they are never allocated again.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use opentelemetry::KeyValue;
use tracing::{info, warn};

use crate::allocator::touch_placeholder;
use crate::error::{Error, Result};
use crate::model::{Batch, ItemId};
use crate::store::StateStore;
use crate::telemetry::{batch as batch_span, metrics};

/// Canonical form used to compare URLs: lower-cased, without scheme, leading
/// `www.`, fragment or trailing slashes. The query string is significant.
pub fn normalize_url(url: &str) -> String {
    let mut url = url.trim().to_lowercase();

    if let Some(hash) = url.find('#') {
        url.truncate(hash);
    }
    if let Some((scheme, rest)) = url.split_once("://")
        && !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    {
        url = rest.to_string();
    }
    if let Some(rest) = url.strip_prefix("www.") {
        url = rest.to_string();
    }
    url.trim_end_matches('/').to_string()
}

/// Where one copy of a URL lives.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location {
    pub batch: String,
    pub id: ItemId,
}

/// A duplicate selected for removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub url: String,
    pub removed: Location,
    pub kept: Location,
    /// Artifact files deleted. Empty on a dry run.
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Default)]
pub struct DedupReport {
    pub removals: Vec<Removal>,
    /// Copies whose artifacts could not all be cleared. Their records are
    /// kept so a later run finds them again.
    pub failed_removals: Vec<(Location, String)>,
    /// Batches that could not be read or modified, with the reason.
    pub failed_batches: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct DuplicateResolver {
    store: StateStore,
}

impl DuplicateResolver {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Find duplicates across `batches` and, unless `dry_run`, remove every
    /// copy but the kept one.
    pub fn resolve(&self, batches: &[Batch], dry_run: bool) -> DedupReport {
        let mut report = DedupReport::default();
        let planned = self.plan(batches, &mut report);

        if dry_run {
            report.removals = planned;
            return report;
        }

        let mut by_batch: BTreeMap<String, Vec<Removal>> = BTreeMap::new();
        for removal in planned {
            by_batch
                .entry(removal.removed.batch.clone())
                .or_default()
                .push(removal);
        }

        for batch in batches {
            let Some(pending) = by_batch.remove(&batch.key) else {
                continue;
            };
            match self.remove_in(batch, pending, &mut report.failed_removals) {
                Ok(mut done) => report.removals.append(&mut done),
                Err(e) => {
                    warn!(batch = %batch, error = %e, "duplicate removal failed for batch");
                    report.failed_batches.push((batch.key.clone(), e.to_string()));
                }
            }
        }

        info!(
            removed = report.removals.len(),
            failed = report.failed_removals.len(),
            "resolved duplicates"
        );
        report
    }

    /// Group every record by normalized URL and pick the copies to drop.
    fn plan(&self, batches: &[Batch], report: &mut DedupReport) -> Vec<Removal> {
        let mut groups: BTreeMap<String, Vec<(Location, String)>> = BTreeMap::new();
        for batch in batches {
            let set = match self.store.load(batch) {
                Ok(set) => set,
                Err(e) => {
                    warn!(batch = %batch, error = %e, "skipping unreadable batch");
                    report.failed_batches.push((batch.key.clone(), e.to_string()));
                    continue;
                }
            };
            for (id, record) in set.iter() {
                let key = normalize_url(&record.url);
                if key.is_empty() {
                    continue;
                }
                let location = Location {
                    batch: batch.key.clone(),
                    id,
                };
                groups
                    .entry(key)
                    .or_default()
                    .push((location, record.url.clone()));
            }
        }

        let mut removals = Vec::new();
        for copies in groups.into_values() {
            if copies.len() < 2 {
                continue;
            }
            let Some(kept) = copies
                .iter()
                .map(|(loc, _)| loc)
                .min_by(|a, b| (a.id, &a.batch).cmp(&(b.id, &b.batch)))
                .cloned()
            else {
                continue;
            };
            for (location, url) in copies {
                if location != kept {
                    removals.push(Removal {
                        url,
                        removed: location,
                        kept: kept.clone(),
                        files: Vec::new(),
                    });
                }
            }
        }
        removals.sort_by(|a, b| a.removed.cmp(&b.removed));
        removals
    }

    /// Delete the planned copies from one batch under its lock. A record that
    /// changed since planning is left alone. The placeholder is written and
    /// every artifact deleted before a record goes; a copy with any failure
    /// keeps its record and lands in `failed`.
    fn remove_in(
        &self,
        batch: &Batch,
        pending: Vec<Removal>,
        failed: &mut Vec<(Location, String)>,
    ) -> Result<Vec<Removal>> {
        let span = batch_span::start_batch_span("dedupe", batch);
        let _entered = span.enter();
        let layout = self.store.layout();

        self.store.lock_for(batch).with_lock(|guard| {
            let set = self.store.load(batch)?;
            let mut cleared = Vec::with_capacity(pending.len());
            for mut removal in pending {
                let id = removal.removed.id;
                let unchanged = set
                    .get(id)
                    .is_some_and(|r| normalize_url(&r.url) == normalize_url(&removal.url));
                if !unchanged {
                    warn!(batch = %batch, id = %id, "record changed since planning; not removed");
                    continue;
                }

                guard.verify()?;
                let outcome = touch_placeholder(layout, batch, id)
                    .map_err(Error::Io)
                    .and_then(|_| self.delete_artifacts(batch, id));
                match outcome {
                    Ok(files) => {
                        removal.files = files;
                        cleared.push(removal);
                    }
                    Err(e) => {
                        warn!(batch = %batch, id = %id, error = %e, "duplicate not removed; record kept");
                        failed.push((removal.removed, e.to_string()));
                    }
                }
            }

            if cleared.is_empty() {
                return Ok(cleared);
            }
            self.store.update_locked(guard, batch, |set| {
                for removal in &cleared {
                    set.remove(removal.removed.id);
                }
                Ok(())
            })?;

            for removal in &cleared {
                metrics::duplicates_removed().add(1, &[KeyValue::new("batch", batch.key.clone())]);
                info!(
                    batch = %batch,
                    id = %removal.removed.id,
                    kept_batch = %removal.kept.batch,
                    kept_id = %removal.kept.id,
                    files = removal.files.len(),
                    "removed duplicate"
                );
            }
            Ok(cleared)
        })
    }

    /// Remove every namespace output and image belonging to `id`. Every file
    /// is attempted; the first error is returned after the rest were tried.
    fn delete_artifacts(&self, batch: &Batch, id: ItemId) -> Result<Vec<PathBuf>> {
        let layout = self.store.layout();
        let mut first_error = None;

        let mut targets: Vec<PathBuf> = layout
            .namespaces
            .iter()
            .map(|ns| layout.output_path(&batch.root, ns, id))
            .collect();

        let images = batch.root.join(&layout.images_dir);
        match std::fs::read_dir(&images) {
            Ok(entries) => {
                for entry in entries {
                    match entry {
                        Ok(entry) => {
                            if layout.is_image_of(&entry.file_name().to_string_lossy(), id) {
                                targets.push(entry.path());
                            }
                        }
                        Err(e) => {
                            first_error.get_or_insert(Error::Io(e));
                        }
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                first_error.get_or_insert(Error::Io(e));
            }
        }

        let mut deleted = Vec::new();
        for path in targets {
            match remove_if_present(&path) {
                Ok(true) => deleted.push(path),
                Ok(false) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "could not delete artifact");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(deleted),
        }
    }
}

fn remove_if_present(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::Io(e)),
    }
}

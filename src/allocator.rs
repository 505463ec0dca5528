//! Identifier allocation.
//!
//! Under the batch lock: find the highest identifier already taken, add one,
//! and reserve the result with an empty placeholder file before the lock is
//! released. A placeholder counts as taken even if its owner crashed before
//! producing any output or record, so identifiers are never handed out twice.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use opentelemetry::KeyValue;
use tracing::{info, warn};

use crate::config::Layout;
use crate::error::{Error, Result};
use crate::lock::LockGuard;
use crate::model::{Batch, ItemId};
use crate::store::StateStore;
use crate::telemetry::metrics;

/// A freshly reserved identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub id: ItemId,
    pub placeholder: PlaceholderStatus,
}

impl Allocation {
    /// False when the placeholder could not be written. The identifier is
    /// still usable, but a concurrent allocator that does not see a record
    /// or output for it yet may compute the same value.
    pub fn is_reserved(&self) -> bool {
        matches!(self.placeholder, PlaceholderStatus::Written(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceholderStatus {
    Written(PathBuf),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct NumberAllocator {
    store: StateStore,
}

impl NumberAllocator {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    fn layout(&self) -> &Layout {
        self.store.layout()
    }

    /// Acquire the batch lock, reserve the next identifier, release.
    ///
    /// Fails with [`Error::LockTimeout`] when the lock cannot be taken.
    pub fn next_identifier(&self, batch: &Batch) -> Result<Allocation> {
        self.store
            .lock_for(batch)
            .with_lock(|guard| self.reserve_locked(guard, batch))
    }

    /// Reserve the next identifier while the caller holds the batch lock.
    ///
    /// Fails with [`Error::IdentifiersExhausted`] when `u32::MAX` is taken.
    pub fn reserve_locked(&self, guard: &LockGuard, batch: &Batch) -> Result<Allocation> {
        self.layout().validate()?;
        let next = match self.highest_taken(batch)? {
            Some(highest) => highest
                .next()
                .ok_or_else(|| Error::IdentifiersExhausted(batch.key.clone()))?,
            None => ItemId(1),
        };

        // Scanning may have been slow; do not reserve on an expired lease.
        guard.verify()?;

        let placeholder = self.write_placeholder(batch, next);
        let label = match &placeholder {
            PlaceholderStatus::Written(path) => {
                info!(batch = %batch, id = %next, placeholder = %path.display(), "identifier allocated");
                "written"
            }
            PlaceholderStatus::Failed(reason) => {
                warn!(
                    batch = %batch,
                    id = %next,
                    reason,
                    "identifier allocated but placeholder write failed; duplicate allocation possible"
                );
                "failed"
            }
        };
        metrics::ids_allocated().add(1, &[KeyValue::new("placeholder", label)]);

        Ok(Allocation {
            id: next,
            placeholder,
        })
    }

    /// Highest identifier visible in any output namespace, placeholder or
    /// record of the batch. Missing directories contribute nothing.
    pub fn highest_taken(&self, batch: &Batch) -> Result<Option<ItemId>> {
        let layout = self.layout();
        let mut highest: Option<ItemId> = None;

        for (index, ns) in layout.namespaces.iter().enumerate() {
            let mut extensions = vec![ns.extension.as_str()];
            if index == 0 {
                extensions.push(layout.placeholder_extension.as_str());
            }
            let found = scan_dir(layout, &batch.root.join(&ns.dir), &extensions)?;
            highest = highest.max(found);
        }

        let records = self.store.load(batch)?;
        Ok(highest.max(records.max_id()))
    }

    fn write_placeholder(&self, batch: &Batch, id: ItemId) -> PlaceholderStatus {
        match touch_placeholder(self.layout(), batch, id) {
            Ok(path) => PlaceholderStatus::Written(path),
            Err(e) => PlaceholderStatus::Failed(e.to_string()),
        }
    }
}

/// Create the empty placeholder for `id`, and the primary namespace if needed.
pub(crate) fn touch_placeholder(
    layout: &Layout,
    batch: &Batch,
    id: ItemId,
) -> std::io::Result<PathBuf> {
    let path = layout.placeholder_path(&batch.root, id).ok_or_else(|| {
        std::io::Error::new(ErrorKind::InvalidInput, "layout has no output namespace")
    })?;
    let created = path
        .parent()
        .map_or(Ok(()), std::fs::create_dir_all)
        .and_then(|()| {
            OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .map(drop)
        });
    match created {
        Ok(()) => Ok(path),
        Err(e) => Err(std::io::Error::new(e.kind(), format!("{}: {e}", path.display()))),
    }
}

fn scan_dir(layout: &Layout, dir: &Path, extensions: &[&str]) -> Result<Option<ItemId>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    };

    let mut highest = None;
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let found = extensions
            .iter()
            .filter_map(|ext| layout.parse_file_name(&name, ext))
            .max();
        highest = highest.max(found);
    }
    Ok(highest)
}

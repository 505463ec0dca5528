//! Per-batch record file.
//!
//! One JSON object per batch, keyed by zero-padded identifier. Each value is
//! either a bare URL string (older writers; implicitly completed) or a
//! structured record. Every mutation is a full read-modify-write of the file,
//! performed under the batch's allocation lock and committed with an atomic
//! rename.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde_json::{Map, Value};
use tracing::warn;

use crate::config::Layout;
use crate::dedup::normalize_url;
use crate::error::{Error, Result};
use crate::lock::{LockGuard, LockManager, LockOptions};
use crate::model::{Batch, ItemId, Status, WorkRecord};
use crate::telemetry::{batch as batch_span, metrics};

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

// ---------------------------------------------------------------------------
// Record set
// ---------------------------------------------------------------------------

/// All records of one batch, in identifier order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSet {
    records: BTreeMap<ItemId, WorkRecord>,
    /// Entries that are not records (non-numeric keys, odd values), written
    /// back untouched.
    foreign: Map<String, Value>,
}

impl RecordSet {
    pub fn get(&self, id: ItemId) -> Option<&WorkRecord> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: ItemId) -> Option<&mut WorkRecord> {
        self.records.get_mut(&id)
    }

    pub fn insert(&mut self, id: ItemId, record: WorkRecord) -> Option<WorkRecord> {
        self.records.insert(id, record)
    }

    pub fn remove(&mut self, id: ItemId) -> Option<WorkRecord> {
        self.records.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ItemId, &WorkRecord)> {
        self.records.iter().map(|(id, record)| (*id, record))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ItemId, &mut WorkRecord)> {
        self.records.iter_mut().map(|(id, record)| (*id, record))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn max_id(&self) -> Option<ItemId> {
        self.records.keys().next_back().copied()
    }

    /// First record whose URL normalizes to the same string as `url`.
    pub fn find_by_url(&self, url: &str) -> Option<(ItemId, &WorkRecord)> {
        let wanted = normalize_url(url);
        if wanted.is_empty() {
            return None;
        }
        self.iter().find(|(_, record)| normalize_url(&record.url) == wanted)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Outcome of a status update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub id: ItemId,
    /// `None` when the update created the record.
    pub from: Option<Status>,
    pub to: Status,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    layout: Layout,
    lock: LockOptions,
}

impl StateStore {
    pub fn new(layout: Layout, lock: LockOptions) -> Self {
        Self { layout, lock }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// The lock guarding this batch's allocation and record file.
    pub fn lock_for(&self, batch: &Batch) -> LockManager {
        LockManager::new(self.layout.lock_path(&batch.root), self.lock.clone())
    }

    /// Read the batch's records. A missing or empty file is an empty set.
    ///
    /// This is a snapshot: without the lock it may be stale by the time the
    /// caller looks at it.
    pub fn load(&self, batch: &Batch) -> Result<RecordSet> {
        let path = self.layout.state_path(&batch.root);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(RecordSet::default()),
            Err(e) => return Err(Error::Io(e)),
        };
        if text.trim().is_empty() {
            return Ok(RecordSet::default());
        }
        parse_records(batch, &text)
    }

    /// Replace the batch's record file. Requires the batch lock.
    pub fn save(&self, guard: &LockGuard, batch: &Batch, set: &RecordSet) -> Result<()> {
        debug_assert_eq!(guard.path(), self.layout.lock_path(&batch.root));
        guard.verify()?;
        let text = render_records(set)?;
        write_atomic(&self.layout.state_path(&batch.root), text.as_bytes())
    }

    /// Read-modify-write under the batch lock. The file is only rewritten
    /// when `f` actually changed something.
    pub fn update<T, F>(&self, batch: &Batch, f: F) -> Result<T>
    where
        F: FnOnce(&mut RecordSet) -> Result<T>,
    {
        self.lock_for(batch)
            .with_lock(|guard| self.update_locked(guard, batch, f))
    }

    /// Same as [`StateStore::update`] for a caller already holding the lock.
    pub fn update_locked<T, F>(&self, guard: &LockGuard, batch: &Batch, f: F) -> Result<T>
    where
        F: FnOnce(&mut RecordSet) -> Result<T>,
    {
        let mut set = self.load(batch)?;
        let before = set.clone();
        let out = f(&mut set)?;
        if set != before {
            self.save(guard, batch, &set)?;
        }
        Ok(out)
    }

    /// Record a new status for `id`.
    ///
    /// A missing record is created, which requires `url`. An existing record
    /// keeps its URL; passing a different one is an error since identifiers
    /// are never rebound. `reason` is stored for `failed` and `skipped`.
    pub fn set_status(
        &self,
        batch: &Batch,
        id: ItemId,
        status: Status,
        url: Option<&str>,
        reason: Option<&str>,
    ) -> Result<Transition> {
        let span = batch_span::start_batch_span("set_status", batch);
        let _entered = span.enter();

        if status == Status::Completed && !self.has_output(batch, id) {
            warn!(batch = %batch, id = %id, "marked completed but primary output is missing");
        }

        let transition = self.update(batch, |set| {
            apply_status(set, id, status, url, reason, Utc::now())
        })?;

        if let Some(from) = transition.from {
            batch_span::record_status_transition(&span, id, from, status);
        }
        metrics::record_transitions().add(
            1,
            &[
                KeyValue::new(
                    "from",
                    transition.from.map(Status::as_str).unwrap_or("none"),
                ),
                KeyValue::new("to", status.as_str()),
            ],
        );
        Ok(transition)
    }

    /// Whether the primary output artifact for `id` exists.
    pub fn has_output(&self, batch: &Batch, id: ItemId) -> bool {
        self.layout
            .primary()
            .is_some_and(|ns| self.layout.output_path(&batch.root, ns, id).is_file())
    }
}

pub(crate) fn apply_status(
    set: &mut RecordSet,
    id: ItemId,
    status: Status,
    url: Option<&str>,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Transition> {
    match set.get_mut(id) {
        Some(record) => {
            if let Some(url) = url
                && normalize_url(url) != normalize_url(&record.url)
            {
                return Err(Error::Other(format!(
                    "identifier {id} is bound to {}, not {url}",
                    record.url
                )));
            }
            let from = record.transition(status, reason, now)?;
            Ok(Transition {
                id,
                from: Some(from),
                to: status,
            })
        }
        None => {
            let url = url.ok_or_else(|| Error::NotFound(format!("record {id}")))?;
            let mut record = WorkRecord::new(url, status, now);
            if matches!(status, Status::Failed | Status::Skipped) {
                record.error = reason.map(str::to_string);
            }
            set.insert(id, record);
            Ok(Transition {
                id,
                from: None,
                to: status,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

fn parse_records(batch: &Batch, text: &str) -> Result<RecordSet> {
    let raw: Map<String, Value> = serde_json::from_str(text)?;
    let mut set = RecordSet::default();

    for (key, value) in raw {
        let Ok(id) = key.parse::<ItemId>() else {
            warn!(batch = %batch, key, "record key is not an identifier, keeping as-is");
            set.foreign.insert(key, value);
            continue;
        };

        let record = match value {
            Value::String(url) => WorkRecord::legacy(url),
            Value::Object(map) => record_from_object(batch, &key, map),
            other => {
                warn!(batch = %batch, key, "record is neither a URL nor an object, keeping as-is");
                set.foreign.insert(key, other);
                continue;
            }
        };

        // "7" and "07" name the same identifier. Prefer the structured one.
        match set.records.get(&id) {
            Some(existing) if !existing.is_legacy() || record.is_legacy() => {
                warn!(batch = %batch, key, "duplicate identifier key, keeping the first");
                set.foreign.insert(key, record_to_value(&record)?);
            }
            Some(_) => {
                warn!(batch = %batch, key, "duplicate identifier key, keeping the structured one");
                if let Some(previous) = set.records.insert(id, record) {
                    set.foreign
                        .insert(format!("{}", id.0), record_to_value(&previous)?);
                }
            }
            None => {
                set.records.insert(id, record);
            }
        }
    }

    Ok(set)
}

fn record_from_object(batch: &Batch, key: &str, mut map: Map<String, Value>) -> WorkRecord {
    let url = take_string(&mut map, "url").unwrap_or_else(|| {
        warn!(batch = %batch, key, "record has no url");
        String::new()
    });

    let status = match take_string(&mut map, "status") {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(batch = %batch, key, status = raw, "unrecognized status, treating as pending");
            map.insert("unrecognizedStatus".to_string(), Value::String(raw));
            Status::Pending
        }),
        None => Status::Pending,
    };

    let assigned_at = match take_timestamp(batch, key, &mut map, "assignedAt") {
        Some(at) => Some(at),
        None => take_timestamp(batch, key, &mut map, "timestamp"),
    };
    let completed_at = take_timestamp(batch, key, &mut map, "completedAt");
    let failed_at = take_timestamp(batch, key, &mut map, "failedAt");
    let error = take_string(&mut map, "error");

    WorkRecord {
        url,
        status,
        assigned_at,
        completed_at,
        failed_at,
        error,
        extra: map,
        legacy: false,
    }
}

/// Remove `field` and return it as text. Non-string values are stringified
/// so the field never appears twice on save.
fn take_string(map: &mut Map<String, Value>, field: &str) -> Option<String> {
    match map.remove(field)? {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn take_timestamp(
    batch: &Batch,
    key: &str,
    map: &mut Map<String, Value>,
    field: &str,
) -> Option<DateTime<Utc>> {
    let raw = take_string(map, field)?;
    match DateTime::parse_from_rfc3339(&raw) {
        Ok(at) => Some(at.with_timezone(&Utc)),
        Err(_) => {
            warn!(batch = %batch, key, field, value = raw, "unparsable timestamp dropped");
            None
        }
    }
}

fn record_to_value(record: &WorkRecord) -> Result<Value> {
    if record.is_legacy() {
        Ok(Value::String(record.url.clone()))
    } else {
        Ok(serde_json::to_value(record)?)
    }
}

fn render_records(set: &RecordSet) -> Result<String> {
    let mut out = Map::new();
    for (id, record) in &set.records {
        out.insert(id.to_string(), record_to_value(record)?);
    }
    for (key, value) in &set.foreign {
        out.entry(key.clone()).or_insert_with(|| value.clone());
    }
    let mut text = serde_json::to_string_pretty(&Value::Object(out))?;
    text.push('\n');
    Ok(text)
}

/// Write `bytes` to a sibling temp file and rename it over `path`, so readers
/// see either the old or the new content.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(
        "{file_name}.tmp.{}.{}",
        std::process::id(),
        TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));

    if let Err(e) = std::fs::write(&temp, bytes) {
        let _ = std::fs::remove_file(&temp);
        return Err(Error::Io(e));
    }
    if let Err(e) = std::fs::rename(&temp, path) {
        let _ = std::fs::remove_file(&temp);
        return Err(Error::Io(e));
    }
    Ok(())
}

//! Content root: one subdirectory per batch, named by calendar day.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate};

use crate::config::Layout;
use crate::error::{Error, Result};
use crate::model::Batch;

const BATCH_KEY_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    layout: Layout,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>, layout: Layout) -> Self {
        Self {
            root: root.into(),
            layout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// The batch for `key`. The directory need not exist yet; it is created
    /// on first allocation.
    pub fn batch(&self, key: &str) -> Result<Batch> {
        let valid = !key.is_empty()
            && key != "."
            && key != ".."
            && !key.contains(['/', '\\']);
        if !valid {
            return Err(Error::Other(format!("invalid batch key: {key:?}")));
        }
        Ok(Batch::new(key, self.root.join(key)))
    }

    /// The batch for the current local day.
    pub fn today(&self) -> Batch {
        let key = Local::now().format(BATCH_KEY_FORMAT).to_string();
        Batch::new(key.clone(), self.root.join(key))
    }

    /// Every existing batch directory, oldest first. A missing content root
    /// simply has no batches.
    pub fn batches(&self) -> Result<Vec<Batch>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut batches = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_batch_key(&name) {
                batches.push(Batch::new(name, entry.path()));
            }
        }
        batches.sort();
        Ok(batches)
    }
}

/// `YYYY-MM-DD` naming a real calendar day.
pub fn is_batch_key(name: &str) -> bool {
    name.len() == 10 && NaiveDate::parse_from_str(name, BATCH_KEY_FORMAT).is_ok()
}

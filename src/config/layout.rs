//! On-disk artifact layout of a batch directory.
//!
//! Every batch shares the same shape: a record file, a lock marker, one or
//! more output namespaces holding `<prefix><id>.<ext>` files, and an image
//! directory. Defaults describe the stock tree; a TOML file can override any
//! field for trees produced by other writers.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::ItemId;

/// One physical location for completed artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Namespace {
    /// Subdirectory of the batch root.
    pub dir: String,
    /// Extension of real output files, without the dot.
    pub extension: String,
}

impl Namespace {
    pub fn new(dir: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Layout {
    pub state_file: String,
    pub lock_file: String,
    pub file_prefix: String,
    pub placeholder_extension: String,
    pub images_dir: String,
    pub retry_list_file: String,
    /// Case-insensitive substrings marking a failure reason as permanent.
    pub permanent_failure_markers: Vec<String>,
    /// Output namespaces. The first one is primary: placeholders live there
    /// and its output is what counts as "completed".
    pub namespaces: Vec<Namespace>,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            state_file: "records.json".to_string(),
            lock_file: ".allocation.lock".to_string(),
            file_prefix: "article_".to_string(),
            placeholder_extension: "tmp".to_string(),
            images_dir: "images".to_string(),
            retry_list_file: "retry_urls.txt".to_string(),
            permanent_failure_markers: ["404", "403", "not found", "forbidden"]
                .into_iter()
                .map(String::from)
                .collect(),
            namespaces: vec![Namespace::new("ready", "md"), Namespace::new("rendered", "html")],
        }
    }
}

impl Layout {
    /// Load a layout from a TOML file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read layout file {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad layout file {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let layout: Layout = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        layout.validate()?;
        Ok(layout)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespaces.is_empty() {
            return Err(Error::Config("layout needs at least one namespace".into()));
        }
        if self.file_prefix.is_empty() {
            return Err(Error::Config("file_prefix must not be empty".into()));
        }
        if self
            .namespaces
            .iter()
            .any(|ns| ns.extension == self.placeholder_extension)
        {
            return Err(Error::Config(format!(
                "placeholder extension {:?} collides with an output extension",
                self.placeholder_extension
            )));
        }
        Ok(())
    }

    /// The namespace placeholders are written to. `None` only for a layout
    /// that fails [`Layout::validate`].
    pub fn primary(&self) -> Option<&Namespace> {
        self.namespaces.first()
    }

    pub fn output_name(&self, ns: &Namespace, id: ItemId) -> String {
        format!("{}{id}.{}", self.file_prefix, ns.extension)
    }

    pub fn placeholder_name(&self, id: ItemId) -> String {
        format!("{}{id}.{}", self.file_prefix, self.placeholder_extension)
    }

    pub fn output_path(&self, batch_root: &Path, ns: &Namespace, id: ItemId) -> PathBuf {
        batch_root.join(&ns.dir).join(self.output_name(ns, id))
    }

    pub fn placeholder_path(&self, batch_root: &Path, id: ItemId) -> Option<PathBuf> {
        let primary = self.primary()?;
        Some(batch_root.join(&primary.dir).join(self.placeholder_name(id)))
    }

    pub fn state_path(&self, batch_root: &Path) -> PathBuf {
        batch_root.join(&self.state_file)
    }

    pub fn lock_path(&self, batch_root: &Path) -> PathBuf {
        batch_root.join(&self.lock_file)
    }

    /// Parse `<prefix><digits>.<extension>` and return the identifier.
    pub fn parse_file_name(&self, name: &str, extension: &str) -> Option<ItemId> {
        let stem = name
            .strip_prefix(&self.file_prefix)?
            .strip_suffix(extension)?
            .strip_suffix('.')?;
        stem.parse().ok()
    }

    /// Image files belonging to `id` carry `_<id>_` in their name.
    pub fn is_image_of(&self, name: &str, id: ItemId) -> bool {
        name.contains(&format!("_{id}_"))
    }

    pub fn is_permanent_failure(&self, reason: &str) -> bool {
        let reason = reason.to_lowercase();
        self.permanent_failure_markers
            .iter()
            .any(|marker| reason.contains(&marker.to_lowercase()))
    }
}

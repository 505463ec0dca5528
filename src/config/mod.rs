//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The artifact layout comes from an optional TOML file.

pub mod layout;

use std::path::PathBuf;
use std::time::Duration;

pub use layout::{Layout, Namespace};

use crate::error::{Error, Result};
use crate::lock::LockOptions;

/// How long a `processing` record may sit untouched before reconciliation
/// fails it. Unrelated to the lock lease.
pub const DEFAULT_STUCK_THRESHOLD: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding one subdirectory per batch.
    pub content_root: PathBuf,
    pub layout: Layout,
    pub lock: LockOptions,
    pub stuck_threshold: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Defaults for everything except the content root.
    pub fn new(content_root: impl Into<PathBuf>) -> Self {
        Self {
            content_root: content_root.into(),
            layout: Layout::default(),
            lock: LockOptions::default(),
            stuck_threshold: DEFAULT_STUCK_THRESHOLD,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let content_root = lookup("BATCHQ_CONTENT_ROOT").ok_or_else(|| {
            Error::Config("required environment variable BATCHQ_CONTENT_ROOT is not set".into())
        })?;

        let layout = match lookup("BATCHQ_LAYOUT") {
            Some(path) => Layout::load(path.as_ref())?,
            None => Layout::default(),
        };

        let defaults = LockOptions::default();
        let lock = LockOptions {
            lease: millis_var(&lookup, "BATCHQ_LOCK_LEASE_MS")?.unwrap_or(defaults.lease),
            max_retries: match number_var(&lookup, "BATCHQ_LOCK_RETRIES")? {
                Some(n) => u32::try_from(n)
                    .map_err(|_| Error::Config(format!("BATCHQ_LOCK_RETRIES={n} is too large")))?,
                None => defaults.max_retries,
            },
            backoff: millis_var(&lookup, "BATCHQ_LOCK_BACKOFF_MS")?.unwrap_or(defaults.backoff),
            holder: defaults.holder,
        };

        let stuck_threshold = number_var(&lookup, "BATCHQ_STUCK_THRESHOLD_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_STUCK_THRESHOLD);

        Ok(Self {
            content_root: PathBuf::from(content_root),
            layout,
            lock,
            stuck_threshold,
            otel_endpoint: lookup("OTEL_ENDPOINT"),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn number_var<F>(lookup: &F, name: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|e| Error::Config(format!("{name}={raw:?} is not a whole number: {e}")))
}

fn millis_var<F>(lookup: &F, name: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(number_var(lookup, name)?.map(Duration::from_millis))
}

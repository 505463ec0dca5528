//! Cross-process exclusive lock built on an atomically created marker file.
//!
//! The marker holds `"<holder>:<acquired-at-epoch-ms>"`. Creation uses
//! `create_new`, so exactly one process can create it. A marker older than
//! the lease is considered abandoned and may be reclaimed by the next
//! acquirer; its creator must not assume it still holds the lock.
//!
//! Holding the lock is represented by a [`LockGuard`]. Dropping the guard
//! releases the lock on every exit path.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::telemetry::metrics;

pub const DEFAULT_LEASE: Duration = Duration::from_millis(5000);
pub const DEFAULT_MAX_RETRIES: u32 = 10;
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(100);

static TOMBSTONE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Tuning for lock acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// Age after which a marker is no longer authoritative.
    pub lease: Duration,
    /// Creation attempts before giving up with [`Error::LockTimeout`].
    pub max_retries: u32,
    /// Fixed sleep between attempts.
    pub backoff: Duration,
    /// Identity written into the marker. Defaults to the process id.
    pub holder: String,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lease: DEFAULT_LEASE,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: DEFAULT_BACKOFF,
            holder: std::process::id().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Marker
// ---------------------------------------------------------------------------

/// Parsed content of a lock marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockMarker {
    pub holder: String,
    pub acquired_at_ms: i64,
}

impl LockMarker {
    fn now(holder: &str) -> Self {
        Self {
            holder: holder.to_string(),
            acquired_at_ms: now_ms(),
        }
    }

    /// Parse `"<holder>:<epoch-ms>"`. The holder may itself contain colons.
    pub fn parse(content: &str) -> Option<Self> {
        let (holder, ms) = content.trim().rsplit_once(':')?;
        Some(Self {
            holder: holder.to_string(),
            acquired_at_ms: ms.parse().ok()?,
        })
    }

    pub fn render(&self) -> String {
        format!("{}:{}", self.holder, self.acquired_at_ms)
    }

    /// Age relative to now. A timestamp in the future counts as brand new.
    pub fn age(&self) -> Duration {
        let elapsed = now_ms().saturating_sub(self.acquired_at_ms);
        Duration::from_millis(u64::try_from(elapsed).unwrap_or(0))
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// What an observer sees when looking at the marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    /// No marker.
    Free,
    /// A marker within its lease.
    Held { holder: String, age: Duration },
    /// A marker past its lease, eligible for reclamation.
    Stale {
        holder: String,
        age: Duration,
        content: String,
    },
    /// The marker exists but could not be read or dated.
    Unknown,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Acquires and inspects the lock marker at one path.
#[derive(Debug, Clone)]
pub struct LockManager {
    path: PathBuf,
    options: LockOptions,
}

impl LockManager {
    pub fn new(path: impl Into<PathBuf>, options: LockOptions) -> Self {
        Self {
            path: path.into(),
            options,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Acquire with the configured retry budget.
    pub fn acquire(&self) -> Result<LockGuard> {
        self.acquire_with_retries(self.options.max_retries)
    }

    /// Try to create the marker up to `max_retries` times, sleeping the fixed
    /// backoff between attempts.
    ///
    /// Reclaiming a stale marker retries immediately without spending an
    /// attempt. Reclaims are capped at `max_retries` as well so a marker that
    /// keeps reappearing stale cannot spin forever.
    pub fn acquire_with_retries(&self, max_retries: u32) -> Result<LockGuard> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let started = Instant::now();
        let max_retries = max_retries.max(1);
        let mut attempts = 0u32;
        let mut reclaims = 0u32;

        loop {
            let marker = LockMarker::now(&self.options.holder);
            match create_marker(&self.path, &marker) {
                Ok(()) => {
                    let contended = attempts > 0 || reclaims > 0;
                    metrics::lock_acquisitions()
                        .add(1, &[KeyValue::new("contended", contended.to_string())]);
                    metrics::lock_wait_ms().record(started.elapsed().as_secs_f64() * 1000.0, &[]);
                    debug!(path = %self.path.display(), attempts, reclaims, "lock acquired");
                    return Ok(LockGuard {
                        path: self.path.clone(),
                        token: marker.render(),
                        lease: self.options.lease,
                        acquired: Instant::now(),
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(Error::Io(e)),
            }

            match self.inspect() {
                LockState::Stale {
                    holder,
                    age,
                    content,
                } if reclaims < max_retries => {
                    reclaims += 1;
                    if self.reclaim(&content)? {
                        warn!(
                            path = %self.path.display(),
                            holder,
                            age_ms = age.as_millis() as u64,
                            "reclaimed stale lock"
                        );
                        metrics::stale_locks_reclaimed().add(1, &[]);
                    }
                    continue;
                }
                LockState::Free if reclaims < max_retries => {
                    // Released between our create and our read.
                    reclaims += 1;
                    continue;
                }
                state => {
                    debug!(path = %self.path.display(), ?state, attempt = attempts + 1, "lock busy");
                }
            }

            attempts += 1;
            if attempts >= max_retries {
                metrics::lock_timeouts().add(1, &[]);
                warn!(path = %self.path.display(), attempts, "gave up waiting for lock");
                return Err(Error::LockTimeout {
                    path: self.path.clone(),
                    attempts,
                });
            }
            std::thread::sleep(self.options.backoff);
        }
    }

    /// Run `f` while holding the lock. The lock is released however `f` exits.
    pub fn with_lock<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&LockGuard) -> Result<T>,
    {
        let guard = self.acquire()?;
        let result = f(&guard);
        guard.release();
        result
    }

    /// Look at the marker without touching it.
    pub fn inspect(&self) -> LockState {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return LockState::Free,
            Err(_) => return LockState::Unknown,
        };

        let (holder, age) = match LockMarker::parse(&content) {
            Some(marker) => {
                let age = marker.age();
                (marker.holder, age)
            }
            // Content not written yet, or garbage left by a crash: date it
            // by modification time instead.
            None => match modified_age(&self.path) {
                Some(age) => (String::new(), age),
                None => return LockState::Unknown,
            },
        };

        if age > self.options.lease {
            LockState::Stale {
                holder,
                age,
                content,
            }
        } else {
            LockState::Held { holder, age }
        }
    }

    /// Remove a stale marker, but only the one we looked at.
    ///
    /// The marker is first renamed aside so that the content check and the
    /// removal apply to the same file. If it turns out another acquirer had
    /// already replaced it, the fresh marker is linked back into place. That
    /// restore fails if a third acquirer filled the gap; see
    /// [`LockGuard::verify`].
    fn reclaim(&self, observed: &str) -> Result<bool> {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tombstone = self.path.with_file_name(format!(
            "{file_name}.stale.{}.{}",
            std::process::id(),
            TOMBSTONE_SEQ.fetch_add(1, Ordering::Relaxed)
        ));

        match fs::rename(&self.path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::Io(e)),
        }

        let moved = fs::read_to_string(&tombstone).unwrap_or_default();
        if moved == observed {
            remove_if_present(&tombstone)?;
            return Ok(true);
        }

        match fs::hard_link(&tombstone, &self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                warn!(path = %self.path.display(), "live lock displaced during reclaim");
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "could not restore live lock");
            }
        }
        remove_if_present(&tombstone)?;
        Ok(false)
    }
}

fn create_marker(path: &Path, marker: &LockMarker) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    if let Err(e) = file.write_all(marker.render().as_bytes()) {
        drop(file);
        let _ = fs::remove_file(path);
        return Err(e);
    }
    Ok(())
}

fn modified_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(modified.elapsed().unwrap_or_default())
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// Proof of holding the lock. Functions that must run under the lock take
/// `&LockGuard`.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    token: String,
    lease: Duration,
    acquired: Instant,
    released: bool,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Held longer than the lease; another process may have taken over.
    pub fn is_expired(&self) -> bool {
        self.acquired.elapsed() > self.lease
    }

    /// Confirm the marker on disk is still ours and within its lease.
    ///
    /// Holding a guard is not proof of exclusion on its own. A reclaimer that
    /// read a stale marker renames whatever is at the path aside before
    /// checking it; if that was a live marker, a third acquirer can create a
    /// new one in the gap before it is linked back. The displaced holder only
    /// learns this here, so call `verify` immediately before every write.
    pub fn verify(&self) -> Result<()> {
        if self.is_expired() {
            return Err(Error::LockLost {
                path: self.path.clone(),
            });
        }
        match fs::read_to_string(&self.path) {
            Ok(content) if content == self.token => Ok(()),
            Ok(_) => Err(Error::LockLost {
                path: self.path.clone(),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::LockLost {
                path: self.path.clone(),
            }),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Release the lock. Equivalent to dropping the guard.
    pub fn release(mut self) {
        self.release_inner();
    }

    /// Deletes the marker if it is still ours. A missing marker is fine;
    /// a marker written by someone else is left alone.
    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        match fs::read_to_string(&self.path) {
            Ok(content) if content == self.token => {
                if let Err(e) = remove_if_present(&self.path) {
                    warn!(path = %self.path.display(), error = %e, "failed to remove lock marker");
                }
            }
            Ok(_) => {
                warn!(
                    path = %self.path.display(),
                    "lock was reclaimed by another holder before release"
                );
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "lock marker already gone at release");
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "could not read lock marker at release");
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

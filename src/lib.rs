//! # batchq
//!
//! Filesystem-coordinated work tracking for batch content pipelines.
//!
//! Several independent worker processes share one content root without a
//! database or server. Each batch directory carries a lock file, a JSON
//! record file and per-item artifacts named by a sequential identifier.
//! This crate provides the lease-based lock, identifier allocation, the
//! record store and the repair, retry and de-duplication passes over it.

pub mod allocator;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod error;
pub mod lock;
pub mod model;
pub mod reconcile;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod workspace;

pub use coordinator::{Admission, Coordinator};
pub use error::{Error, Result};

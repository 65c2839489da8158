//! flowtime-core - Core library for Flowtime
//!
//! This crate contains the shared models, the SQLite persistence layer, the
//! local timestamp ledger, and the UI-facing local stores used by all
//! Flowtime interfaces. Everything network-facing lives in `flowtime-sync`.

pub mod db;
pub mod error;
pub mod ledger;
pub mod models;
pub mod store;

pub use error::{Error, Result};
pub use ledger::TimestampLedger;
pub use models::{Preset, Session, Syncable, Task, UserId, UserSettings};

/// Current wall-clock time as unix milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

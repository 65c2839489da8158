//! flowtime-sync - Sync engines for Flowtime
//!
//! Everything between the local stores in `flowtime-core` and the remote
//! backend: the durable sync queue, the REST remote client, the merge
//! strategies, and the four per-entity sync engines. Each engine pulls,
//! merges, applies, and then pushes local changes after a debounce window;
//! conflicts resolve by last-writer-wins against the local timestamp
//! ledger, so replicas converge regardless of which one merges first.

pub mod engine;
pub mod error;
pub mod queue;
pub mod remote;

pub use engine::presets::{merge_presets, PresetDriver, PresetEngine};
pub use engine::sessions::{merge_sessions, SessionDriver, SessionEngine};
pub use engine::settings::{merge_settings, SettingsEngine, SettingsMergeOutcome};
pub use engine::tasks::{merge_tasks, TaskDriver, TaskEngine};
pub use engine::{EngineConfig, EngineDriver, EngineState, MergeOutcome, SyncEngine, SyncState};
pub use error::{SyncError, SyncResult};
pub use queue::SyncQueue;
pub use remote::{RemoteCollection, RemoteFilter, RemoteRow, RestRemote};

//! Data models for Flowtime

mod ids;
mod preset;
mod session;
mod settings;
mod task;

pub use ids::{PresetId, SessionId, TaskId, UserId};
pub use preset::Preset;
pub use session::Session;
pub use settings::{NotificationPrefs, SettingsPatch, ThemeMode, UserSettings};
pub use task::{RepeatRule, Task};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Common surface of every entity the sync layer moves between the local
/// store and the remote backend.
///
/// The string forms of the id and owner are what end up in SQLite columns,
/// ledger field keys, and remote filters, so they are exposed directly.
pub trait Syncable:
    Clone + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Entity kind tag used in SQLite rows and ledger field keys
    const KIND: &'static str;

    /// Whether a local hard delete leaves a tombstone behind
    const TOMBSTONED: bool;

    /// String form of the entity id
    fn id_str(&self) -> String;

    /// Owning user
    fn owner(&self) -> UserId;

    /// Last local modification time (unix ms)
    fn updated_at(&self) -> i64;

    /// Canonical whole-entity ledger field key (`kind/id`)
    fn field_key(&self) -> String {
        format!("{}/{}", Self::KIND, self.id_str())
    }
}

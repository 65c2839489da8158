//! Timer preset model

use serde::{Deserialize, Serialize};

use super::{PresetId, Syncable, UserId};
use crate::now_ms;

/// A saved timer configuration (duration plus look-and-feel).
///
/// Presets are hard-deleted; a tombstone marker keeps a stale remote copy
/// from resurrecting after deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    /// Unique identifier
    pub id: PresetId,
    /// Owning user
    pub owner: UserId,
    /// Display name; merged at field granularity, separately from the rest
    pub name: String,
    /// Timer duration in seconds
    pub duration_secs: u32,
    /// Completion sound
    #[serde(default)]
    pub sound_id: Option<String>,
    /// Visual theme
    #[serde(default)]
    pub theme: Option<String>,
    /// Ambient scene played while the timer runs
    #[serde(default)]
    pub ambiance: Option<String>,
    /// Position in the preset picker
    #[serde(default)]
    pub sort_order: i32,
    /// Creation timestamp (unix ms)
    pub created_at: i64,
    /// Last update timestamp (unix ms)
    pub updated_at: i64,
}

impl Preset {
    /// Create a new preset with the given name and duration
    #[must_use]
    pub fn new(owner: UserId, name: impl Into<String>, duration_secs: u32) -> Self {
        let now = now_ms();
        Self {
            id: PresetId::new(),
            owner,
            name: name.into(),
            duration_secs,
            sound_id: None,
            theme: None,
            ambiance: None,
            sort_order: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Bump the update timestamp to now
    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }
}

impl Syncable for Preset {
    const KIND: &'static str = "preset";
    const TOMBSTONED: bool = true;

    fn id_str(&self) -> String {
        self.id.as_str()
    }

    fn owner(&self) -> UserId {
        self.owner
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_new() {
        let preset = Preset::new(UserId::new(), "Deep Work", 90 * 60);
        assert_eq!(preset.name, "Deep Work");
        assert_eq!(preset.duration_secs, 5400);
        assert_eq!(preset.sort_order, 0);
    }
}

//! User settings model
//!
//! Settings are a per-user singleton merged at field granularity: every
//! scalar field has its own ledger key, and the goal-history map merges by
//! per-day union. `SettingsPatch` is the single mutation entry point the
//! stores use so a field change and its ledger stamp can never diverge.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Syncable, UserId};
use crate::error::{Error, Result};
use crate::now_ms;

/// Theme mode options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThemeMode {
    /// Light theme
    Light,
    /// Dark theme
    Dark,
    /// Follow system preference
    #[default]
    System,
}

/// Notification preferences.
///
/// An empty remote representation of this struct must never reset local
/// values; the settings merge treats `{}` the same as an absent field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NotificationPrefs {
    /// Notify when a session ends
    #[serde(default)]
    pub session_end: bool,
    /// Daily reminder to start focusing
    #[serde(default)]
    pub daily_reminder: bool,
    /// Reminder time of day (`HH:MM`), if enabled
    #[serde(default)]
    pub reminder_time: Option<String>,
}

/// Per-user application settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    /// Owning user; settings are a singleton per user
    pub owner: UserId,
    /// Display name shown in the app
    pub display_name: String,
    /// Theme mode
    pub theme: ThemeMode,
    /// Accent color token
    pub accent_color: String,
    /// Daily focus goal in minutes
    pub daily_goal_minutes: u32,
    /// Focused minutes per day (`YYYY-MM-DD` keys); merged by union
    #[serde(default)]
    pub goal_history: BTreeMap<String, u32>,
    /// Notification preferences
    #[serde(default)]
    pub notification_prefs: NotificationPrefs,
    /// Keep the screen awake while a timer runs
    pub keep_screen_awake: bool,
    /// Haptic feedback on timer events
    pub haptics_enabled: bool,
    /// Preset selected by default when starting a timer
    #[serde(default)]
    pub default_preset_id: Option<String>,
    /// Whether the week starts on Monday (false = Sunday)
    pub week_starts_monday: bool,
    /// Ambient sound volume, 0-100
    pub ambient_volume: u8,
    /// 24-hour clock display
    pub clock_24h: bool,
    /// Automatically start a break after a session
    pub auto_start_break: bool,
    /// Break duration in seconds
    pub break_duration_secs: u32,
    /// Whether onboarding has been completed
    pub onboarding_complete: bool,
    /// Last update timestamp (unix ms)
    pub updated_at: i64,
}

impl UserSettings {
    /// Scalar fields merged with field-level LWW. `goal_history` is absent
    /// on purpose: it merges by per-day union, not as one value.
    pub const FIELDS: [&'static str; 14] = [
        "display_name",
        "theme",
        "accent_color",
        "daily_goal_minutes",
        "notification_prefs",
        "keep_screen_awake",
        "haptics_enabled",
        "default_preset_id",
        "week_starts_monday",
        "ambient_volume",
        "clock_24h",
        "auto_start_break",
        "break_duration_secs",
        "onboarding_complete",
    ];

    /// Default settings for a fresh account
    #[must_use]
    pub fn new(owner: UserId) -> Self {
        Self {
            owner,
            display_name: String::new(),
            theme: ThemeMode::System,
            accent_color: "ember".to_string(),
            daily_goal_minutes: 120,
            goal_history: BTreeMap::new(),
            notification_prefs: NotificationPrefs::default(),
            keep_screen_awake: true,
            haptics_enabled: true,
            default_preset_id: None,
            week_starts_monday: true,
            ambient_volume: 60,
            clock_24h: false,
            auto_start_break: false,
            break_duration_secs: 300,
            onboarding_complete: false,
            updated_at: now_ms(),
        }
    }

    /// Current JSON value of a scalar field, `None` for unknown names
    #[must_use]
    pub fn field(&self, name: &str) -> Option<Value> {
        let value = match name {
            "display_name" => Value::from(self.display_name.clone()),
            "theme" => serde_json::to_value(self.theme).ok()?,
            "accent_color" => Value::from(self.accent_color.clone()),
            "daily_goal_minutes" => Value::from(self.daily_goal_minutes),
            "notification_prefs" => serde_json::to_value(&self.notification_prefs).ok()?,
            "keep_screen_awake" => Value::from(self.keep_screen_awake),
            "haptics_enabled" => Value::from(self.haptics_enabled),
            "default_preset_id" => serde_json::to_value(&self.default_preset_id).ok()?,
            "week_starts_monday" => Value::from(self.week_starts_monday),
            "ambient_volume" => Value::from(self.ambient_volume),
            "clock_24h" => Value::from(self.clock_24h),
            "auto_start_break" => Value::from(self.auto_start_break),
            "break_duration_secs" => Value::from(self.break_duration_secs),
            "onboarding_complete" => Value::from(self.onboarding_complete),
            _ => return None,
        };
        Some(value)
    }

    /// Overwrite a scalar field from a JSON value
    pub fn set_field(&mut self, name: &str, value: Value) -> Result<()> {
        match name {
            "display_name" => self.display_name = serde_json::from_value(value)?,
            "theme" => self.theme = serde_json::from_value(value)?,
            "accent_color" => self.accent_color = serde_json::from_value(value)?,
            "daily_goal_minutes" => self.daily_goal_minutes = serde_json::from_value(value)?,
            "notification_prefs" => self.notification_prefs = serde_json::from_value(value)?,
            "keep_screen_awake" => self.keep_screen_awake = serde_json::from_value(value)?,
            "haptics_enabled" => self.haptics_enabled = serde_json::from_value(value)?,
            "default_preset_id" => self.default_preset_id = serde_json::from_value(value)?,
            "week_starts_monday" => self.week_starts_monday = serde_json::from_value(value)?,
            "ambient_volume" => self.ambient_volume = serde_json::from_value(value)?,
            "clock_24h" => self.clock_24h = serde_json::from_value(value)?,
            "auto_start_break" => self.auto_start_break = serde_json::from_value(value)?,
            "break_duration_secs" => self.break_duration_secs = serde_json::from_value(value)?,
            "onboarding_complete" => self.onboarding_complete = serde_json::from_value(value)?,
            other => {
                return Err(Error::InvalidInput(format!(
                    "unknown settings field: {other}"
                )))
            }
        }
        Ok(())
    }

    /// Apply a patch, returning the ledger key suffixes of every field that
    /// actually changed (e.g. `display_name`, `goal_history/2026-08-30`).
    pub fn apply_patch(&mut self, patch: &SettingsPatch) -> Vec<String> {
        let mut stamped = Vec::new();
        for field in Self::FIELDS {
            let Some(new_value) = patch.field(field) else {
                continue;
            };
            if self.field(field).as_ref() != Some(&new_value) {
                // Values come straight out of the patch, so they decode.
                if self.set_field(field, new_value).is_ok() {
                    stamped.push(field.to_string());
                }
            }
        }
        for (day, minutes) in &patch.goal_history {
            if self.goal_history.get(day) != Some(minutes) {
                self.goal_history.insert(day.clone(), *minutes);
                stamped.push(format!("goal_history/{day}"));
            }
        }
        for day in &patch.goal_history_remove {
            if self.goal_history.remove(day).is_some() {
                stamped.push(format!("goal_history/{day}"));
            }
        }
        if !stamped.is_empty() {
            self.updated_at = now_ms();
        }
        stamped
    }
}

impl Syncable for UserSettings {
    const KIND: &'static str = "settings";
    const TOMBSTONED: bool = false;

    fn id_str(&self) -> String {
        self.owner.as_str()
    }

    fn owner(&self) -> UserId {
        self.owner
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }
}

/// A partial settings update; `None` fields are left untouched
#[derive(Debug, Clone, Default)]
pub struct SettingsPatch {
    pub display_name: Option<String>,
    pub theme: Option<ThemeMode>,
    pub accent_color: Option<String>,
    pub daily_goal_minutes: Option<u32>,
    pub notification_prefs: Option<NotificationPrefs>,
    pub keep_screen_awake: Option<bool>,
    pub haptics_enabled: Option<bool>,
    /// `Some(None)` clears the default preset
    pub default_preset_id: Option<Option<String>>,
    pub week_starts_monday: Option<bool>,
    pub ambient_volume: Option<u8>,
    pub clock_24h: Option<bool>,
    pub auto_start_break: Option<bool>,
    pub break_duration_secs: Option<u32>,
    pub onboarding_complete: Option<bool>,
    /// Goal-history entries to set
    pub goal_history: BTreeMap<String, u32>,
    /// Goal-history days to remove explicitly
    pub goal_history_remove: Vec<String>,
}

impl SettingsPatch {
    /// JSON value the patch carries for a scalar field, if any
    #[must_use]
    pub fn field(&self, name: &str) -> Option<Value> {
        let value = match name {
            "display_name" => self.display_name.as_ref().map(|v| Value::from(v.clone())),
            "theme" => self.theme.and_then(|v| serde_json::to_value(v).ok()),
            "accent_color" => self.accent_color.as_ref().map(|v| Value::from(v.clone())),
            "daily_goal_minutes" => self.daily_goal_minutes.map(Value::from),
            "notification_prefs" => self
                .notification_prefs
                .as_ref()
                .and_then(|v| serde_json::to_value(v).ok()),
            "keep_screen_awake" => self.keep_screen_awake.map(Value::from),
            "haptics_enabled" => self.haptics_enabled.map(Value::from),
            "default_preset_id" => self
                .default_preset_id
                .as_ref()
                .and_then(|v| serde_json::to_value(v).ok()),
            "week_starts_monday" => self.week_starts_monday.map(Value::from),
            "ambient_volume" => self.ambient_volume.map(Value::from),
            "clock_24h" => self.clock_24h.map(Value::from),
            "auto_start_break" => self.auto_start_break.map(Value::from),
            "break_duration_secs" => self.break_duration_secs.map(Value::from),
            "onboarding_complete" => self.onboarding_complete.map(Value::from),
            _ => None,
        };
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_settings_defaults() {
        let settings = UserSettings::new(UserId::new());
        assert_eq!(settings.theme, ThemeMode::System);
        assert_eq!(settings.daily_goal_minutes, 120);
        assert!(!settings.onboarding_complete);
    }

    #[test]
    fn test_field_round_trip() {
        let mut settings = UserSettings::new(UserId::new());
        for field in UserSettings::FIELDS {
            let value = settings.field(field).unwrap();
            settings.set_field(field, value.clone()).unwrap();
            assert_eq!(settings.field(field).unwrap(), value, "field {field}");
        }
    }

    #[test]
    fn test_apply_patch_stamps_changed_fields_only() {
        let mut settings = UserSettings::new(UserId::new());
        let patch = SettingsPatch {
            theme: Some(ThemeMode::Dark),
            daily_goal_minutes: Some(120), // unchanged default
            ..SettingsPatch::default()
        };
        let stamped = settings.apply_patch(&patch);
        assert_eq!(stamped, vec!["theme".to_string()]);
        assert_eq!(settings.theme, ThemeMode::Dark);
    }

    #[test]
    fn test_apply_patch_goal_history() {
        let mut settings = UserSettings::new(UserId::new());
        let patch = SettingsPatch {
            goal_history: BTreeMap::from([("2026-08-30".to_string(), 95)]),
            ..SettingsPatch::default()
        };
        let stamped = settings.apply_patch(&patch);
        assert_eq!(stamped, vec!["goal_history/2026-08-30".to_string()]);

        let removal = SettingsPatch {
            goal_history_remove: vec!["2026-08-30".to_string()],
            ..SettingsPatch::default()
        };
        let stamped = settings.apply_patch(&removal);
        assert_eq!(stamped, vec!["goal_history/2026-08-30".to_string()]);
        assert!(settings.goal_history.is_empty());
    }

    #[test]
    fn test_set_field_rejects_unknown() {
        let mut settings = UserSettings::new(UserId::new());
        assert!(settings.set_field("nope", Value::Null).is_err());
    }
}

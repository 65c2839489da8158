//! Task model

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::{Syncable, TaskId, UserId};
use crate::now_ms;

/// How a task repeats across days
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatRule {
    /// Every day
    Daily,
    /// Monday through Friday
    Weekdays,
    /// Saturday and Sunday
    Weekends,
    /// Same weekday each week
    Weekly,
}

/// A to-do item that can be focused on with the timer.
///
/// `completed_days` records one occurrence key (`YYYY-MM-DD`) per day the
/// task was completed; repeating tasks accumulate one entry per completion.
/// Archiving is the user-facing soft delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: TaskId,
    /// Owning user
    pub owner: UserId,
    /// Short title shown in lists
    pub title: String,
    /// Free-form notes
    #[serde(default)]
    pub notes: String,
    /// Optional reminder time (unix ms)
    #[serde(default)]
    pub reminder_at: Option<i64>,
    /// Optional repeat rule
    #[serde(default)]
    pub repeat_rule: Option<RepeatRule>,
    /// Focus duration attached to the task, in seconds
    pub duration_secs: u32,
    /// Days on which the task was completed (`YYYY-MM-DD` keys)
    #[serde(default)]
    pub completed_days: BTreeSet<String>,
    /// Soft delete flag
    #[serde(default)]
    pub archived: bool,
    /// Creation timestamp (unix ms)
    pub created_at: i64,
    /// Last update timestamp (unix ms)
    pub updated_at: i64,
}

impl Task {
    /// Create a new task with the given title and focus duration
    #[must_use]
    pub fn new(owner: UserId, title: impl Into<String>, duration_secs: u32) -> Self {
        let now = now_ms();
        Self {
            id: TaskId::new(),
            owner,
            title: title.into(),
            notes: String::new(),
            reminder_at: None,
            repeat_rule: None,
            duration_secs,
            completed_days: BTreeSet::new(),
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Bump the update timestamp to now
    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }

    /// Whether the task was completed on the given day key
    #[must_use]
    pub fn is_completed_on(&self, day: &str) -> bool {
        self.completed_days.contains(day)
    }

    /// Add or remove a completion occurrence for the given day.
    ///
    /// Returns true if the set actually changed.
    pub fn set_completed_on(&mut self, day: &str, done: bool) -> bool {
        let changed = if done {
            self.completed_days.insert(day.to_string())
        } else {
            self.completed_days.remove(day)
        };
        if changed {
            self.touch();
        }
        changed
    }
}

impl Syncable for Task {
    const KIND: &'static str = "task";
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
    fn test_task_new() {
        let task = Task::new(UserId::new(), "Buy milk", 1500);
        assert_eq!(task.title, "Buy milk");
        assert!(!task.archived);
        assert_eq!(task.created_at, task.updated_at);
        assert!(task.completed_days.is_empty());
    }

    #[test]
    fn test_set_completed_on() {
        let mut task = Task::new(UserId::new(), "Stretch", 300);
        assert!(task.set_completed_on("2026-08-30", true));
        assert!(task.is_completed_on("2026-08-30"));

        // Re-marking the same day is a no-op
        assert!(!task.set_completed_on("2026-08-30", true));

        assert!(task.set_completed_on("2026-08-30", false));
        assert!(!task.is_completed_on("2026-08-30"));
    }

    #[test]
    fn test_field_key_shape() {
        let task = Task::new(UserId::new(), "x", 60);
        assert_eq!(task.field_key(), format!("task/{}", task.id));
    }
}

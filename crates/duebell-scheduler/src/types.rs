use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One concrete reminder instant for one task.
///
/// Identity is `(task_id, timestamp_second)`; the ordering is by task first,
/// which keeps expansion output grouped per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReminderRecord {
    pub task_id: i64,
    /// Reminder instant as Unix epoch seconds.
    pub timestamp_second: i64,
}

impl ReminderRecord {
    pub fn new(task_id: i64, timestamp_second: i64) -> Self {
        Self {
            task_id,
            timestamp_second,
        }
    }

    pub fn from_instant(task_id: i64, at: DateTime<Utc>) -> Self {
        Self::new(task_id, at.timestamp())
    }

    pub fn instant(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp_second, 0)
    }
}

impl std::fmt::Display for ReminderRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.instant() {
            Some(at) => write!(f, "task {} at {}", self.task_id, at.to_rfc3339()),
            None => write!(f, "task {} at {}s", self.task_id, self.timestamp_second),
        }
    }
}

/// What [`ReminderHandle::schedule`](crate::engine::ReminderHandle::schedule)
/// did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScheduleOutcome {
    /// A timer was armed to fire after `delay_ms`.
    Armed { delay_ms: i64 },
    /// The record was already in the index; nothing changed.
    AlreadyScheduled,
    /// The instant is too close or already past. Recorded as seen, not armed.
    Expired,
    /// The engine worker is gone; the record was not kept.
    ShutDown,
}

impl ScheduleOutcome {
    pub fn is_armed(&self) -> bool {
        matches!(self, ScheduleOutcome::Armed { .. })
    }
}

//! Task snapshots as seen by the reminder daemon.
//!
//! Tasks are owned by the persistence layer; everything here is a transient,
//! possibly stale copy used to derive reminder instants.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DuebellError, Result};

/// How a recurring task repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Frequency {
    type Err = DuebellError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            other => Err(DuebellError::InvalidRecurrence(format!(
                "unknown frequency: {other}"
            ))),
        }
    }
}

/// Recurrence rule: a subset of iCalendar RRULE.
///
/// Occurrences are stepped in local time of the daemon's configured zone,
/// starting from the task's `due_at`. Monthly steps on the 29th-31st clamp
/// to the last day of shorter months.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub frequency: Frequency,
    /// Step between occurrences, in units of `frequency`. Always >= 1.
    #[serde(default = "default_interval")]
    pub interval: u32,
    /// Total number of occurrences including the first one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    /// Last instant (inclusive) an occurrence may fall on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

fn default_interval() -> u32 {
    1
}

impl Recurrence {
    pub fn new(frequency: Frequency) -> Self {
        Self {
            frequency,
            interval: 1,
            count: None,
            until: None,
        }
    }

    pub fn daily() -> Self {
        Self::new(Frequency::Daily)
    }

    pub fn weekly() -> Self {
        Self::new(Frequency::Weekly)
    }

    pub fn monthly() -> Self {
        Self::new(Frequency::Monthly)
    }

    pub fn every(mut self, interval: u32) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            return Err(DuebellError::InvalidRecurrence(
                "interval must be at least 1".to_string(),
            ));
        }
        if self.count == Some(0) {
            return Err(DuebellError::InvalidRecurrence(
                "count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A task snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    /// User who owns the task.
    pub owner: String,
    /// Users who receive the due notification besides the owner.
    #[serde(default)]
    pub assignees: Vec<String>,
    /// Due instant of the first (or only) occurrence.
    pub due_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<Recurrence>,
    /// Remind this many minutes before each due instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remind_before_minutes: Option<u32>,
}

impl Task {
    pub fn new(
        id: i64,
        name: impl Into<String>,
        owner: impl Into<String>,
        due_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            owner: owner.into(),
            assignees: Vec::new(),
            due_at,
            recurrence: None,
            remind_before_minutes: None,
        }
    }

    pub fn with_recurrence(mut self, recurrence: Recurrence) -> Self {
        self.recurrence = Some(recurrence);
        self
    }

    pub fn with_assignees(mut self, assignees: Vec<String>) -> Self {
        self.assignees = assignees;
        self
    }

    pub fn with_remind_before(mut self, minutes: u32) -> Self {
        self.remind_before_minutes = Some(minutes);
        self
    }

    /// Offset between a due instant and its reminder instant.
    pub fn lead_time(&self) -> Duration {
        Duration::minutes(i64::from(self.remind_before_minutes.unwrap_or(0)))
    }

    /// Reminder instant of the first occurrence.
    pub fn reminder_at(&self) -> DateTime<Utc> {
        self.due_at - self.lead_time()
    }

    /// Copy of this task pinned to one concrete occurrence.
    pub fn occurrence(&self, due_at: DateTime<Utc>) -> Task {
        Task {
            due_at,
            ..self.clone()
        }
    }

    /// Owner followed by assignees, without duplicates.
    pub fn recipients(&self) -> Vec<&str> {
        let mut out = vec![self.owner.as_str()];
        for a in &self.assignees {
            if !out.contains(&a.as_str()) {
                out.push(a.as_str());
            }
        }
        out
    }
}

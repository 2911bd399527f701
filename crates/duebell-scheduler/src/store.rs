use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use duebell_core::Task;

use crate::{error::Result, schedule::expand_snapshots, types::ReminderRecord};

/// Read access to the source-of-truth task store.
///
/// Calls are synchronous and may block on I/O; the engine issues them from its
/// worker and from whichever thread triggers a mutation.
pub trait TaskStore: Send + Sync {
    /// Tasks that may have a reminder instant in `[start, end]`.
    ///
    /// Over-fetching is fine (expansion trims); missing a task is not.
    fn candidate_tasks(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Task>>;

    /// Current state of one task, `None` when it has been deleted.
    fn find_task(&self, id: i64) -> Result<Option<Task>>;

    /// Every reminder record in `[start, end]` with its occurrence snapshot.
    fn reminding_tasks(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        tz: Tz,
    ) -> Result<Vec<(ReminderRecord, Task)>> {
        Ok(self
            .candidate_tasks(start, end)?
            .iter()
            .flat_map(|task| expand_snapshots(task, start, end, tz))
            .collect())
    }
}

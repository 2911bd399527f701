use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use tracing::{info, warn};

use duebell_core::{Recurrence, Task};

use crate::{
    error::{Result, SchedulerError},
    store::TaskStore,
};

/// Initialise the task schema in `conn`.
///
/// Creates the `tasks` table (idempotent) and an index on `due_at` so the
/// windowed reminder query stays cheap with many tasks.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id                     INTEGER NOT NULL PRIMARY KEY,
            name                   TEXT    NOT NULL,
            owner                  TEXT    NOT NULL,
            assignees              TEXT    NOT NULL DEFAULT '[]', -- JSON array of user names
            due_at                 INTEGER NOT NULL,              -- Unix epoch seconds, UTC
            recurrence             TEXT,                          -- JSON-encoded Recurrence or NULL
            remind_before_minutes  INTEGER,
            updated_at             TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_tasks_due_at ON tasks (due_at);
        ",
    )?;
    Ok(())
}

const TASK_COLUMNS: &str =
    "id, name, owner, assignees, due_at, recurrence, remind_before_minutes";

// Columns: id, name, owner, assignees JSON, due_at, recurrence JSON, remind_before_minutes
type TaskRow = (i64, String, String, String, i64, Option<String>, Option<u32>);

/// SQLite-backed [`TaskStore`].
///
/// Owns its own `Connection`; the daemon opens one per subsystem so the
/// reminder worker never contends with request handlers on a single handle.
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a task or replace the stored copy with the same id.
    pub fn upsert_task(&self, task: &Task) -> Result<()> {
        let recurrence = match &task.recurrence {
            Some(rule) => {
                rule.validate()
                    .map_err(|e| SchedulerError::InvalidRecurrence(e.to_string()))?;
                Some(
                    serde_json::to_string(rule)
                        .map_err(|e| SchedulerError::InvalidRecurrence(e.to_string()))?,
                )
            }
            None => None,
        };
        let assignees = serde_json::to_string(&task.assignees)
            .map_err(|e| SchedulerError::Store(e.to_string()))?;
        let now = Utc::now().to_rfc3339();

        self.conn().execute(
            "INSERT INTO tasks
             (id, name, owner, assignees, due_at, recurrence, remind_before_minutes, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                owner = excluded.owner,
                assignees = excluded.assignees,
                due_at = excluded.due_at,
                recurrence = excluded.recurrence,
                remind_before_minutes = excluded.remind_before_minutes,
                updated_at = excluded.updated_at",
            rusqlite::params![
                task.id,
                task.name,
                task.owner,
                assignees,
                task.due_at.timestamp(),
                recurrence,
                task.remind_before_minutes,
                now
            ],
        )?;
        info!(task_id = task.id, "task stored");
        Ok(())
    }

    /// Remove a task by ID. Returns `TaskNotFound` if no row is deleted.
    pub fn delete_task(&self, id: i64) -> Result<()> {
        let n = self.conn().execute("DELETE FROM tasks WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::TaskNotFound { id });
        }
        info!(task_id = id, "task deleted");
        Ok(())
    }

    /// All stored tasks ordered by due time.
    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY due_at, id"))?;
        let rows = stmt
            .query_map([], read_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(readable_tasks(rows))
    }
}

impl TaskStore for SqliteTaskStore {
    fn candidate_tasks(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Task>> {
        let conn = self.conn();
        // One-off tasks: reminder instant inside the window. Recurring tasks:
        // anything whose first reminder is not after the window end.
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE (recurrence IS NULL
                    AND due_at - COALESCE(remind_before_minutes, 0) * 60 BETWEEN ?1 AND ?2)
                OR (recurrence IS NOT NULL
                    AND due_at - COALESCE(remind_before_minutes, 0) * 60 <= ?2)
             ORDER BY due_at, id"
        ))?;
        let rows = stmt
            .query_map([start.timestamp(), end.timestamp()], read_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(readable_tasks(rows))
    }

    fn find_task(&self, id: i64) -> Result<Option<Task>> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                [id],
                read_row,
            )
            .optional()?;
        row.map(into_task).transpose()
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn into_task(row: TaskRow) -> Result<Task> {
    let (id, name, owner, assignees, due_at, recurrence, remind_before_minutes) = row;
    let assignees: Vec<String> = serde_json::from_str(&assignees)
        .map_err(|e| SchedulerError::Store(format!("task {id}: bad assignees JSON: {e}")))?;
    let due_at = DateTime::from_timestamp(due_at, 0)
        .ok_or_else(|| SchedulerError::Store(format!("task {id}: due_at out of range")))?;
    let recurrence = recurrence
        .map(|json| serde_json::from_str::<Recurrence>(&json))
        .transpose()
        .map_err(|e| SchedulerError::InvalidRecurrence(format!("task {id}: {e}")))?;
    Ok(Task {
        id,
        name,
        owner,
        assignees,
        due_at,
        recurrence,
        remind_before_minutes,
    })
}

/// Decode rows, skipping (and logging) the ones that no longer parse.
fn readable_tasks(rows: Vec<TaskRow>) -> Vec<Task> {
    rows.into_iter()
        .filter_map(|row| match into_task(row) {
            Ok(task) => Some(task),
            Err(e) => {
                warn!("skipping unreadable task row: {e}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::UTC;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn init_db_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
    }

    #[test]
    fn upsert_and_find_round_trip() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let task = Task::new(1, "standup", "ana", utc(2026, 10, 18, 9, 0))
            .with_assignees(vec!["bo".into()])
            .with_recurrence(Recurrence::weekly().every(2).with_count(4))
            .with_remind_before(15);
        store.upsert_task(&task).unwrap();
        assert_eq!(store.find_task(1).unwrap(), Some(task));
        assert_eq!(store.find_task(2).unwrap(), None);
    }

    #[test]
    fn upsert_replaces_existing_row() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let task = Task::new(1, "standup", "ana", utc(2026, 10, 18, 9, 0));
        store.upsert_task(&task).unwrap();
        let moved = Task {
            due_at: utc(2026, 10, 19, 9, 0),
            ..task
        };
        store.upsert_task(&moved).unwrap();
        assert_eq!(store.list_tasks().unwrap(), vec![moved]);
    }

    #[test]
    fn upsert_rejects_invalid_recurrence() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let task = Task::new(1, "bad", "ana", utc(2026, 10, 18, 9, 0))
            .with_recurrence(Recurrence::daily().every(0));
        assert!(matches!(
            store.upsert_task(&task),
            Err(SchedulerError::InvalidRecurrence(_))
        ));
    }

    #[test]
    fn delete_missing_task_is_not_found() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        assert!(matches!(
            store.delete_task(42),
            Err(SchedulerError::TaskNotFound { id: 42 })
        ));
    }

    #[test]
    fn candidate_tasks_filter_by_reminder_instant() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        // In window.
        store.upsert_task(&Task::new(1, "a", "ana", utc(2026, 10, 18, 10, 0))).unwrap();
        // Due after the window, but its lead time pulls the reminder inside.
        store
            .upsert_task(&Task::new(2, "b", "ana", utc(2026, 10, 18, 12, 20)).with_remind_before(30))
            .unwrap();
        // Outside.
        store.upsert_task(&Task::new(3, "c", "ana", utc(2026, 10, 20, 10, 0))).unwrap();
        // Recurring, first due long ago.
        store
            .upsert_task(
                &Task::new(4, "d", "ana", utc(2026, 1, 1, 11, 0)).with_recurrence(Recurrence::daily()),
            )
            .unwrap();
        // Recurring, starts after the window.
        store
            .upsert_task(
                &Task::new(5, "e", "ana", utc(2026, 11, 1, 11, 0)).with_recurrence(Recurrence::daily()),
            )
            .unwrap();

        let ids: Vec<i64> = store
            .candidate_tasks(utc(2026, 10, 18, 8, 0), utc(2026, 10, 18, 12, 0))
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![4, 1, 2]);
    }

    #[test]
    fn reminding_tasks_expands_occurrences() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        store
            .upsert_task(
                &Task::new(4, "d", "ana", utc(2026, 1, 1, 11, 0)).with_recurrence(Recurrence::daily()),
            )
            .unwrap();
        let records = store
            .reminding_tasks(utc(2026, 10, 18, 0, 0), utc(2026, 10, 19, 23, 59), UTC)
            .unwrap();
        assert_eq!(records.len(), 2);
        let (record, snapshot) = &records[0];
        assert_eq!(record.task_id, 4);
        assert_eq!(snapshot.due_at, utc(2026, 10, 18, 11, 0));
    }
}

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Datelike, Days, Duration, Months, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

use duebell_core::{Frequency, Recurrence, Task};

use crate::types::ReminderRecord;

/// Upper bound on occurrences visited by one expansion.
const MAX_STEPS: usize = 10_000;

/// Reminder records of `task` whose instant falls in `[start, end]`.
///
/// Pure: the same task and window always produce the same set, so the
/// initial load, the sweep and the mutation path can all call it freely.
pub fn expand(
    task: &Task,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    tz: Tz,
) -> BTreeSet<ReminderRecord> {
    expand_snapshots(task, start, end, tz).into_keys().collect()
}

/// Like [`expand`], paired with the occurrence snapshot each record was
/// derived from (the task with `due_at` pinned to that occurrence).
pub fn expand_snapshots(
    task: &Task,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    tz: Tz,
) -> BTreeMap<ReminderRecord, Task> {
    let mut out = BTreeMap::new();
    if start > end {
        return out;
    }
    let lead = task.lead_time();

    match &task.recurrence {
        None => {
            let at = task.due_at - lead;
            if at >= start && at <= end {
                out.insert(ReminderRecord::from_instant(task.id, at), task.clone());
            }
        }
        Some(rule) => {
            // A reminder at `due - lead` is in-window iff `due` is in the
            // window shifted by `lead`.
            for due in occurrences(task.due_at, rule, start + lead, end + lead, tz) {
                out.insert(
                    ReminderRecord::from_instant(task.id, due - lead),
                    task.occurrence(due),
                );
            }
        }
    }
    out
}

/// Due instants of `rule` anchored at `first` that fall in `[from, to]`.
pub fn occurrences(
    first: DateTime<Utc>,
    rule: &Recurrence,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    tz: Tz,
) -> Vec<DateTime<Utc>> {
    let mut out = Vec::new();
    if from > to {
        return out;
    }

    let interval = rule.interval.max(1);
    let base = first.with_timezone(&tz).naive_local();
    let mut index = skip_ahead(first, rule.frequency, interval, from, tz);

    let mut steps = 0;
    loop {
        if steps == MAX_STEPS {
            warn!(
                frequency = %rule.frequency,
                interval,
                "recurrence expansion hit step cap; window truncated"
            );
            break;
        }
        steps += 1;

        if rule.count.is_some_and(|c| index >= u64::from(c)) {
            break;
        }
        let Some(local) = nth_local(base, rule.frequency, interval, index) else {
            break;
        };
        index += 1;

        let Some(due) = resolve_local(tz, local) else {
            continue;
        };
        if due > to || rule.until.is_some_and(|u| due > u) {
            break;
        }
        if due >= from {
            out.push(due);
        }
    }
    out
}

/// Index of an occurrence safely before `from`, so expansion of an old
/// recurring task does not walk every occurrence since its first due date.
fn skip_ahead(
    first: DateTime<Utc>,
    frequency: Frequency,
    interval: u32,
    from: DateTime<Utc>,
    tz: Tz,
) -> u64 {
    if from <= first {
        return 0;
    }
    let steps = match frequency {
        Frequency::Daily => (from - first).num_days() / i64::from(interval),
        Frequency::Weekly => (from - first).num_days() / (7 * i64::from(interval)),
        Frequency::Monthly => {
            let a = first.with_timezone(&tz);
            let b = from.with_timezone(&tz);
            let months = (i64::from(b.year()) - i64::from(a.year())) * 12
                + i64::from(b.month())
                - i64::from(a.month());
            months / i64::from(interval)
        }
    };
    // One step of slack absorbs DST shifts and month-end clamping.
    u64::try_from(steps - 1).unwrap_or(0)
}

/// Local wall-clock time of occurrence `index`, always stepped from `base`
/// so month-end clamping does not drift.
fn nth_local(
    base: NaiveDateTime,
    frequency: Frequency,
    interval: u32,
    index: u64,
) -> Option<NaiveDateTime> {
    let steps = index.checked_mul(u64::from(interval))?;
    match frequency {
        Frequency::Daily => base.checked_add_days(Days::new(steps)),
        Frequency::Weekly => base.checked_add_days(Days::new(steps.checked_mul(7)?)),
        Frequency::Monthly => base.checked_add_months(Months::new(u32::try_from(steps).ok()?)),
    }
}

/// Map a local time to UTC. Ambiguous times take the earlier instant; times
/// inside a DST gap move forward one hour.
fn resolve_local(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(local + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use chrono_tz::America::New_York;
    use chrono_tz::UTC;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn instants(records: &BTreeSet<ReminderRecord>) -> Vec<DateTime<Utc>> {
        records.iter().map(|r| r.instant().unwrap()).collect()
    }

    #[test]
    fn one_off_inside_window_yields_due_instant() {
        let due = utc(2026, 10, 18, 12, 0);
        let task = Task::new(1, "dentist", "ana", due);
        let records = expand(&task, utc(2026, 10, 18, 11, 0), utc(2026, 10, 18, 13, 0), UTC);
        assert_eq!(records.len(), 1);
        let record = records.iter().next().unwrap();
        assert_eq!(*record, ReminderRecord::new(1, due.timestamp()));
    }

    #[test]
    fn one_off_outside_window_is_empty() {
        let due = utc(2026, 10, 18, 12, 0);
        let task = Task::new(1, "dentist", "ana", due);
        assert!(expand(&task, utc(2026, 10, 18, 12, 1), utc(2026, 10, 18, 14, 0), UTC).is_empty());
        assert!(expand(&task, utc(2026, 10, 17, 0, 0), utc(2026, 10, 18, 11, 59), UTC).is_empty());
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let due = utc(2026, 10, 18, 12, 0);
        let task = Task::new(1, "dentist", "ana", due);
        assert_eq!(expand(&task, due, due, UTC).len(), 1);
    }

    #[test]
    fn inverted_window_is_empty() {
        let task = Task::new(1, "dentist", "ana", utc(2026, 10, 18, 12, 0))
            .with_recurrence(Recurrence::daily());
        assert!(expand(&task, utc(2026, 10, 19, 0, 0), utc(2026, 10, 18, 0, 0), UTC).is_empty());
    }

    #[test]
    fn lead_time_moves_reminder_before_due() {
        let task = Task::new(2, "call", "ana", utc(2026, 10, 18, 12, 0)).with_remind_before(30);
        let records = expand(&task, utc(2026, 10, 18, 11, 0), utc(2026, 10, 18, 11, 45), UTC);
        assert_eq!(instants(&records), vec![utc(2026, 10, 18, 11, 30)]);
    }

    #[test]
    fn daily_occurrences_in_window() {
        let task = Task::new(3, "standup", "ana", utc(2026, 10, 1, 9, 0))
            .with_recurrence(Recurrence::daily())
            .with_remind_before(10);
        let snaps = expand_snapshots(&task, utc(2026, 10, 18, 0, 0), utc(2026, 10, 21, 0, 0), UTC);
        let got: Vec<_> = snaps.iter().map(|(r, t)| (r.instant().unwrap(), t.due_at)).collect();
        assert_eq!(
            got,
            vec![
                (utc(2026, 10, 18, 8, 50), utc(2026, 10, 18, 9, 0)),
                (utc(2026, 10, 19, 8, 50), utc(2026, 10, 19, 9, 0)),
                (utc(2026, 10, 20, 8, 50), utc(2026, 10, 20, 9, 0)),
            ]
        );
    }

    #[test]
    fn old_daily_task_skips_to_window() {
        // More days since the first due date than the step cap allows.
        let task = Task::new(4, "journal", "ana", utc(1990, 1, 1, 9, 0))
            .with_recurrence(Recurrence::daily());
        let records = expand(&task, utc(2026, 10, 18, 0, 0), utc(2026, 10, 19, 0, 0), UTC);
        assert_eq!(instants(&records), vec![utc(2026, 10, 18, 9, 0)]);
    }

    #[test]
    fn biweekly_occurrences() {
        let task = Task::new(5, "retro", "ana", utc(2026, 10, 5, 10, 0))
            .with_recurrence(Recurrence::weekly().every(2));
        let records = expand(&task, utc(2026, 10, 5, 0, 0), utc(2026, 11, 5, 0, 0), UTC);
        assert_eq!(
            instants(&records),
            vec![utc(2026, 10, 5, 10, 0), utc(2026, 10, 19, 10, 0), utc(2026, 11, 2, 10, 0)]
        );
    }

    #[test]
    fn monthly_clamps_to_month_end() {
        let task = Task::new(6, "rent", "ana", utc(2026, 1, 31, 8, 0))
            .with_recurrence(Recurrence::monthly());
        let records = expand(&task, utc(2026, 2, 1, 0, 0), utc(2026, 4, 30, 23, 59), UTC);
        assert_eq!(
            instants(&records),
            vec![utc(2026, 2, 28, 8, 0), utc(2026, 3, 31, 8, 0), utc(2026, 4, 30, 8, 0)]
        );
    }

    #[test]
    fn count_limits_occurrences() {
        let task = Task::new(7, "pills", "ana", utc(2026, 10, 18, 9, 0))
            .with_recurrence(Recurrence::daily().with_count(3));
        let records = expand(&task, utc(2026, 10, 1, 0, 0), utc(2026, 11, 1, 0, 0), UTC);
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn count_applies_before_skip_ahead() {
        let task = Task::new(7, "pills", "ana", utc(2026, 1, 1, 9, 0))
            .with_recurrence(Recurrence::daily().with_count(3));
        assert!(expand(&task, utc(2026, 10, 1, 0, 0), utc(2026, 11, 1, 0, 0), UTC).is_empty());
    }

    #[test]
    fn until_is_inclusive() {
        let task = Task::new(8, "pills", "ana", utc(2026, 10, 18, 9, 0))
            .with_recurrence(Recurrence::daily().with_until(utc(2026, 10, 20, 9, 0)));
        let records = expand(&task, utc(2026, 10, 1, 0, 0), utc(2026, 11, 1, 0, 0), UTC);
        assert_eq!(
            instants(&records),
            vec![utc(2026, 10, 18, 9, 0), utc(2026, 10, 19, 9, 0), utc(2026, 10, 20, 9, 0)]
        );
    }

    #[test]
    fn daily_keeps_local_time_across_dst() {
        // 09:00 EST on 2026-03-06; DST starts 2026-03-08 in New York.
        let task = Task::new(9, "gym", "ana", utc(2026, 3, 6, 14, 0))
            .with_recurrence(Recurrence::daily());
        let records = expand(&task, utc(2026, 3, 6, 0, 0), utc(2026, 3, 10, 23, 59), New_York);
        let got = instants(&records);
        assert_eq!(
            got,
            vec![
                utc(2026, 3, 6, 14, 0),
                utc(2026, 3, 7, 14, 0),
                utc(2026, 3, 8, 13, 0),
                utc(2026, 3, 9, 13, 0),
                utc(2026, 3, 10, 13, 0),
            ]
        );
        assert!(got.iter().all(|at| at.with_timezone(&New_York).hour() == 9));
    }

    #[test]
    fn local_time_in_dst_gap_moves_forward() {
        // 02:30 local does not exist on 2026-03-08 in New York.
        let task = Task::new(10, "backup", "ana", utc(2026, 3, 7, 7, 30))
            .with_recurrence(Recurrence::daily());
        let records = expand(&task, utc(2026, 3, 8, 0, 0), utc(2026, 3, 8, 23, 59), New_York);
        let got = instants(&records);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].with_timezone(&New_York).hour(), 3);
    }

    #[test]
    fn expansion_is_deterministic() {
        let task = Task::new(11, "standup", "ana", utc(2026, 10, 1, 9, 0))
            .with_recurrence(Recurrence::weekly());
        let a = expand_snapshots(&task, utc(2026, 10, 1, 0, 0), utc(2026, 12, 1, 0, 0), New_York);
        let b = expand_snapshots(&task, utc(2026, 10, 1, 0, 0), utc(2026, 12, 1, 0, 0), New_York);
        assert_eq!(a, b);
    }
}

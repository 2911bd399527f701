//! Reminder engine: schedule index, jitter scheduler, sweep loop and firing
//! handler.
//!
//! One worker task ([`ReminderEngine::run`]) owns a min-heap of armed timers
//! and executes every firing, the initial load and the daily sweep in
//! sequence. Any thread may arm timers through a cloned [`ReminderHandle`];
//! arming only inserts into the shared [`ScheduleIndex`] and pushes onto an
//! unbounded channel, so it never blocks on the worker.
//!
//! Stale timers are not cancelled. The firing handler re-reads the task and
//! re-expands it; a record that no longer matches is discarded instead.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};
use chrono_tz::Tz;
use dashmap::{mapref::entry::Entry, DashMap};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use duebell_core::config::{ReminderConfig, MIN_JITTER_MS, SECONDS_OF_DAY};
use duebell_core::Task;

use crate::{
    error::Result,
    notify::Notifier,
    schedule::expand_snapshots,
    store::TaskStore,
    types::{ReminderRecord, ScheduleOutcome},
};

/// Look-ahead used when a task is created or updated.
const MUTATION_WINDOW_SECONDS: i64 = SECONDS_OF_DAY;

/// Concurrent map of every record the engine has seen, keyed by record.
///
/// An entry means a timer is pending for the record, or it fired/expired and
/// waits for [`purge_expired`](Self::purge_expired). Values are advisory
/// snapshots; firing always re-reads the store.
#[derive(Default)]
pub struct ScheduleIndex {
    entries: DashMap<ReminderRecord, Task>,
}

impl ScheduleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `snapshot` under `record` unless the record is already present.
    ///
    /// Returns `true` when this call inserted. Check and insert run under the
    /// shard lock of `record`, so of two racing callers exactly one wins.
    pub fn insert_if_absent(&self, record: ReminderRecord, snapshot: Task) -> bool {
        match self.entries.entry(record) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(snapshot);
                true
            }
        }
    }

    pub fn contains(&self, record: &ReminderRecord) -> bool {
        self.entries.contains_key(record)
    }

    pub fn remove(&self, record: &ReminderRecord) -> Option<Task> {
        self.entries.remove(record).map(|(_, task)| task)
    }

    /// Drop every entry with `timestamp_second + buffer_seconds < now_second`.
    /// Returns the number of entries removed.
    pub fn purge_expired(&self, now_second: i64, buffer_seconds: i64) -> usize {
        let mut removed = 0;
        self.entries.retain(|record, _| {
            let keep = record.timestamp_second.saturating_add(buffer_seconds) >= now_second;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Milliseconds from `now_second` until shortly before `target_second`.
///
/// Subtracts a uniform jitter in `[MIN_JITTER_MS, jitter_ms)` so reminders
/// sharing a due instant do not all fire in the same millisecond. A bound at
/// or below the floor yields exactly `MIN_JITTER_MS`.
pub fn jitter_delay_ms<R: Rng + ?Sized>(
    target_second: i64,
    now_second: i64,
    jitter_ms: i64,
    rng: &mut R,
) -> i64 {
    let jitter = if jitter_ms > MIN_JITTER_MS {
        rng.gen_range(MIN_JITTER_MS..jitter_ms)
    } else {
        MIN_JITTER_MS
    };
    target_second
        .saturating_sub(now_second)
        .saturating_mul(1_000)
        .saturating_sub(jitter)
}

/// Seconds until the next local midnight in `tz` (at least 1).
pub fn seconds_until_local_midnight(now: DateTime<Utc>, tz: Tz) -> u64 {
    let passed = i64::from(now.with_timezone(&tz).num_seconds_from_midnight());
    u64::try_from(SECONDS_OF_DAY - passed).unwrap_or(1).max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct ArmedTimer {
    fire_at: Instant,
    record: ReminderRecord,
}

struct Shared {
    index: ScheduleIndex,
    store: Arc<dyn TaskStore>,
    timer_tx: mpsc::UnboundedSender<ArmedTimer>,
    /// Timers handed to the worker and not yet fired or dropped.
    pending: AtomicUsize,
    tz: Tz,
    jitter_ms: i64,
}

/// Cloneable entry point for arming reminders from any thread.
#[derive(Clone)]
pub struct ReminderHandle {
    shared: Arc<Shared>,
}

impl ReminderHandle {
    /// Arm a timer for `record` unless it is already indexed.
    ///
    /// A record whose jittered delay is not positive is indexed without a
    /// timer, so later sweeps treat it as seen and never retry it.
    pub fn schedule(&self, record: ReminderRecord, snapshot: Task) -> ScheduleOutcome {
        let shared = &self.shared;
        let delay_ms = jitter_delay_ms(
            record.timestamp_second,
            Utc::now().timestamp(),
            shared.jitter_ms,
            &mut rand::thread_rng(),
        );

        if !shared.index.insert_if_absent(record, snapshot) {
            debug!(%record, "reminder already scheduled");
            return ScheduleOutcome::AlreadyScheduled;
        }
        if delay_ms <= 0 {
            debug!(%record, delay_ms, "reminder instant passed; indexed without timer");
            return ScheduleOutcome::Expired;
        }

        let fire_at = Instant::now() + std::time::Duration::from_millis(delay_ms.unsigned_abs());
        shared.pending.fetch_add(1, Ordering::SeqCst);
        if shared.timer_tx.send(ArmedTimer { fire_at, record }).is_err() {
            shared.pending.fetch_sub(1, Ordering::SeqCst);
            shared.index.remove(&record);
            warn!(%record, "reminder engine stopped; timer not armed");
            return ScheduleOutcome::ShutDown;
        }
        info!(%record, delay_ms, "reminder armed");
        ScheduleOutcome::Armed { delay_ms }
    }

    /// Arm reminders for tasks that were just created or updated.
    ///
    /// Covers the next day only; anything later is picked up by the sweep.
    pub fn generate_task_reminder(&self, tasks: &[Task]) -> Vec<(ReminderRecord, ScheduleOutcome)> {
        let now = Utc::now();
        let end = now + Duration::seconds(MUTATION_WINDOW_SECONDS);
        let mut outcomes = Vec::new();
        for task in tasks {
            debug!(task_id = task.id, "generating reminders for task");
            for (record, snapshot) in expand_snapshots(task, now, end, self.shared.tz) {
                outcomes.push((record, self.schedule(record, snapshot)));
            }
        }
        outcomes
    }

    /// Query the store for `[start, end]` and schedule every record found.
    pub fn load_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<(ReminderRecord, ScheduleOutcome)>> {
        let records = self.shared.store.reminding_tasks(start, end, self.shared.tz)?;
        Ok(records
            .into_iter()
            .map(|(record, snapshot)| (record, self.schedule(record, snapshot)))
            .collect())
    }

    pub fn index(&self) -> &ScheduleIndex {
        &self.shared.index
    }

    pub fn pending_timers(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    pub fn timezone(&self) -> Tz {
        self.shared.tz
    }
}

/// The reminder worker. Build with [`ReminderEngine::new`], hand out
/// [`handle`](Self::handle)s, then drive it with [`run`](Self::run).
pub struct ReminderEngine {
    shared: Arc<Shared>,
    timer_rx: mpsc::UnboundedReceiver<ArmedTimer>,
    queue: BinaryHeap<Reverse<ArmedTimer>>,
    notifier: Arc<dyn Notifier>,
    config: ReminderConfig,
    deliveries: TaskTracker,
}

impl ReminderEngine {
    pub fn new(
        config: &ReminderConfig,
        store: Arc<dyn TaskStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate()?;
        let tz = config.tz()?;
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        Ok(Self {
            shared: Arc::new(Shared {
                index: ScheduleIndex::new(),
                store,
                timer_tx,
                pending: AtomicUsize::new(0),
                tz,
                jitter_ms: config.jitter_ms,
            }),
            timer_rx,
            queue: BinaryHeap::new(),
            notifier,
            config: config.clone(),
            deliveries: TaskTracker::new(),
        })
    }

    pub fn handle(&self) -> ReminderHandle {
        ReminderHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Main loop. Loads once, then fires timers and sweeps daily (anchored at
    /// local midnight) until `shutdown` broadcasts `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            timezone = %self.shared.tz,
            notifier = self.notifier.name(),
            "reminder engine started"
        );
        self.initial_load();

        let first_sweep = seconds_until_local_midnight(Utc::now(), self.shared.tz);
        debug!(first_sweep_secs = first_sweep, "daily sweep anchored to local midnight");
        let cron = std::time::Duration::from_secs(self.config.cron_job_seconds.unsigned_abs());
        let sweep = tokio::time::sleep(std::time::Duration::from_secs(first_sweep));
        tokio::pin!(sweep);

        loop {
            let next_fire = self.queue.peek().map(|Reverse(t)| t.fire_at);
            tokio::select! {
                Some(timer) = self.timer_rx.recv() => self.queue.push(Reverse(timer)),
                () = wait_until(next_fire) => self.fire_due(),
                () = &mut sweep => {
                    self.sweep();
                    sweep.as_mut().reset(Instant::now() + cron);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("reminder engine shutting down");
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Schedule everything in `[now - load_prev, now + load_next]`.
    pub fn initial_load(&self) {
        let now = Utc::now();
        let start = now - Duration::seconds(self.config.load_prev_seconds);
        let end = now + Duration::seconds(self.config.load_next_seconds);
        self.load(start, end, "initial load");
    }

    /// Purge expired index entries, then schedule `[now, now + load_next]`.
    pub fn sweep(&self) {
        let now = Utc::now();
        let purged = self
            .shared
            .index
            .purge_expired(now.timestamp(), self.config.purge_prev_seconds);
        info!(purged, indexed = self.shared.index.len(), "reminder index purged");
        self.load(now, now + Duration::seconds(self.config.load_next_seconds), "daily sweep");
    }

    /// Firing handler: re-validate `record` against the stored task and
    /// deliver it if it still applies.
    pub fn fire(&self, record: ReminderRecord) {
        debug!(%record, "reminder timer elapsed");
        let task = match self.shared.store.find_task(record.task_id) {
            Ok(Some(task)) => task,
            Ok(None) => {
                // Left in the index for the purge to reclaim.
                info!(%record, "task deleted before its reminder fired; dropped");
                return;
            }
            Err(e) => {
                error!(%record, "reminder re-validation failed: {e}");
                return;
            }
        };

        let now = Utc::now();
        let buffer = Duration::seconds(self.config.verify_buffer_seconds);
        let mut current = expand_snapshots(&task, now - buffer, now + buffer, self.shared.tz);
        match current.remove(&record) {
            Some(snapshot) => {
                info!(%record, recipients = ?snapshot.recipients(), "sending due notification");
                self.deliver(record, snapshot);
            }
            None => {
                self.shared.index.remove(&record);
                info!(%record, "task rescheduled since reminder was armed; discarded");
            }
        }
    }

    fn load(&self, start: DateTime<Utc>, end: DateTime<Utc>, phase: &'static str) {
        match self.handle().load_window(start, end) {
            Ok(outcomes) => {
                let armed = outcomes.iter().filter(|(_, o)| o.is_armed()).count();
                info!(phase, records = outcomes.len(), armed, "reminder window loaded");
            }
            // The next sweep retries; the worker must keep running.
            Err(e) => error!(phase, "reminder window load failed: {e}"),
        }
    }

    fn fire_due(&mut self) {
        let now = Instant::now();
        while let Some(&Reverse(timer)) = self.queue.peek() {
            if timer.fire_at > now {
                break;
            }
            self.queue.pop();
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            self.fire(timer.record);
        }
    }

    fn deliver(&self, record: ReminderRecord, snapshot: Task) {
        let notifier = Arc::clone(&self.notifier);
        self.deliveries.spawn(async move {
            if let Err(e) = notifier.send_due(std::slice::from_ref(&snapshot)).await {
                warn!(%record, notifier = notifier.name(), "due notification failed: {e}");
            }
        });
    }

    /// Drop pending timers and give in-flight deliveries a bounded grace period.
    async fn shutdown(mut self) {
        self.timer_rx.close();
        let mut dropped = self.queue.len();
        self.queue.clear();
        while self.timer_rx.try_recv().is_ok() {
            dropped += 1;
        }
        self.shared.pending.fetch_sub(dropped, Ordering::SeqCst);

        self.deliveries.close();
        let grace = std::time::Duration::from_secs(self.config.await_termination_seconds);
        if tokio::time::timeout(grace, self.deliveries.wait()).await.is_err() {
            warn!(
                in_flight = self.deliveries.len(),
                "deliveries still running after shutdown grace period"
            );
        }
        info!(dropped_timers = dropped, "reminder engine stopped");
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

//! `duebell-scheduler`: in-process reminder engine over a SQLite task store.
//!
//! # Overview
//!
//! Tasks live in a SQLite `tasks` table ([`db::SqliteTaskStore`]). The
//! [`engine::ReminderEngine`] keeps one timer per due reminder inside a rolling
//! look-ahead window, refills the window with a daily sweep anchored at local
//! midnight, and re-validates every reminder against the store when its timer
//! fires. Stale timers are filtered at fire time, never cancelled.
//!
//! # Phases
//!
//! | Phase          | Window                                   | Trigger                     |
//! |----------------|------------------------------------------|-----------------------------|
//! | Initial load   | `[now - load_prev, now + load_next]`     | engine start                |
//! | Task mutation  | `[now, now + 1 day]`                     | `generate_task_reminder`    |
//! | Daily sweep    | purge, then `[now, now + load_next]`     | local midnight, then cron   |
//! | Firing         | verify against `[now ± verify_buffer]`   | timer elapsed               |

pub mod db;
pub mod engine;
pub mod error;
pub mod notify;
pub mod schedule;
pub mod store;
pub mod types;

pub use db::SqliteTaskStore;
pub use engine::{ReminderEngine, ReminderHandle, ScheduleIndex};
pub use error::{DeliveryError, Result, SchedulerError};
pub use notify::Notifier;
pub use schedule::{expand, expand_snapshots};
pub use store::TaskStore;
pub use types::{ReminderRecord, ScheduleOutcome};

//! Shared model, configuration and errors for the duebell reminder daemon.

pub mod config;
pub mod error;
pub mod task;

pub use config::{DuebellConfig, ReminderConfig};
pub use error::{DuebellError, Result};
pub use task::{Frequency, Recurrence, Task};

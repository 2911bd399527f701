use chrono_tz::Tz;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DuebellError, Result};

pub const SECONDS_OF_DAY: i64 = 86_400;
/// Lower bound of the random jitter subtracted from every reminder delay.
pub const MIN_JITTER_MS: i64 = 200;
pub const DEFAULT_TIMEZONE: &str = "UTC";
/// Upper bound for every window and interval setting (100 years).
pub const MAX_WINDOW_SECONDS: i64 = 100 * 365 * SECONDS_OF_DAY;

/// Top-level config (duebell.toml + DUEBELL_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DuebellConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub reminder: ReminderConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Reminder daemon tuning. Read once at startup, static afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderConfig {
    /// IANA zone used for recurrence stepping and the midnight sweep anchor.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Fixed delay between daily sweeps.
    #[serde(default = "default_cron_job_seconds")]
    pub cron_job_seconds: i64,
    /// Look-back of the initial load.
    #[serde(default = "default_load_prev_seconds")]
    pub load_prev_seconds: i64,
    /// Look-ahead of the initial load and every sweep.
    #[serde(default = "default_load_next_seconds")]
    pub load_next_seconds: i64,
    /// Index entries older than this (relative to their instant) are purged.
    /// Must exceed `verify_buffer_seconds`.
    #[serde(default = "default_purge_prev_seconds")]
    pub purge_prev_seconds: i64,
    /// Upper bound of the random jitter, in milliseconds.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: i64,
    /// Half-width of the fire-time re-validation window.
    #[serde(default = "default_verify_buffer_seconds")]
    pub verify_buffer_seconds: i64,
    /// Grace period for in-flight deliveries on shutdown.
    #[serde(default = "default_await_termination_seconds")]
    pub await_termination_seconds: u64,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            cron_job_seconds: default_cron_job_seconds(),
            load_prev_seconds: default_load_prev_seconds(),
            load_next_seconds: default_load_next_seconds(),
            purge_prev_seconds: default_purge_prev_seconds(),
            jitter_ms: default_jitter_ms(),
            verify_buffer_seconds: default_verify_buffer_seconds(),
            await_termination_seconds: default_await_termination_seconds(),
        }
    }
}

impl ReminderConfig {
    /// Parse the configured timezone identifier.
    pub fn tz(&self) -> Result<Tz> {
        self.timezone.parse::<Tz>().map_err(|e| {
            DuebellError::Config(format!("unknown timezone '{}': {e}", self.timezone))
        })
    }

    /// Reject combinations that would break the scheduling invariants.
    pub fn validate(&self) -> Result<()> {
        self.tz()?;
        check_seconds("reminder.cron_job_seconds", self.cron_job_seconds, 1)?;
        check_seconds("reminder.load_prev_seconds", self.load_prev_seconds, 0)?;
        check_seconds("reminder.load_next_seconds", self.load_next_seconds, 0)?;
        check_seconds("reminder.purge_prev_seconds", self.purge_prev_seconds, 0)?;
        check_seconds("reminder.verify_buffer_seconds", self.verify_buffer_seconds, 0)?;
        if self.jitter_ms < 0 {
            return Err(DuebellError::Config(
                "reminder.jitter_ms must not be negative".to_string(),
            ));
        }
        // Timers fire up to `jitter_ms` early; the re-validation window has
        // to reach back over that or every valid reminder is discarded.
        if self.verify_buffer_seconds * 1_000 <= self.jitter_ms {
            return Err(DuebellError::Config(format!(
                "reminder.verify_buffer_seconds ({}s) must exceed reminder.jitter_ms ({}ms)",
                self.verify_buffer_seconds, self.jitter_ms
            )));
        }
        // A purge that outruns verification would drop entries whose timer
        // can still fire and look itself up.
        if self.purge_prev_seconds <= self.verify_buffer_seconds {
            return Err(DuebellError::Config(format!(
                "reminder.purge_prev_seconds ({}) must exceed reminder.verify_buffer_seconds ({})",
                self.purge_prev_seconds, self.verify_buffer_seconds
            )));
        }
        Ok(())
    }
}

/// Bound a window setting to `[min, MAX_WINDOW_SECONDS]`, keeping date
/// arithmetic on it far from chrono's range limits.
fn check_seconds(key: &str, value: i64, min: i64) -> Result<()> {
    if value < min || value > MAX_WINDOW_SECONDS {
        return Err(DuebellError::Config(format!(
            "{key} ({value}) must be between {min} and {MAX_WINDOW_SECONDS}"
        )));
    }
    Ok(())
}

/// Outbound delivery channel selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// When set, due notifications are POSTed here as JSON; otherwise they
    /// are only written to the log.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_timeout_secs: default_webhook_timeout_secs(),
        }
    }
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}
fn default_cron_job_seconds() -> i64 {
    SECONDS_OF_DAY
}
fn default_load_prev_seconds() -> i64 {
    3_600
}
fn default_load_next_seconds() -> i64 {
    2 * SECONDS_OF_DAY
}
fn default_purge_prev_seconds() -> i64 {
    SECONDS_OF_DAY
}
fn default_jitter_ms() -> i64 {
    5_000
}
fn default_verify_buffer_seconds() -> i64 {
    7_200
}
fn default_await_termination_seconds() -> u64 {
    5
}
fn default_webhook_timeout_secs() -> u64 {
    10
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.duebell/duebell.db", home)
}

impl DuebellConfig {
    /// Load config from a TOML file with DUEBELL_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.duebell/duebell.toml
    ///
    /// Nested keys use a double underscore in env vars, e.g.
    /// `DUEBELL_REMINDER__JITTER_MS=3000`. A missing file is not an error;
    /// every field has a default.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        debug!(%path, "loading config");

        let config: DuebellConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("DUEBELL_").split("__"))
            .extract()
            .map_err(|e| DuebellError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.reminder.validate()
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.duebell/duebell.toml", home)
}

//! Command-line surface of the daemon binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// duebell - task due-date reminder daemon
#[derive(Parser, Debug)]
#[command(name = "duebell-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path (falls back to DUEBELL_CONFIG, then ~/.duebell/duebell.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to execute; defaults to `run`
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Explicit `--config` wins over the `DUEBELL_CONFIG` environment variable.
    pub fn config_path(&self, env_path: Option<String>) -> Option<String> {
        self.config
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .or(env_path)
    }

    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Run)
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Start the reminder daemon in the foreground
    Run,

    /// Print the reminder records stored tasks would produce
    Preview {
        /// Only expand this task; every stored task otherwise
        #[arg(short, long)]
        task_id: Option<i64>,

        /// Look-ahead from now, in hours
        #[arg(long, default_value_t = 48)]
        hours: u32,
    },

    /// Print the effective configuration as JSON
    Config,
}

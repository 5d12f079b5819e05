//! `pstats-bridge.toml` config loading.

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{BridgeError, BridgeResult, KeyStyle, WorkerCommand};

pub const DEFAULT_CONFIG_FILE: &str = "pstats-bridge.toml";

/// Environment variable the built-in worker reads its key style from.
pub const KEY_STYLE_ENV: &str = "PSTATS_BRIDGE_KEY_STYLE";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Budget for one conversion before the worker is killed.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Cadence at which the worker is checked for completion.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Allows `/json/file/<abs path>` lookups of arbitrary local reports.
    #[serde(default)]
    pub single_user_mode: bool,

    /// Where stored reports live; defaults to the process temp dir.
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,

    #[serde(default)]
    pub key_style: KeyStyle,

    /// Report worker failures as 500 and timeouts as 504 instead of an
    /// empty 200.
    #[serde(default)]
    pub distinguish_failures: bool,

    /// Worker executable; defaults to this binary.
    #[serde(default)]
    pub worker_program: Option<PathBuf>,

    #[serde(default = "default_worker_args")]
    pub worker_args: Vec<String>,
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_worker_args() -> Vec<String> {
    // `--` keeps a stored name such as `-x.prof` from parsing as a flag.
    vec!["encode-worker".to_string(), "--".to_string()]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            single_user_mode: false,
            storage_dir: None,
            key_style: KeyStyle::default(),
            distinguish_failures: false,
            worker_program: None,
            worker_args: default_worker_args(),
        }
    }
}

impl Config {
    pub fn load_optional(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(s) => match toml::from_str::<Config>(&s) {
                Ok(cfg) => cfg,
                Err(err) => {
                    tracing::warn!("failed to parse config {}: {err}", path.display());
                    Self::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                tracing::warn!("failed to read config {}: {err}", path.display());
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(BridgeError::Config(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.storage_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Worker invocation for one conversion; the report path is appended
    /// by the runner.
    pub fn worker_command(&self) -> BridgeResult<WorkerCommand> {
        let program = match &self.worker_program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };
        Ok(WorkerCommand::new(program, self.worker_args.clone())
            .env(KEY_STYLE_ENV, self.key_style.as_str()))
    }
}

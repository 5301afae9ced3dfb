//! Global configuration parsing and validation.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::daemon::DaemonSettings;
use crate::executor::ExecutorOptions;
use crate::models::session::Dimensions;
use crate::orchestrator::OrchestratorSettings;
use crate::{AppError, Result};

/// Command execution limits and retry policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct ExecutorConfig {
    /// Maximum concurrently running external processes; `<= 0` means 10.
    pub max_concurrent: i64,
    /// Default per-attempt timeout when a command does not set one.
    pub default_timeout_seconds: u64,
    /// Extra attempts for retryable exit codes; negative values clamp to 0.
    pub retry_count: i64,
    /// Delay between attempts.
    pub retry_delay_ms: u64,
    /// Exit codes that trigger a retry.
    pub retry_on_exit_codes: Vec<i32>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            default_timeout_seconds: 120,
            retry_count: 0,
            retry_delay_ms: 500,
            retry_on_exit_codes: Vec::new(),
        }
    }
}

/// Session lifecycle tuning.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct OrchestratorConfig {
    /// Delay before a `Loading` session is promoted to `Ready`.
    pub ready_grace_ms: u64,
    /// Root directory for isolated workspaces. Unset places them next to
    /// the repository as `<repo>-worktree-<id>`.
    pub worktree_dir: Option<PathBuf>,
    /// Program launched when a request does not name one.
    pub default_program: String,
    /// Default terminal width.
    pub default_width: u16,
    /// Default terminal height.
    pub default_height: u16,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let dims = Dimensions::default();
        Self {
            ready_grace_ms: 2000,
            worktree_dir: None,
            default_program: "claude".into(),
            default_width: dims.width,
            default_height: dims.height,
        }
    }
}

/// Auto-accept daemon tuning.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct DaemonConfig {
    /// Tick interval.
    pub poll_interval_ms: u64,
    /// Minimum spacing between repeated per-session warnings.
    pub log_window_seconds: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            log_window_seconds: 60,
        }
    }
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory holding the session database.
    pub data_dir: PathBuf,
    /// Command executor settings.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Orchestrator settings.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Daemon settings.
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults rooted at `$HOME/.agent-squad`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `HOME` is not set.
    pub fn from_home() -> Result<Self> {
        let home = env::var_os("HOME")
            .ok_or_else(|| AppError::Config("HOME is not set; pass --config".into()))?;
        Ok(Self::with_data_dir(PathBuf::from(home).join(".agent-squad")))
    }

    /// Defaults with an explicit data directory.
    #[must_use]
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            executor: ExecutorConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }

    /// Path of the `SQLite` session database.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("sessions.db")
    }

    /// Executor options with the documented clamps applied.
    #[must_use]
    pub fn executor_options(&self) -> ExecutorOptions {
        let cfg = &self.executor;
        ExecutorOptions::default()
            .max_concurrent(cfg.max_concurrent)
            .default_timeout(Duration::from_secs(cfg.default_timeout_seconds))
            .retry(
                cfg.retry_count,
                Duration::from_millis(cfg.retry_delay_ms),
                cfg.retry_on_exit_codes.clone(),
            )
    }

    /// Orchestrator settings derived from the `[orchestrator]` section.
    #[must_use]
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        let cfg = &self.orchestrator;
        OrchestratorSettings {
            ready_grace: Duration::from_millis(cfg.ready_grace_ms),
            worktree_dir: cfg.worktree_dir.clone(),
            default_dimensions: Dimensions {
                width: cfg.default_width,
                height: cfg.default_height,
            },
        }
    }

    /// Daemon settings derived from the `[daemon]` section.
    #[must_use]
    pub fn daemon_settings(&self) -> DaemonSettings {
        DaemonSettings {
            poll_interval: Duration::from_millis(self.daemon.poll_interval_ms),
            log_window: Duration::from_secs(self.daemon.log_window_seconds),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(AppError::Config("data_dir must not be empty".into()));
        }

        if self.daemon.poll_interval_ms == 0 {
            return Err(AppError::Config(
                "daemon.poll_interval_ms must be greater than zero".into(),
            ));
        }

        if self.executor.default_timeout_seconds == 0 {
            return Err(AppError::Config(
                "executor.default_timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.orchestrator.default_program.trim().is_empty() {
            return Err(AppError::Config(
                "orchestrator.default_program must not be empty".into(),
            ));
        }

        Ok(())
    }
}

//! Bounded, retryable external process execution.
//!
//! Every adapter that shells out (`git`, `tmux`) goes through a
//! [`CommandExecutor`]. The executor:
//! - bounds the number of simultaneously running processes with a
//!   counting semaphore (acquisition is cancellable via the command's
//!   [`CancellationToken`]);
//! - applies a per-attempt timeout, falling back to the configured default
//!   when a command sets none or zero;
//! - retries only on configured exit codes, returning the last attempt;
//! - spawns every child with `kill_on_drop(true)` so an abandoned or
//!   timed-out process is terminated rather than left running detached.
//!
//! Streaming, interactive and detached execution live in the submodules.

mod interactive;
mod process_table;
mod streaming;

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{AppError, Result};

pub use interactive::InteractiveSession;
pub use process_table::{HandleId, ProcessHandle, ProcessInfo, ProcessState};
pub use streaming::STREAM_BUFFER;

use process_table::ProcessTable;

/// Concurrency floor used when `max_concurrent <= 0`.
pub const DEFAULT_MAX_CONCURRENT: usize = 10;

/// Per-attempt timeout used when neither the command nor the options set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// A program invocation.
#[derive(Debug, Clone, Default)]
pub struct Command {
    /// Program name or path.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Working directory; falls back to [`ExecutorOptions::working_dir`].
    pub current_dir: Option<PathBuf>,
    /// Environment overrides applied on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Bytes written to the child's stdin; replayed on every attempt.
    pub stdin: Option<Bytes>,
    /// Per-attempt timeout; `None` or zero uses the executor default.
    pub timeout: Option<Duration>,
    /// Caller cancellation; aborts slot acquisition and running attempts.
    pub cancel: Option<CancellationToken>,
}

impl Command {
    /// Start building a command for `program`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Add an environment override.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Provide stdin content.
    #[must_use]
    pub fn stdin(mut self, input: impl Into<Bytes>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Set the per-attempt timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Tie the command to a caller cancellation token.
    #[must_use]
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// `program arg1 arg2` for log lines and error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Captured outcome of a completed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// Captured stdout of the last attempt.
    pub stdout: Bytes,
    /// Captured stderr of the last attempt.
    pub stderr: Bytes,
    /// Exit code of the last attempt; `-1` when terminated by a signal.
    pub exit_code: i32,
    /// Wall time of the last attempt.
    pub duration: Duration,
    /// Terminal error of the last attempt, if it did not succeed.
    pub error: Option<String>,
    /// Number of attempts made.
    pub attempts: u32,
}

impl ExecResult {
    /// Whether the last attempt exited with code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout decoded lossily as UTF-8.
    #[must_use]
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr decoded lossily as UTF-8.
    #[must_use]
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Turn a non-zero exit into an `ExternalService` error carrying stderr.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalService` if the exit code is non-zero.
    pub fn ensure_success(self, context: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(AppError::ExternalService(format!(
                "{context}: exit code {}: {}",
                self.exit_code,
                self.stderr_str().trim()
            )))
        }
    }
}

/// Tagged chunk emitted by streaming and interactive execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// Bytes read from stdout.
    Stdout(Bytes),
    /// Bytes read from stderr.
    Stderr(Bytes),
    /// Final event: the process terminated with this code (`-1` if killed).
    Exit {
        /// Exit code.
        code: i32,
    },
    /// Read failure, timeout or cancellation; always followed by `Exit`.
    Error(String),
}

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Maximum concurrently running processes.
    pub max_concurrent: usize,
    /// Per-attempt timeout when a command sets none.
    pub default_timeout: Duration,
    /// Extra attempts for retryable exit codes.
    pub retry_count: u32,
    /// Delay between attempts.
    pub retry_delay: Duration,
    /// Exit codes that trigger a retry.
    pub retry_on_exit_codes: Vec<i32>,
    /// Environment applied to every command before its own overrides.
    pub default_env: Vec<(String, String)>,
    /// Working directory for commands that set none.
    pub working_dir: Option<PathBuf>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            default_timeout: DEFAULT_TIMEOUT,
            retry_count: 0,
            retry_delay: Duration::from_millis(500),
            retry_on_exit_codes: Vec::new(),
            default_env: Vec::new(),
            working_dir: None,
        }
    }
}

impl ExecutorOptions {
    /// Set the concurrency cap; values `<= 0` fall back to [`DEFAULT_MAX_CONCURRENT`].
    #[must_use]
    pub fn max_concurrent(mut self, max: i64) -> Self {
        self.max_concurrent = usize::try_from(max)
            .ok()
            .filter(|m| *m > 0)
            .unwrap_or(DEFAULT_MAX_CONCURRENT);
        self
    }

    /// Set the default timeout; zero keeps [`DEFAULT_TIMEOUT`].
    #[must_use]
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = if timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            timeout
        };
        self
    }

    /// Configure retries; a negative count clamps to 0.
    #[must_use]
    pub fn retry(mut self, count: i64, delay: Duration, exit_codes: Vec<i32>) -> Self {
        self.retry_count = u32::try_from(count.max(0)).unwrap_or(u32::MAX);
        self.retry_delay = delay;
        self.retry_on_exit_codes = exit_codes;
        self
    }
}

/// Live-process counters, shared by every execution path that holds a slot.
#[derive(Debug, Default)]
struct ExecStats {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ExecStats {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(Arc::clone(self))
    }
}

struct InFlightGuard(Arc<ExecStats>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shared command executor. Cloning shares the semaphore and process table.
#[derive(Clone)]
pub struct CommandExecutor {
    options: Arc<ExecutorOptions>,
    semaphore: Arc<Semaphore>,
    stats: Arc<ExecStats>,
    processes: Arc<ProcessTable>,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new(ExecutorOptions::default())
    }
}

impl CommandExecutor {
    /// Create an executor. A zero `max_concurrent` falls back to the floor.
    #[must_use]
    pub fn new(mut options: ExecutorOptions) -> Self {
        if options.max_concurrent == 0 {
            options.max_concurrent = DEFAULT_MAX_CONCURRENT;
        }
        if options.default_timeout.is_zero() {
            options.default_timeout = DEFAULT_TIMEOUT;
        }
        let semaphore = Arc::new(Semaphore::new(options.max_concurrent));
        Self {
            options: Arc::new(options),
            semaphore,
            stats: Arc::new(ExecStats::default()),
            processes: Arc::new(ProcessTable::default()),
        }
    }

    /// Effective options.
    #[must_use]
    pub fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Processes currently running under an execution slot.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.stats.in_flight.load(Ordering::SeqCst)
    }

    /// Highest [`in_flight`](Self::in_flight) value observed so far.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.stats.peak.load(Ordering::SeqCst)
    }

    /// Run a command to completion and capture its output.
    ///
    /// Holds one execution slot for the whole attempt sequence. Non-zero
    /// exits are returned as `Ok` with [`ExecResult::exit_code`] set; only
    /// exit codes listed in `retry_on_exit_codes` are retried.
    ///
    /// # Errors
    ///
    /// - `AppError::ConcurrencyLimit` if cancelled while waiting for a slot.
    /// - `AppError::Timeout` if an attempt exceeds its timeout or is
    ///   cancelled while running (the process is killed; no retry).
    /// - `AppError::ExternalService` if the program cannot be spawned.
    pub async fn execute(&self, cmd: Command) -> Result<ExecResult> {
        let _permit = self.acquire(&cmd).await?;
        let max_attempts = self.options.retry_count.saturating_add(1);
        debug!(command = %cmd.describe(), "executing command");

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut result = self.run_once(&cmd).await?;
            result.attempts = attempt;

            let retryable = !result.success()
                && self.options.retry_on_exit_codes.contains(&result.exit_code);
            if !retryable || attempt >= max_attempts {
                if !result.success() {
                    debug!(
                        command = %cmd.describe(),
                        exit_code = result.exit_code,
                        attempts = attempt,
                        "command failed"
                    );
                }
                return Ok(result);
            }

            info!(
                command = %cmd.describe(),
                exit_code = result.exit_code,
                attempt = attempt + 1,
                max_attempts,
                "retrying command"
            );
            tokio::select! {
                () = tokio::time::sleep(self.options.retry_delay) => {}
                () = wait_cancelled(cmd.cancel.as_ref()) => {
                    return Err(AppError::Timeout(format!(
                        "{} cancelled between retries",
                        cmd.program
                    )));
                }
            }
        }
    }

    /// [`execute`](Self::execute) with `input` as stdin.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    pub async fn execute_with_input(&self, cmd: Command, input: impl Into<Bytes>) -> Result<ExecResult> {
        self.execute(cmd.stdin(input)).await
    }

    /// Run a command attached to the caller's terminal and wait for it.
    ///
    /// Bypasses the execution slots: a human-driven process can run for
    /// hours and must not starve background commands. Only a timeout set on
    /// the command itself applies.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalService` if the program cannot be spawned
    /// or waited on, `AppError::Timeout` if its own timeout expires.
    pub async fn execute_foreground(&self, cmd: Command) -> Result<i32> {
        let mut child = self
            .build(&cmd)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| AppError::external(&format!("failed to spawn {}", cmd.program), err))?;

        let status = match cmd.timeout.filter(|t| !t.is_zero()) {
            Some(limit) => tokio::time::timeout(limit, child.wait())
                .await
                .map_err(|_| AppError::Timeout(format!("{} exceeded {limit:?}", cmd.program)))?,
            None => child.wait().await,
        }
        .map_err(|err| AppError::external(&format!("failed to wait for {}", cmd.program), err))?;

        Ok(status.code().unwrap_or(-1))
    }

    /// Whether `program` resolves on `PATH`.
    #[must_use]
    pub fn command_exists(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }

    /// Resolve `program` on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the program is not on `PATH`.
    pub fn which(&self, program: &str) -> Result<PathBuf> {
        which::which(program).map_err(|err| AppError::NotFound(format!("{program}: {err}")))
    }

    /// Environment inherited by spawned commands, including default overrides.
    #[must_use]
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut vars: Vec<(String, String)> = std::env::vars().collect();
        for (key, value) in &self.options.default_env {
            vars.retain(|(k, _)| k != key);
            vars.push((key.clone(), value.clone()));
        }
        vars
    }

    /// Working directory used for commands that set none.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the process working directory is unreadable.
    pub fn working_directory(&self) -> Result<PathBuf> {
        match &self.options.working_dir {
            Some(dir) => Ok(dir.clone()),
            None => std::env::current_dir()
                .map_err(|err| AppError::Io(format!("cannot read working directory: {err}"))),
        }
    }

    /// Wait for a slot, bounded by the command's timeout and cancel token.
    async fn acquire(&self, cmd: &Command) -> Result<OwnedSemaphorePermit> {
        let semaphore = Arc::clone(&self.semaphore);
        let limit = self.timeout_for(cmd);
        tokio::select! {
            permit = semaphore.acquire_owned() => permit
                .map_err(|_| AppError::ConcurrencyLimit("executor is shut down".into())),
            () = wait_cancelled(cmd.cancel.as_ref()) => Err(AppError::ConcurrencyLimit(format!(
                "cancelled while waiting for an execution slot for {}",
                cmd.program
            ))),
            () = tokio::time::sleep(limit) => Err(AppError::Timeout(format!(
                "no execution slot for {} within {}ms",
                cmd.program,
                limit.as_millis()
            ))),
        }
    }

    fn timeout_for(&self, cmd: &Command) -> Duration {
        cmd.timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(self.options.default_timeout)
    }

    fn build(&self, cmd: &Command) -> tokio::process::Command {
        let mut proc = tokio::process::Command::new(&cmd.program);
        proc.args(&cmd.args);
        for (key, value) in self.options.default_env.iter().chain(cmd.env.iter()) {
            proc.env(key, value);
        }
        if let Some(dir) = cmd.current_dir.as_ref().or(self.options.working_dir.as_ref()) {
            proc.current_dir(dir);
        }
        proc.kill_on_drop(true);
        proc
    }

    fn spawn_piped(&self, cmd: &Command) -> Result<Child> {
        let stdin = if cmd.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        let mut child = self
            .build(cmd)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| AppError::external(&format!("failed to spawn {}", cmd.program), err))?;

        if let (Some(input), Some(mut writer)) = (cmd.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(err) = writer.write_all(&input).await {
                    debug!(%err, "child stdin closed before input was written");
                }
            });
        }
        Ok(child)
    }

    async fn run_once(&self, cmd: &Command) -> Result<ExecResult> {
        let child = self.spawn_piped(cmd)?;
        let _running = self.stats.enter();
        let started = Instant::now();
        let limit = self.timeout_for(cmd);

        // Dropping the `wait_with_output` future drops the child, and
        // `kill_on_drop` terminates it.
        let waited = tokio::select! {
            res = tokio::time::timeout(limit, child.wait_with_output()) => res,
            () = wait_cancelled(cmd.cancel.as_ref()) => {
                warn!(command = %cmd.describe(), "command cancelled; process killed");
                return Err(AppError::Timeout(format!("{} cancelled", cmd.program)));
            }
        };

        let output = match waited {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                return Err(AppError::external(
                    &format!("failed to wait for {}", cmd.program),
                    err,
                ))
            }
            Err(_elapsed) => {
                warn!(command = %cmd.describe(), ?limit, "command timed out; process killed");
                return Err(AppError::Timeout(format!(
                    "{} exceeded {limit:?}",
                    cmd.describe()
                )));
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let error = (!output.status.success()).then(|| match output.status.code() {
            Some(code) => format!("exited with code {code}"),
            None => "terminated by signal".to_owned(),
        });

        Ok(ExecResult {
            stdout: Bytes::from(output.stdout),
            stderr: Bytes::from(output.stderr),
            exit_code,
            duration: started.elapsed(),
            error,
            attempts: 1,
        })
    }
}

/// Resolve when `token` is cancelled; never resolve without a token.
pub(crate) async fn wait_cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

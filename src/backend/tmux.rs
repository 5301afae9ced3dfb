//! `tmux` implementation of [`ProcessBackend`].

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::ProcessBackend;
use crate::executor::{Command, CommandExecutor, ExecResult};
use crate::models::session::Dimensions;
use crate::{AppError, Result};

/// Prefix marking tmux sessions owned by this tool.
pub const SESSION_PREFIX: &str = "agentsquad_";

const TMUX_TIMEOUT: Duration = Duration::from_secs(10);

/// Map a session name to a valid, prefixed tmux session name.
///
/// Whitespace is removed and `.`/`:` (tmux target separators) become `_`.
/// Already-prefixed names are returned unchanged.
#[must_use]
pub fn tmux_name(name: &str) -> String {
    let cleaned: String = name
        .split_whitespace()
        .collect::<String>()
        .replace(['.', ':'], "_");
    if cleaned.starts_with(SESSION_PREFIX) {
        cleaned
    } else {
        format!("{SESSION_PREFIX}{cleaned}")
    }
}

fn missing_session(result: &ExecResult) -> bool {
    let stderr = result.stderr_str();
    stderr.contains("can't find session")
        || stderr.contains("no server running")
        || stderr.contains("error connecting")
}

/// Runs `tmux` through a shared [`CommandExecutor`].
#[derive(Clone)]
pub struct TmuxBackend {
    executor: CommandExecutor,
}

impl TmuxBackend {
    /// Create an adapter sharing `executor`'s concurrency budget.
    #[must_use]
    pub fn new(executor: CommandExecutor) -> Self {
        Self { executor }
    }

    async fn tmux(&self, args: &[&str]) -> Result<ExecResult> {
        let cmd = Command::new("tmux")
            .args(args.iter().copied())
            .timeout(TMUX_TIMEOUT);
        self.executor.execute(cmd).await
    }

    async fn run(&self, args: &[&str], context: &str) -> Result<String> {
        let result = self.tmux(args).await?.ensure_success(context)?;
        Ok(result.stdout_str())
    }

    async fn exists(&self, target: &str) -> Result<bool> {
        Ok(self.tmux(&["has-session", "-t", target]).await?.success())
    }

    async fn capture(&self, name: &str, scrollback: bool) -> Result<String> {
        let target = tmux_name(name);
        let mut args = vec!["capture-pane", "-p", "-t", target.as_str()];
        if scrollback {
            args.extend(["-S", "-"]);
        }
        self.run(&args, &format!("capture-pane {target}")).await
    }
}

impl ProcessBackend for TmuxBackend {
    fn create_session<'a>(
        &'a self,
        name: &'a str,
        work_dir: &'a Path,
        command: &'a str,
        dimensions: Dimensions,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let target = tmux_name(name);
            if self.exists(&target).await? {
                return Err(AppError::ExternalService(format!(
                    "tmux session already exists: {target}"
                )));
            }

            let dir = work_dir.to_string_lossy().into_owned();
            let width = dimensions.width.to_string();
            let height = dimensions.height.to_string();
            let mut args = vec![
                "new-session",
                "-d",
                "-s",
                target.as_str(),
                "-c",
                dir.as_str(),
                "-x",
                width.as_str(),
                "-y",
                height.as_str(),
            ];
            if !command.trim().is_empty() {
                args.push(command);
            }
            self.run(&args, &format!("new-session {target}")).await?;
            info!(session = %target, dir = %work_dir.display(), "tmux session started");
            Ok(())
        })
    }

    fn kill_session<'a>(&'a self, name: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let target = tmux_name(name);
            let result = self.tmux(&["kill-session", "-t", target.as_str()]).await?;
            if result.success() {
                debug!(session = %target, "tmux session killed");
                return Ok(());
            }
            if missing_session(&result) {
                debug!(session = %target, "tmux session already gone");
                return Ok(());
            }
            result.ensure_success(&format!("kill-session {target}")).map(drop)
        })
    }

    fn session_exists<'a>(&'a self, name: &'a str) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move { self.exists(&tmux_name(name)).await })
    }

    fn send_keys<'a>(&'a self, name: &'a str, text: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let target = tmux_name(name);
            let mut lines = text.split('\n').peekable();
            while let Some(line) = lines.next() {
                if !line.is_empty() {
                    self.run(
                        &["send-keys", "-t", target.as_str(), "-l", line],
                        &format!("send-keys {target}"),
                    )
                    .await?;
                }
                if lines.peek().is_some() {
                    self.run(
                        &["send-keys", "-t", target.as_str(), "Enter"],
                        &format!("send-keys {target}"),
                    )
                    .await?;
                }
            }
            Ok(())
        })
    }

    fn capture_pane<'a>(&'a self, name: &'a str) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(self.capture(name, false))
    }

    fn capture_scrollback<'a>(&'a self, name: &'a str) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(self.capture(name, true))
    }

    fn attach_session<'a>(&'a self, name: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let target = tmux_name(name);
            if !self.exists(&target).await? {
                return Err(AppError::ExternalService(format!(
                    "tmux session does not exist: {target}"
                )));
            }
            let code = self
                .executor
                .execute_foreground(Command::new("tmux").args(["attach-session", "-t", target.as_str()]))
                .await?;
            if code != 0 {
                return Err(AppError::ExternalService(format!(
                    "tmux attach-session {target} exited with code {code}"
                )));
            }
            Ok(())
        })
    }

    fn cleanup_sessions(&self) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + '_>> {
        Box::pin(async move {
            let result = self.tmux(&["ls", "-F", "#{session_name}"]).await?;
            if !result.success() {
                let stderr = result.stderr_str();
                if stderr.contains("no server running") || stderr.contains("no sessions") {
                    return Ok(0);
                }
                result.ensure_success("tmux ls")?;
                return Ok(0);
            }

            let mut killed = 0;
            for name in result
                .stdout_str()
                .lines()
                .map(str::trim)
                .filter(|name| name.starts_with(SESSION_PREFIX))
            {
                match self.kill_session(name).await {
                    Ok(()) => killed += 1,
                    Err(err) => warn!(%err, session = name, "failed to kill tmux session"),
                }
            }
            info!(killed, "tmux sessions cleaned up");
            Ok(killed)
        })
    }
}

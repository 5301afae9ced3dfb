//! Interactive execution: live stdin plus a tagged output stream.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use super::streaming::{spawn_readers, supervise};
use super::{Command, CommandExecutor, Output, STREAM_BUFFER};
use crate::{AppError, Result};

/// A running process with writable stdin and a tagged output stream.
///
/// Stdout and stderr arrive on one channel as [`Output::Stdout`] and
/// [`Output::Stderr`] in the order each reader observed them, followed by
/// a single [`Output::Exit`]. Dropping the session kills the process.
pub struct InteractiveSession {
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    output: mpsc::Receiver<Output>,
    kill: CancellationToken,
    waiter: Option<JoinHandle<i32>>,
}

impl InteractiveSession {
    /// OS process id, if the process was still alive when spawned.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Forward bytes to the process's stdin.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if stdin was closed or the pipe is broken.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| AppError::Io("stdin already closed".into()))?;
        stdin
            .write_all(data)
            .await
            .map_err(|err| AppError::Io(format!("stdin write failed: {err}")))?;
        stdin
            .flush()
            .await
            .map_err(|err| AppError::Io(format!("stdin flush failed: {err}")))
    }

    /// Close stdin so the process sees end-of-file.
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Next output chunk; `None` once the `Exit` event has been consumed.
    pub async fn recv(&mut self) -> Option<Output> {
        self.output.recv().await
    }

    /// Kill the process (if still running) and return its exit code.
    ///
    /// Undelivered output is discarded.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the supervising task panicked.
    pub async fn close(mut self) -> Result<i32> {
        self.stdin = None;
        self.output.close();
        self.kill.cancel();
        match self.waiter.take() {
            Some(waiter) => waiter
                .await
                .map_err(|err| AppError::Io(format!("interactive supervisor failed: {err}"))),
            None => Ok(-1),
        }
    }
}

impl Drop for InteractiveSession {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

impl CommandExecutor {
    /// Start a process with stdin, stdout and stderr connected.
    ///
    /// Interactive sessions do not take an execution slot; they are driven
    /// by a human and may live for hours. A timeout set on the command (or
    /// its cancellation token) still kills the process.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalService` if the program cannot be spawned.
    pub fn execute_interactive(&self, cmd: &Command) -> Result<InteractiveSession> {
        let mut child = self
            .build(cmd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| AppError::external(&format!("failed to spawn {}", cmd.program), err))?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let readers = spawn_readers(&mut child, &tx)?;

        let kill = cmd
            .cancel
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);
        let limit = cmd.timeout.filter(|t| !t.is_zero());
        let span = tracing::debug_span!("interactive_command", program = %cmd.program, ?pid);
        let token = kill.clone();
        let waiter = tokio::spawn(
            async move {
                let code = supervise(child, readers, tx, limit, Some(token), None).await;
                debug!(code, "interactive command finished");
                code
            }
            .instrument(span),
        );

        Ok(InteractiveSession {
            pid,
            stdin,
            output: rx,
            kill,
            waiter: Some(waiter),
        })
    }
}

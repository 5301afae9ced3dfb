//! Streaming execution: stdout/stderr chunks delivered as they arrive.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use super::{wait_cancelled, Command, CommandExecutor, Output};
use crate::{AppError, Result};

/// Capacity of the output channel returned by streaming execution.
pub const STREAM_BUFFER: usize = 100;

const READ_CHUNK: usize = 4096;

impl CommandExecutor {
    /// Start a command and stream its output.
    ///
    /// One reader task per stream forwards [`Output::Stdout`] and
    /// [`Output::Stderr`] chunks in arrival order. Once the process has
    /// terminated and both readers have drained, a single [`Output::Exit`]
    /// is sent and the channel closes. Timeouts and cancellation kill the
    /// process and emit [`Output::Error`] before `Exit`.
    ///
    /// **Backpressure:** the channel holds [`STREAM_BUFFER`] chunks. A
    /// consumer that stops reading stalls the readers, which stalls the
    /// process once its pipe fills, and delays the `Exit` event. Always
    /// drain to completion or drop the receiver; dropping it kills the
    /// process.
    ///
    /// # Errors
    ///
    /// - `AppError::ConcurrencyLimit` if cancelled while waiting for a slot.
    /// - `AppError::ExternalService` if the program cannot be spawned.
    pub async fn execute_streaming(&self, cmd: Command) -> Result<mpsc::Receiver<Output>> {
        let permit = self.acquire(&cmd).await?;
        let mut child = self.spawn_piped(&cmd)?;
        let running = self.stats.enter();

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let readers = spawn_readers(&mut child, &tx)?;
        let limit = Some(self.timeout_for(&cmd));
        let cancel = cmd.cancel.clone();
        let span = tracing::debug_span!("stream_command", program = %cmd.program);

        tokio::spawn(
            async move {
                let code = supervise(child, readers, tx, limit, cancel, Some(permit)).await;
                drop(running);
                debug!(code, "streaming command finished");
            }
            .instrument(span),
        );

        Ok(rx)
    }
}

/// Take the child's stdout/stderr and spawn one forwarding task for each.
pub(super) fn spawn_readers(
    child: &mut Child,
    tx: &mpsc::Sender<Output>,
) -> Result<[JoinHandle<()>; 2]> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Io("failed to capture child stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Io("failed to capture child stderr".into()))?;

    Ok([
        tokio::spawn(pump(stdout, tx.clone(), Output::Stdout)),
        tokio::spawn(pump(stderr, tx.clone(), Output::Stderr)),
    ])
}

async fn pump<R>(mut reader: R, tx: mpsc::Sender<Output>, tag: fn(Bytes) -> Output)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0_u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(tag(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                let _ = tx.send(Output::Error(format!("read failed: {err}"))).await;
                break;
            }
        }
    }
}

enum Finish {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut(Duration),
    Cancelled,
    Abandoned,
}

/// Wait for the child under a deadline, join the readers, then emit the
/// final events. Returns the exit code (`-1` if the process was killed).
///
/// `permit` is held until the readers have drained.
pub(super) async fn supervise(
    mut child: Child,
    readers: [JoinHandle<()>; 2],
    tx: mpsc::Sender<Output>,
    limit: Option<Duration>,
    cancel: Option<CancellationToken>,
    permit: Option<OwnedSemaphorePermit>,
) -> i32 {
    let finish = tokio::select! {
        res = wait_with_limit(&mut child, limit) => res,
        () = wait_cancelled(cancel.as_ref()) => Finish::Cancelled,
        () = tx.closed() => Finish::Abandoned,
    };

    let (code, error, needs_kill) = match finish {
        Finish::Exited(Ok(status)) => (status.code().unwrap_or(-1), None, false),
        Finish::Exited(Err(err)) => (-1, Some(format!("wait failed: {err}")), true),
        Finish::TimedOut(limit) => (-1, Some(format!("timed out after {limit:?}")), true),
        Finish::Cancelled => (-1, Some("cancelled".to_owned()), true),
        Finish::Abandoned => (-1, None, true),
    };

    if needs_kill {
        if let Err(err) = child.kill().await {
            debug!(%err, "kill after abnormal finish failed; process already gone");
        }
    }

    for reader in readers {
        if let Err(err) = reader.await {
            warn!(%err, "output reader task failed");
        }
    }
    drop(permit);

    if let Some(message) = error {
        let _ = tx.send(Output::Error(message)).await;
    }
    let _ = tx.send(Output::Exit { code }).await;
    code
}

async fn wait_with_limit(child: &mut Child, limit: Option<Duration>) -> Finish {
    match limit {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(res) => Finish::Exited(res),
            Err(_) => Finish::TimedOut(limit),
        },
        None => Finish::Exited(child.wait().await),
    }
}

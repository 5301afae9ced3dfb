//! Detached, explicitly managed processes.
//!
//! [`CommandExecutor::start`] registers a process in a table keyed by
//! [`HandleId`] and returns an owning [`ProcessHandle`]. The entry lives
//! exactly as long as the handle: [`ProcessHandle::wait`] and
//! [`ProcessHandle::dispose`] remove it, and so does dropping the handle.
//! Removal drops the last reference to the child, and `kill_on_drop`
//! terminates a process that is still running.
//!
//! The table's lock is never held across an await and is disjoint from
//! every orchestrator lock.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Command, CommandExecutor, ExecResult};
use crate::{AppError, Result};

/// Key of a process table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HandleId(u64);

impl Display for HandleId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "proc-{}", self.0)
    }
}

/// Observed state of a detached process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Running normally.
    Running,
    /// Suspended with `SIGSTOP`.
    Stopped,
    /// Killed through the table.
    Exited,
    /// Exited on its own, but its handle has not been waited on or disposed.
    Zombie,
}

/// Snapshot of a process table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    /// Table key.
    pub handle: HandleId,
    /// OS process id.
    pub pid: Option<u32>,
    /// Program that was started.
    pub program: String,
    /// Its arguments.
    pub args: Vec<String>,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Last observed state.
    pub state: ProcessState,
}

struct Entry {
    child: Arc<tokio::sync::Mutex<Child>>,
    kill: CancellationToken,
    info: ProcessInfo,
}

impl Entry {
    /// Detect a process that exited while nobody was waiting on it.
    fn refresh(&mut self) {
        if !matches!(self.info.state, ProcessState::Running | ProcessState::Stopped) {
            return;
        }
        // A held lock means a waiter owns the child; it reports the exit.
        if let Ok(mut child) = self.child.try_lock() {
            if let Ok(Some(_)) = child.try_wait() {
                self.info.state = ProcessState::Zombie;
            }
        }
    }
}

/// Registry of detached processes.
#[derive(Default)]
pub(super) struct ProcessTable {
    next: AtomicU64,
    entries: Mutex<HashMap<HandleId, Entry>>,
}

impl ProcessTable {
    fn entries(&self) -> MutexGuard<'_, HashMap<HandleId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, child: Child, cmd: &Command) -> (HandleId, Arc<tokio::sync::Mutex<Child>>, CancellationToken) {
        let id = HandleId(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        let info = ProcessInfo {
            handle: id,
            pid: child.id(),
            program: cmd.program.clone(),
            args: cmd.args.clone(),
            started_at: Utc::now(),
            state: ProcessState::Running,
        };
        let child = Arc::new(tokio::sync::Mutex::new(child));
        let kill = CancellationToken::new();
        self.entries().insert(
            id,
            Entry {
                child: Arc::clone(&child),
                kill: kill.clone(),
                info,
            },
        );
        (id, child, kill)
    }

    fn remove(&self, id: HandleId) -> bool {
        self.entries().remove(&id).is_some()
    }

    fn set_state(&self, id: HandleId, state: ProcessState) {
        if let Some(entry) = self.entries().get_mut(&id) {
            entry.info.state = state;
        }
    }

    fn info(&self, id: HandleId) -> Option<ProcessInfo> {
        self.entries().get_mut(&id).map(|entry| {
            entry.refresh();
            entry.info.clone()
        })
    }

    fn snapshot(&self) -> Vec<ProcessInfo> {
        let mut all: Vec<ProcessInfo> = self
            .entries()
            .values_mut()
            .map(|entry| {
                entry.refresh();
                entry.info.clone()
            })
            .collect();
        all.sort_by_key(|info| info.handle);
        all
    }

    fn kill(&self, id: HandleId) -> Result<()> {
        let mut entries = self.entries();
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("process {id}")))?;
        entry.kill.cancel();
        if let Ok(mut child) = entry.child.try_lock() {
            if let Err(err) = child.start_kill() {
                debug!(%err, handle = %id, "kill on already finished process");
            }
        }
        entry.info.state = ProcessState::Exited;
        Ok(())
    }

    fn pid(&self, id: HandleId) -> Result<Option<u32>> {
        self.entries()
            .get(&id)
            .map(|entry| entry.info.pid)
            .ok_or_else(|| AppError::NotFound(format!("process {id}")))
    }
}

/// Owning reference to a detached process.
///
/// Dropping the handle removes the table entry and kills the process if it
/// is still running.
pub struct ProcessHandle {
    id: HandleId,
    pid: Option<u32>,
    child: Arc<tokio::sync::Mutex<Child>>,
    kill: CancellationToken,
    table: Arc<ProcessTable>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    /// Table key.
    #[must_use]
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// OS process id.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current table snapshot for this process.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the entry was removed.
    pub fn info(&self) -> Result<ProcessInfo> {
        self.table
            .info(self.id)
            .ok_or_else(|| AppError::NotFound(format!("process {}", self.id)))
    }

    /// Kill the process. The entry stays until the handle is waited on or
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the entry was removed.
    pub fn kill(&self) -> Result<()> {
        self.table.kill(self.id)
    }

    /// Deliver a signal. `SIGSTOP` and `SIGCONT` update the recorded state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the process has no pid, or
    /// `AppError::ExternalService` if delivery fails.
    #[cfg(unix)]
    pub fn signal(&self, signal: nix::sys::signal::Signal) -> Result<()> {
        send_signal(&self.table, self.id, signal)
    }

    /// Wait for the process to exit and remove its entry.
    ///
    /// Output of detached processes is not captured; `stdout` and `stderr`
    /// are empty.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalService` if waiting fails.
    pub async fn wait(self) -> Result<ExecResult> {
        let started = Instant::now();
        let status = {
            let mut child = self.child.lock().await;
            tokio::select! {
                status = child.wait() => status,
                () = self.kill.cancelled() => {
                    if let Err(err) = child.start_kill() {
                        debug!(%err, handle = %self.id, "process already finished before kill");
                    }
                    child.wait().await
                }
            }
        }
        .map_err(|err| AppError::external(&format!("failed to wait for {}", self.id), err))?;

        let exit_code = status.code().unwrap_or(-1);
        debug!(handle = %self.id, exit_code, "detached process reaped");
        Ok(ExecResult {
            stdout: Bytes::new(),
            stderr: Bytes::new(),
            exit_code,
            duration: started.elapsed(),
            error: (!status.success()).then(|| format!("exited with {status}")),
            attempts: 1,
        })
    }

    /// Remove the entry now, killing the process if it is still running.
    pub fn dispose(self) {
        drop(self);
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.table.remove(self.id) {
            debug!(handle = %self.id, "process handle released");
        }
    }
}

#[cfg(unix)]
fn send_signal(table: &ProcessTable, id: HandleId, signal: nix::sys::signal::Signal) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = table
        .pid(id)?
        .ok_or_else(|| AppError::NotFound(format!("process {id} has no pid")))?;
    let raw = i32::try_from(pid)
        .map_err(|_| AppError::Validation(format!("pid {pid} out of range")))?;
    kill(Pid::from_raw(raw), signal)
        .map_err(|err| AppError::external(&format!("failed to signal {id}"), err))?;

    match signal {
        Signal::SIGSTOP => table.set_state(id, ProcessState::Stopped),
        Signal::SIGCONT => table.set_state(id, ProcessState::Running),
        _ => {}
    }
    Ok(())
}

impl CommandExecutor {
    /// Start a detached process outside the bounded-concurrency path.
    ///
    /// Stdio is connected to the null device.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalService` if the program cannot be spawned.
    pub fn start(&self, cmd: &Command) -> Result<ProcessHandle> {
        let child = self
            .build(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| AppError::external(&format!("failed to spawn {}", cmd.program), err))?;

        let pid = child.id();
        let (id, child, kill) = self.processes.insert(child, cmd);
        info!(handle = %id, ?pid, command = %cmd.describe(), "detached process started");
        Ok(ProcessHandle {
            id,
            pid,
            child,
            kill,
            table: Arc::clone(&self.processes),
        })
    }

    /// Kill a tracked process by handle id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown handle.
    pub fn kill(&self, id: HandleId) -> Result<()> {
        self.processes.kill(id)
    }

    /// Signal a tracked process by handle id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown handle, or
    /// `AppError::ExternalService` if delivery fails.
    #[cfg(unix)]
    pub fn signal(&self, id: HandleId, signal: nix::sys::signal::Signal) -> Result<()> {
        send_signal(&self.processes, id, signal)
    }

    /// Wait for a detached process and release its entry.
    ///
    /// # Errors
    ///
    /// Same as [`ProcessHandle::wait`].
    pub async fn wait(&self, handle: ProcessHandle) -> Result<ExecResult> {
        handle.wait().await
    }

    /// Release a handle without waiting.
    pub fn dispose(&self, handle: ProcessHandle) {
        handle.dispose();
    }

    /// Snapshot of one tracked process.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown handle.
    pub fn get_process_info(&self, id: HandleId) -> Result<ProcessInfo> {
        self.processes
            .info(id)
            .ok_or_else(|| AppError::NotFound(format!("process {id}")))
    }

    /// Snapshots of every tracked process, ordered by handle.
    #[must_use]
    pub fn list_processes(&self) -> Vec<ProcessInfo> {
        self.processes.snapshot()
    }

    /// Look up a tracked process by OS pid.
    #[must_use]
    pub fn find_process(&self, pid: u32) -> Option<ProcessInfo> {
        self.processes
            .snapshot()
            .into_iter()
            .find(|info| info.pid == Some(pid))
    }
}

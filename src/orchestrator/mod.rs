//! Session orchestration across workspace, terminal backend and storage.
//!
//! [`SessionOrchestrator`] owns the in-memory session cache and is the
//! only writer of session records. Lifecycle operations live in
//! [`lifecycle`]; this module holds construction, reads and I/O proxying.
//!
//! Locking: a per-session async mutex ([`SessionLocks`]) serialises every
//! multi-service operation on one ID. The cache lock is taken after the
//! session lock, never before, and is only held across a store read when
//! reconciling the cache with storage.

mod lifecycle;
pub mod session_locks;

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::backend::ProcessBackend;
use crate::models::session::{Dimensions, Session};
use crate::models::workspace::DiffStats;
use crate::persistence::{SessionFilter, SessionStore};
use crate::workspace::WorkspaceService;
use crate::{AppError, Result};

pub use lifecycle::SESSION_BRANCH_PREFIX;
pub use session_locks::SessionLocks;

const EVENT_CAPACITY: usize = 256;

/// Orchestrator tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Delay before a `Loading` session is promoted to `Ready`.
    pub ready_grace: Duration,
    /// Root for isolated workspaces; `None` places them beside the repository.
    pub worktree_dir: Option<PathBuf>,
    /// Terminal size used when a request sets none.
    pub default_dimensions: Dimensions,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            ready_grace: Duration::from_secs(2),
            worktree_dir: None,
            default_dimensions: Dimensions::default(),
        }
    }
}

/// Lifecycle notifications, including failures of background tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session was created and is `Loading`.
    Created {
        /// Session identifier.
        session_id: String,
    },
    /// A session was promoted to `Ready` after its grace interval.
    Ready {
        /// Session identifier.
        session_id: String,
    },
    /// A session was paused.
    Paused {
        /// Session identifier.
        session_id: String,
    },
    /// A paused session was resumed.
    Resumed {
        /// Session identifier.
        session_id: String,
    },
    /// A session was stopped and its record deleted.
    Stopped {
        /// Session identifier.
        session_id: String,
    },
    /// A background task for a session failed.
    TaskFailed {
        /// Session identifier.
        session_id: String,
        /// Task name.
        task: &'static str,
        /// Error description.
        error: String,
    },
}

struct Inner {
    workspace: Arc<dyn WorkspaceService>,
    backend: Arc<dyn ProcessBackend>,
    store: Arc<dyn SessionStore>,
    cache: RwLock<SessionCache>,
    locks: SessionLocks,
    settings: OrchestratorSettings,
    tasks: TaskTracker,
    cancel: CancellationToken,
    events: broadcast::Sender<SessionEvent>,
}

#[derive(Default)]
struct SessionCache {
    sessions: HashMap<String, Session>,
    /// Set once the cache mirrors the full store contents.
    complete: bool,
}

/// Stateful coordinator of session lifecycles. Cloning shares all state.
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

impl SessionOrchestrator {
    /// Build an orchestrator over the three external services.
    #[must_use]
    pub fn new(
        workspace: Arc<dyn WorkspaceService>,
        backend: Arc<dyn ProcessBackend>,
        store: Arc<dyn SessionStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                workspace,
                backend,
                store,
                cache: RwLock::new(SessionCache::default()),
                locks: SessionLocks::new(),
                settings,
                tasks: TaskTracker::new(),
                cancel: CancellationToken::new(),
                events,
            }),
        }
    }

    /// Effective settings.
    #[must_use]
    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    /// Receive lifecycle and background-task events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Cancel pending readiness timers and wait for in-flight lifecycle
    /// operations to finish.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("orchestrator shut down");
    }

    /// Fetch a session, cache first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown ID, or
    /// `AppError::Persistence` if the store read fails.
    pub async fn get_session(&self, id: &str) -> Result<Session> {
        if let Some(session) = self.inner.cache.read().await.sessions.get(id) {
            return Ok(session.clone());
        }

        // Re-check and read through under the write lock so a concurrent
        // stop cannot be undone by a stale store read.
        let mut cache = self.inner.cache.write().await;
        if let Some(session) = cache.sessions.get(id) {
            return Ok(session.clone());
        }
        let session = self.inner.store.get(id).await.map_err(persistence)?;
        cache.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    /// Fetch the oldest session with this title.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no session has this title, or
    /// `AppError::Persistence` if the store read fails.
    pub async fn get_session_by_title(&self, title: &str) -> Result<Session> {
        self.list_sessions()
            .await?
            .into_iter()
            .find(|session| session.title == title)
            .ok_or_else(|| AppError::NotFound(format!("no session titled {title:?}")))
    }

    /// All sessions, oldest first. Served from the cache once it has been
    /// filled from the store.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if the store read fails.
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        {
            let cache = self.inner.cache.read().await;
            if cache.complete {
                return Ok(sorted(cache.sessions.values().cloned().collect()));
            }
        }
        self.refresh_sessions().await
    }

    /// Reload the cache from the store, picking up records written by other
    /// processes and dropping records deleted elsewhere.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if the store read fails; the cache
    /// is left unchanged.
    pub async fn refresh_sessions(&self) -> Result<Vec<Session>> {
        let mut cache = self.inner.cache.write().await;
        let stored = self
            .inner
            .store
            .list(&SessionFilter::all())
            .await
            .map_err(persistence)?;
        cache.sessions = stored
            .iter()
            .map(|session| (session.id.clone(), session.clone()))
            .collect();
        cache.complete = true;
        debug!(count = stored.len(), "session cache reloaded");
        Ok(stored)
    }

    /// Attach the caller's terminal to the session's backend session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Precondition` unless the session is `Ready` or
    /// `Running`, or `AppError::ExternalService` if attaching fails.
    pub async fn attach_session(&self, id: &str) -> Result<()> {
        let session = self.io_session(id).await?;
        self.inner
            .backend
            .attach_session(&session.id)
            .await
            .map_err(|err| external("attach", err))
    }

    /// Type `text` into the session; `\n` submits.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Precondition` unless the session is `Ready` or
    /// `Running`, or `AppError::ExternalService` if delivery fails.
    pub async fn send_input(&self, id: &str, text: &str) -> Result<()> {
        let session = self.io_session(id).await?;
        self.inner
            .backend
            .send_keys(&session.id, text)
            .await
            .map_err(|err| external("send input", err))
    }

    /// Visible terminal contents of the session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Precondition` unless the session is `Ready` or
    /// `Running`, or `AppError::ExternalService` if capture fails.
    pub async fn get_output(&self, id: &str) -> Result<String> {
        let session = self.io_session(id).await?;
        self.inner
            .backend
            .capture_pane(&session.id)
            .await
            .map_err(|err| external("capture output", err))
    }

    /// Full scrollback of the session.
    ///
    /// # Errors
    ///
    /// Same as [`get_output`](Self::get_output).
    pub async fn get_scrollback(&self, id: &str) -> Result<String> {
        let session = self.io_session(id).await?;
        self.inner
            .backend
            .capture_scrollback(&session.id)
            .await
            .map_err(|err| external("capture scrollback", err))
    }

    /// Uncommitted changes in the session's workspace.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Precondition` while the session is paused, or
    /// `AppError::ExternalService` if the diff cannot be computed.
    pub async fn diff_session(&self, id: &str) -> Result<DiffStats> {
        let session = self.get_session(id).await?;
        let path = match (&session.workspace_path, session.status.is_live()) {
            (Some(path), true) => path.clone(),
            _ => {
                return Err(AppError::Precondition(format!(
                    "session {} has no workspace while {}",
                    session.short_id(),
                    session.status
                )))
            }
        };
        self.inner
            .workspace
            .diff_stats(&path)
            .await
            .map_err(|err| external("diff", err))
    }

    async fn io_session(&self, id: &str) -> Result<Session> {
        let session = self.get_session(id).await?;
        if !session.status.accepts_io() {
            return Err(AppError::Precondition(format!(
                "session {} is {}; input and output need ready or running",
                session.short_id(),
                session.status
            )));
        }
        Ok(session)
    }

    async fn cache_put(&self, session: Session) {
        self.inner
            .cache
            .write()
            .await
            .sessions
            .insert(session.id.clone(), session);
    }

    async fn cache_evict(&self, id: &str) {
        self.inner.cache.write().await.sessions.remove(id);
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    /// Run a lifecycle operation on a tracked task so that rollback
    /// completes even if the caller stops waiting.
    async fn run_tracked<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.inner
            .tasks
            .spawn(op)
            .await
            .map_err(|err| AppError::Io(format!("lifecycle task failed: {err}")))?
    }

    fn workspace_path_for(&self, repo: &Path, id: &str) -> PathBuf {
        match &self.inner.settings.worktree_dir {
            Some(dir) => dir.join(id),
            None => {
                let mut raw = repo.components().as_path().as_os_str().to_owned();
                raw.push(format!("-worktree-{id}"));
                PathBuf::from(raw)
            }
        }
    }
}

fn sorted(mut sessions: Vec<Session>) -> Vec<Session> {
    sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    sessions
}

/// Classify a workspace/backend failure. Timeouts and slot cancellation
/// keep their own kind.
fn external(context: &str, err: AppError) -> AppError {
    match err {
        AppError::ExternalService(msg) => AppError::ExternalService(format!("{context}: {msg}")),
        AppError::Timeout(_) | AppError::ConcurrencyLimit(_) => err,
        other => AppError::external(context, other),
    }
}

/// Classify a store failure. `NotFound` passes through.
fn persistence(err: AppError) -> AppError {
    match err {
        AppError::Persistence(_) | AppError::NotFound(_) => err,
        other => AppError::Persistence(other.to_string()),
    }
}

//! Multi-service lifecycle operations and their rollback paths.
//!
//! Each public operation runs on a tracked task under the session's lock.
//! Writes go to the store first and to the cache only after the store
//! accepted them. Rollback and best-effort teardown failures are logged;
//! the original error is the one returned.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{external, persistence, SessionEvent, SessionOrchestrator};
use crate::models::session::{CreateSessionRequest, Session, SessionStatus};
use crate::{AppError, Result};

/// Prefix of the branch started for a session created without one.
pub const SESSION_BRANCH_PREFIX: &str = "squad/";

impl SessionOrchestrator {
    /// Create a session: workspace, backend session, record.
    ///
    /// Returns the session in `Loading`; it is promoted to `Ready` after
    /// the configured grace interval. On failure no workspace or backend
    /// session created by this call outlives it.
    ///
    /// # Errors
    ///
    /// - `AppError::Validation` for an empty title or path.
    /// - `AppError::Precondition` if the path is not a repository.
    /// - `AppError::ExternalService` if the workspace or backend fails.
    /// - `AppError::Persistence` if the record cannot be stored.
    pub async fn create_session(&self, request: CreateSessionRequest) -> Result<Session> {
        let this = self.clone();
        self.run_tracked(async move {
            let span = info_span!("create_session", title = %request.title);
            this.create_inner(request).instrument(span).await
        })
        .await
    }

    /// Bring a paused session back: recreate its workspace on the stored
    /// branch and its backend session, then mark it `Ready`. A workspace
    /// that pause could not remove is reused as is.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` for an unknown ID.
    /// - `AppError::Precondition` unless the session is `Paused`.
    /// - `AppError::ExternalService` if the workspace or backend fails.
    /// - `AppError::Persistence` if the record cannot be updated.
    pub async fn resume_session(&self, id: &str) -> Result<Session> {
        let this = self.clone();
        let id = id.to_owned();
        self.run_tracked(async move {
            let span = info_span!("resume_session", session_id = %id);
            this.resume_inner(&id).instrument(span).await
        })
        .await
    }

    /// Alias of [`resume_session`](Self::resume_session).
    ///
    /// # Errors
    ///
    /// Same as [`resume_session`](Self::resume_session).
    pub async fn start_session(&self, id: &str) -> Result<Session> {
        self.resume_session(id).await
    }

    /// Pause a session: commit its work, tear down the backend session and
    /// workspace, keep the record and branch.
    ///
    /// Teardown is best effort; its failures never block the transition.
    /// A workspace that cannot be removed stays recorded on the session.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` for an unknown ID.
    /// - `AppError::Precondition` if already paused.
    /// - `AppError::Persistence` if the record cannot be updated.
    pub async fn pause_session(&self, id: &str) -> Result<Session> {
        let this = self.clone();
        let id = id.to_owned();
        self.run_tracked(async move {
            let span = info_span!("pause_session", session_id = %id);
            this.pause_inner(&id).instrument(span).await
        })
        .await
    }

    /// Stop a session: tear down its backend session and workspace
    /// (force), delete its record and evict it from the cache.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` for an unknown or already stopped ID.
    /// - `AppError::Persistence` if the record cannot be deleted.
    pub async fn stop_session(&self, id: &str) -> Result<()> {
        let this = self.clone();
        let id = id.to_owned();
        self.run_tracked(async move {
            let span = info_span!("stop_session", session_id = %id);
            this.stop_inner(&id).instrument(span).await
        })
        .await
    }

    /// Set the status of a live session, updating store and cache.
    ///
    /// Pausing and resuming have side effects and must go through
    /// [`pause_session`](Self::pause_session) and
    /// [`resume_session`](Self::resume_session).
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` for an unknown ID.
    /// - `AppError::Precondition` for an illegal transition.
    /// - `AppError::Persistence` if the record cannot be updated.
    pub async fn update_session_status(&self, id: &str, status: SessionStatus) -> Result<Session> {
        let this = self.clone();
        let id = id.to_owned();
        self.run_tracked(async move {
            let span = info_span!("update_session_status", session_id = %id, %status);
            this.update_status_inner(&id, status).instrument(span).await
        })
        .await
    }

    /// Stop every session, clear the store, kill leftover backend sessions
    /// and prune workspace bookkeeping. Returns the number of sessions
    /// stopped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if the store cannot be listed or
    /// cleared. Per-session failures are logged.
    pub async fn reset_all(&self) -> Result<usize> {
        let sessions = self.refresh_sessions().await?;
        let repos: BTreeSet<PathBuf> = sessions.iter().map(|s| s.repo_path.clone()).collect();

        let mut stopped = 0;
        for session in &sessions {
            match self.stop_session(&session.id).await {
                Ok(()) => stopped += 1,
                Err(err) => warn!(%err, session_id = %session.id, "reset: stop failed"),
            }
        }

        let cleared = self.inner.store.delete_all().await.map_err(persistence)?;
        {
            let mut cache = self.inner.cache.write().await;
            cache.sessions.clear();
            cache.complete = true;
        }

        if let Err(err) = self.inner.backend.cleanup_sessions().await {
            warn!(%err, "reset: backend cleanup failed");
        }
        for repo in &repos {
            if let Err(err) = self.inner.workspace.prune_workspaces(repo).await {
                warn!(%err, repo = %repo.display(), "reset: workspace prune failed");
            }
        }

        info!(stopped, cleared, "all sessions reset");
        Ok(stopped)
    }

    async fn create_inner(&self, request: CreateSessionRequest) -> Result<Session> {
        let title = request.title.trim();
        if title.is_empty() {
            return Err(AppError::Validation("title must not be empty".into()));
        }
        if request.path.as_os_str().is_empty() {
            return Err(AppError::Validation("path must not be empty".into()));
        }
        let repo = request.path.as_path();

        let is_repo = self
            .inner
            .workspace
            .is_repository(repo)
            .await
            .map_err(|err| external("repository check", err))?;
        if !is_repo {
            return Err(AppError::Precondition(format!(
                "{} is not under version control",
                repo.display()
            )));
        }

        let mut session = Session::new(
            title.to_owned(),
            request.path.clone(),
            String::new(),
            request.program.clone(),
            request
                .dimensions
                .unwrap_or(self.inner.settings.default_dimensions),
        );
        session.auto_yes = request.auto_yes;
        session.prompt = request.prompt.clone().filter(|p| !p.trim().is_empty());
        let id = session.id.clone();
        let _guard = self.inner.locks.acquire(&id).await;

        session.branch = match request.branch.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
            Some(branch) => {
                self.ensure_branch(repo, branch).await?;
                branch.to_owned()
            }
            None => {
                let base = self
                    .inner
                    .workspace
                    .current_branch(repo)
                    .await
                    .map_err(|err| external("read current branch", err))?;
                // Sessions never share a branch with the main work tree or
                // with each other.
                let branch = format!("{SESSION_BRANCH_PREFIX}{}", session.short_id());
                self.inner
                    .workspace
                    .create_branch(repo, &branch)
                    .await
                    .map_err(|err| external("create branch", err))?;
                debug!(%base, %branch, "session branch started from current HEAD");
                branch
            }
        };

        let target = self.workspace_path_for(repo, &id);
        let workspace = self
            .inner
            .workspace
            .create_isolated_workspace(repo, &target, &session.branch)
            .await
            .map_err(|err| external("create workspace", err))?;
        session.workspace_path = Some(workspace.path.clone());

        if let Err(err) = self
            .inner
            .backend
            .create_session(&id, &workspace.path, &session.program, session.dimensions)
            .await
        {
            warn!(%err, session_id = %id, "backend session failed; removing workspace");
            self.discard_workspace(repo, &workspace.path).await;
            return Err(external("create backend session", err));
        }

        if let Some(prompt) = session.prompt.as_deref() {
            if let Err(err) = self.inner.backend.send_keys(&id, &format!("{prompt}\n")).await {
                warn!(%err, session_id = %id, "failed to send initial prompt");
            }
        }

        if let Err(err) = self.inner.store.create(&session).await {
            warn!(%err, session_id = %id, "persisting session failed; tearing down");
            self.discard_backend(&id).await;
            self.discard_workspace(repo, &workspace.path).await;
            return Err(persistence(err));
        }

        self.cache_put(session.clone()).await;
        self.emit(SessionEvent::Created {
            session_id: id.clone(),
        });
        self.schedule_ready(id.clone());
        info!(session_id = %id, branch = %session.branch, "session created");
        Ok(session)
    }

    async fn ensure_branch(&self, repo: &Path, branch: &str) -> Result<()> {
        let branches = self
            .inner
            .workspace
            .list_branches(repo)
            .await
            .map_err(|err| external("list branches", err))?;
        if branches.iter().any(|b| b.name == branch) {
            debug!(branch, "reusing existing branch");
            return Ok(());
        }
        self.inner
            .workspace
            .create_branch(repo, branch)
            .await
            .map_err(|err| external("create branch", err))
    }

    async fn resume_inner(&self, id: &str) -> Result<Session> {
        let _guard = self.inner.locks.acquire(id).await;
        let mut session = self.get_session(id).await?;
        if session.status != SessionStatus::Paused {
            return Err(AppError::Precondition(format!(
                "session {} is {}; only paused sessions can be resumed",
                session.short_id(),
                session.status
            )));
        }

        let repo = session.repo_path.clone();
        let (path, created) = match self.leftover_workspace(&session).await {
            Some(path) => {
                info!(session_id = id, path = %path.display(), "reusing workspace left behind by pause");
                (path, false)
            }
            None => {
                let target = self.workspace_path_for(&repo, id);
                let workspace = self
                    .inner
                    .workspace
                    .create_isolated_workspace(&repo, &target, &session.branch)
                    .await
                    .map_err(|err| external("recreate workspace", err))?;
                (workspace.path, true)
            }
        };

        if let Err(err) = self
            .inner
            .backend
            .create_session(id, &path, &session.program, session.dimensions)
            .await
        {
            warn!(%err, session_id = id, "backend session failed");
            if created {
                self.discard_workspace(&repo, &path).await;
            }
            return Err(external("recreate backend session", err));
        }

        session.workspace_path = Some(path.clone());
        session.set_status(SessionStatus::Ready);
        if let Err(err) = self.inner.store.update(&session).await {
            warn!(%err, session_id = id, "persisting resume failed; tearing down");
            self.discard_backend(id).await;
            if created {
                self.discard_workspace(&repo, &path).await;
            }
            return Err(persistence(err));
        }

        self.cache_put(session.clone()).await;
        self.emit(SessionEvent::Resumed {
            session_id: id.to_owned(),
        });
        info!(session_id = id, branch = %session.branch, "session resumed");
        Ok(session)
    }

    /// A workspace a failed pause left on disk, if it is still there. A
    /// stale registration is pruned so the path can be recreated.
    async fn leftover_workspace(&self, session: &Session) -> Option<PathBuf> {
        let path = session.workspace_path.clone()?;
        match self.inner.workspace.is_repository(&path).await {
            Ok(true) => return Some(path),
            Ok(false) => debug!(session_id = %session.id, path = %path.display(), "leftover workspace is gone"),
            Err(err) => warn!(%err, session_id = %session.id, "could not inspect leftover workspace"),
        }
        if let Err(err) = self.inner.workspace.prune_workspaces(&session.repo_path).await {
            warn!(%err, session_id = %session.id, "failed to prune stale workspaces");
        }
        None
    }

    async fn pause_inner(&self, id: &str) -> Result<Session> {
        let _guard = self.inner.locks.acquire(id).await;
        let mut session = self.get_session(id).await?;
        if session.status == SessionStatus::Paused {
            return Err(AppError::Precondition(format!(
                "session {} is already paused",
                session.short_id()
            )));
        }

        self.discard_backend(id).await;
        if let Some(path) = session.workspace_path.clone() {
            let message = format!(
                "[agent-squad] pause '{}' at {}",
                session.title,
                Utc::now().to_rfc3339()
            );
            // Force only once the work is safely committed.
            let committed = match self.inner.workspace.commit_all(&path, &message).await {
                Ok(made) => {
                    debug!(session_id = id, commit = made, "workspace changes saved");
                    true
                }
                Err(err) => {
                    warn!(%err, session_id = id, "commit before pause failed");
                    false
                }
            };
            match self
                .inner
                .workspace
                .remove_isolated_workspace(&session.repo_path, &path, committed)
                .await
            {
                Ok(()) => session.workspace_path = None,
                Err(err) => {
                    // Keep the path so resume can reuse the leftover and
                    // stop can still tear it down.
                    warn!(%err, session_id = id, path = %path.display(), "failed to remove workspace on pause; keeping it");
                }
            }
        }

        session.set_status(SessionStatus::Paused);
        self.inner
            .store
            .update(&session)
            .await
            .map_err(persistence)?;

        self.cache_put(session.clone()).await;
        self.emit(SessionEvent::Paused {
            session_id: id.to_owned(),
        });
        info!(session_id = id, branch = %session.branch, "session paused");
        Ok(session)
    }

    async fn stop_inner(&self, id: &str) -> Result<()> {
        let guard = self.inner.locks.acquire(id).await;
        let session = self.get_session(id).await?;

        self.discard_backend(id).await;
        if let Some(path) = &session.workspace_path {
            self.discard_workspace(&session.repo_path, path).await;
        }

        match self.inner.store.delete(id).await {
            Ok(()) => {}
            Err(AppError::NotFound(_)) => {
                debug!(session_id = id, "record already gone from store");
            }
            Err(err) => return Err(persistence(err)),
        }

        self.cache_evict(id).await;
        drop(guard);
        self.inner.locks.release(id);
        self.emit(SessionEvent::Stopped {
            session_id: id.to_owned(),
        });
        info!(session_id = id, "session stopped");
        Ok(())
    }

    async fn update_status_inner(&self, id: &str, status: SessionStatus) -> Result<Session> {
        let _guard = self.inner.locks.acquire(id).await;
        let current = self.get_session(id).await?;

        if status == SessionStatus::Paused || current.status == SessionStatus::Paused {
            if current.status != status {
                return Err(AppError::Precondition(format!(
                    "session {}: {} -> {} requires pause or resume",
                    current.short_id(),
                    current.status,
                    status
                )));
            }
        } else if !current.status.can_transition_to(status) {
            return Err(AppError::Precondition(format!(
                "session {}: illegal transition {} -> {}",
                current.short_id(),
                current.status,
                status
            )));
        }

        let stored = self
            .inner
            .store
            .update_status(id, status)
            .await
            .map_err(persistence)?;
        self.cache_put(stored.clone()).await;
        debug!(session_id = id, %status, "session status updated");
        Ok(stored)
    }

    /// Promote a session to `Ready` once the grace interval has elapsed.
    fn schedule_ready(&self, id: String) {
        let this = self.clone();
        let cancel = self.inner.cancel.clone();
        let grace = self.inner.settings.ready_grace;
        let span = info_span!("ready_promotion", session_id = %id);

        self.inner.tasks.spawn(
            async move {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("readiness timer cancelled");
                        return;
                    }
                    () = tokio::time::sleep(grace) => {}
                }
                if let Err(err) = this.promote(&id).await {
                    warn!(%err, "readiness promotion failed");
                    this.emit(SessionEvent::TaskFailed {
                        session_id: id.clone(),
                        task: "ready_promotion",
                        error: err.to_string(),
                    });
                }
            }
            .instrument(span),
        );
    }

    async fn promote(&self, id: &str) -> Result<()> {
        let _guard = self.inner.locks.acquire(id).await;
        let mut session = match self.get_session(id).await {
            Ok(session) => session,
            Err(AppError::NotFound(_)) => {
                debug!("session stopped before promotion");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        if session.status != SessionStatus::Loading {
            debug!(status = %session.status, "session left loading before promotion");
            return Ok(());
        }

        session.set_status(SessionStatus::Ready);
        self.inner
            .store
            .update(&session)
            .await
            .map_err(persistence)?;
        self.cache_put(session).await;
        self.emit(SessionEvent::Ready {
            session_id: id.to_owned(),
        });
        info!("session ready");
        Ok(())
    }

    async fn discard_backend(&self, id: &str) {
        if let Err(err) = self.inner.backend.kill_session(id).await {
            warn!(%err, session_id = id, "failed to kill backend session");
        }
    }

    async fn discard_workspace(&self, repo: &Path, path: &Path) {
        if let Err(err) = self
            .inner
            .workspace
            .remove_isolated_workspace(repo, path, true)
            .await
        {
            warn!(%err, path = %path.display(), "failed to remove workspace");
        }
    }
}

#![allow(dead_code)]

//! Shared fakes for orchestrator and daemon integration tests.
//!
//! `FakeWorkspace` and `FakeBackend` record every call and can be told to
//! fail; `FakeStore` wraps the real in-memory `SQLite` store with failure
//! switches so rollback paths can be exercised.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_squad::backend::ProcessBackend;
use agent_squad::models::session::{CreateSessionRequest, Dimensions, Session, SessionStatus};
use agent_squad::models::workspace::{Branch, DiffStats, IsolatedWorkspace};
use agent_squad::orchestrator::{OrchestratorSettings, SessionOrchestrator};
use agent_squad::persistence::session_repo::SqliteSessionStore;
use agent_squad::persistence::{db, SessionFilter, SessionStore};
use agent_squad::workspace::WorkspaceService;
use agent_squad::{AppError, Result};

type Boxed<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

pub const REPO: &str = "/repo";

// ── Workspace ───────────────────────────────────────────

#[derive(Debug, Default)]
pub struct WorkspaceState {
    pub current: String,
    pub branches: BTreeSet<String>,
    pub worktrees: BTreeMap<PathBuf, String>,
    pub not_repository: bool,
    pub fail_create: bool,
    pub fail_remove: bool,
    pub fail_commit: bool,
    pub commits: Vec<(PathBuf, String)>,
    pub removals: Vec<(PathBuf, bool)>,
    pub pruned: Vec<PathBuf>,
    pub diff: DiffStats,
}

#[derive(Debug)]
pub struct FakeWorkspace {
    pub state: Mutex<WorkspaceState>,
}

impl FakeWorkspace {
    pub fn new() -> Self {
        let mut state = WorkspaceState {
            current: "main".into(),
            ..WorkspaceState::default()
        };
        state.branches.insert("main".into());
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut WorkspaceState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn worktree_count(&self) -> usize {
        self.with(|s| s.worktrees.len())
    }
}

impl WorkspaceService for FakeWorkspace {
    fn is_repository<'a>(&'a self, path: &'a Path) -> Boxed<'a, bool> {
        Box::pin(async move {
            Ok(self.with(|s| {
                if s.worktrees.contains_key(path) {
                    return true;
                }
                // A worktree that was removed is no longer a repository.
                !s.not_repository && !s.removals.iter().any(|(p, _)| p == path)
            }))
        })
    }

    fn create_isolated_workspace<'a>(
        &'a self,
        _repo: &'a Path,
        target: &'a Path,
        branch: &'a str,
    ) -> Boxed<'a, IsolatedWorkspace> {
        Box::pin(async move {
            self.with(|s| {
                if s.fail_create {
                    return Err(AppError::ExternalService("worktree add failed".into()));
                }
                if s.worktrees.contains_key(target) {
                    return Err(AppError::ExternalService("worktree exists".into()));
                }
                s.branches.insert(branch.to_owned());
                s.worktrees.insert(target.to_path_buf(), branch.to_owned());
                Ok(IsolatedWorkspace {
                    path: target.to_path_buf(),
                    branch: branch.to_owned(),
                    revision: "abc123".into(),
                })
            })
        })
    }

    fn remove_isolated_workspace<'a>(&'a self, _repo: &'a Path, path: &'a Path, force: bool) -> Boxed<'a, ()> {
        Box::pin(async move {
            self.with(|s| {
                s.removals.push((path.to_path_buf(), force));
                if s.fail_remove {
                    return Err(AppError::ExternalService("worktree remove failed".into()));
                }
                s.worktrees.remove(path);
                Ok(())
            })
        })
    }

    fn create_branch<'a>(&'a self, _repo: &'a Path, branch: &'a str) -> Boxed<'a, ()> {
        Box::pin(async move {
            self.with(|s| s.branches.insert(branch.to_owned()));
            Ok(())
        })
    }

    fn checkout_branch<'a>(&'a self, _repo: &'a Path, branch: &'a str) -> Boxed<'a, ()> {
        Box::pin(async move {
            self.with(|s| s.current = branch.to_owned());
            Ok(())
        })
    }

    fn current_branch<'a>(&'a self, _repo: &'a Path) -> Boxed<'a, String> {
        Box::pin(async move { Ok(self.with(|s| s.current.clone())) })
    }

    fn list_branches<'a>(&'a self, _repo: &'a Path) -> Boxed<'a, Vec<Branch>> {
        Box::pin(async move {
            Ok(self.with(|s| {
                s.branches
                    .iter()
                    .map(|name| Branch {
                        name: name.clone(),
                        is_current: *name == s.current,
                        revision: None,
                    })
                    .collect()
            }))
        })
    }

    fn diff_stats<'a>(&'a self, path: &'a Path) -> Boxed<'a, DiffStats> {
        Box::pin(async move {
            self.with(|s| {
                if s.worktrees.contains_key(path) {
                    Ok(s.diff.clone())
                } else {
                    Err(AppError::ExternalService("no such worktree".into()))
                }
            })
        })
    }

    fn commit_all<'a>(&'a self, path: &'a Path, message: &'a str) -> Boxed<'a, bool> {
        Box::pin(async move {
            self.with(|s| {
                if s.fail_commit {
                    return Err(AppError::ExternalService("commit failed".into()));
                }
                s.commits.push((path.to_path_buf(), message.to_owned()));
                Ok(true)
            })
        })
    }

    fn prune_workspaces<'a>(&'a self, repo: &'a Path) -> Boxed<'a, ()> {
        Box::pin(async move {
            self.with(|s| s.pruned.push(repo.to_path_buf()));
            Ok(())
        })
    }
}

// ── Backend ─────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct FakePane {
    pub work_dir: PathBuf,
    pub command: String,
    pub dimensions: Option<Dimensions>,
    pub output: String,
    pub keys: Vec<String>,
}

#[derive(Debug, Default)]
pub struct BackendState {
    pub panes: BTreeMap<String, FakePane>,
    pub fail_create: bool,
    pub fail_send: bool,
    pub fail_capture: bool,
    pub created: usize,
    pub killed: Vec<String>,
    pub attached: Vec<String>,
    pub cleanups: usize,
}

#[derive(Debug, Default)]
pub struct FakeBackend {
    pub state: Mutex<BackendState>,
}

impl FakeBackend {
    pub fn with<R>(&self, f: impl FnOnce(&mut BackendState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_output(&self, name: &str, output: &str) {
        self.with(|s| {
            if let Some(pane) = s.panes.get_mut(name) {
                pane.output = output.to_owned();
            }
        });
    }

    pub fn keys(&self, name: &str) -> Vec<String> {
        self.with(|s| s.panes.get(name).map(|p| p.keys.clone()).unwrap_or_default())
    }

    pub fn pane_count(&self) -> usize {
        self.with(|s| s.panes.len())
    }
}

impl ProcessBackend for FakeBackend {
    fn create_session<'a>(
        &'a self,
        name: &'a str,
        work_dir: &'a Path,
        command: &'a str,
        dimensions: Dimensions,
    ) -> Boxed<'a, ()> {
        Box::pin(async move {
            self.with(|s| {
                if s.fail_create {
                    return Err(AppError::ExternalService("tmux new-session failed".into()));
                }
                if s.panes.contains_key(name) {
                    return Err(AppError::ExternalService("tmux session exists".into()));
                }
                s.created += 1;
                s.panes.insert(
                    name.to_owned(),
                    FakePane {
                        work_dir: work_dir.to_path_buf(),
                        command: command.to_owned(),
                        dimensions: Some(dimensions),
                        ..FakePane::default()
                    },
                );
                Ok(())
            })
        })
    }

    fn kill_session<'a>(&'a self, name: &'a str) -> Boxed<'a, ()> {
        Box::pin(async move {
            self.with(|s| {
                s.killed.push(name.to_owned());
                s.panes.remove(name);
            });
            Ok(())
        })
    }

    fn session_exists<'a>(&'a self, name: &'a str) -> Boxed<'a, bool> {
        Box::pin(async move { Ok(self.with(|s| s.panes.contains_key(name))) })
    }

    fn send_keys<'a>(&'a self, name: &'a str, text: &'a str) -> Boxed<'a, ()> {
        Box::pin(async move {
            self.with(|s| {
                if s.fail_send {
                    return Err(AppError::ExternalService("send-keys failed".into()));
                }
                let pane = s
                    .panes
                    .get_mut(name)
                    .ok_or_else(|| AppError::ExternalService("can't find session".into()))?;
                pane.keys.push(text.to_owned());
                Ok(())
            })
        })
    }

    fn capture_pane<'a>(&'a self, name: &'a str) -> Boxed<'a, String> {
        Box::pin(async move {
            self.with(|s| {
                if s.fail_capture {
                    return Err(AppError::ExternalService("capture-pane failed".into()));
                }
                s.panes
                    .get(name)
                    .map(|p| p.output.clone())
                    .ok_or_else(|| AppError::ExternalService("can't find session".into()))
            })
        })
    }

    fn capture_scrollback<'a>(&'a self, name: &'a str) -> Boxed<'a, String> {
        Box::pin(async move {
            self.with(|s| {
                s.panes
                    .get(name)
                    .map(|p| format!("history\n{}", p.output))
                    .ok_or_else(|| AppError::ExternalService("can't find session".into()))
            })
        })
    }

    fn attach_session<'a>(&'a self, name: &'a str) -> Boxed<'a, ()> {
        Box::pin(async move {
            self.with(|s| s.attached.push(name.to_owned()));
            Ok(())
        })
    }

    fn cleanup_sessions(&self) -> Boxed<'_, usize> {
        Box::pin(async move {
            Ok(self.with(|s| {
                s.cleanups += 1;
                let count = s.panes.len();
                s.panes.clear();
                count
            }))
        })
    }
}

// ── Store ───────────────────────────────────────────────

pub struct FakeStore {
    pub inner: SqliteSessionStore,
    pub fail_create: AtomicBool,
    pub fail_update: AtomicBool,
    pub fail_list: AtomicBool,
    pub gets: AtomicUsize,
}

impl FakeStore {
    pub async fn new() -> Self {
        let pool = db::connect_memory().await.expect("in-memory db");
        Self {
            inner: SqliteSessionStore::new(Arc::new(pool)),
            fail_create: AtomicBool::new(false),
            fail_update: AtomicBool::new(false),
            fail_list: AtomicBool::new(false),
            gets: AtomicUsize::new(0),
        }
    }

    fn injected(flag: &AtomicBool, op: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(AppError::Persistence(format!("injected {op} failure")))
        } else {
            Ok(())
        }
    }
}

impl SessionStore for FakeStore {
    fn create<'a>(&'a self, session: &'a Session) -> Boxed<'a, ()> {
        Box::pin(async move {
            Self::injected(&self.fail_create, "create")?;
            self.inner.create(session).await
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> Boxed<'a, Session> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(id)
    }

    fn update<'a>(&'a self, session: &'a Session) -> Boxed<'a, ()> {
        Box::pin(async move {
            Self::injected(&self.fail_update, "update")?;
            self.inner.update(session).await
        })
    }

    fn delete<'a>(&'a self, id: &'a str) -> Boxed<'a, ()> {
        self.inner.delete(id)
    }

    fn list<'a>(&'a self, filter: &'a SessionFilter) -> Boxed<'a, Vec<Session>> {
        Box::pin(async move {
            Self::injected(&self.fail_list, "list")?;
            self.inner.list(filter).await
        })
    }

    fn update_status<'a>(&'a self, id: &'a str, status: SessionStatus) -> Boxed<'a, Session> {
        Box::pin(async move {
            Self::injected(&self.fail_update, "update_status")?;
            self.inner.update_status(id, status).await
        })
    }

    fn delete_all(&self) -> Boxed<'_, u64> {
        self.inner.delete_all()
    }
}

// ── Harness ─────────────────────────────────────────────

pub struct Harness {
    pub orchestrator: SessionOrchestrator,
    pub workspace: Arc<FakeWorkspace>,
    pub backend: Arc<FakeBackend>,
    pub store: Arc<FakeStore>,
}

/// Orchestrator over fresh fakes with a 50 ms readiness grace.
pub async fn harness() -> Harness {
    harness_with_grace(Duration::from_millis(50)).await
}

pub async fn harness_with_grace(grace: Duration) -> Harness {
    let workspace = Arc::new(FakeWorkspace::new());
    let backend = Arc::new(FakeBackend::default());
    let store = Arc::new(FakeStore::new().await);
    let settings = OrchestratorSettings {
        ready_grace: grace,
        ..OrchestratorSettings::default()
    };
    let orchestrator = SessionOrchestrator::new(
        Arc::clone(&workspace) as Arc<dyn WorkspaceService>,
        Arc::clone(&backend) as Arc<dyn ProcessBackend>,
        Arc::clone(&store) as Arc<dyn SessionStore>,
        settings,
    );
    Harness {
        orchestrator,
        workspace,
        backend,
        store,
    }
}

pub fn request(title: &str) -> CreateSessionRequest {
    CreateSessionRequest::new(title, REPO, "claude")
}

/// Poll until the session reaches `status`, failing after two seconds.
pub async fn wait_for_status(orchestrator: &SessionOrchestrator, id: &str, status: SessionStatus) -> Session {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let session = orchestrator.get_session(id).await.expect("session exists");
        if session.status == status {
            return session;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session {id} stuck in {} waiting for {status}",
            session.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Create a session and wait for it to become `Ready`.
pub async fn ready_session(h: &Harness, title: &str) -> Session {
    let created = h.orchestrator.create_session(request(title)).await.expect("create");
    wait_for_status(&h.orchestrator, &created.id, SessionStatus::Ready).await
}

//! Isolated workspace management.
//!
//! [`WorkspaceService`] is the orchestrator's only view of version
//! control. [`git::GitWorkspace`] implements it with `git worktree`.

pub mod git;

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use crate::models::workspace::{Branch, DiffStats, IsolatedWorkspace};
use crate::Result;

pub use git::GitWorkspace;

/// Branch-scoped, isolated copies of a repository.
pub trait WorkspaceService: Send + Sync {
    /// Whether `path` lies inside a repository work tree.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalService` if the check itself cannot run.
    fn is_repository<'a>(&'a self, path: &'a Path) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

    /// Create a workspace at `target` with `branch` checked out. The branch
    /// is created from `HEAD` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalService` if creation fails.
    fn create_isolated_workspace<'a>(
        &'a self,
        repo: &'a Path,
        target: &'a Path,
        branch: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<IsolatedWorkspace>> + Send + 'a>>;

    /// Remove the workspace at `path` that belongs to `repo`. `force`
    /// discards uncommitted changes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalService` if removal fails.
    fn remove_isolated_workspace<'a>(
        &'a self,
        repo: &'a Path,
        path: &'a Path,
        force: bool,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Create `branch` from the current `HEAD` without checking it out.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalService` if the branch cannot be created.
    fn create_branch<'a>(&'a self, repo: &'a Path, branch: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Check out `branch` in `repo`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalService` if checkout fails.
    fn checkout_branch<'a>(&'a self, repo: &'a Path, branch: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Name of the checked-out branch.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalService` on failure or detached `HEAD`.
    fn current_branch<'a>(&'a self, repo: &'a Path) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

    /// Local branches.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalService` if listing fails.
    fn list_branches<'a>(&'a self, repo: &'a Path) -> Pin<Box<dyn Future<Output = Result<Vec<Branch>>> + Send + 'a>>;

    /// Changes in the workspace at `path` relative to its `HEAD`, including
    /// untracked files.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalService` if the diff cannot be computed.
    fn diff_stats<'a>(&'a self, path: &'a Path) -> Pin<Box<dyn Future<Output = Result<DiffStats>> + Send + 'a>>;

    /// Stage and commit every change in the workspace. Returns whether a
    /// commit was made (`false` for a clean tree).
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalService` if staging or committing fails.
    fn commit_all<'a>(&'a self, path: &'a Path, message: &'a str) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

    /// Drop bookkeeping for workspaces whose directories are gone.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalService` if pruning fails.
    fn prune_workspaces<'a>(&'a self, repo: &'a Path) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

//! `git worktree` implementation of [`WorkspaceService`].

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, info};

use super::WorkspaceService;
use crate::executor::{Command, CommandExecutor, ExecResult};
use crate::models::workspace::{Branch, DiffStats, FileDiff, FileStatus, IsolatedWorkspace};
use crate::{AppError, Result};

const GIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs `git` through a shared [`CommandExecutor`].
#[derive(Clone)]
pub struct GitWorkspace {
    executor: CommandExecutor,
}

impl GitWorkspace {
    /// Create an adapter sharing `executor`'s concurrency budget.
    #[must_use]
    pub fn new(executor: CommandExecutor) -> Self {
        Self { executor }
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<ExecResult> {
        let cmd = Command::new("git")
            .arg("-C")
            .arg(dir.to_string_lossy())
            .args(args.iter().copied())
            .timeout(GIT_TIMEOUT);
        self.executor.execute(cmd).await
    }

    /// Run and require exit code 0; returns trimmed stdout.
    async fn run(&self, dir: &Path, args: &[&str], context: &str) -> Result<String> {
        let result = self.git(dir, args).await?.ensure_success(context)?;
        Ok(result.stdout_str().trim().to_owned())
    }

    async fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{branch}");
        let result = self
            .git(repo, &["rev-parse", "--verify", "--quiet", reference.as_str()])
            .await?;
        Ok(result.success())
    }

    async fn head_revision(&self, dir: &Path) -> Result<String> {
        self.run(dir, &["rev-parse", "HEAD"], "git rev-parse HEAD").await
    }
}

impl WorkspaceService for GitWorkspace {
    fn is_repository<'a>(&'a self, path: &'a Path) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            if !path.is_dir() {
                return Ok(false);
            }
            let result = self.git(path, &["rev-parse", "--is-inside-work-tree"]).await?;
            Ok(result.success() && result.stdout_str().trim() == "true")
        })
    }

    fn create_isolated_workspace<'a>(
        &'a self,
        repo: &'a Path,
        target: &'a Path,
        branch: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<IsolatedWorkspace>> + Send + 'a>> {
        Box::pin(async move {
            let target_str = target.to_string_lossy().into_owned();
            // Never forced: a branch checked out elsewhere is refused.
            if self.branch_exists(repo, branch).await? {
                self.run(repo, &["worktree", "add", target_str.as_str(), branch], "git worktree add")
                    .await?;
            } else {
                self.run(
                    repo,
                    &["worktree", "add", "-b", branch, target_str.as_str()],
                    "git worktree add -b",
                )
                .await?;
            }

            let revision = self.head_revision(target).await?;
            info!(path = %target.display(), branch, %revision, "worktree created");
            Ok(IsolatedWorkspace {
                path: target.to_path_buf(),
                branch: branch.to_owned(),
                revision,
            })
        })
    }

    fn remove_isolated_workspace<'a>(
        &'a self,
        repo: &'a Path,
        path: &'a Path,
        force: bool,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let path_str = path.to_string_lossy().into_owned();
            let mut args = vec!["worktree", "remove"];
            if force {
                args.push("--force");
            }
            args.push(path_str.as_str());
            self.run(repo, &args, "git worktree remove").await?;
            debug!(path = %path.display(), force, "worktree removed");
            Ok(())
        })
    }

    fn create_branch<'a>(&'a self, repo: &'a Path, branch: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.run(repo, &["branch", branch], &format!("git branch {branch}"))
                .await
                .map(drop)
        })
    }

    fn checkout_branch<'a>(&'a self, repo: &'a Path, branch: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.run(repo, &["checkout", branch], &format!("git checkout {branch}"))
                .await
                .map(drop)
        })
    }

    fn current_branch<'a>(&'a self, repo: &'a Path) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let name = self
                .run(repo, &["branch", "--show-current"], "git branch --show-current")
                .await?;
            if name.is_empty() {
                return Err(AppError::ExternalService(format!(
                    "{} is not on any branch (detached HEAD)",
                    repo.display()
                )));
            }
            Ok(name)
        })
    }

    fn list_branches<'a>(&'a self, repo: &'a Path) -> Pin<Box<dyn Future<Output = Result<Vec<Branch>>> + Send + 'a>> {
        Box::pin(async move {
            let out = self
                .run(
                    repo,
                    &["branch", "--format=%(HEAD)%09%(refname:short)%09%(objectname)"],
                    "git branch",
                )
                .await?;
            Ok(out.lines().filter_map(parse_branch_line).collect())
        })
    }

    fn diff_stats<'a>(&'a self, path: &'a Path) -> Pin<Box<dyn Future<Output = Result<DiffStats>> + Send + 'a>> {
        Box::pin(async move {
            // Intent-to-add makes untracked files visible to `diff HEAD`.
            self.run(path, &["add", "-N", "."], "git add -N").await?;
            let out = self
                .run(path, &["diff", "--numstat", "HEAD"], "git diff --numstat")
                .await?;
            Ok(DiffStats::from_files(parse_numstat(&out)))
        })
    }

    fn commit_all<'a>(&'a self, path: &'a Path, message: &'a str) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            self.run(path, &["add", "-A"], "git add -A").await?;
            let staged = self.git(path, &["diff", "--cached", "--quiet"]).await?;
            match staged.exit_code {
                0 => return Ok(false),
                1 => {}
                _ => {
                    staged.ensure_success("git diff --cached")?;
                }
            }
            self.run(
                path,
                &["commit", "--no-verify", "-m", message],
                "git commit",
            )
            .await?;
            info!(path = %path.display(), "workspace changes committed");
            Ok(true)
        })
    }

    fn prune_workspaces<'a>(&'a self, repo: &'a Path) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.run(repo, &["worktree", "prune"], "git worktree prune")
                .await
                .map(drop)
        })
    }
}

/// Parse one line of `git branch --format=%(HEAD)%09%(refname:short)%09%(objectname)`.
#[must_use]
pub fn parse_branch_line(line: &str) -> Option<Branch> {
    let mut parts = line.split('\t');
    let head = parts.next()?;
    let name = parts.next()?.trim();
    if name.is_empty() {
        return None;
    }
    let revision = parts
        .next()
        .map(str::trim)
        .filter(|rev| !rev.is_empty())
        .map(str::to_owned);
    Some(Branch {
        name: name.to_owned(),
        is_current: head.trim() == "*",
        revision,
    })
}

/// Parse `git diff --numstat` output.
///
/// A `-` count marks a binary file. Insert-only files are `Added`,
/// delete-only files `Deleted`, everything else `Modified`.
#[must_use]
pub fn parse_numstat(output: &str) -> Vec<FileDiff> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '\t');
            let added = parts.next()?;
            let deleted = parts.next()?;
            let path = parts.next()?.trim();
            if path.is_empty() {
                return None;
            }

            let binary = added == "-" || deleted == "-";
            let insertions = added.parse::<u64>().unwrap_or(0);
            let deletions = deleted.parse::<u64>().unwrap_or(0);
            let status = match (binary, insertions, deletions) {
                (false, i, 0) if i > 0 => FileStatus::Added,
                (false, 0, d) if d > 0 => FileStatus::Deleted,
                _ => FileStatus::Modified,
            };

            Some(FileDiff {
                path: path.to_owned(),
                insertions,
                deletions,
                binary,
                status,
            })
        })
        .collect()
}

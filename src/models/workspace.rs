//! Value types returned by the workspace service.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A branch in the source repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Branch {
    /// Branch name without the `refs/heads/` prefix.
    pub name: String,
    /// Whether this is the checked-out branch.
    pub is_current: bool,
    /// Commit the branch points at, when known.
    pub revision: Option<String>,
}

/// A freshly created isolated workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IsolatedWorkspace {
    /// Filesystem location of the workspace.
    pub path: PathBuf,
    /// Branch checked out in the workspace.
    pub branch: String,
    /// Commit checked out in the workspace.
    pub revision: String,
}

/// Change classification for a single file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Only insertions.
    Added,
    /// Only deletions.
    Deleted,
    /// Mixed changes, or a binary file.
    Modified,
}

/// Per-file diff statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileDiff {
    /// Path relative to the workspace root.
    pub path: String,
    /// Inserted lines (0 for binary files).
    pub insertions: u64,
    /// Deleted lines (0 for binary files).
    pub deletions: u64,
    /// Whether git reported the file as binary.
    pub binary: bool,
    /// Derived change classification.
    pub status: FileStatus,
}

/// Aggregate diff statistics for a workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffStats {
    /// Number of changed files.
    pub files_changed: usize,
    /// Total inserted lines.
    pub insertions: u64,
    /// Total deleted lines.
    pub deletions: u64,
    /// Per-file breakdown.
    pub files: Vec<FileDiff>,
}

impl DiffStats {
    /// Build aggregate totals from a per-file list.
    #[must_use]
    pub fn from_files(files: Vec<FileDiff>) -> Self {
        Self {
            files_changed: files.len(),
            insertions: files.iter().map(|f| f.insertions).sum(),
            deletions: files.iter().map(|f| f.deletions).sum(),
            files,
        }
    }

    /// Whether the workspace has no changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files_changed == 0
    }
}

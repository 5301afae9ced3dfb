//! Session model and lifecycle helpers.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppError;

/// Lifecycle status for an agent session.
///
/// `Stopped` is not a stored state: a stopped session's record is deleted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Program launched, still inside the readiness grace window.
    Loading,
    /// Program is up and idle.
    Ready,
    /// Program is actively working.
    Running,
    /// Workspace and backend session torn down; only the record remains.
    Paused,
}

impl SessionStatus {
    /// Stable lowercase name used in storage and CLI output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
        }
    }

    /// Whether the session owns a live workspace and backend session.
    #[must_use]
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Paused)
    }

    /// Whether input/output proxying to the backend is allowed.
    #[must_use]
    pub fn accepts_io(self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }

    /// Determine whether a lifecycle transition is permitted.
    ///
    /// `Loading -> Ready -> Running <-> Paused`; any non-paused state may
    /// pause, and a paused session only comes back through resume (`Ready`).
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Self::Loading, Self::Ready | Self::Running | Self::Paused)
                | (Self::Ready, Self::Running | Self::Paused)
                | (Self::Running, Self::Ready | Self::Paused)
                | (Self::Paused, Self::Ready)
        )
    }
}

impl Display for SessionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "loading" => Ok(Self::Loading),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            other => Err(AppError::Validation(format!(
                "invalid session status: {other}"
            ))),
        }
    }
}

/// Terminal width and height for the backend session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dimensions {
    /// Columns.
    pub width: u16,
    /// Rows.
    pub height: u16,
}

impl Default for Dimensions {
    fn default() -> Self {
        Self {
            width: 200,
            height: 50,
        }
    }
}

/// Parameters for [`SessionOrchestrator::create_session`](crate::orchestrator::SessionOrchestrator::create_session).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateSessionRequest {
    /// Human label; must be non-empty.
    pub title: String,
    /// Repository the workspace is carved from; must be non-empty.
    pub path: PathBuf,
    /// Branch to work on. `None` starts a fresh `squad/<short id>` branch
    /// from the repository's current HEAD.
    pub branch: Option<String>,
    /// Command line launched inside the backend session.
    pub program: String,
    /// Terminal size; `None` uses the configured default.
    pub dimensions: Option<Dimensions>,
    /// Whether the daemon should auto-acknowledge prompts.
    pub auto_yes: bool,
    /// Initial input sent once the program is launched.
    pub prompt: Option<String>,
}

impl CreateSessionRequest {
    /// Minimal request with title, repository path and program.
    #[must_use]
    pub fn new(title: impl Into<String>, path: impl Into<PathBuf>, program: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            path: path.into(),
            program: program.into(),
            ..Self::default()
        }
    }
}

/// Session domain entity persisted in the session store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Unique record identifier; immutable after creation.
    pub id: String,
    /// Human label.
    pub title: String,
    /// Repository the workspace was created from.
    pub repo_path: PathBuf,
    /// Isolated workspace location. `None` while paused, unless pause could
    /// not remove the workspace; resume and stop then reuse it.
    pub workspace_path: Option<PathBuf>,
    /// Branch the workspace tracks; survives pause/resume.
    pub branch: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Command line launched inside the backend session.
    pub program: String,
    /// Terminal size.
    pub dimensions: Dimensions,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Whether the daemon auto-acknowledges prompts for this session.
    pub auto_yes: bool,
    /// Initial input sent at creation.
    pub prompt: Option<String>,
}

impl Session {
    /// Construct a new `Loading` session with a generated identifier.
    #[must_use]
    pub fn new(
        title: String,
        repo_path: PathBuf,
        branch: String,
        program: String,
        dimensions: Dimensions,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title,
            repo_path,
            workspace_path: None,
            branch,
            status: SessionStatus::Loading,
            program,
            dimensions,
            created_at: now,
            updated_at: now,
            auto_yes: false,
            prompt: None,
        }
    }

    /// Shortened identifier for log lines and CLI tables.
    #[must_use]
    pub fn short_id(&self) -> &str {
        self.id.get(..8).unwrap_or(&self.id)
    }

    /// Set `status` and bump `updated_at`.
    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

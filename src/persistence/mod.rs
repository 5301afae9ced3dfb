//! Session record persistence.
//!
//! The orchestrator talks to storage only through [`SessionStore`];
//! [`session_repo::SqliteSessionStore`] is the production implementation.

pub mod db;
pub mod schema;
pub mod session_repo;

use std::future::Future;
use std::pin::Pin;

use crate::models::session::{Session, SessionStatus};
use crate::Result;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

/// Predicate for [`SessionStore::list`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    /// Only sessions in this status.
    pub status: Option<SessionStatus>,
    /// Only sessions on this branch.
    pub branch: Option<String>,
    /// Only sessions with this exact title.
    pub title: Option<String>,
    /// Only sessions with this auto-yes flag.
    pub auto_yes: Option<bool>,
}

impl SessionFilter {
    /// Filter matching every record.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to one status.
    #[must_use]
    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restrict to one title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Restrict to one branch.
    #[must_use]
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Restrict by auto-yes flag.
    #[must_use]
    pub fn with_auto_yes(mut self, auto_yes: bool) -> Self {
        self.auto_yes = Some(auto_yes);
        self
    }

    /// Whether `session` satisfies every set predicate.
    #[must_use]
    pub fn matches(&self, session: &Session) -> bool {
        self.status.map_or(true, |s| session.status == s)
            && self.branch.as_ref().map_or(true, |b| &session.branch == b)
            && self.title.as_ref().map_or(true, |t| &session.title == t)
            && self.auto_yes.map_or(true, |a| session.auto_yes == a)
    }
}

/// Durable storage of session records keyed by ID.
///
/// Concurrent access to distinct records must be safe; writes to the same
/// record are last-write-wins.
pub trait SessionStore: Send + Sync {
    /// Insert a new record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if the insert fails (including a
    /// duplicate ID).
    fn create<'a>(&'a self, session: &'a Session) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Fetch one record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no record has this ID, or
    /// `AppError::Persistence` if the read fails.
    fn get<'a>(&'a self, id: &'a str) -> Pin<Box<dyn Future<Output = Result<Session>> + Send + 'a>>;

    /// Replace an existing record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the record does not exist, or
    /// `AppError::Persistence` if the write fails.
    fn update<'a>(&'a self, session: &'a Session) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Delete a record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the record does not exist, or
    /// `AppError::Persistence` if the delete fails.
    fn delete<'a>(&'a self, id: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Records matching `filter`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if the query fails.
    fn list<'a>(
        &'a self,
        filter: &'a SessionFilter,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Session>>> + Send + 'a>>;

    /// Set status and bump `updated_at`, returning the stored record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the record does not exist, or
    /// `AppError::Persistence` if the write fails.
    fn update_status<'a>(
        &'a self,
        id: &'a str,
        status: SessionStatus,
    ) -> Pin<Box<dyn Future<Output = Result<Session>> + Send + 'a>>;

    /// Delete every record, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if the delete fails.
    fn delete_all(&self) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>>;
}

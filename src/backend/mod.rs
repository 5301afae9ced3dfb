//! Persistent terminal sessions hosting the agent programs.
//!
//! [`ProcessBackend`] is the orchestrator's only view of the terminal
//! multiplexer. [`tmux::TmuxBackend`] implements it with `tmux`.

pub mod tmux;

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use crate::models::session::Dimensions;
use crate::Result;

pub use tmux::TmuxBackend;

/// Terminal-multiplexing service keyed by session name.
pub trait ProcessBackend: Send + Sync {
    /// Start a detached session named `name` in `work_dir` running `command`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalService` if the session already exists or
    /// cannot be started.
    fn create_session<'a>(
        &'a self,
        name: &'a str,
        work_dir: &'a Path,
        command: &'a str,
        dimensions: Dimensions,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Kill a session. Killing a session that does not exist succeeds.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalService` for any other failure.
    fn kill_session<'a>(&'a self, name: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Whether a session with this name is running.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalService` if the check cannot run.
    fn session_exists<'a>(&'a self, name: &'a str) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

    /// Type `text` into the session. Each `\n` is submitted as Enter.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalService` if delivery fails.
    fn send_keys<'a>(&'a self, name: &'a str, text: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Visible pane contents.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalService` if capture fails.
    fn capture_pane<'a>(&'a self, name: &'a str) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

    /// Full scrollback history plus visible contents.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalService` if capture fails.
    fn capture_scrollback<'a>(&'a self, name: &'a str) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

    /// Attach the caller's terminal; returns once the operator detaches.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalService` if the session is missing or the
    /// attach client fails.
    fn attach_session<'a>(&'a self, name: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Kill every session owned by this tool, returning how many were killed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ExternalService` if sessions cannot be listed.
    fn cleanup_sessions(&self) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + '_>>;
}

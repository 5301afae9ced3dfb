#![forbid(unsafe_code)]

//! Run several isolated agent sessions side by side.
//!
//! Each session pairs a git worktree with a tmux session. The
//! [`orchestrator`] coordinates their lifecycle, the [`executor`] runs every
//! external command under a shared concurrency budget, and the [`daemon`]
//! auto-accepts confirmation prompts in the background.

pub mod backend;
pub mod config;
pub mod daemon;
pub mod errors;
pub mod executor;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod workspace;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};

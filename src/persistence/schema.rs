//! `SQLite` schema bootstrap logic.
//!
//! Table definitions use `CREATE TABLE IF NOT EXISTS` and are safe to
//! re-run on every startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply the session table definition to the connected database.
///
/// # Errors
///
/// Returns `AppError::Persistence` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS session (
    id              TEXT PRIMARY KEY NOT NULL,
    title           TEXT NOT NULL,
    repo_path       TEXT NOT NULL,
    workspace_path  TEXT,
    branch          TEXT NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('loading','ready','running','paused')),
    program         TEXT NOT NULL,
    width           INTEGER NOT NULL,
    height          INTEGER NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    auto_yes        INTEGER NOT NULL DEFAULT 0,
    prompt          TEXT
);

CREATE INDEX IF NOT EXISTS idx_session_title ON session(title);
CREATE INDEX IF NOT EXISTS idx_session_status ON session(status);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}

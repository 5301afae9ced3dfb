//! Session repository for `SQLite` persistence.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::session::{Dimensions, Session, SessionStatus};
use crate::{AppError, Result};

use super::db::Database;
use super::{SessionFilter, SessionStore};

const COLUMNS: &str = "id, title, repo_path, workspace_path, branch, status, program, \
                       width, height, created_at, updated_at, auto_yes, prompt";

/// `SQLite`-backed [`SessionStore`].
#[derive(Clone)]
pub struct SqliteSessionStore {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    title: String,
    repo_path: String,
    workspace_path: Option<String>,
    branch: String,
    status: String,
    program: String,
    width: i64,
    height: i64,
    created_at: String,
    updated_at: String,
    auto_yes: i64,
    prompt: Option<String>,
}

impl SessionRow {
    fn into_session(self) -> Result<Session> {
        let status = self
            .status
            .parse::<SessionStatus>()
            .map_err(|err| AppError::Persistence(format!("corrupt session {}: {err}", self.id)))?;
        let dimensions = Dimensions {
            width: parse_dimension(self.width, "width")?,
            height: parse_dimension(self.height, "height")?,
        };

        Ok(Session {
            created_at: parse_timestamp(&self.created_at, "created_at")?,
            updated_at: parse_timestamp(&self.updated_at, "updated_at")?,
            id: self.id,
            title: self.title,
            repo_path: PathBuf::from(self.repo_path),
            workspace_path: self.workspace_path.map(PathBuf::from),
            branch: self.branch,
            status,
            program: self.program,
            dimensions,
            auto_yes: self.auto_yes != 0,
            prompt: self.prompt,
        })
    }
}

fn parse_timestamp(raw: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AppError::Persistence(format!("invalid {field}: {e}")))
}

fn parse_dimension(raw: i64, field: &str) -> Result<u16> {
    u16::try_from(raw).map_err(|_| AppError::Persistence(format!("invalid {field}: {raw}")))
}

fn path_str(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

impl SqliteSessionStore {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn insert(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO session (id, title, repo_path, workspace_path, branch, status, program,
                                  width, height, created_at, updated_at, auto_yes, prompt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(&session.id)
        .bind(&session.title)
        .bind(path_str(&session.repo_path))
        .bind(session.workspace_path.as_deref().map(path_str))
        .bind(&session.branch)
        .bind(session.status.as_str())
        .bind(&session.program)
        .bind(i64::from(session.dimensions.width))
        .bind(i64::from(session.dimensions.height))
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .bind(i64::from(session.auto_yes))
        .bind(&session.prompt)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Session> {
        let row: Option<SessionRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM session WHERE id = ?1"))
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;
        row.ok_or_else(|| AppError::NotFound(format!("session {id}")))?
            .into_session()
    }

    async fn replace(&self, session: &Session) -> Result<()> {
        let result = sqlx::query(
            "UPDATE session
             SET title = ?2, repo_path = ?3, workspace_path = ?4, branch = ?5, status = ?6,
                 program = ?7, width = ?8, height = ?9, updated_at = ?10, auto_yes = ?11,
                 prompt = ?12
             WHERE id = ?1",
        )
        .bind(&session.id)
        .bind(&session.title)
        .bind(path_str(&session.repo_path))
        .bind(session.workspace_path.as_deref().map(path_str))
        .bind(&session.branch)
        .bind(session.status.as_str())
        .bind(&session.program)
        .bind(i64::from(session.dimensions.width))
        .bind(i64::from(session.dimensions.height))
        .bind(session.updated_at.to_rfc3339())
        .bind(i64::from(session.auto_yes))
        .bind(&session.prompt)
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("session {}", session.id)));
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM session WHERE id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("session {id}")));
        }
        Ok(())
    }

    async fn select(&self, filter: &SessionFilter) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM session
             WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR branch = ?2)
               AND (?3 IS NULL OR title = ?3)
               AND (?4 IS NULL OR auto_yes = ?4)
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(filter.status.map(SessionStatus::as_str))
        .bind(&filter.branch)
        .bind(&filter.title)
        .bind(filter.auto_yes.map(i64::from))
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    async fn set_status(&self, id: &str, status: SessionStatus) -> Result<Session> {
        let result = sqlx::query("UPDATE session SET status = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .execute(self.db.as_ref())
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("session {id}")));
        }
        self.get_by_id(id).await
    }

    async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM session")
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}

impl SessionStore for SqliteSessionStore {
    fn create<'a>(&'a self, session: &'a Session) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.insert(session))
    }

    fn get<'a>(&'a self, id: &'a str) -> Pin<Box<dyn Future<Output = Result<Session>> + Send + 'a>> {
        Box::pin(self.get_by_id(id))
    }

    fn update<'a>(&'a self, session: &'a Session) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.replace(session))
    }

    fn delete<'a>(&'a self, id: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.remove(id))
    }

    fn list<'a>(
        &'a self,
        filter: &'a SessionFilter,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Session>>> + Send + 'a>> {
        Box::pin(self.select(filter))
    }

    fn update_status<'a>(
        &'a self,
        id: &'a str,
        status: SessionStatus,
    ) -> Pin<Box<dyn Future<Output = Result<Session>> + Send + 'a>> {
        Box::pin(self.set_status(id, status))
    }

    fn delete_all(&self) -> Pin<Box<dyn Future<Output = Result<u64>> + Send + '_>> {
        Box::pin(self.clear())
    }
}

use std::sync::Arc;

use agent_squad::models::session::{Dimensions, Session, SessionStatus};
use agent_squad::persistence::session_repo::SqliteSessionStore;
use agent_squad::persistence::{db, SessionFilter, SessionStore};
use agent_squad::AppError;
use chrono::{Duration, Utc};

async fn store() -> SqliteSessionStore {
    let pool = db::connect_memory().await.expect("in-memory connect should succeed");
    SqliteSessionStore::new(Arc::new(pool))
}

fn session(title: &str, branch: &str, age_secs: i64) -> Session {
    let mut session = Session::new(
        title.into(),
        "/repo".into(),
        branch.into(),
        "claude".into(),
        Dimensions {
            width: 120,
            height: 40,
        },
    );
    session.created_at = Utc::now() - Duration::seconds(age_secs);
    session.updated_at = session.created_at;
    session
}

#[tokio::test]
async fn in_memory_connect_creates_session_table() {
    let pool = db::connect_memory().await.unwrap();
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM session")
        .fetch_one(&pool)
        .await
        .expect("session table should be queryable");
    assert_eq!(row.0, 0);
}

#[tokio::test]
async fn create_then_get_returns_identical_record() {
    let store = store().await;
    let mut original = session("fix login", "feature/login", 0);
    original.workspace_path = Some("/repo-worktree-x".into());
    original.auto_yes = true;
    original.prompt = Some("write tests".into());

    store.create(&original).await.unwrap();
    let fetched = store.get(&original.id).await.unwrap();
    assert_eq!(fetched, original);
}

#[tokio::test]
async fn duplicate_id_is_rejected() {
    let store = store().await;
    let original = session("a", "main", 0);
    store.create(&original).await.unwrap();
    assert!(matches!(
        store.create(&original).await,
        Err(AppError::Persistence(_))
    ));
}

#[tokio::test]
async fn update_replaces_mutable_fields() {
    let store = store().await;
    let mut record = session("a", "main", 0);
    store.create(&record).await.unwrap();

    record.workspace_path = None;
    record.set_status(SessionStatus::Paused);
    store.update(&record).await.unwrap();

    let fetched = store.get(&record.id).await.unwrap();
    assert_eq!(fetched.status, SessionStatus::Paused);
    assert!(fetched.workspace_path.is_none());
    assert_eq!(fetched.created_at, record.created_at);
}

#[tokio::test]
async fn missing_records_are_not_found() {
    let store = store().await;
    let ghost = session("ghost", "main", 0);
    assert!(matches!(store.get(&ghost.id).await, Err(AppError::NotFound(_))));
    assert!(matches!(store.update(&ghost).await, Err(AppError::NotFound(_))));
    assert!(matches!(store.delete(&ghost.id).await, Err(AppError::NotFound(_))));
    assert!(matches!(
        store.update_status(&ghost.id, SessionStatus::Ready).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn update_status_returns_updated_record() {
    let store = store().await;
    let record = session("a", "main", 10);
    store.create(&record).await.unwrap();

    let updated = store
        .update_status(&record.id, SessionStatus::Running)
        .await
        .unwrap();
    assert_eq!(updated.status, SessionStatus::Running);
    assert!(updated.updated_at > record.updated_at);
}

#[tokio::test]
async fn list_is_ordered_by_creation_and_filters() {
    let store = store().await;
    let newest = session("newest", "main", 1);
    let oldest = session("oldest", "feature/x", 30);
    let mut middle = session("middle", "main", 10);
    middle.auto_yes = true;
    middle.status = SessionStatus::Paused;
    for record in [&newest, &oldest, &middle] {
        store.create(record).await.unwrap();
    }

    let titles: Vec<String> = store
        .list(&SessionFilter::all())
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.title)
        .collect();
    assert_eq!(titles, vec!["oldest", "middle", "newest"]);

    let on_main = store
        .list(&SessionFilter::all().with_branch("main"))
        .await
        .unwrap();
    assert_eq!(on_main.len(), 2);

    let paused = store
        .list(&SessionFilter::all().with_status(SessionStatus::Paused))
        .await
        .unwrap();
    assert_eq!(paused.len(), 1);
    assert_eq!(paused[0].id, middle.id);

    let auto = store
        .list(&SessionFilter::all().with_auto_yes(true).with_title("middle"))
        .await
        .unwrap();
    assert_eq!(auto.len(), 1);

    assert!(SessionFilter::all().with_branch("main").matches(&newest));
    assert!(!SessionFilter::all().with_branch("main").matches(&oldest));
}

#[tokio::test]
async fn delete_and_delete_all() {
    let store = store().await;
    let a = session("a", "main", 2);
    let b = session("b", "main", 1);
    let c = session("c", "main", 0);
    for record in [&a, &b, &c] {
        store.create(record).await.unwrap();
    }

    store.delete(&a.id).await.unwrap();
    assert_eq!(store.list(&SessionFilter::all()).await.unwrap().len(), 2);

    assert_eq!(store.delete_all().await.unwrap(), 2);
    assert!(store.list(&SessionFilter::all()).await.unwrap().is_empty());
}

#[tokio::test]
async fn file_database_persists_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("sessions.db");
    let record = session("durable", "main", 0);

    {
        let pool = db::connect(&path).await.unwrap();
        let store = SqliteSessionStore::new(Arc::new(pool.clone()));
        store.create(&record).await.unwrap();
        pool.close().await;
    }

    let pool = db::connect(&path).await.unwrap();
    let store = SqliteSessionStore::new(Arc::new(pool));
    assert_eq!(store.get(&record.id).await.unwrap(), record);
}

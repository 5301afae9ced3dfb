use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::time::Duration;

use agent_squad::models::session::SessionStatus;
use agent_squad::persistence::SessionStore;
use agent_squad::AppError;

use super::test_helpers::{harness, ready_session, request, wait_for_status};

#[tokio::test]
async fn parallel_creates_get_distinct_sessions() {
    let h = harness().await;
    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.create_session(request(&format!("s{i}"))).await })
        })
        .collect();

    let mut ids = HashSet::new();
    for task in futures_util::future::join_all(tasks).await {
        ids.insert(task.unwrap().unwrap().id);
    }
    assert_eq!(ids.len(), 8);
    assert_eq!(h.workspace.worktree_count(), 8);
    assert_eq!(h.backend.pane_count(), 8);
    assert_eq!(h.orchestrator.list_sessions().await.unwrap().len(), 8);

    for id in &ids {
        wait_for_status(&h.orchestrator, id, SessionStatus::Ready).await;
    }
}

#[tokio::test]
async fn concurrent_pause_and_stop_serialise() {
    let h = harness().await;
    let session = ready_session(&h, "contended").await;

    let pause = {
        let orchestrator = h.orchestrator.clone();
        let id = session.id.clone();
        tokio::spawn(async move { orchestrator.pause_session(&id).await })
    };
    let stop = {
        let orchestrator = h.orchestrator.clone();
        let id = session.id.clone();
        tokio::spawn(async move { orchestrator.stop_session(&id).await })
    };

    let paused = pause.await.unwrap();
    stop.await.unwrap().unwrap();

    // Whichever ran first, the stop wins and nothing is left behind.
    if let Err(err) = paused {
        assert!(matches!(err, AppError::NotFound(_)), "got {err:?}");
    }
    assert!(matches!(
        h.orchestrator.get_session(&session.id).await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        h.store.inner.get(&session.id).await,
        Err(AppError::NotFound(_))
    ));
    assert_eq!(h.backend.pane_count(), 0);
    assert_eq!(h.workspace.worktree_count(), 0);
}

#[tokio::test]
async fn concurrent_pauses_apply_once() {
    let h = harness().await;
    let session = ready_session(&h, "double").await;

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let orchestrator = h.orchestrator.clone();
            let id = session.id.clone();
            tokio::spawn(async move { orchestrator.pause_session(&id).await })
        })
        .collect();

    let mut ok = 0;
    for result in futures_util::future::join_all(tasks).await {
        match result.unwrap() {
            Ok(_) => ok += 1,
            Err(err) => assert!(matches!(err, AppError::Precondition(_)), "got {err:?}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(h.workspace.with(|s| s.commits.len()), 1);
}

#[tokio::test]
async fn dropped_caller_does_not_abort_rollback() {
    let h = harness().await;
    h.store.fail_create.store(true, Ordering::SeqCst);

    let orchestrator = h.orchestrator.clone();
    let call = tokio::spawn(async move { orchestrator.create_session(request("abandoned")).await });
    tokio::time::sleep(Duration::from_millis(1)).await;
    call.abort();
    let _ = call.await;

    h.orchestrator.shutdown().await;
    assert_eq!(h.backend.pane_count(), 0);
    assert_eq!(h.workspace.worktree_count(), 0);
}

#[tokio::test]
async fn refresh_drops_records_deleted_elsewhere() {
    let h = harness().await;
    let session = ready_session(&h, "external").await;
    assert_eq!(h.orchestrator.list_sessions().await.unwrap().len(), 1);

    h.store.inner.delete(&session.id).await.unwrap();
    // Cached until refreshed.
    assert_eq!(h.orchestrator.list_sessions().await.unwrap().len(), 1);
    assert!(h.orchestrator.refresh_sessions().await.unwrap().is_empty());
    assert!(h.orchestrator.list_sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn cached_reads_do_not_hit_the_store() {
    let h = harness().await;
    let session = ready_session(&h, "cached").await;
    let before = h.store.gets.load(Ordering::SeqCst);
    for _ in 0..5 {
        h.orchestrator.get_session(&session.id).await.unwrap();
    }
    assert_eq!(h.store.gets.load(Ordering::SeqCst), before);
}

use std::sync::Arc;
use std::time::Duration;

use agent_squad::orchestrator::SessionLocks;

#[tokio::test]
async fn same_id_is_exclusive() {
    let locks = Arc::new(SessionLocks::new());
    let guard = locks.acquire("a").await;

    let contender = {
        let locks = Arc::clone(&locks);
        tokio::spawn(async move {
            let _guard = locks.acquire("a").await;
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!contender.is_finished());

    drop(guard);
    tokio::time::timeout(Duration::from_secs(1), contender)
        .await
        .expect("contender acquires after release")
        .unwrap();
}

#[tokio::test]
async fn different_ids_do_not_block() {
    let locks = SessionLocks::new();
    let _a = locks.acquire("a").await;
    let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("b")).await;
    assert!(b.is_ok());
    assert_eq!(locks.len(), 2);
}

#[tokio::test]
async fn release_drops_idle_entries_only() {
    let locks = SessionLocks::new();
    let guard = locks.acquire("a").await;
    locks.release("a");
    assert_eq!(locks.len(), 1, "held lock stays registered");

    drop(guard);
    locks.release("a");
    assert!(locks.is_empty());
}

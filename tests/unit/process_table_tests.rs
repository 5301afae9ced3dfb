#![cfg(unix)]

use std::time::Duration;

use agent_squad::executor::{Command, CommandExecutor, ProcessState};
use agent_squad::AppError;
use nix::sys::signal::Signal;

#[tokio::test]
async fn started_process_is_listed_until_waited() {
    let executor = CommandExecutor::default();
    let handle = executor.start(&Command::new("sh").args(["-c", "exit 5"])).unwrap();
    let id = handle.id();

    let listed = executor.list_processes();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].handle, id);
    assert_eq!(listed[0].program, "sh");
    assert_eq!(listed[0].args, vec!["-c".to_owned(), "exit 5".to_owned()]);

    let result = executor.wait(handle).await.unwrap();
    assert_eq!(result.exit_code, 5);
    assert!(result.stdout.is_empty());
    assert!(executor.list_processes().is_empty());
    assert!(matches!(executor.get_process_info(id), Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn finished_but_unwaited_process_is_a_zombie() {
    let executor = CommandExecutor::default();
    let handle = executor.start(&Command::new("true")).unwrap();

    let mut state = ProcessState::Running;
    for _ in 0..50 {
        state = executor.get_process_info(handle.id()).unwrap().state;
        if state == ProcessState::Zombie {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state, ProcessState::Zombie);
    executor.dispose(handle);
    assert!(executor.list_processes().is_empty());
}

#[tokio::test]
async fn kill_by_id_terminates_process() {
    let executor = CommandExecutor::default();
    let handle = executor.start(&Command::new("sleep").arg("30")).unwrap();
    executor.kill(handle.id()).unwrap();
    assert_eq!(
        executor.get_process_info(handle.id()).unwrap().state,
        ProcessState::Exited
    );

    let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("killed process is reaped promptly")
        .unwrap();
    assert_eq!(result.exit_code, -1);
    assert!(!result.success());
}

#[tokio::test]
async fn kill_while_waiting_unblocks_waiter() {
    let executor = CommandExecutor::default();
    let handle = executor.start(&Command::new("sleep").arg("30")).unwrap();
    let id = handle.id();
    let waiter = tokio::spawn(handle.wait());
    tokio::time::sleep(Duration::from_millis(50)).await;

    executor.kill(id).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter finishes")
        .unwrap()
        .unwrap();
    assert_eq!(result.exit_code, -1);
}

#[tokio::test]
async fn stop_and_continue_update_state() {
    let executor = CommandExecutor::default();
    let handle = executor.start(&Command::new("sleep").arg("30")).unwrap();

    executor.signal(handle.id(), Signal::SIGSTOP).unwrap();
    assert_eq!(handle.info().unwrap().state, ProcessState::Stopped);

    handle.signal(Signal::SIGCONT).unwrap();
    assert_eq!(handle.info().unwrap().state, ProcessState::Running);

    handle.kill().unwrap();
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn find_by_pid_and_drop_releases_entry() {
    let executor = CommandExecutor::default();
    let handle = executor.start(&Command::new("sleep").arg("30")).unwrap();
    let pid = handle.pid().unwrap();

    let found = executor.find_process(pid).unwrap();
    assert_eq!(found.handle, handle.id());
    assert_eq!(found.handle.to_string(), format!("{}", handle.id()));
    assert!(found.handle.to_string().starts_with("proc-"));

    drop(handle);
    assert!(executor.find_process(pid).is_none());
}

#[tokio::test]
async fn unknown_handles_are_not_found() {
    let executor = CommandExecutor::default();
    let handle = executor.start(&Command::new("true")).unwrap();
    let id = handle.id();
    executor.dispose(handle);

    assert!(matches!(executor.kill(id), Err(AppError::NotFound(_))));
    assert!(matches!(
        executor.signal(id, Signal::SIGTERM),
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn handles_are_listed_in_start_order() {
    let executor = CommandExecutor::default();
    let first = executor.start(&Command::new("sleep").arg("30")).unwrap();
    let second = executor.start(&Command::new("sleep").arg("30")).unwrap();

    let ids: Vec<_> = executor.list_processes().iter().map(|p| p.handle).collect();
    assert_eq!(ids, vec![first.id(), second.id()]);
}

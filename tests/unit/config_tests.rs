use std::io::Write;
use std::time::Duration;

use agent_squad::executor::DEFAULT_MAX_CONCURRENT;
use agent_squad::{AppError, GlobalConfig};

#[test]
fn minimal_config_uses_defaults() {
    let config = GlobalConfig::from_toml_str("data_dir = '/tmp/squad'").unwrap();
    assert_eq!(config.db_path(), std::path::Path::new("/tmp/squad/sessions.db"));

    let orchestrator = config.orchestrator_settings();
    assert_eq!(orchestrator.ready_grace, Duration::from_secs(2));
    assert!(orchestrator.worktree_dir.is_none());
    assert_eq!(orchestrator.default_dimensions.width, 200);
    assert_eq!(orchestrator.default_dimensions.height, 50);

    let daemon = config.daemon_settings();
    assert_eq!(daemon.poll_interval, Duration::from_secs(1));
    assert_eq!(daemon.log_window, Duration::from_secs(60));

    let executor = config.executor_options();
    assert_eq!(executor.max_concurrent, 10);
    assert_eq!(executor.default_timeout, Duration::from_secs(120));
    assert_eq!(executor.retry_count, 0);
}

#[test]
fn sections_override_defaults() {
    let raw = r#"
data_dir = "/var/lib/squad"

[executor]
max_concurrent = 3
default_timeout_seconds = 30
retry_count = 2
retry_delay_ms = 10
retry_on_exit_codes = [128]

[orchestrator]
ready_grace_ms = 250
worktree_dir = "/var/lib/squad/worktrees"
default_program = "aider"
default_width = 120
default_height = 40

[daemon]
poll_interval_ms = 200
log_window_seconds = 5
"#;
    let config = GlobalConfig::from_toml_str(raw).unwrap();

    let executor = config.executor_options();
    assert_eq!(executor.max_concurrent, 3);
    assert_eq!(executor.default_timeout, Duration::from_secs(30));
    assert_eq!(executor.retry_count, 2);
    assert_eq!(executor.retry_delay, Duration::from_millis(10));
    assert_eq!(executor.retry_on_exit_codes, vec![128]);

    let orchestrator = config.orchestrator_settings();
    assert_eq!(orchestrator.ready_grace, Duration::from_millis(250));
    assert_eq!(
        orchestrator.worktree_dir.as_deref(),
        Some(std::path::Path::new("/var/lib/squad/worktrees"))
    );
    assert_eq!(config.orchestrator.default_program, "aider");
    assert_eq!(orchestrator.default_dimensions.width, 120);

    assert_eq!(config.daemon_settings().poll_interval, Duration::from_millis(200));
}

#[test]
fn non_positive_concurrency_and_negative_retries_are_clamped() {
    let raw = r"
data_dir = '/tmp/squad'

[executor]
max_concurrent = -4
retry_count = -1
";
    let options = GlobalConfig::from_toml_str(raw).unwrap().executor_options();
    assert_eq!(options.max_concurrent, DEFAULT_MAX_CONCURRENT);
    assert_eq!(options.retry_count, 0);
}

#[test]
fn zero_poll_interval_is_rejected() {
    let raw = "data_dir = '/tmp/squad'\n[daemon]\npoll_interval_ms = 0\n";
    assert!(matches!(
        GlobalConfig::from_toml_str(raw),
        Err(AppError::Config(_))
    ));
}

#[test]
fn empty_program_is_rejected() {
    let raw = "data_dir = '/tmp/squad'\n[orchestrator]\ndefault_program = '  '\n";
    assert!(matches!(
        GlobalConfig::from_toml_str(raw),
        Err(AppError::Config(_))
    ));
}

#[test]
fn missing_data_dir_is_a_config_error() {
    assert!(matches!(
        GlobalConfig::from_toml_str("[daemon]\npoll_interval_ms = 5\n"),
        Err(AppError::Config(_))
    ));
}

#[test]
fn load_from_path_reads_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "data_dir = '/tmp/from-file'").unwrap();
    let config = GlobalConfig::load_from_path(file.path()).unwrap();
    assert_eq!(config.data_dir, std::path::Path::new("/tmp/from-file"));
}

#[test]
fn load_from_missing_path_fails() {
    let dir = tempfile::tempdir().unwrap();
    let result = GlobalConfig::load_from_path(dir.path().join("absent.toml"));
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn with_data_dir_builds_valid_defaults() {
    let config = GlobalConfig::with_data_dir("/data".into());
    assert_eq!(config.orchestrator.default_program, "claude");
    assert_eq!(config.db_path(), std::path::Path::new("/data/sessions.db"));
}

#[test]
#[serial_test::serial]
fn from_home_roots_data_dir_under_home() {
    let dir = tempfile::tempdir().unwrap();
    let previous = std::env::var_os("HOME");
    std::env::set_var("HOME", dir.path());

    let config = GlobalConfig::from_home().unwrap();

    match previous {
        Some(home) => std::env::set_var("HOME", home),
        None => std::env::remove_var("HOME"),
    }
    assert_eq!(config.data_dir, dir.path().join(".agent-squad"));
    assert_eq!(config.db_path(), dir.path().join(".agent-squad").join("sessions.db"));
}

#[test]
#[serial_test::serial]
fn from_home_without_home_is_a_config_error() {
    let previous = std::env::var_os("HOME");
    std::env::remove_var("HOME");

    let result = GlobalConfig::from_home();

    if let Some(home) = previous {
        std::env::set_var("HOME", home);
    }
    assert!(matches!(result, Err(AppError::Config(_))));
}

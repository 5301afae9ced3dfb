#![forbid(unsafe_code)]

//! `agent-squad` command-line entry point.
//!
//! Wires the git workspace service, the tmux backend and the `SQLite`
//! session store into one [`SessionOrchestrator`] and dispatches a single
//! subcommand against it. `daemon` keeps running until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_squad::backend::TmuxBackend;
use agent_squad::config::GlobalConfig;
use agent_squad::daemon::Daemon;
use agent_squad::executor::CommandExecutor;
use agent_squad::models::session::{CreateSessionRequest, Session};
use agent_squad::orchestrator::{SessionEvent, SessionOrchestrator};
use agent_squad::persistence::db;
use agent_squad::persistence::session_repo::SqliteSessionStore;
use agent_squad::workspace::GitWorkspace;
use agent_squad::{AppError, Result};

/// Extra wait on top of the readiness grace before `create` gives up on
/// seeing the session promoted.
const READY_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-squad", about = "Run isolated agent sessions side by side", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Defaults live under `~/.agent-squad`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a session in its own worktree and tmux session.
    Create {
        /// Session title.
        #[arg(long)]
        title: String,
        /// Repository to carve the workspace from.
        #[arg(long, default_value = ".")]
        path: PathBuf,
        /// Branch to work on; created if missing. Defaults to a new squad/<id> branch.
        #[arg(long)]
        branch: Option<String>,
        /// Program to launch. Defaults to the configured program.
        #[arg(long)]
        program: Option<String>,
        /// Initial input sent after launch.
        #[arg(long)]
        prompt: Option<String>,
        /// Let the daemon auto-accept prompts for this session.
        #[arg(long)]
        auto_yes: bool,
    },
    /// List sessions, oldest first.
    List {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Show uncommitted changes of a session.
    Diff {
        /// Session ID or title.
        session: String,
    },
    /// Commit work, tear down the workspace and keep the branch.
    Pause {
        /// Session ID or title.
        session: String,
    },
    /// Recreate a paused session's workspace and tmux session.
    Resume {
        /// Session ID or title.
        session: String,
    },
    /// Attach the terminal to a session.
    Attach {
        /// Session ID or title.
        session: String,
    },
    /// Tear a session down and delete its record.
    Stop {
        /// Session ID or title.
        session: String,
    },
    /// Stop every session and clean up leftovers.
    Reset,
    /// Auto-accept prompts for every session until interrupted.
    Daemon,
}

fn main() -> ExitCode {
    let args = Cli::parse();
    if let Err(err) = init_tracing(args.log_format) {
        eprintln!("agent-squad: {err}");
        return ExitCode::FAILURE;
    }

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))
        .and_then(|runtime| runtime.block_on(run(args)));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("agent-squad: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Cli) -> Result<()> {
    let config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::from_home()?,
    };
    info!(data_dir = %config.data_dir.display(), "configuration loaded");

    let database = Arc::new(db::connect(&config.db_path()).await?);
    let executor = CommandExecutor::new(config.executor_options());
    let orchestrator = SessionOrchestrator::new(
        Arc::new(GitWorkspace::new(executor.clone())),
        Arc::new(TmuxBackend::new(executor)),
        Arc::new(SqliteSessionStore::new(database)),
        config.orchestrator_settings(),
    );

    let result = dispatch(&orchestrator, &config, args.command).await;
    orchestrator.shutdown().await;
    result
}

async fn dispatch(orchestrator: &SessionOrchestrator, config: &GlobalConfig, command: Commands) -> Result<()> {
    match command {
        Commands::Create {
            title,
            path,
            branch,
            program,
            prompt,
            auto_yes,
        } => {
            let path = path
                .canonicalize()
                .map_err(|err| AppError::Validation(format!("invalid path {}: {err}", path.display())))?;
            let program = program.unwrap_or_else(|| config.orchestrator.default_program.clone());
            let mut request = CreateSessionRequest::new(title, path, program);
            request.branch = branch;
            request.prompt = prompt;
            request.auto_yes = auto_yes;

            let events = orchestrator.subscribe();
            let session = orchestrator.create_session(request).await?;
            wait_until_ready(orchestrator, events, &session.id).await;
            let session = orchestrator.get_session(&session.id).await?;
            println!("{}", row(&session));
        }
        Commands::List { json } => {
            let sessions = orchestrator.list_sessions().await?;
            if json {
                let text = serde_json::to_string_pretty(&sessions)
                    .map_err(|err| AppError::Io(format!("failed to encode sessions: {err}")))?;
                println!("{text}");
            } else if sessions.is_empty() {
                println!("no sessions");
            } else {
                for session in &sessions {
                    println!("{}", row(session));
                }
            }
        }
        Commands::Diff { session } => {
            let session = resolve(orchestrator, &session).await?;
            let stats = orchestrator.diff_session(&session.id).await?;
            for file in &stats.files {
                if file.binary {
                    println!("   bin         {}", file.path);
                } else {
                    println!(
                        "{:>6} {:>6}  {}",
                        format!("+{}", file.insertions),
                        format!("-{}", file.deletions),
                        file.path
                    );
                }
            }
            println!(
                "{} file(s) changed, +{} -{}",
                stats.files_changed, stats.insertions, stats.deletions
            );
        }
        Commands::Pause { session } => {
            let session = resolve(orchestrator, &session).await?;
            let session = orchestrator.pause_session(&session.id).await?;
            println!("{}", row(&session));
        }
        Commands::Resume { session } => {
            let session = resolve(orchestrator, &session).await?;
            let session = orchestrator.resume_session(&session.id).await?;
            println!("{}", row(&session));
        }
        Commands::Attach { session } => {
            let session = resolve(orchestrator, &session).await?;
            orchestrator.attach_session(&session.id).await?;
        }
        Commands::Stop { session } => {
            let session = resolve(orchestrator, &session).await?;
            orchestrator.stop_session(&session.id).await?;
            println!("stopped {}", session.short_id());
        }
        Commands::Reset => {
            let stopped = orchestrator.reset_all().await?;
            println!("reset: {stopped} session(s) stopped");
        }
        Commands::Daemon => {
            let daemon = Daemon::new(orchestrator.clone(), config.daemon_settings())?;
            let daemon = daemon.run_until_signal(CancellationToken::new()).await?;
            info!(answered = daemon.answered(), "daemon exited");
        }
    }
    Ok(())
}

/// Look a session up by ID, then by title.
async fn resolve(orchestrator: &SessionOrchestrator, key: &str) -> Result<Session> {
    match orchestrator.get_session(key).await {
        Err(AppError::NotFound(_)) => orchestrator.get_session_by_title(key).await,
        other => other,
    }
}

/// The readiness timer lives in this process, so `create` waits for it
/// before the runtime shuts down.
async fn wait_until_ready(
    orchestrator: &SessionOrchestrator,
    mut events: broadcast::Receiver<SessionEvent>,
    id: &str,
) {
    let limit = orchestrator.settings().ready_grace + READY_SLACK;
    let outcome = tokio::time::timeout(limit, async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Ready { session_id }) if session_id == id => return,
                Ok(SessionEvent::TaskFailed { session_id, error, .. }) if session_id == id => {
                    warn!(session_id = id, %error, "session was not promoted");
                    return;
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
    .await;
    if outcome.is_err() {
        warn!(session_id = id, "timed out waiting for session to become ready");
    }
}

fn row(session: &Session) -> String {
    format!(
        "{}  {:<8}  {:<24}  {}",
        session.short_id(),
        session.status,
        session.title,
        session.branch
    )
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}

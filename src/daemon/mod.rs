//! Background auto-accept loop.
//!
//! The daemon polls the orchestrator on a fixed interval and submits a
//! newline to sessions whose output ends in a confirmation prompt. It is a
//! single sequential actor: sessions are processed one after another, and
//! its local view may lag the orchestrator between ticks.
//!
//! Every session the daemon tracks is treated as auto-accepting: the stored
//! `auto_yes` flag is overridden locally, so running the daemon opts every
//! ready session in.
//!
//! A prompt is answered once per occurrence. The captured output that was
//! answered is remembered per session, and an identical capture on a later
//! tick is not answered again.

pub mod log_limiter;
pub mod prompt_detector;

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::models::session::Session;
use crate::orchestrator::SessionOrchestrator;
use crate::{AppError, Result};

pub use log_limiter::LogLimiter;
pub use prompt_detector::PromptDetector;

const REFRESH_LOG_KEY: &str = "<refresh>";

/// Daemon tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonSettings {
    /// Tick interval.
    pub poll_interval: Duration,
    /// Minimum spacing between repeated warnings for one session.
    pub log_window: Duration,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            log_window: Duration::from_secs(60),
        }
    }
}

struct Tracked {
    session: Session,
    last_answered: Option<String>,
}

impl Tracked {
    fn new(mut session: Session) -> Self {
        session.auto_yes = true;
        Self {
            session,
            last_answered: None,
        }
    }

    fn refresh(&mut self, mut session: Session) {
        session.auto_yes = true;
        self.session = session;
    }
}

/// Auto-accept actor over a [`SessionOrchestrator`].
pub struct Daemon {
    orchestrator: SessionOrchestrator,
    settings: DaemonSettings,
    detector: PromptDetector,
    limiter: LogLimiter,
    sessions: BTreeMap<String, Tracked>,
    answered: u64,
}

impl Daemon {
    /// Build a daemon with the default prompt detector.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the prompt pattern fails to compile.
    pub fn new(orchestrator: SessionOrchestrator, settings: DaemonSettings) -> Result<Self> {
        Ok(Self::with_detector(orchestrator, settings, PromptDetector::new()?))
    }

    /// Build a daemon with a custom prompt detector.
    #[must_use]
    pub fn with_detector(
        orchestrator: SessionOrchestrator,
        settings: DaemonSettings,
        detector: PromptDetector,
    ) -> Self {
        let limiter = LogLimiter::new(settings.log_window);
        Self {
            orchestrator,
            settings,
            detector,
            limiter,
            sessions: BTreeMap::new(),
            answered: 0,
        }
    }

    /// Newlines submitted so far.
    #[must_use]
    pub fn answered(&self) -> u64 {
        self.answered
    }

    /// Run on a background task until `cancel` fires.
    #[must_use]
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<Result<Self>> {
        tokio::spawn(self.run(cancel).instrument(info_span!("daemon")))
    }

    /// Run until SIGINT/SIGTERM or `cancel`, then wait for the in-flight
    /// tick.
    ///
    /// # Errors
    ///
    /// Same as [`run`](Self::run).
    pub async fn run_until_signal(self, cancel: CancellationToken) -> Result<Self> {
        let trigger = cancel.clone();
        let watcher = tokio::spawn(async move {
            tokio::select! {
                () = shutdown_signal() => {
                    info!("termination signal received");
                    trigger.cancel();
                }
                () = trigger.cancelled() => {}
            }
        });

        let result = self.run(cancel.clone()).await;
        cancel.cancel();
        if let Err(err) = watcher.await {
            warn!(%err, "signal watcher task failed");
        }
        result
    }

    /// Load the session list, then tick until `cancel` fires. A tick in
    /// progress always completes. Returns the daemon for inspection.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if the initial session list cannot
    /// be loaded. Failures after start-up are logged, never returned.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<Self> {
        self.load().await?;
        info!(
            sessions = self.sessions.len(),
            poll_ms = u64::try_from(self.settings.poll_interval.as_millis()).unwrap_or(u64::MAX),
            "daemon started"
        );

        let period = self.settings.poll_interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        info!(answered = self.answered, "daemon stopped");
        Ok(self)
    }

    /// One pass over every tracked session.
    pub async fn tick(&mut self) {
        self.refresh().await;
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        for id in ids {
            self.process(&id).await;
        }
    }

    async fn load(&mut self) -> Result<()> {
        let sessions = self.orchestrator.list_sessions().await?;
        self.sessions = sessions
            .into_iter()
            .map(|session| (session.id.clone(), Tracked::new(session)))
            .collect();
        Ok(())
    }

    /// Pick up sessions created elsewhere and drop stopped ones.
    async fn refresh(&mut self) {
        let listed = match self.orchestrator.refresh_sessions().await {
            Ok(listed) => listed,
            Err(err) => {
                if self.limiter.should_log(REFRESH_LOG_KEY) {
                    warn!(%err, "could not refresh session list");
                }
                return;
            }
        };

        let mut next = BTreeMap::new();
        for session in listed {
            let tracked = match self.sessions.remove(&session.id) {
                Some(mut tracked) => {
                    tracked.refresh(session);
                    tracked
                }
                None => {
                    debug!(session_id = %session.id, "tracking new session");
                    Tracked::new(session)
                }
            };
            next.insert(tracked.session.id.clone(), tracked);
        }
        for id in self.sessions.keys() {
            self.limiter.forget(id);
        }
        self.sessions = next;
    }

    async fn process(&mut self, id: &str) {
        let Some(tracked) = self.sessions.get(id) else {
            return;
        };
        let session = &tracked.session;
        if !session.status.accepts_io() {
            return;
        }
        let title = session.title.clone();
        let already_answered = tracked.last_answered.clone();

        match self.orchestrator.get_output(id).await {
            Ok(output) => {
                let prompt = self.detector.is_prompt(&output);
                let answered = if prompt && already_answered.as_deref() == Some(output.as_str()) {
                    debug!(session_id = id, "prompt unchanged since last answer");
                    Some(output)
                } else if prompt {
                    match self.orchestrator.send_input(id, "\n").await {
                        Ok(()) => {
                            self.answered += 1;
                            info!(session_id = id, title = %title, "auto-accepted prompt");
                            Some(output)
                        }
                        Err(err) => {
                            if self.limiter.should_log(id) {
                                warn!(%err, session_id = id, title = %title, "could not send input");
                            }
                            already_answered
                        }
                    }
                } else {
                    None
                };
                if let Some(tracked) = self.sessions.get_mut(id) {
                    tracked.last_answered = answered;
                }
            }
            Err(err) => {
                if self.limiter.should_log(id) {
                    warn!(%err, session_id = id, title = %title, "could not get output");
                }
            }
        }

        match self.orchestrator.get_session(id).await {
            Ok(latest) => {
                if let Some(tracked) = self.sessions.get_mut(id) {
                    tracked.refresh(latest);
                }
            }
            Err(AppError::NotFound(_)) => {
                debug!(session_id = id, "session gone; no longer tracked");
                self.sessions.remove(id);
                self.limiter.forget(id);
            }
            Err(err) => {
                if self.limiter.should_log(id) {
                    warn!(%err, session_id = id, "could not re-read session");
                }
            }
        }
    }
}

/// Resolve on Ctrl-C, or on SIGTERM where supported.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

//! Session monitor: the periodic discover → classify → revive loop.
//!
//! One background task per monitor instance runs sweeps every
//! `ping_interval`. The session snapshot and configuration live behind a
//! single lock that is only held for in-memory work, never across a tmux
//! or `ps` invocation. Sweeps themselves are serialized by a second lock:
//! a sweep requested while another is running waits for it and shares its
//! report instead of reviving the same sessions twice. All state is owned
//! by the instance, so several monitors can coexist in one process.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{ConfigUpdate, MonitorConfig, Settings};
use crate::error::{MonitorError, Result};
use crate::leader::{LeaderElection, ProcessLister, PsProcessLister};
use crate::markers::{MarkerReader, SessionDescriptor, WorkItem, NO_TARGET};
use crate::revival::{choose_message, RevivalActuator};
use crate::staleness::{classify, Classification, SessionState};
use crate::tmux::{TerminalGateway, TmuxClient};

/// How long `stop_monitoring` waits for the loop to exit.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const MANUAL_PROJECT: &str = "manual";

/// Tallies from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub iteration: u64,
    pub discovered: usize,
    pub active: usize,
    /// Stale and queued for revival
    pub stale: usize,
    /// Stale but with no open work items
    pub idle: usize,
    pub forgotten: usize,
    pub revived: usize,
    pub failed: usize,
    /// `None` when nothing needed reviving and leadership was not consulted
    pub leader: Option<bool>,
}

/// One session as reported by [`SessionMonitor::list_sessions`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session_id: String,
    pub project_key: String,
    pub routing_token: String,
    /// Unix seconds
    pub last_activity: f64,
    pub idle_seconds: u64,
    pub state: SessionState,
    pub should_revive: bool,
    pub active_work_count: Option<usize>,
    pub work_items: Option<Vec<WorkItem>>,
}

impl SessionView {
    fn new(session: &SessionDescriptor, verdict: Classification) -> Self {
        Self {
            session_id: session.session_id.clone(),
            project_key: session.project_key.clone(),
            routing_token: session.routing_token.clone(),
            last_activity: session
                .last_activity
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
            idle_seconds: verdict.idle.as_secs(),
            state: verdict.state,
            should_revive: verdict.should_revive,
            active_work_count: session.active_work_count(),
            work_items: session.work_items.clone(),
        }
    }
}

/// Result of `list_sessions`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListing {
    pub sessions: Vec<SessionView>,
    pub count: usize,
    pub monitoring_enabled: bool,
    pub tmux_available: bool,
    pub is_leader: bool,
    pub pid: u32,
}

/// Mutable state guarded by the monitor's one lock.
struct MonitorState {
    sessions: BTreeMap<String, SessionDescriptor>,
    config: MonitorConfig,
}

struct Inner<G: TerminalGateway, P: ProcessLister> {
    state: Mutex<MonitorState>,
    /// Held for a whole sweep; keeps the last completed report
    last_sweep: Mutex<SweepReport>,
    enabled: AtomicBool,
    tmux_available: AtomicBool,
    sweeps: AtomicU64,
    wake: Notify,
    gateway: Arc<G>,
    actuator: RevivalActuator<G>,
    leader: LeaderElection<P>,
    reader: MarkerReader,
}

/// Watches marker files and revives stale sessions when this process leads.
pub struct SessionMonitor<G: TerminalGateway = TmuxClient, P: ProcessLister = PsProcessLister> {
    inner: Arc<Inner<G, P>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionMonitor<TmuxClient, PsProcessLister> {
    /// Production wiring: real tmux, `ps`-based election, this process's PID.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.monitor.clone(),
            MarkerReader::new(settings.sessions_root.clone()),
            TmuxClient::new(),
            LeaderElection::new(
                PsProcessLister,
                settings.process_signature.clone(),
                std::process::id(),
            ),
        )
    }
}

impl<G: TerminalGateway, P: ProcessLister> SessionMonitor<G, P> {
    pub fn new(
        config: MonitorConfig,
        reader: MarkerReader,
        gateway: G,
        leader: LeaderElection<P>,
    ) -> Self {
        let gateway = Arc::new(gateway);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(MonitorState {
                    sessions: BTreeMap::new(),
                    config,
                }),
                last_sweep: Mutex::new(SweepReport::default()),
                enabled: AtomicBool::new(false),
                tmux_available: AtomicBool::new(false),
                sweeps: AtomicU64::new(0),
                wake: Notify::new(),
                actuator: RevivalActuator::new(Arc::clone(&gateway)),
                gateway,
                leader,
                reader,
            }),
            task: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> u32 {
        self.inner.leader.pid()
    }

    /// Start the sweep loop. Idempotent.
    ///
    /// Returns whether monitoring is running afterwards; without tmux it
    /// stays disabled.
    pub async fn start_monitoring(&self) -> bool {
        let mut task = self.task.lock().await;
        if self.is_enabled() {
            debug!("monitoring already enabled, skipping start");
            return true;
        }

        let available = self.inner.gateway.is_available().await;
        self.inner.tmux_available.store(available, Ordering::SeqCst);
        if !available {
            warn!("tmux not available, monitoring disabled");
            return false;
        }

        let config = self.inner.state.lock().await.config.clone();
        debug!(
            pid = self.pid(),
            ping_interval = config.ping_interval,
            stale_timeout = config.stale_timeout,
            forget_timeout = config.forget_timeout,
            sessions_root = %self.inner.reader.root().display(),
            "starting session monitoring"
        );

        self.inner.enabled.store(true, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let span = info_span!("session_monitor", pid = self.pid());
        *task = Some(tokio::spawn(inner.run_loop().instrument(span)));

        info!("session monitoring started");
        true
    }

    /// Clear the enabled flag and wait up to [`SHUTDOWN_GRACE`] for the loop.
    ///
    /// A sweep already in flight is allowed to finish within the grace
    /// period; past it the loop and its sweep are aborted.
    pub async fn stop_monitoring(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
        self.inner.wake.notify_one();

        let Some(mut handle) = self.task.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
            Ok(Ok(())) => info!("session monitoring stopped"),
            Ok(Err(e)) => warn!("monitor task ended abnormally: {}", e),
            Err(_) => {
                warn!(grace = ?SHUTDOWN_GRACE, "monitor task did not exit in time, aborting it");
                handle.abort();
            }
        }
    }

    /// Snapshot of known sessions plus monitor status.
    pub async fn list_sessions(&self) -> SessionListing {
        let now = SystemTime::now();
        let sessions: Vec<SessionView> = {
            let state = self.inner.state.lock().await;
            let config = &state.config;
            state
                .sessions
                .values()
                .map(|s| {
                    let verdict = classify(
                        s.last_activity,
                        s.active_work_count(),
                        config.stale_timeout(),
                        config.forget_timeout(),
                        now,
                    );
                    SessionView::new(s, verdict)
                })
                .collect()
        };
        let is_leader = self.inner.leader.is_leader(false).await;

        SessionListing {
            count: sessions.len(),
            sessions,
            monitoring_enabled: self.is_enabled(),
            tmux_available: self.inner.tmux_available.load(Ordering::SeqCst),
            is_leader,
            pid: self.pid(),
        }
    }

    /// Apply a partial config update and return the effective config.
    pub async fn configure(&self, update: ConfigUpdate) -> MonitorConfig {
        let mut state = self.inner.state.lock().await;
        state.config.apply(update);
        info!(
            ping_interval = state.config.ping_interval,
            stale_timeout = state.config.stale_timeout,
            forget_timeout = state.config.forget_timeout,
            messages = state.config.continuation_messages.len(),
            "monitor reconfigured"
        );
        state.config.clone()
    }

    pub async fn config(&self) -> MonitorConfig {
        self.inner.state.lock().await.config.clone()
    }

    /// Manually send a continuation to any target, bypassing staleness and
    /// leadership. A blank or missing message draws from the pool.
    pub async fn send_continuation(&self, target: &str, message: Option<String>) -> Result<bool> {
        if !self.inner.gateway.is_available().await {
            return Err(MonitorError::TmuxUnavailable);
        }
        let message = match message.filter(|m| !m.trim().is_empty()) {
            Some(m) => m,
            None => {
                let state = self.inner.state.lock().await;
                match choose_message(&state.config.continuation_messages) {
                    Some(m) => m.clone(),
                    None => return Ok(false),
                }
            }
        };
        let sent = self.inner.actuator.deliver(target, &message).await;
        info!(target, sent, "manual continuation");
        Ok(sent)
    }

    /// Add a session to the snapshot ahead of discovery.
    ///
    /// The entry lasts until the next sweep replaces the snapshot.
    pub async fn register_session(
        &self,
        session_id: &str,
        routing_token: Option<String>,
    ) -> Result<SessionDescriptor> {
        let token = routing_token
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| NO_TARGET.to_string());

        if token != NO_TARGET
            && self.inner.gateway.is_available().await
            && !self.inner.gateway.session_exists(&token).await
        {
            return Err(MonitorError::TargetNotFound(token));
        }

        let session = SessionDescriptor {
            session_id: session_id.to_string(),
            project_key: MANUAL_PROJECT.to_string(),
            routing_token: token,
            last_activity: SystemTime::now(),
            work_items: None,
        };
        self.inner
            .state
            .lock()
            .await
            .sessions
            .insert(session.session_id.clone(), session.clone());

        info!(session_id, target = %session.routing_token, "registered session");
        Ok(session)
    }

    /// Revive one known session now, regardless of staleness or leadership.
    pub async fn revive_session(&self, session_id: &str) -> Result<bool> {
        let (session, pool) = {
            let state = self.inner.state.lock().await;
            let session = state
                .sessions
                .get(session_id)
                .cloned()
                .ok_or_else(|| MonitorError::SessionNotFound(session_id.to_string()))?;
            (session, state.config.continuation_messages.clone())
        };
        Ok(self.inner.actuator.revive(&session, &pool).await)
    }

    /// Leader verdict with the cache bypassed.
    pub async fn force_leader_recheck(&self) -> bool {
        self.inner.leader.is_leader(true).await
    }

    /// Run one sweep immediately on the caller's task.
    ///
    /// If a sweep is already running, waits for it and returns its report.
    pub async fn sweep_now(&self) -> Result<SweepReport> {
        self.inner.sweep().await
    }
}

impl<G: TerminalGateway, P: ProcessLister> Drop for SessionMonitor<G, P> {
    fn drop(&mut self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }
}

/// Aborts the wrapped task when dropped, so cancelling the loop also
/// cancels the sweep it is waiting on.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<G: TerminalGateway, P: ProcessLister> Inner<G, P> {
    async fn run_loop(self: Arc<Self>) {
        while self.enabled.load(Ordering::SeqCst) {
            // Own task so a panic inside one sweep cannot end the loop.
            let inner = Arc::clone(&self);
            let sweep = tokio::spawn(async move { inner.sweep().await });
            let _guard = AbortOnDrop(sweep.abort_handle());
            match sweep.await {
                Ok(Ok(report)) => debug!(?report, "sweep complete"),
                Ok(Err(e)) => error!(
                    iteration = self.sweeps.load(Ordering::SeqCst),
                    "monitor sweep failed: {}", e
                ),
                Err(e) => error!(
                    iteration = self.sweeps.load(Ordering::SeqCst),
                    "monitor sweep panicked: {}", e
                ),
            }

            let interval = self.state.lock().await.config.ping_interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.wake.notified() => {}
            }
        }
        debug!("monitor loop exited");
    }

    async fn sweep(&self) -> Result<SweepReport> {
        let mut last = match self.last_sweep.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("sweep already in progress, waiting for it");
                return Ok(self.last_sweep.lock().await.clone());
            }
        };
        let report = self.sweep_once().await?;
        *last = report.clone();
        Ok(report)
    }

    async fn sweep_once(&self) -> Result<SweepReport> {
        let iteration = self.sweeps.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(iteration, "monitor sweep starting");

        let reader = self.reader.clone();
        let discovered = tokio::task::spawn_blocking(move || reader.discover()).await??;

        let now = SystemTime::now();
        let mut report = SweepReport {
            iteration,
            discovered: discovered.len(),
            ..Default::default()
        };

        let (candidates, pool) = {
            let mut state = self.state.lock().await;

            let previous = state.sessions.len();
            let mut sessions = BTreeMap::new();
            for session in discovered {
                if let Some(dup) = sessions.insert(session.session_id.clone(), session) {
                    debug!(session_id = %dup.session_id, project = %dup.project_key, "duplicate session id, keeping later marker");
                }
            }
            state.sessions = sessions;
            if state.sessions.len() != previous {
                info!(previous, current = state.sessions.len(), "session count changed");
            }

            let stale_timeout = state.config.stale_timeout();
            let forget_timeout = state.config.forget_timeout();
            let mut candidates = Vec::new();
            for session in state.sessions.values() {
                let verdict = classify(
                    session.last_activity,
                    session.active_work_count(),
                    stale_timeout,
                    forget_timeout,
                    now,
                );
                debug!(
                    session_id = %session.session_id,
                    idle_secs = verdict.idle.as_secs(),
                    state = ?verdict.state,
                    active_work = ?session.active_work_count(),
                    "classified session"
                );
                match verdict.state {
                    SessionState::Active => report.active += 1,
                    SessionState::Forgotten => report.forgotten += 1,
                    SessionState::Stale if verdict.should_revive => {
                        report.stale += 1;
                        candidates.push(session.clone());
                    }
                    SessionState::Stale => report.idle += 1,
                }
            }
            (candidates, state.config.continuation_messages.clone())
        };

        if candidates.is_empty() {
            return Ok(report);
        }

        let leader = self.leader.is_leader(false).await;
        report.leader = Some(leader);
        if !leader {
            debug!(stale = candidates.len(), "not leader, leaving stale sessions alone");
            return Ok(report);
        }

        for session in &candidates {
            warn!(
                session_id = %session.session_id,
                active_work = ?session.active_work_count(),
                "stale session detected"
            );
            if self.actuator.revive(session, &pool).await {
                report.revived += 1;
            } else {
                report.failed += 1;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct StubGateway {
        unavailable: bool,
        missing: bool,
        /// Panic on the first validation, succeed afterwards
        panic_once: bool,
        /// Never finish validating
        hang: bool,
        validations: AtomicUsize,
        sent: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl TerminalGateway for StubGateway {
        async fn is_available(&self) -> bool {
            !self.unavailable
        }
        async fn session_exists(&self, _target: &str) -> bool {
            !self.missing
        }
        async fn validate_target(&self, _target: &str) -> bool {
            let seen = self.validations.fetch_add(1, Ordering::SeqCst);
            if self.panic_once && seen == 0 {
                panic!("gateway blew up");
            }
            if self.hang {
                std::future::pending::<()>().await;
            }
            !self.missing
        }
        async fn send_keys(&self, target: &str, text: &str) -> bool {
            self.sent
                .lock()
                .unwrap()
                .push((target.to_string(), text.to_string()));
            true
        }
    }

    struct SoloLister;

    #[async_trait]
    impl ProcessLister for SoloLister {
        async fn matching_pids(&self, _signature: &str) -> anyhow::Result<Vec<u32>> {
            Ok(Vec::new())
        }
    }

    fn monitor(gateway: StubGateway) -> (SessionMonitor<StubGateway, SoloLister>, tempfile::TempDir) {
        monitor_with(MonitorConfig::default(), gateway)
    }

    fn monitor_with(
        config: MonitorConfig,
        gateway: StubGateway,
    ) -> (SessionMonitor<StubGateway, SoloLister>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let monitor = SessionMonitor::new(
            config,
            MarkerReader::new(dir.path()),
            gateway,
            LeaderElection::new(SoloLister, "session-pulse-test", 1),
        );
        (monitor, dir)
    }

    fn write_stale_marker(root: &std::path::Path) {
        let path = root.join("proj/abc.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"[{"content":"x","status":"pending"}]"#).unwrap();
        let then = SystemTime::now() - Duration::from_secs(200);
        filetime::set_file_mtime(&path, filetime::FileTime::from_system_time(then)).unwrap();
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_joins() {
        let (monitor, _dir) = monitor(StubGateway::default());
        assert!(monitor.start_monitoring().await);
        assert!(monitor.start_monitoring().await);
        assert!(monitor.is_enabled());

        monitor.stop_monitoring().await;
        assert!(!monitor.is_enabled());
        assert!(monitor.task.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_tmux_keeps_monitoring_disabled() {
        let (monitor, _dir) = monitor(StubGateway {
            unavailable: true,
            ..Default::default()
        });
        assert!(!monitor.start_monitoring().await);

        let listing = monitor.list_sessions().await;
        assert!(!listing.monitoring_enabled);
        assert!(!listing.tmux_available);
        assert!(matches!(
            monitor.send_continuation("dev", None).await,
            Err(MonitorError::TmuxUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_configure_clamps_and_ignores_empty_pool() {
        let (monitor, _dir) = monitor(StubGateway::default());
        let config = monitor
            .configure(ConfigUpdate {
                stale_timeout: Some(10),
                continuation_messages: Some(vec![]),
                ..Default::default()
            })
            .await;
        assert_eq!(config.stale_timeout, crate::config::MIN_STALE_TIMEOUT);
        assert_eq!(
            config.continuation_messages,
            MonitorConfig::default().continuation_messages
        );
    }

    #[tokio::test]
    async fn test_registered_session_is_replaced_by_next_sweep() {
        let (monitor, _dir) = monitor(StubGateway::default());
        monitor
            .register_session("manual-1", Some("dev:0".into()))
            .await
            .unwrap();
        assert_eq!(monitor.list_sessions().await.count, 1);

        monitor.sweep_now().await.unwrap();
        assert_eq!(monitor.list_sessions().await.count, 0);
    }

    #[tokio::test]
    async fn test_register_rejects_missing_target() {
        let (monitor, _dir) = monitor(StubGateway {
            missing: true,
            ..Default::default()
        });
        let err = monitor
            .register_session("manual-1", Some("gone".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::TargetNotFound(t) if t == "gone"));
    }

    #[tokio::test]
    async fn test_revive_session_sends_regardless_of_state() {
        let (monitor, _dir) = monitor(StubGateway::default());
        monitor
            .register_session("manual-1", Some("dev:0".into()))
            .await
            .unwrap();
        assert!(monitor.revive_session("manual-1").await.unwrap());
        assert!(matches!(
            monitor.revive_session("nope").await,
            Err(MonitorError::SessionNotFound(_))
        ));

        let sent = monitor.inner.gateway.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "dev:0");
    }

    #[tokio::test]
    async fn test_manual_continuation_uses_given_message() {
        let (monitor, _dir) = monitor(StubGateway::default());
        assert!(monitor
            .send_continuation("dev:1", Some("keep going".into()))
            .await
            .unwrap());
        assert!(!monitor
            .send_continuation(NO_TARGET, Some("keep going".into()))
            .await
            .unwrap());

        let sent = monitor.inner.gateway.sent.lock().unwrap().clone();
        assert_eq!(sent, vec![("dev:1".to_string(), "keep going".to_string())]);
    }

    #[tokio::test]
    async fn test_loop_keeps_sweeping_after_a_panicking_sweep() {
        // Built directly to get a sub-minimum interval.
        let config = MonitorConfig {
            ping_interval: 1,
            ..MonitorConfig::default()
        };
        let (monitor, dir) = monitor_with(
            config,
            StubGateway {
                panic_once: true,
                ..Default::default()
            },
        );
        write_stale_marker(dir.path());
        assert!(monitor.start_monitoring().await);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while monitor.inner.gateway.sent.lock().unwrap().is_empty()
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(monitor.inner.sweeps.load(Ordering::SeqCst) >= 2);
        assert!(!monitor.inner.gateway.sent.lock().unwrap().is_empty());
        assert!(monitor.is_enabled());

        monitor.stop_monitoring().await;
        assert!(!monitor.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborts_a_sweep_that_outlives_the_grace_period() {
        let (monitor, dir) = monitor(StubGateway {
            hang: true,
            ..Default::default()
        });
        write_stale_marker(dir.path());
        assert!(monitor.start_monitoring().await);

        while monitor.inner.gateway.validations.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(monitor.inner.last_sweep.try_lock().is_err());

        monitor.stop_monitoring().await;
        assert!(monitor.task.lock().await.is_none());

        // The hung sweep is cancelled and releases the sweep lock.
        let mut released = false;
        for _ in 0..100 {
            if monitor.inner.last_sweep.try_lock().is_ok() {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(released);
        assert!(monitor.inner.gateway.sent.lock().unwrap().is_empty());
    }
}

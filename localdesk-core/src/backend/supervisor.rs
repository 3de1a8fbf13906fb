//! Lifecycle owner of the single backend process.

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::environment::BackendRuntimeConfig;
use super::launch::LaunchStrategy;
use super::prepare::{self, PortInspector, SystemPortInspector};
use super::readiness::{self, HealthProbe, ReadinessOutcome, ReadinessPolicy};
use crate::config::{BuildMode, OrchestratorConfig};
use crate::error::BackendError;
use crate::events::{BACKEND_ALIAS, EventBus, LifecycleEvent, LifecycleKind};
use crate::paths::AppPaths;
use crate::process::{LineSink, OutputStream, ProcessHandle, ProcessSpec, TerminateMode};

/// Output lines retained for crash diagnostics.
const TAIL_LINES: usize = 64;

/// Backend lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BackendState {
    NotStarted,
    Starting,
    Ready,
    TimedOut,
    Crashed { exit_code: Option<i32> },
    Stopped,
}

impl std::fmt::Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendState::NotStarted => write!(f, "not_started"),
            BackendState::Starting => write!(f, "starting"),
            BackendState::Ready => write!(f, "ready"),
            BackendState::TimedOut => write!(f, "timed_out"),
            BackendState::Crashed { exit_code } => match exit_code {
                Some(code) => write!(f, "crashed ({code})"),
                None => write!(f, "crashed"),
            },
            BackendState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Everything the supervisor needs, resolved once per boot.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub runtime: BackendRuntimeConfig,
    pub build_mode: BuildMode,
    pub resources_dir: PathBuf,
    pub policy: ReadinessPolicy,
    /// Marker file name, relative to the home directory.
    pub marker_file: PathBuf,
    /// Lock files, relative to the home directory.
    pub lock_files: Vec<PathBuf>,
    pub stop_grace: Duration,
}

impl BackendSettings {
    pub fn from_config(config: &OrchestratorConfig, paths: &AppPaths) -> Self {
        Self {
            runtime: BackendRuntimeConfig::derive(config, paths),
            build_mode: config.runtime.build_mode,
            resources_dir: paths.resources_dir.clone(),
            policy: ReadinessPolicy::from_config(&config.backend),
            marker_file: PathBuf::from(&config.backend.marker_file),
            lock_files: config.backend.lock_files.clone(),
            stop_grace: Duration::from_millis(config.runtime.stop_grace_ms),
        }
    }

    pub fn marker_path(&self) -> PathBuf {
        self.runtime.home_dir.join(&self.marker_file)
    }
}

type OutputTail = Arc<Mutex<VecDeque<String>>>;

/// Owns the backend process: preparation, spawn, readiness and stop.
///
/// `start` and `stop` are serialized through the process slot, so port
/// reclamation and lock cleanup never run from two call sites at once.
pub struct BackendSupervisor {
    settings: BackendSettings,
    inspector: Arc<dyn PortInspector>,
    probe: HealthProbe,
    events: EventBus,
    process: tokio::sync::Mutex<Option<Arc<ProcessHandle>>>,
    state: Arc<watch::Sender<BackendState>>,
    generation: Arc<AtomicU64>,
    tail: OutputTail,
}

impl BackendSupervisor {
    pub fn new(settings: BackendSettings, events: EventBus) -> Result<Self, BackendError> {
        let probe = HealthProbe::new(&settings.runtime.base_url(), settings.policy.probe_timeout)?;
        let (state, _) = watch::channel(BackendState::NotStarted);
        Ok(Self {
            settings,
            inspector: Arc::new(SystemPortInspector),
            probe,
            events,
            process: tokio::sync::Mutex::new(None),
            state: Arc::new(state),
            generation: Arc::new(AtomicU64::new(0)),
            tail: Arc::new(Mutex::new(VecDeque::with_capacity(TAIL_LINES))),
        })
    }

    /// Replace the OS port inspector.
    pub fn with_port_inspector(mut self, inspector: Arc<dyn PortInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn settings(&self) -> &BackendSettings {
        &self.settings
    }

    pub fn state(&self) -> BackendState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<BackendState> {
        self.state.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        self.process
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| h.try_exit().is_none())
    }

    pub async fn pid(&self) -> Option<u32> {
        self.process.lock().await.as_ref().and_then(|h| h.pid())
    }

    /// The most recent backend output lines, oldest first.
    pub fn recent_output(&self) -> Vec<String> {
        self.tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Prepare, spawn and wait for the backend.
    ///
    /// Timing out and crashing before readiness are outcomes, not errors;
    /// `Err` is reserved for a missing launcher, unusable storage or a failed
    /// spawn.
    pub async fn start(
        &self,
        overrides: BTreeMap<String, String>,
    ) -> Result<ReadinessOutcome, BackendError> {
        let mut slot = self.process.lock().await;
        if slot.as_ref().is_some_and(|h| h.try_exit().is_none()) {
            let state = self.state();
            debug!(state = %state, "backend already running");
            return Ok(ReadinessOutcome::AlreadyRunning { state });
        }

        let strategy = LaunchStrategy::resolve(self.settings.build_mode, &self.settings.resources_dir)?;
        info!(strategy = %strategy, build_mode = %self.settings.build_mode, "starting backend");

        let port = self.settings.runtime.port;
        let reclaimed = prepare::reclaim_port(self.inspector.as_ref(), port).await;
        if !reclaimed.is_empty() {
            info!(port, pids = ?reclaimed, "reclaimed backend port");
        }

        let home = &self.settings.runtime.home_dir;
        prepare::ensure_home(home).await?;
        let mut stale = self.settings.lock_files.clone();
        stale.push(self.settings.marker_file.clone());
        prepare::clear_stale_files(home, &stale).await;

        let env = self
            .settings
            .runtime
            .to_env(&overrides, |key| std::env::var(key).ok());
        let mut spec = ProcessSpec::new(BACKEND_ALIAS, strategy.program())
            .args(strategy.args())
            .envs(env);
        if let Some(dir) = strategy.working_dir() {
            spec = spec.current_dir(dir);
        }

        self.tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let handle = ProcessHandle::spawn(&spec, backend_line_sink(self.tail.clone()))
            .map_err(|e| BackendError::SpawnFailed {
                message: format!("{strategy}: {e}"),
            })?;
        let handle = Arc::new(handle);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *slot = Some(handle.clone());
        self.state.send_replace(BackendState::Starting);
        drop(slot);

        info!(pid = ?handle.pid(), port, "backend spawned");
        self.events
            .publish(LifecycleEvent::new(BACKEND_ALIAS, LifecycleKind::Started, None));
        self.watch_exit(generation, handle.clone());

        let outcome = readiness::wait_until_ready(
            &self.settings.policy,
            &self.settings.marker_path(),
            &self.probe,
            handle.exit_receiver(),
        )
        .await;

        match &outcome {
            ReadinessOutcome::Ready => {
                info!(port, "backend ready");
                if self.transition_from_starting(generation, BackendState::Ready) {
                    self.events
                        .publish(LifecycleEvent::new(BACKEND_ALIAS, LifecycleKind::Ready, None));
                }
            }
            ReadinessOutcome::TimedOut { waited } => {
                warn!(
                    waited_ms = waited.as_millis() as u64,
                    "backend not ready within budget, leaving it running"
                );
                self.transition_from_starting(generation, BackendState::TimedOut);
            }
            ReadinessOutcome::Crashed { exit_code } => {
                warn!(exit_code = ?exit_code, "backend exited before becoming ready");
                for line in self.recent_output() {
                    warn!(target: "backend", "{line}");
                }
                self.transition_from_starting(
                    generation,
                    BackendState::Crashed {
                        exit_code: *exit_code,
                    },
                );
            }
            ReadinessOutcome::AlreadyRunning { .. } => {}
        }
        Ok(outcome)
    }

    /// Terminate the backend and its helpers.
    ///
    /// Sends the platform termination, waits the stop grace, then force
    /// kills. Reaches `Stopped` from any state.
    pub async fn stop(&self) {
        let handle = self.process.lock().await.take();
        self.state.send_replace(BackendState::Stopped);
        let Some(handle) = handle else {
            return;
        };
        if handle.try_exit().is_some() {
            return;
        }

        info!(pid = ?handle.pid(), "stopping backend");
        handle.terminate(TerminateMode::Tree);
        let grace = self.settings.stop_grace;
        if tokio::time::timeout(grace, handle.wait_exit()).await.is_ok() {
            return;
        }
        warn!(grace_ms = grace.as_millis() as u64, "backend ignored termination, killing");
        handle.terminate(TerminateMode::Kill);
        if tokio::time::timeout(grace, handle.wait_exit()).await.is_err() {
            warn!(pid = ?handle.pid(), "backend exit not observed after kill");
        }
    }

    /// A single health probe, for callers polling after a timed-out start.
    pub async fn probe_health(&self) -> bool {
        self.probe.check().await
    }

    /// Access credential the backend wrote into its marker file.
    pub async fn access_key(&self) -> Option<String> {
        let contents = tokio::fs::read_to_string(self.settings.marker_path())
            .await
            .ok()?;
        let key = contents.trim();
        (!key.is_empty()).then(|| key.to_string())
    }

    fn transition_from_starting(&self, generation: u64, next: BackendState) -> bool {
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        self.state.send_if_modified(|state| {
            if *state == BackendState::Starting {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    fn watch_exit(&self, generation: u64, handle: Arc<ProcessHandle>) {
        let state = self.state.clone();
        let current = self.generation.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let exit = handle.wait_exit().await;
            let exit_code = exit.exit_code();
            if current.load(Ordering::SeqCst) != generation {
                debug!(exit_code = ?exit_code, "superseded backend process exited");
                return;
            }
            let requested = *state.borrow() == BackendState::Stopped;
            if requested {
                info!(exit_code = ?exit_code, "backend stopped");
                events.publish(LifecycleEvent::new(
                    BACKEND_ALIAS,
                    LifecycleKind::Stopped,
                    exit_code,
                ));
            } else {
                warn!(exit_code = ?exit_code, error = ?exit.error, "backend exited unexpectedly");
                state.send_replace(BackendState::Crashed { exit_code });
                events.publish(LifecycleEvent::new(
                    BACKEND_ALIAS,
                    LifecycleKind::Crashed,
                    exit_code,
                ));
            }
        });
    }
}

impl std::fmt::Debug for BackendSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSupervisor")
            .field("port", &self.settings.runtime.port)
            .field("state", &self.state())
            .finish()
    }
}

/// Logs every backend line under the `backend` target and keeps a short tail.
fn backend_line_sink(tail: OutputTail) -> LineSink {
    Arc::new(move |stream: OutputStream, line: &str| {
        debug!(target: "backend", %stream, "{line}");
        let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
        if tail.len() == TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn settings(data_dir: &Path) -> BackendSettings {
        let config = OrchestratorConfig::default();
        let paths = AppPaths::under(data_dir, &config);
        BackendSettings::from_config(&config, &paths)
    }

    #[test]
    fn test_settings_from_config() {
        let settings = settings(Path::new("/data"));
        assert_eq!(
            settings.marker_path(),
            PathBuf::from("/data/local_rag/local_key.txt")
        );
        assert_eq!(settings.resources_dir, PathBuf::from("/data/resources"));
        assert_eq!(settings.stop_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(BackendState::TimedOut.to_string(), "timed_out");
        assert_eq!(
            BackendState::Crashed { exit_code: Some(1) }.to_string(),
            "crashed (1)"
        );
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        let tail: OutputTail = Arc::new(Mutex::new(VecDeque::new()));
        let sink = backend_line_sink(tail.clone());
        for i in 0..(TAIL_LINES + 10) {
            sink(OutputStream::Stderr, &format!("line {i}"));
        }
        let tail = tail.lock().unwrap();
        assert_eq!(tail.len(), TAIL_LINES);
        assert_eq!(tail.front().map(String::as_str), Some("line 10"));
    }

    #[tokio::test]
    async fn test_missing_launcher_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = BackendSupervisor::new(settings(dir.path()), EventBus::new()).unwrap();
        let result = supervisor.start(BTreeMap::new()).await;
        assert!(matches!(result, Err(BackendError::LauncherNotFound { .. })));
        assert_eq!(supervisor.state(), BackendState::NotStarted);
    }

    #[tokio::test]
    async fn test_stop_before_start_reaches_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = BackendSupervisor::new(settings(dir.path()), EventBus::new()).unwrap();
        supervisor.stop().await;
        assert_eq!(supervisor.state(), BackendState::Stopped);
        assert!(!supervisor.is_running().await);
    }

    #[tokio::test]
    async fn test_access_key_reads_marker() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = BackendSupervisor::new(settings(dir.path()), EventBus::new()).unwrap();
        assert_eq!(supervisor.access_key().await, None);

        let marker = supervisor.settings().marker_path();
        std::fs::create_dir_all(marker.parent().unwrap()).unwrap();
        std::fs::write(&marker, "sk-local-abc123\n").unwrap();
        assert_eq!(
            supervisor.access_key().await.as_deref(),
            Some("sk-local-abc123")
        );
    }
}

//! Registry of aliased inference-serving processes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::descriptor::{LogFileResolver, ServiceDescriptor, ServiceType};
use crate::error::ServiceError;
use crate::events::{EventBus, LifecycleEvent, LifecycleKind};
use crate::process::{
    LineLevel, LineSink, OutputStream, ProcessHandle, ProcessSpec, TerminateMode, classify_line,
};

/// Result of a start request that did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    Started { pid: Option<u32> },
    /// The alias already had a live process; nothing was spawned.
    AlreadyRunning,
    /// The model file does not exist; the alias was not registered.
    SkippedMissingModel { model_path: PathBuf },
}

/// Point-in-time view of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSnapshot {
    pub alias: String,
    pub pid: Option<u32>,
    pub port: u16,
    pub service_type: ServiceType,
    pub started_at: DateTime<Utc>,
}

struct RegistryEntry {
    generation: u64,
    handle: Arc<ProcessHandle>,
    descriptor: ServiceDescriptor,
    started_at: DateTime<Utc>,
}

type Registry = Arc<Mutex<HashMap<String, RegistryEntry>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<String, RegistryEntry>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Manages inference servers keyed by alias.
///
/// The registry holds at most one live entry per alias. Entries are removed
/// by [`stop_service`](Self::stop_service) or, for unrequested exits, by the
/// exit watcher spawned alongside each process. Every entry carries a
/// generation number so that the watcher of an old process can never remove
/// the entry of a newer one under the same alias.
pub struct ServiceManager {
    server_binary: PathBuf,
    host: String,
    stop_grace: Duration,
    log_files: LogFileResolver,
    events: EventBus,
    registry: Registry,
    next_generation: AtomicU64,
}

impl ServiceManager {
    pub fn new(
        server_binary: impl Into<PathBuf>,
        host: impl Into<String>,
        stop_grace: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            server_binary: server_binary.into(),
            host: host.into(),
            stop_grace,
            log_files: LogFileResolver::from_env(),
            events,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Replace the environment-derived log file resolution.
    pub fn with_log_files(mut self, log_files: LogFileResolver) -> Self {
        self.log_files = log_files;
        self
    }

    pub fn server_binary(&self) -> &Path {
        &self.server_binary
    }

    /// Full argument vector a start of `descriptor` would use.
    pub fn command_line(&self, descriptor: &ServiceDescriptor) -> Vec<String> {
        let log_file = self.log_files.resolve(&descriptor.alias);
        descriptor.build_args(&self.host, log_file.as_deref())
    }

    /// Start the inference server described by `descriptor`.
    ///
    /// A missing model is a soft skip, not an error: it is logged and the
    /// alias stays unregistered. Only a missing server executable or a
    /// spawn failure is returned as `Err`.
    pub async fn start_service(
        &self,
        descriptor: ServiceDescriptor,
    ) -> Result<StartOutcome, ServiceError> {
        let alias = descriptor.alias.clone();
        if self.is_running(&alias) {
            debug!(alias = %alias, "service already running");
            return Ok(StartOutcome::AlreadyRunning);
        }

        if !path_exists(&self.server_binary).await {
            error!(alias = %alias, path = %self.server_binary.display(), "inference server executable missing");
            return Err(ServiceError::MissingBinary {
                path: self.server_binary.clone(),
            });
        }

        if !path_exists(&descriptor.model_path).await {
            warn!(
                alias = %alias,
                model_path = %descriptor.model_path.display(),
                "model file missing, skipping service"
            );
            return Ok(StartOutcome::SkippedMissingModel {
                model_path: descriptor.model_path,
            });
        }

        let spec = ProcessSpec::new(alias.clone(), &self.server_binary)
            .args(self.command_line(&descriptor));
        let endpoint = descriptor.endpoint(&self.host);

        let (handle, generation) = {
            let mut registry = lock(&self.registry);
            // A concurrent start for the same alias may have won the race
            // while the existence checks were awaited.
            if registry.contains_key(&alias) {
                return Ok(StartOutcome::AlreadyRunning);
            }
            let handle = ProcessHandle::spawn(&spec, service_line_sink(alias.clone()))
                .map_err(|e| ServiceError::SpawnFailed {
                    alias: alias.clone(),
                    message: e.to_string(),
                })?;
            let handle = Arc::new(handle);
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            registry.insert(
                alias.clone(),
                RegistryEntry {
                    generation,
                    handle: handle.clone(),
                    descriptor,
                    started_at: Utc::now(),
                },
            );
            (handle, generation)
        };

        let pid = handle.pid();
        info!(alias = %alias, pid = ?pid, endpoint = %endpoint, "service started");
        self.events
            .publish(LifecycleEvent::new(alias.as_str(), LifecycleKind::Started, None));
        self.watch_exit(alias, generation, handle);

        Ok(StartOutcome::Started { pid })
    }

    /// Force-kill the process registered under `alias`.
    ///
    /// Idempotent. The entry is gone from the registry before this returns,
    /// even when the exit is not observed within the stop grace.
    pub async fn stop_service(&self, alias: &str) -> Result<(), ServiceError> {
        let Some(entry) = lock(&self.registry).remove(alias) else {
            debug!(alias, "stop requested for unknown alias");
            return Ok(());
        };

        info!(alias, pid = ?entry.handle.pid(), "stopping service");
        entry.handle.terminate(TerminateMode::Kill);
        match tokio::time::timeout(self.stop_grace, entry.handle.wait_exit()).await {
            Ok(exit) => {
                debug!(alias, exit_code = ?exit.exit_code(), "service stopped");
                Ok(())
            }
            Err(_) => Err(ServiceError::StopTimeout {
                alias: alias.to_string(),
                timeout_ms: self.stop_grace.as_millis() as u64,
            }),
        }
    }

    /// Stop every registered alias, continuing past individual failures.
    pub async fn stop_all(&self) {
        let aliases = self.running_aliases();
        if aliases.is_empty() {
            return;
        }
        info!(count = aliases.len(), "stopping all services");
        let results =
            futures::future::join_all(aliases.iter().map(|alias| self.stop_service(alias))).await;
        for (alias, result) in aliases.iter().zip(results) {
            if let Err(e) = result {
                warn!(alias = %alias, error = %e, "failed to stop service");
            }
        }
    }

    /// Registry lookup only; the process itself is not probed.
    pub fn is_running(&self, alias: &str) -> bool {
        lock(&self.registry).contains_key(alias)
    }

    pub fn running_aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = lock(&self.registry).keys().cloned().collect();
        aliases.sort();
        aliases
    }

    /// Live entries, ordered by alias.
    pub fn snapshot(&self) -> Vec<ServiceSnapshot> {
        let mut entries: Vec<ServiceSnapshot> = lock(&self.registry)
            .iter()
            .map(|(alias, entry)| ServiceSnapshot {
                alias: alias.clone(),
                pid: entry.handle.pid(),
                port: entry.descriptor.port,
                service_type: entry.descriptor.service_type,
                started_at: entry.started_at,
            })
            .collect();
        entries.sort_by(|a, b| a.alias.cmp(&b.alias));
        entries
    }

    fn watch_exit(&self, alias: String, generation: u64, handle: Arc<ProcessHandle>) {
        let registry = self.registry.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let exit = handle.wait_exit().await;
            let exit_code = exit.exit_code();
            let unrequested = {
                let mut registry = lock(&registry);
                let current = registry
                    .get(&alias)
                    .is_some_and(|entry| entry.generation == generation);
                if current {
                    registry.remove(&alias);
                }
                current
            };
            if unrequested {
                warn!(alias = %alias, exit_code = ?exit_code, error = ?exit.error, "service exited unexpectedly");
            } else {
                debug!(alias = %alias, exit_code = ?exit_code, "service exit observed");
            }
            events.publish(LifecycleEvent::new(alias, LifecycleKind::Stopped, exit_code));
        });
    }
}

impl std::fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManager")
            .field("server_binary", &self.server_binary)
            .field("host", &self.host)
            .field("running", &self.running_aliases())
            .finish()
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Routes each output line to `error` or `info` according to the classifier.
fn service_line_sink(alias: String) -> LineSink {
    Arc::new(move |stream: OutputStream, line: &str| match classify_line(line) {
        LineLevel::Error => error!(target: "localdesk::service", alias = %alias, %stream, "{line}"),
        LineLevel::Info => info!(target: "localdesk::service", alias = %alias, %stream, "{line}"),
    })
}

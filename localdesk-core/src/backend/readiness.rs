//! Bounded readiness polling: marker file plus HTTP health probe.

use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use super::supervisor::BackendState;
use crate::config::BackendConfig;
use crate::error::BackendError;
use crate::process::ExitInfo;

/// How a backend start resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReadinessOutcome {
    Ready,
    /// A backend process was already live; nothing was spawned. Carries the
    /// state that process had reached.
    AlreadyRunning { state: BackendState },
    /// The budget elapsed. The process is left running.
    TimedOut {
        #[serde(with = "millis")]
        waited: Duration,
    },
    /// The process exited before it became ready.
    Crashed { exit_code: Option<i32> },
}

impl ReadinessOutcome {
    pub fn is_ready(&self) -> bool {
        match self {
            ReadinessOutcome::Ready => true,
            ReadinessOutcome::AlreadyRunning { state } => *state == BackendState::Ready,
            _ => false,
        }
    }
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Timing of the readiness loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub timeout: Duration,
    pub interval: Duration,
    pub probe_timeout: Duration,
}

impl ReadinessPolicy {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.readiness_timeout_secs),
            interval: Duration::from_millis(config.readiness_interval_ms.max(1)),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
        }
    }
}

/// A 2xx is ready; 403 means alive but gated by the access credential, which
/// also counts.
pub fn status_is_ready(status: u16) -> bool {
    (200..300).contains(&status) || status == 403
}

/// One-shot `GET /health` against the backend.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HealthProbe {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Client {
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            url: format!("{}/health", base_url.trim_end_matches('/')),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the backend answered with a ready status.
    pub async fn check(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                debug!(url = %self.url, status, "health probe answered");
                status_is_ready(status)
            }
            Err(e) => {
                debug!(url = %self.url, error = %e, "health probe failed");
                false
            }
        }
    }
}

/// Poll until the backend is ready, has exited, or the budget is spent.
///
/// Each round first looks at the exit, then at the marker file, and probes
/// HTTP only once the marker exists. An exit wakes the wait immediately
/// rather than at the next interval.
pub async fn wait_until_ready(
    policy: &ReadinessPolicy,
    marker: &Path,
    probe: &HealthProbe,
    mut exit: watch::Receiver<Option<ExitInfo>>,
) -> ReadinessOutcome {
    let started = Instant::now();
    let deadline = started + policy.timeout;

    loop {
        if let Some(info) = exit.borrow_and_update().as_ref() {
            return ReadinessOutcome::Crashed {
                exit_code: info.exit_code(),
            };
        }

        if tokio::fs::try_exists(marker).await.unwrap_or(false) && probe.check().await {
            return ReadinessOutcome::Ready;
        }

        let now = Instant::now();
        if now >= deadline {
            return ReadinessOutcome::TimedOut {
                waited: now - started,
            };
        }

        let pause = policy.interval.min(deadline - now);
        tokio::select! {
            changed = exit.changed() => {
                if changed.is_err() {
                    // Sender gone without publishing: the supervisor died.
                    return ReadinessOutcome::Crashed {
                        exit_code: exit.borrow().as_ref().and_then(ExitInfo::exit_code),
                    };
                }
            }
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

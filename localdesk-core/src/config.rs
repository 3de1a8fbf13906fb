//! Configuration system for Localdesk.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! explicit config file -> environment. The user config lives at
//! `<config_dir>/config.toml` as resolved by `directories::ProjectDirs`.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::services::ServiceType;

/// Top-level configuration for the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub services: ServicesConfig,
}

/// How the host application was built. Decides which backend launcher is
/// preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    Development,
    Packaged,
}

impl Default for BuildMode {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            BuildMode::Development
        } else {
            BuildMode::Packaged
        }
    }
}

impl std::fmt::Display for BuildMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildMode::Development => write!(f, "development"),
            BuildMode::Packaged => write!(f, "packaged"),
        }
    }
}

/// Host-level settings shared by every managed process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Interface every local process binds to.
    pub host: String,
    #[serde(default)]
    pub build_mode: BuildMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub models_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_dir: Option<PathBuf>,
    /// Directory holding the packaged backend and its launcher scripts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_dir: Option<PathBuf>,
    /// How long a stop waits for a terminated process to be reaped.
    pub stop_grace_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            build_mode: BuildMode::default(),
            data_dir: None,
            models_dir: None,
            bin_dir: None,
            resources_dir: None,
            logs_dir: None,
            stop_grace_ms: 5_000,
        }
    }
}

/// Settings for the retrieval backend process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub port: u16,
    /// Backend home directory. Defaults to `<data_dir>/local_rag`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_dir: Option<PathBuf>,
    /// Total readiness budget in seconds.
    pub readiness_timeout_secs: u64,
    /// Delay between readiness attempts in milliseconds.
    pub readiness_interval_ms: u64,
    /// Timeout of a single health probe in milliseconds.
    pub probe_timeout_ms: u64,
    /// Marker file (relative to the home directory) the backend writes once
    /// its access credential exists.
    pub marker_file: String,
    /// Exclusive-lock files (relative to the home directory) left behind by a
    /// crashed session.
    pub lock_files: Vec<PathBuf>,
    pub db_file: String,
    pub vector_dir: String,
    /// Thread count exported to the backend's numeric libraries.
    pub omp_threads: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            port: 8890,
            home_dir: None,
            readiness_timeout_secs: 60,
            readiness_interval_ms: 500,
            probe_timeout_ms: 2_000,
            marker_file: "local_key.txt".into(),
            lock_files: vec![PathBuf::from("qdrant_data").join(".lock")],
            db_file: "rag.db".into(),
            vector_dir: "qdrant_data".into(),
            omp_threads: 1,
        }
    }
}

/// Settings for one inference-serving process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub enabled: bool,
    pub port: u16,
    pub context_size: u32,
    pub threads: u32,
    pub gpu_layers: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub micro_batch_size: Option<u32>,
}

impl ServiceConfig {
    fn with_port(port: u16) -> Self {
        Self {
            enabled: true,
            port,
            context_size: 8192,
            threads: default_threads(),
            gpu_layers: 999,
            batch_size: None,
            micro_batch_size: None,
        }
    }
}

/// Per-capability inference service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    pub embedding: ServiceConfig,
    pub rerank: ServiceConfig,
    pub vision: ServiceConfig,
    pub completion: ServiceConfig,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            // Embedding and reranking evaluate a whole input in one batch.
            embedding: ServiceConfig {
                batch_size: Some(8192),
                micro_batch_size: Some(8192),
                ..ServiceConfig::with_port(8007)
            },
            rerank: ServiceConfig {
                batch_size: Some(8192),
                micro_batch_size: Some(8192),
                ..ServiceConfig::with_port(8008)
            },
            vision: ServiceConfig {
                context_size: 16384,
                ..ServiceConfig::with_port(8001)
            },
            completion: ServiceConfig {
                enabled: false,
                ..ServiceConfig::with_port(8002)
            },
        }
    }
}

impl ServicesConfig {
    pub fn get(&self, service_type: ServiceType) -> &ServiceConfig {
        match service_type {
            ServiceType::Embedding => &self.embedding,
            ServiceType::Reranking => &self.rerank,
            ServiceType::VisionCompletion => &self.vision,
            ServiceType::TextCompletion => &self.completion,
        }
    }
}

impl OrchestratorConfig {
    /// Reject configurations where two enabled listeners share a port.
    ///
    /// Two inference servers on one port would leave the later spawn unable
    /// to bind, so the conflict is reported before anything is started.
    pub fn validate_ports(&self) -> Result<(), ConfigError> {
        let mut seen: Vec<(u16, String)> = vec![(self.backend.port, "backend".to_string())];
        for service_type in ServiceType::ALL {
            let service = self.services.get(service_type);
            if !service.enabled {
                continue;
            }
            let name = service_type.default_alias().to_string();
            if let Some((_, first)) = seen.iter().find(|(port, _)| *port == service.port) {
                return Err(ConfigError::PortConflict {
                    port: service.port,
                    first: first.clone(),
                    second: name,
                });
            }
            seen.push((service.port, name));
        }
        Ok(())
    }
}

/// Half the available cores, clamped to `1..=8`.
fn default_threads() -> u32 {
    std::thread::available_parallelism()
        .map(|n| (n.get() / 2).clamp(1, 8) as u32)
        .unwrap_or(4)
}

/// Platform project directories for Localdesk.
pub fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "localdesk", "localdesk")
}

/// Path of the user-level config file, if the platform has a config dir.
pub fn user_config_path() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().join("config.toml"))
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `LOCALDESK_`, `__` separates sections)
/// 2. Explicit config file
/// 3. User config (`<config_dir>/config.toml`)
/// 4. Built-in defaults
pub fn load_config(explicit: Option<&Path>) -> Result<OrchestratorConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(OrchestratorConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(ConfigError::Invalid {
                message: format!("config file {} does not exist", path.display()),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    // LOCALDESK_BACKEND__PORT, LOCALDESK_SERVICES__EMBEDDING__PORT, etc.
    figment = figment.merge(Env::prefixed("LOCALDESK_").split("__"));

    figment.extract().map_err(|e| ConfigError::Load(Box::new(e)))
}

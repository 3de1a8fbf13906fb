//! Filesystem layout for Localdesk data, models and bundled executables.

use std::path::{Path, PathBuf};

use crate::config::{OrchestratorConfig, project_dirs};
use crate::error::ConfigError;

/// Name of the shared inference server executable.
pub fn server_binary_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "llama-server.exe"
    } else {
        "llama-server"
    }
}

/// Resolved directories for one boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub data_dir: PathBuf,
    pub models_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub resources_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub backend_home: PathBuf,
}

impl AppPaths {
    /// Resolve every directory, preferring explicit configuration over the
    /// platform defaults.
    pub fn resolve(config: &OrchestratorConfig) -> Result<Self, ConfigError> {
        let data_dir = match &config.runtime.data_dir {
            Some(dir) => dir.clone(),
            None => project_dirs()
                .map(|d| d.data_dir().to_path_buf())
                .ok_or(ConfigError::NoDataDir)?,
        };
        Ok(Self::under(&data_dir, config))
    }

    /// Lay out every directory below `data_dir`, still honouring explicit
    /// per-directory overrides.
    pub fn under(data_dir: &Path, config: &OrchestratorConfig) -> Self {
        let runtime = &config.runtime;
        let pick = |explicit: &Option<PathBuf>, default: &str| {
            explicit.clone().unwrap_or_else(|| data_dir.join(default))
        };
        Self {
            models_dir: pick(&runtime.models_dir, "models"),
            bin_dir: pick(&runtime.bin_dir, "bin"),
            resources_dir: pick(&runtime.resources_dir, "resources"),
            logs_dir: pick(&runtime.logs_dir, "logs"),
            backend_home: pick(&config.backend.home_dir, "local_rag"),
            data_dir: data_dir.to_path_buf(),
        }
    }

    /// Path of the inference server executable.
    pub fn server_binary(&self) -> PathBuf {
        self.bin_dir.join(server_binary_name())
    }

    /// Path of the persisted model settings file.
    pub fn model_settings_file(&self) -> PathBuf {
        self.data_dir.join("model-config.json")
    }
}

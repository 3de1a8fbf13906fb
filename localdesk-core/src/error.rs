//! Error types for the Localdesk orchestrator.
//!
//! Uses `thiserror` for public API error types. Conditions that are expected
//! during a normal boot (a missing model file, a slow backend) are *not*
//! errors: they are reported through tagged outcomes such as
//! [`StartOutcome`](crate::services::StartOutcome) and
//! [`ReadinessOutcome`](crate::backend::ReadinessOutcome).

use std::path::PathBuf;

/// Top-level error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the inference service manager.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Inference server executable not found at {}", path.display())]
    MissingBinary { path: PathBuf },

    #[error("Failed to spawn service '{alias}': {message}")]
    SpawnFailed { alias: String, message: String },

    #[error("Service '{alias}' did not exit within {timeout_ms}ms of being killed")]
    StopTimeout { alias: String, timeout_ms: u64 },
}

/// Errors from the backend supervisor.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("No backend launcher found (searched: {})", format_paths(searched))]
    LauncherNotFound { searched: Vec<PathBuf> },

    #[error("Failed to prepare backend storage at {}: {message}", path.display())]
    Storage { path: PathBuf, message: String },

    #[error("Failed to spawn backend: {message}")]
    SpawnFailed { message: String },

    #[error("Health probe client could not be built: {message}")]
    Client { message: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Port {port} is assigned to both '{first}' and '{second}'")]
    PortConflict {
        port: u16,
        first: String,
        second: String,
    },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Could not determine the platform data directory")]
    NoDataDir,
}

/// Errors from the model registry and persisted model settings.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Unknown model id '{id}'")]
    UnknownModel { id: String },

    #[error("Model '{id}' serves {actual}, not {expected}")]
    CapabilityMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("No model selected for {capability}")]
    NotSelected { capability: String },

    #[error("Failed to read model manifest {}: {message}", path.display())]
    Manifest { path: PathBuf, message: String },

    #[error("Failed to persist model settings: {0}")]
    Persist(#[from] std::io::Error),
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

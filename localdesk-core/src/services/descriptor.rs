//! Service descriptors and the inference server invocation contract.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::ServiceConfig;

/// Pooling strategy passed to embedding servers.
pub const DEFAULT_POOLING: &str = "mean";

/// Directory receiving `<alias>.log` for every service without an explicit
/// log file.
pub const SERVICE_LOG_DIR_ENV: &str = "LOCALDESK_SERVICE_LOG_DIR";

/// Capability served by one inference process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    Embedding,
    Reranking,
    VisionCompletion,
    TextCompletion,
}

impl ServiceType {
    pub const ALL: [ServiceType; 4] = [
        ServiceType::Embedding,
        ServiceType::Reranking,
        ServiceType::VisionCompletion,
        ServiceType::TextCompletion,
    ];

    /// Alias used when the boot sequence registers this capability.
    pub fn default_alias(self) -> &'static str {
        match self {
            ServiceType::Embedding => "embedding",
            ServiceType::Reranking => "rerank",
            ServiceType::VisionCompletion => "vision",
            ServiceType::TextCompletion => "completion",
        }
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceType::Embedding => write!(f, "embedding"),
            ServiceType::Reranking => write!(f, "reranking"),
            ServiceType::VisionCompletion => write!(f, "vision-completion"),
            ServiceType::TextCompletion => write!(f, "text-completion"),
        }
    }
}

/// Immutable description of one inference process invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub alias: String,
    pub service_type: ServiceType,
    pub model_path: PathBuf,
    pub port: u16,
    pub context_size: u32,
    pub threads: u32,
    pub gpu_offload_layers: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multimodal_projector_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub micro_batch_size: Option<u32>,
}

impl ServiceDescriptor {
    pub fn new(
        alias: impl Into<String>,
        service_type: ServiceType,
        model_path: impl Into<PathBuf>,
        port: u16,
    ) -> Self {
        Self {
            alias: alias.into(),
            service_type,
            model_path: model_path.into(),
            port,
            context_size: 4096,
            threads: 4,
            gpu_offload_layers: 0,
            multimodal_projector_path: None,
            batch_size: None,
            micro_batch_size: None,
        }
    }

    /// Build a descriptor from per-capability configuration.
    pub fn from_config(
        service_type: ServiceType,
        config: &ServiceConfig,
        model_path: PathBuf,
        projector_path: Option<PathBuf>,
    ) -> Self {
        Self {
            alias: service_type.default_alias().to_string(),
            service_type,
            model_path,
            port: config.port,
            context_size: config.context_size,
            threads: config.threads,
            gpu_offload_layers: config.gpu_layers,
            multimodal_projector_path: projector_path,
            batch_size: config.batch_size,
            micro_batch_size: config.micro_batch_size,
        }
    }

    pub fn with_projector(mut self, path: impl Into<PathBuf>) -> Self {
        self.multimodal_projector_path = Some(path.into());
        self
    }

    pub fn with_batch_sizes(mut self, batch: Option<u32>, micro_batch: Option<u32>) -> Self {
        self.batch_size = batch;
        self.micro_batch_size = micro_batch;
        self
    }

    /// Local URL the service answers on.
    pub fn endpoint(&self, host: &str) -> String {
        format!("http://{host}:{}", self.port)
    }

    /// Argument list for the inference server executable.
    ///
    /// Order: model, host, port, context, threads, GPU layers, type-specific
    /// flags, then the optional batch sizes and log file.
    pub fn build_args(&self, host: &str, log_file: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            "-m".to_string(),
            self.model_path.display().to_string(),
            "--host".to_string(),
            host.to_string(),
            "--port".to_string(),
            self.port.to_string(),
            "-c".to_string(),
            self.context_size.to_string(),
            "-t".to_string(),
            self.threads.to_string(),
            "-ngl".to_string(),
            self.gpu_offload_layers.to_string(),
        ];

        match self.service_type {
            ServiceType::Embedding => {
                args.push("--embedding".to_string());
                args.push("--pooling".to_string());
                args.push(DEFAULT_POOLING.to_string());
            }
            ServiceType::Reranking => args.push("--reranking".to_string()),
            ServiceType::VisionCompletion => {
                if let Some(projector) = &self.multimodal_projector_path {
                    args.push("--mmproj".to_string());
                    args.push(projector.display().to_string());
                }
            }
            ServiceType::TextCompletion => {}
        }

        if let Some(batch) = self.batch_size {
            args.push("-b".to_string());
            args.push(batch.to_string());
        }
        if let Some(micro_batch) = self.micro_batch_size {
            args.push("-ub".to_string());
            args.push(micro_batch.to_string());
        }
        if let Some(log_file) = log_file {
            args.push("--log-file".to_string());
            args.push(log_file.display().to_string());
        }
        args
    }
}

/// Environment key holding an explicit log file for `alias`, e.g.
/// `LOCALDESK_EMBEDDING_LOG_FILE`.
pub fn log_file_env_key(alias: &str) -> String {
    let normalized: String = alias
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("LOCALDESK_{normalized}_LOG_FILE")
}

/// Resolves per-service log destinations from environment configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFileResolver {
    vars: HashMap<String, String>,
}

impl LogFileResolver {
    /// Snapshot the relevant variables of the current process environment.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            vars: vars
                .into_iter()
                .filter(|(k, v)| k.starts_with("LOCALDESK_") && !v.trim().is_empty())
                .collect(),
        }
    }

    /// Explicit per-alias file first, then `<SERVICE_LOG_DIR>/<alias>.log`.
    pub fn resolve(&self, alias: &str) -> Option<PathBuf> {
        if let Some(file) = self.vars.get(&log_file_env_key(alias)) {
            return Some(PathBuf::from(file));
        }
        self.vars
            .get(SERVICE_LOG_DIR_ENV)
            .map(|dir| Path::new(dir).join(format!("{alias}.log")))
    }
}

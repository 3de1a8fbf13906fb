//! Inference services: descriptors and the alias-keyed service manager.

pub mod descriptor;
pub mod manager;

pub use descriptor::{
    DEFAULT_POOLING, LogFileResolver, SERVICE_LOG_DIR_ENV, ServiceDescriptor, ServiceType,
    log_file_env_key,
};
pub use manager::{ServiceManager, ServiceSnapshot, StartOutcome};

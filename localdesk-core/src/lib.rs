//! # Localdesk Core
//!
//! Local process orchestration for the Localdesk AI workspace.
//! Provides the shared process handle, the inference service manager, the
//! retrieval backend supervisor, the boot sequence, configuration, model
//! catalogue and lifecycle events.

pub mod backend;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod events;
pub mod model_settings;
pub mod models;
pub mod paths;
pub mod process;
pub mod services;
pub mod shutdown;

// Re-export commonly used types at the crate root.
pub use backend::{
    BackendSettings, BackendState, BackendSupervisor, PortInspector, ReadinessOutcome,
    SystemPortInspector,
};
pub use bootstrap::{
    BackendReport, BootPlan, BootReport, Bootstrapper, CapabilityOutcome, Orchestrator,
    PlanStatus, PlannedService,
};
pub use config::{BuildMode, OrchestratorConfig, load_config};
pub use error::{
    BackendError, ConfigError, ModelError, OrchestratorError, Result, ServiceError,
};
pub use events::{EventBus, LifecycleEvent, LifecycleKind};
pub use model_settings::{ModelSettings, PdfMode};
pub use models::{ModelEntry, ModelRegistry, ResolvedModel};
pub use paths::AppPaths;
pub use process::{ExitInfo, OutputStream, ProcessHandle, ProcessSpec, TerminateMode};
pub use services::{ServiceDescriptor, ServiceManager, ServiceSnapshot, ServiceType, StartOutcome};
pub use shutdown::QuitCoordinator;

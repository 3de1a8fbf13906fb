//! Orchestrator context and the boot sequence.
//!
//! [`Orchestrator`] is built once at boot and owns every long-lived
//! component. [`Bootstrapper`] borrows it to run the one correct startup
//! order: backend first, then every inference capability independently and
//! concurrently, so a failure in one never blocks the rest.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::backend::{
    BackendSettings, BackendSupervisor, LaunchStrategy, PortInspector, ReadinessOutcome,
    SystemPortInspector,
};
use crate::config::OrchestratorConfig;
use crate::error::{ModelError, OrchestratorError};
use crate::events::EventBus;
use crate::model_settings::ModelSettings;
use crate::models::ModelRegistry;
use crate::paths::AppPaths;
use crate::services::{ServiceDescriptor, ServiceManager, ServiceType, StartOutcome};
use crate::shutdown::QuitCoordinator;

/// Explicit orchestration context; there are no process-wide singletons.
#[derive(Debug)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    paths: AppPaths,
    events: EventBus,
    services: Arc<ServiceManager>,
    backend: Arc<BackendSupervisor>,
    registry: ModelRegistry,
    quit: QuitCoordinator,
}

impl Orchestrator {
    /// Resolve paths from the configuration and build the context.
    pub fn from_config(config: OrchestratorConfig) -> Result<Self, OrchestratorError> {
        let paths = AppPaths::resolve(&config)?;
        Self::new(config, paths)
    }

    pub fn new(config: OrchestratorConfig, paths: AppPaths) -> Result<Self, OrchestratorError> {
        Self::with_port_inspector(config, paths, Arc::new(SystemPortInspector))
    }

    /// Build the context with a custom port inspector for the backend.
    pub fn with_port_inspector(
        config: OrchestratorConfig,
        paths: AppPaths,
        inspector: Arc<dyn PortInspector>,
    ) -> Result<Self, OrchestratorError> {
        config.validate_ports()?;
        let registry = match ModelRegistry::load(&paths.models_dir) {
            Ok(registry) => registry,
            Err(e) => {
                warn!(error = %e, "unreadable model manifest, using built-in catalogue");
                ModelRegistry::builtin(&paths.models_dir)
            }
        };
        let events = EventBus::new();

        let services = Arc::new(ServiceManager::new(
            paths.server_binary(),
            config.runtime.host.clone(),
            std::time::Duration::from_millis(config.runtime.stop_grace_ms),
            events.clone(),
        ));
        let backend = Arc::new(
            BackendSupervisor::new(BackendSettings::from_config(&config, &paths), events.clone())?
                .with_port_inspector(inspector),
        );
        let quit = QuitCoordinator::new(services.clone(), backend.clone());

        Ok(Self {
            config,
            paths,
            events,
            services,
            backend,
            registry,
            quit,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn services(&self) -> &Arc<ServiceManager> {
        &self.services
    }

    pub fn backend(&self) -> &Arc<BackendSupervisor> {
        &self.backend
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn quit(&self) -> &QuitCoordinator {
        &self.quit
    }

    pub fn bootstrapper(&self) -> Bootstrapper<'_> {
        Bootstrapper { orchestrator: self }
    }

    /// Run the quit sequence; `false` when it already ran.
    pub async fn shutdown(&self) -> bool {
        self.quit.shutdown().await
    }
}

/// What happened to the backend during boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BackendReport {
    Launched { outcome: ReadinessOutcome },
    Failed { reason: String },
}

/// What happened to one inference capability during boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CapabilityOutcome {
    Started { pid: Option<u32> },
    AlreadyRunning,
    SkippedMissingModel { model_path: PathBuf },
    Disabled,
    Failed { reason: String },
}

impl From<StartOutcome> for CapabilityOutcome {
    fn from(outcome: StartOutcome) -> Self {
        match outcome {
            StartOutcome::Started { pid } => CapabilityOutcome::Started { pid },
            StartOutcome::AlreadyRunning => CapabilityOutcome::AlreadyRunning,
            StartOutcome::SkippedMissingModel { model_path } => {
                CapabilityOutcome::SkippedMissingModel { model_path }
            }
        }
    }
}

impl CapabilityOutcome {
    /// Whether the capability is served after boot.
    pub fn is_available(&self) -> bool {
        matches!(
            self,
            CapabilityOutcome::Started { .. } | CapabilityOutcome::AlreadyRunning
        )
    }
}

/// Result of [`Bootstrapper::launch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootReport {
    pub backend: BackendReport,
    pub capabilities: BTreeMap<ServiceType, CapabilityOutcome>,
}

impl BootReport {
    /// True when any enabled part of the system is not available.
    pub fn is_degraded(&self) -> bool {
        let backend_ok = matches!(
            &self.backend,
            BackendReport::Launched { outcome } if outcome.is_ready()
        );
        !backend_ok
            || self.capabilities.values().any(|outcome| {
                !outcome.is_available() && *outcome != CapabilityOutcome::Disabled
            })
    }
}

/// A capability as it would be started.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PlanStatus {
    Spawn {
        descriptor: ServiceDescriptor,
        command_line: Vec<String>,
        model_present: bool,
    },
    Disabled,
    Unresolved {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedService {
    pub capability: ServiceType,
    #[serde(flatten)]
    pub status: PlanStatus,
}

/// Dry run of the boot sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BootPlan {
    pub server_binary: PathBuf,
    pub server_binary_present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_launch: Option<LaunchStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_launch_error: Option<String>,
    pub backend_env: BTreeMap<String, String>,
    pub services: Vec<PlannedService>,
}

/// Runs the startup order against an [`Orchestrator`].
pub struct Bootstrapper<'a> {
    orchestrator: &'a Orchestrator,
}

impl Bootstrapper<'_> {
    /// Persisted model settings; unreadable settings fall back to defaults.
    pub fn load_settings(&self) -> ModelSettings {
        let path = self.orchestrator.paths.model_settings_file();
        match ModelSettings::load(&path) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable model settings, using defaults");
                ModelSettings::default()
            }
        }
    }

    /// Descriptor for `capability`, or `None` when it is disabled or has no
    /// model selected where selection is optional.
    pub fn descriptor_for(
        &self,
        capability: ServiceType,
        settings: &ModelSettings,
    ) -> Result<Option<ServiceDescriptor>, ModelError> {
        let service = self.orchestrator.config.services.get(capability);
        if !service.enabled {
            return Ok(None);
        }
        let Some(model_id) = settings.model_for(capability) else {
            if capability == ServiceType::TextCompletion {
                return Ok(None);
            }
            return Err(ModelError::NotSelected {
                capability: capability.to_string(),
            });
        };
        let resolved = self.orchestrator.registry.resolve(model_id, capability)?;
        let mut descriptor = ServiceDescriptor::from_config(
            capability,
            service,
            resolved.model_path,
            resolved.projector_path,
        );
        if let Some(context_size) = settings.context_override(capability) {
            descriptor.context_size = context_size;
        }
        Ok(Some(descriptor))
    }

    /// Start the backend, then every capability concurrently.
    ///
    /// Settings are loaded once. Nothing here returns an error: each failure
    /// is logged and recorded in the report.
    pub async fn launch(&self) -> BootReport {
        let settings = self.load_settings();
        info!(
            pdf_mode = %settings.pdf_mode,
            vision_max_pixels = settings.vision_max_pixels,
            "launching local services"
        );

        let backend = match self
            .orchestrator
            .backend
            .start(settings.backend_overrides())
            .await
        {
            Ok(outcome) => BackendReport::Launched { outcome },
            Err(e) => {
                error!(error = %e, "backend failed to start, continuing degraded");
                BackendReport::Failed {
                    reason: e.to_string(),
                }
            }
        };

        let starts = ServiceType::ALL.map(|capability| self.start_capability(capability, &settings));
        let capabilities = futures::future::join_all(starts).await.into_iter().collect();

        let report = BootReport {
            backend,
            capabilities,
        };
        if report.is_degraded() {
            warn!("boot finished with unavailable capabilities");
        } else {
            info!("boot finished");
        }
        report
    }

    async fn start_capability(
        &self,
        capability: ServiceType,
        settings: &ModelSettings,
    ) -> (ServiceType, CapabilityOutcome) {
        let descriptor = match self.descriptor_for(capability, settings) {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => return (capability, CapabilityOutcome::Disabled),
            Err(e) => {
                warn!(capability = %capability, error = %e, "cannot resolve model");
                return (
                    capability,
                    CapabilityOutcome::Failed {
                        reason: e.to_string(),
                    },
                );
            }
        };
        match self.orchestrator.services.start_service(descriptor).await {
            Ok(outcome) => (capability, outcome.into()),
            Err(e) => {
                error!(capability = %capability, error = %e, "failed to start service");
                (
                    capability,
                    CapabilityOutcome::Failed {
                        reason: e.to_string(),
                    },
                )
            }
        }
    }

    /// Everything `launch` would do, without spawning anything.
    pub fn plan(&self, settings: &ModelSettings) -> BootPlan {
        let orchestrator = self.orchestrator;
        let backend_settings = orchestrator.backend.settings();
        let (backend_launch, backend_launch_error) =
            match LaunchStrategy::resolve(backend_settings.build_mode, &backend_settings.resources_dir)
            {
                Ok(strategy) => (Some(strategy), None),
                Err(e) => (None, Some(e.to_string())),
            };
        let backend_env = backend_settings
            .runtime
            .to_env(&settings.backend_overrides(), |key| std::env::var(key).ok());

        let services = ServiceType::ALL
            .into_iter()
            .map(|capability| {
                let status = match self.descriptor_for(capability, settings) {
                    Ok(Some(descriptor)) => PlanStatus::Spawn {
                        command_line: orchestrator.services.command_line(&descriptor),
                        model_present: descriptor.model_path.exists(),
                        descriptor,
                    },
                    Ok(None) => PlanStatus::Disabled,
                    Err(e) => PlanStatus::Unresolved {
                        reason: e.to_string(),
                    },
                };
                PlannedService { capability, status }
            })
            .collect();

        let server_binary = orchestrator.services.server_binary().to_path_buf();
        BootPlan {
            server_binary_present: server_binary.exists(),
            server_binary,
            backend_launch,
            backend_launch_error,
            backend_env,
            services,
        }
    }
}

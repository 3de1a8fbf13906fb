//! Application quit coordination.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::backend::BackendSupervisor;
use crate::services::ServiceManager;

/// Runs the quit sequence exactly once, however often quit is requested.
#[derive(Debug)]
pub struct QuitCoordinator {
    services: Arc<ServiceManager>,
    backend: Arc<BackendSupervisor>,
    started: AtomicBool,
}

impl QuitCoordinator {
    pub fn new(services: Arc<ServiceManager>, backend: Arc<BackendSupervisor>) -> Self {
        Self {
            services,
            backend,
            started: AtomicBool::new(false),
        }
    }

    /// Stop every inference service, then the backend.
    ///
    /// Returns `true` for the caller that ran the sequence and `false` for
    /// every later caller.
    pub async fn shutdown(&self) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("quit sequence already triggered");
            return false;
        }
        info!("stopping local services before quit");
        self.services.stop_all().await;
        self.backend.stop().await;
        info!("quit sequence complete");
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

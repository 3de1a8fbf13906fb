//! Environment handed to the backend process.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::OrchestratorConfig;
use crate::paths::AppPaths;
use crate::services::ServiceType;

pub const HOST_KEY: &str = "LOCAL_RAG_HOST";
pub const PORT_KEY: &str = "LOCAL_RAG_PORT";
pub const HOME_KEY: &str = "LOCAL_RAG_HOME";
pub const DB_PATH_KEY: &str = "LOCAL_RAG_DB_PATH";
pub const VECTOR_PATH_KEY: &str = "LOCAL_RAG_QDRANT_PATH";
pub const VISION_MAX_PIXELS_KEY: &str = "LOCAL_RAG_VISION_MAX_PIXELS";
pub const PDF_MODE_KEY: &str = "LOCAL_RAG_PDF_MODE";

/// Environment key carrying the URL of the service that serves `service_type`.
pub fn endpoint_key(service_type: ServiceType) -> &'static str {
    match service_type {
        ServiceType::Embedding => "LOCAL_RAG_EMBEDDING_URL",
        ServiceType::Reranking => "LOCAL_RAG_RERANK_URL",
        ServiceType::VisionCompletion => "LOCAL_RAG_VISION_URL",
        ServiceType::TextCompletion => "LOCAL_RAG_LLM_URL",
    }
}

/// Backend runtime settings derived once per boot from the chosen service
/// ports and the resolved storage layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendRuntimeConfig {
    pub host: String,
    pub port: u16,
    pub home_dir: PathBuf,
    pub db_path: PathBuf,
    pub vector_path: PathBuf,
    /// Derived URL per enabled inference capability.
    pub service_urls: BTreeMap<ServiceType, String>,
    pub omp_threads: u32,
}

impl BackendRuntimeConfig {
    pub fn derive(config: &OrchestratorConfig, paths: &AppPaths) -> Self {
        let host = config.runtime.host.clone();
        let service_urls = ServiceType::ALL
            .into_iter()
            .filter_map(|service_type| {
                let service = config.services.get(service_type);
                service
                    .enabled
                    .then(|| (service_type, format!("http://{host}:{}", service.port)))
            })
            .collect();
        let home_dir = paths.backend_home.clone();
        Self {
            port: config.backend.port,
            db_path: home_dir.join(&config.backend.db_file),
            vector_path: home_dir.join(&config.backend.vector_dir),
            home_dir,
            service_urls,
            omp_threads: config.backend.omp_threads,
            host,
        }
    }

    /// Base URL of the backend API.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Build the backend environment.
    ///
    /// Precedence, highest first: `overrides`, endpoint URLs already present
    /// in the host environment (looked up through `host_env`), derived values.
    pub fn to_env<F>(
        &self,
        overrides: &BTreeMap<String, String>,
        host_env: F,
    ) -> BTreeMap<String, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env = BTreeMap::new();
        env.insert(HOST_KEY.to_string(), self.host.clone());
        env.insert(PORT_KEY.to_string(), self.port.to_string());
        env.insert(HOME_KEY.to_string(), self.home_dir.display().to_string());
        env.insert(DB_PATH_KEY.to_string(), self.db_path.display().to_string());
        env.insert(
            VECTOR_PATH_KEY.to_string(),
            self.vector_path.display().to_string(),
        );
        env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        env.insert("PYTHONIOENCODING".to_string(), "utf-8".to_string());
        env.insert("OMP_NUM_THREADS".to_string(), self.omp_threads.to_string());

        for (service_type, derived) in &self.service_urls {
            let key = endpoint_key(*service_type);
            let url = host_env(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| derived.clone());
            env.insert(key.to_string(), url);
        }

        env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

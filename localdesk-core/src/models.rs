//! Model catalogue: maps model ids to files under the models directory.
//!
//! The registry never checks that files exist. A missing model is detected
//! (and soft-skipped) by the service manager at start time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

use crate::error::ModelError;
use crate::services::ServiceType;

/// Optional manifest in the models directory extending the catalogue.
pub const MANIFEST_FILE: &str = "models.json";

pub const DEFAULT_EMBEDDING_MODEL: &str = "qwen3-embedding-0.6b";
pub const DEFAULT_RERANK_MODEL: &str = "bge-reranker-v2-m3";
pub const DEFAULT_VISION_MODEL: &str = "qwen2.5-vl-3b";
pub const DEFAULT_COMPLETION_MODEL: &str = "qwen3-1.7b";

/// One catalogue entry. `file` and `projector` are relative to the models
/// directory unless absolute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub capability: ServiceType,
    pub file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projector: Option<PathBuf>,
}

impl ModelEntry {
    fn new(id: &str, capability: ServiceType, file: &str) -> Self {
        Self {
            id: id.to_string(),
            capability,
            file: PathBuf::from(file),
            projector: None,
        }
    }

    fn with_projector(mut self, projector: &str) -> Self {
        self.projector = Some(PathBuf::from(projector));
        self
    }
}

/// Absolute paths for one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedModel {
    pub model_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projector_path: Option<PathBuf>,
}

fn builtin_entries() -> Vec<ModelEntry> {
    vec![
        ModelEntry::new(
            DEFAULT_EMBEDDING_MODEL,
            ServiceType::Embedding,
            "Qwen3-Embedding-0.6B-Q8_0.gguf",
        ),
        ModelEntry::new(
            "bge-m3",
            ServiceType::Embedding,
            "bge-m3-Q8_0.gguf",
        ),
        ModelEntry::new(
            DEFAULT_RERANK_MODEL,
            ServiceType::Reranking,
            "bge-reranker-v2-m3-Q8_0.gguf",
        ),
        ModelEntry::new(
            DEFAULT_VISION_MODEL,
            ServiceType::VisionCompletion,
            "Qwen2.5-VL-3B-Instruct-Q4_K_M.gguf",
        )
        .with_projector("mmproj-Qwen2.5-VL-3B-Instruct-f16.gguf"),
        ModelEntry::new(
            "qwen2.5-vl-7b",
            ServiceType::VisionCompletion,
            "Qwen2.5-VL-7B-Instruct-Q4_K_M.gguf",
        )
        .with_projector("mmproj-Qwen2.5-VL-7B-Instruct-f16.gguf"),
        ModelEntry::new(
            DEFAULT_COMPLETION_MODEL,
            ServiceType::TextCompletion,
            "Qwen3-1.7B-Q4_K_M.gguf",
        ),
    ]
}

/// Catalogue of known models rooted at a models directory.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models_dir: PathBuf,
    entries: BTreeMap<String, ModelEntry>,
}

impl ModelRegistry {
    /// Built-in catalogue only.
    pub fn builtin(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            entries: builtin_entries()
                .into_iter()
                .map(|e| (e.id.clone(), e))
                .collect(),
        }
    }

    /// Built-in catalogue extended by `<models_dir>/models.json` when present.
    /// Manifest entries replace built-ins with the same id.
    pub fn load(models_dir: impl Into<PathBuf>) -> Result<Self, ModelError> {
        let mut registry = Self::builtin(models_dir);
        let manifest = registry.models_dir.join(MANIFEST_FILE);
        if !manifest.exists() {
            return Ok(registry);
        }

        let data = std::fs::read_to_string(&manifest).map_err(|e| ModelError::Manifest {
            path: manifest.clone(),
            message: e.to_string(),
        })?;
        let extra: Vec<ModelEntry> =
            serde_json::from_str(&data).map_err(|e| ModelError::Manifest {
                path: manifest.clone(),
                message: e.to_string(),
            })?;
        debug!(path = %manifest.display(), count = extra.len(), "loaded model manifest");
        for entry in extra {
            registry.insert(entry);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, entry: ModelEntry) {
        self.entries.insert(entry.id.clone(), entry);
    }

    pub fn get(&self, id: &str) -> Option<&ModelEntry> {
        self.entries.get(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ModelEntry> {
        self.entries.values()
    }

    /// Ids serving `capability`, sorted.
    pub fn ids_for(&self, capability: ServiceType) -> Vec<&str> {
        self.entries
            .values()
            .filter(|e| e.capability == capability)
            .map(|e| e.id.as_str())
            .collect()
    }

    /// Resolve `id` to absolute paths, checking it serves `capability`.
    pub fn resolve(&self, id: &str, capability: ServiceType) -> Result<ResolvedModel, ModelError> {
        let entry = self.get(id).ok_or_else(|| ModelError::UnknownModel { id: id.to_string() })?;
        if entry.capability != capability {
            return Err(ModelError::CapabilityMismatch {
                id: id.to_string(),
                expected: capability.to_string(),
                actual: entry.capability.to_string(),
            });
        }
        Ok(ResolvedModel {
            model_path: self.models_dir.join(&entry.file),
            projector_path: entry.projector.as_ref().map(|p| self.models_dir.join(p)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_in_catalogue() {
        let registry = ModelRegistry::builtin("/models");
        for (id, capability) in [
            (DEFAULT_EMBEDDING_MODEL, ServiceType::Embedding),
            (DEFAULT_RERANK_MODEL, ServiceType::Reranking),
            (DEFAULT_VISION_MODEL, ServiceType::VisionCompletion),
            (DEFAULT_COMPLETION_MODEL, ServiceType::TextCompletion),
        ] {
            registry.resolve(id, capability).unwrap();
        }
    }

    #[test]
    fn test_resolve_vision_includes_projector() {
        let registry = ModelRegistry::builtin("/models");
        let resolved = registry
            .resolve(DEFAULT_VISION_MODEL, ServiceType::VisionCompletion)
            .unwrap();
        assert_eq!(
            resolved.model_path,
            PathBuf::from("/models/Qwen2.5-VL-3B-Instruct-Q4_K_M.gguf")
        );
        assert_eq!(
            resolved.projector_path,
            Some(PathBuf::from("/models/mmproj-Qwen2.5-VL-3B-Instruct-f16.gguf"))
        );
    }

    #[test]
    fn test_unknown_and_mismatched_ids() {
        let registry = ModelRegistry::builtin("/models");
        assert!(matches!(
            registry.resolve("nope", ServiceType::Embedding),
            Err(ModelError::UnknownModel { .. })
        ));
        match registry.resolve(DEFAULT_RERANK_MODEL, ServiceType::Embedding) {
            Err(ModelError::CapabilityMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, "embedding");
                assert_eq!(actual, "reranking");
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_manifest_adds_and_replaces_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"[
  {"id": "custom-embed", "capability": "embedding", "file": "/abs/custom.gguf"},
  {"id": "bge-reranker-v2-m3", "capability": "reranking", "file": "rr-f16.gguf"}
]"#,
        )
        .unwrap();

        let registry = ModelRegistry::load(dir.path()).unwrap();
        let custom = registry
            .resolve("custom-embed", ServiceType::Embedding)
            .unwrap();
        assert_eq!(custom.model_path, PathBuf::from("/abs/custom.gguf"));
        let rerank = registry
            .resolve(DEFAULT_RERANK_MODEL, ServiceType::Reranking)
            .unwrap();
        assert_eq!(rerank.model_path, dir.path().join("rr-f16.gguf"));
        assert!(
            registry
                .ids_for(ServiceType::Embedding)
                .contains(&"custom-embed")
        );
    }

    #[test]
    fn test_malformed_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), "{not json").unwrap();
        assert!(matches!(
            ModelRegistry::load(dir.path()),
            Err(ModelError::Manifest { .. })
        ));
    }

    #[test]
    fn test_load_without_manifest_is_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ModelRegistry::load(dir.path()).unwrap();
        assert_eq!(
            registry.entries().count(),
            ModelRegistry::builtin("/x").entries().count()
        );
    }
}

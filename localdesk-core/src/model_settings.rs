//! Persisted model selection and backend tuning.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use crate::backend::{PDF_MODE_KEY, VISION_MAX_PIXELS_KEY};
use crate::error::ModelError;
use crate::models::{
    DEFAULT_COMPLETION_MODEL, DEFAULT_EMBEDDING_MODEL, DEFAULT_RERANK_MODEL, DEFAULT_VISION_MODEL,
};
use crate::services::ServiceType;

/// How the backend chunks PDF documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PdfMode {
    /// Extracted text layer only.
    #[default]
    Text,
    /// Pages rendered and described by the vision model.
    Vision,
}

impl std::fmt::Display for PdfMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PdfMode::Text => write!(f, "text"),
            PdfMode::Vision => write!(f, "vision"),
        }
    }
}

/// User model configuration, stored as `model-config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelSettings {
    pub embedding_model: String,
    pub rerank_model: String,
    pub vision_model: String,
    /// Text completion is optional; `None` leaves the capability unstarted.
    pub completion_model: Option<String>,
    /// Pixel budget images are downscaled to before vision inference.
    pub vision_max_pixels: u32,
    pub pdf_mode: PdfMode,
    /// Per-capability context size overriding the service configuration.
    pub context_overrides: BTreeMap<ServiceType, u32>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            rerank_model: DEFAULT_RERANK_MODEL.to_string(),
            vision_model: DEFAULT_VISION_MODEL.to_string(),
            completion_model: Some(DEFAULT_COMPLETION_MODEL.to_string()),
            vision_max_pixels: 1_003_520,
            pdf_mode: PdfMode::Text,
            context_overrides: BTreeMap::new(),
        }
    }
}

impl ModelSettings {
    /// Load settings; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| ModelError::Persist(io::Error::new(io::ErrorKind::InvalidData, e)))
    }

    /// Write atomically: a sibling temp file renamed over the target.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json.as_bytes())?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Selected model id for `capability`.
    pub fn model_for(&self, capability: ServiceType) -> Option<&str> {
        match capability {
            ServiceType::Embedding => Some(self.embedding_model.as_str()),
            ServiceType::Reranking => Some(self.rerank_model.as_str()),
            ServiceType::VisionCompletion => Some(self.vision_model.as_str()),
            ServiceType::TextCompletion => self.completion_model.as_deref(),
        }
        .filter(|id| !id.trim().is_empty())
    }

    pub fn context_override(&self, capability: ServiceType) -> Option<u32> {
        self.context_overrides.get(&capability).copied()
    }

    /// Tuning values passed to the backend environment.
    pub fn backend_overrides(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert(
            VISION_MAX_PIXELS_KEY.to_string(),
            self.vision_max_pixels.to_string(),
        );
        env.insert(PDF_MODE_KEY.to_string(), self.pdf_mode.to_string());
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ModelSettings::load(&dir.path().join("model-config.json")).unwrap();
        assert_eq!(settings, ModelSettings::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("model-config.json");
        let mut settings = ModelSettings {
            pdf_mode: PdfMode::Vision,
            completion_model: None,
            ..ModelSettings::default()
        };
        settings
            .context_overrides
            .insert(ServiceType::VisionCompletion, 8192);
        settings.save(&path).unwrap();

        assert!(!path.with_extension("json.tmp").exists());
        let loaded = ModelSettings::load(&path).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.model_for(ServiceType::TextCompletion), None);
        assert_eq!(
            loaded.context_override(ServiceType::VisionCompletion),
            Some(8192)
        );
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model-config.json");
        std::fs::write(&path, r#"{"visionModel": "qwen2.5-vl-7b", "pdfMode": "vision"}"#).unwrap();
        let settings = ModelSettings::load(&path).unwrap();
        assert_eq!(settings.vision_model, "qwen2.5-vl-7b");
        assert_eq!(settings.pdf_mode, PdfMode::Vision);
        assert_eq!(settings.embedding_model, DEFAULT_EMBEDDING_MODEL);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model-config.json");
        std::fs::write(&path, "{").unwrap();
        assert!(matches!(
            ModelSettings::load(&path),
            Err(ModelError::Persist(_))
        ));
    }

    #[test]
    fn test_blank_selection_counts_as_unselected() {
        let settings = ModelSettings {
            rerank_model: " ".into(),
            ..ModelSettings::default()
        };
        assert_eq!(settings.model_for(ServiceType::Reranking), None);
        assert_eq!(
            settings.model_for(ServiceType::Embedding),
            Some(DEFAULT_EMBEDDING_MODEL)
        );
    }

    #[test]
    fn test_backend_overrides() {
        let env = ModelSettings::default().backend_overrides();
        assert_eq!(env[PDF_MODE_KEY], "text");
        assert_eq!(env[VISION_MAX_PIXELS_KEY], "1003520");
    }
}

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::ModelInfo;

pub const DEFAULT_MODEL_SLUG: &str = "qwen3-0.6";
pub const DEFAULT_CONTEXT_SIZE: u32 = 2048;

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: i64 = 100;
pub const DEFAULT_TOP_P: f32 = 0.0;
pub const DEFAULT_TOP_K: i64 = 0;
/// Decode budget used when the host asks for zero or fewer tokens.
pub const FALLBACK_MAX_TOKENS: u32 = 512;

pub const DEFAULT_TRANSCRIBE_TEMPERATURE: f32 = 0.0;
pub const DEFAULT_TRANSCRIBE_MAX_TOKENS: i64 = 0;

pub const DEFAULT_DOWNLOAD_BASE_URL: &str = "https://huggingface.co";

/// A downloadable model and where its assets live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub slug: String,
    pub name: String,
    #[serde(rename = "sizeMB")]
    pub size_mb: u32,
    #[serde(default)]
    pub supports_tool_calling: bool,
    #[serde(default)]
    pub supports_vision: bool,
    pub quantization: u32,
    /// Repository id on the download host, e.g. `Cactus-Compute/Qwen3-0.6B`.
    pub repo: String,
    pub files: Vec<String>,
}

impl ModelDescriptor {
    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            slug: self.slug.clone(),
            name: self.name.clone(),
            size_mb: self.size_mb,
            supports_tool_calling: self.supports_tool_calling,
            supports_vision: self.supports_vision,
            quantization: self.quantization,
        }
    }
}

pub fn builtin_catalog() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor {
            slug: DEFAULT_MODEL_SLUG.to_string(),
            name: "Qwen3 0.6B".to_string(),
            size_mb: 394,
            supports_tool_calling: true,
            supports_vision: false,
            quantization: 8,
            repo: "Cactus-Compute/Qwen3-0.6B".to_string(),
            files: vec![
                "config.txt".to_string(),
                "tokenizer.json".to_string(),
                "model.weights".to_string(),
            ],
        },
        ModelDescriptor {
            slug: "lfm2-vl-450m".to_string(),
            name: "LFM2-VL 450M".to_string(),
            size_mb: 420,
            supports_tool_calling: false,
            supports_vision: true,
            quantization: 8,
            repo: "Cactus-Compute/LFM2-VL-450M".to_string(),
            files: vec![
                "config.txt".to_string(),
                "tokenizer.json".to_string(),
                "model.weights".to_string(),
                "vision.weights".to_string(),
            ],
        },
    ]
}

/// Everything the bridge needs to know about its installation.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub models_dir: PathBuf,
    pub default_model_slug: String,
    pub default_context_size: u32,
    pub download_base_url: String,
    pub catalog: Vec<ModelDescriptor>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            default_model_slug: DEFAULT_MODEL_SLUG.to_string(),
            default_context_size: DEFAULT_CONTEXT_SIZE,
            download_base_url: DEFAULT_DOWNLOAD_BASE_URL.to_string(),
            catalog: builtin_catalog(),
        }
    }
}

impl BridgeConfig {
    pub fn with_models_dir(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            ..Self::default()
        }
    }

    /// Replace the built-in catalog with a JSON array of [`ModelDescriptor`]s.
    pub fn load_catalog(&mut self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read model catalog {}", path.display()))?;
        self.catalog = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse model catalog {}", path.display()))?;
        Ok(())
    }

    pub fn descriptor(&self, slug: &str) -> Option<&ModelDescriptor> {
        self.catalog.iter().find(|d| d.slug == slug)
    }
}

/// `<data dir>/cactus`, falling back to the temp dir on platforms without one.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("cactus")
}

pub fn default_models_dir() -> PathBuf {
    default_data_dir().join("models")
}

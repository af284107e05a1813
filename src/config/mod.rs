//! Application Configuration
//!
//! User settings stored in TOML format. Every section falls back to its
//! defaults, so a partial file is enough.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::vision::coordinator::CoordinatorOptions;
use crate::vision::onnx::OnnxOptions;
use crate::vision::preprocess::DEFAULT_MAX_DIMENSION;
use crate::vision::{BoxExtractionConfig, DetectionVariant, ExecutionStrategy, ImagePreparer, RecognitionVariant};

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Model selection and cache
    pub models: ModelsConfig,
    /// Image preparation and inference
    pub pipeline: PipelineConfig,
    /// Heatmap to box conversion
    pub detection: BoxExtractionConfig,
    pub logging: LoggingConfig,
}

/// Model selection and cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Detection architecture selected at startup
    pub detection: DetectionVariant,
    /// Recognition architecture selected at startup
    pub recognition: RecognitionVariant,
    /// Model cache directory (defaults to `<data dir>/models`)
    pub models_dir: Option<PathBuf>,
    /// Base URL models are downloaded from when missing
    pub download_base_url: Option<String>,
    /// Intra-op threads per ONNX session
    pub intra_threads: usize,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            detection: DetectionVariant::default(),
            recognition: RecognitionVariant::default(),
            models_dir: None,
            download_base_url: None,
            intra_threads: 4,
        }
    }
}

/// Image preparation and inference settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum width of a prepared image
    pub max_width: u32,
    /// Maximum height of a prepared image
    pub max_height: u32,
    /// Inference time budget in seconds
    pub timeout_secs: u64,
    /// Where detection and recognition run
    pub strategy: ExecutionStrategy,
    /// Word crops per recognition forward pass
    pub recognition_batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_width: DEFAULT_MAX_DIMENSION,
            max_height: DEFAULT_MAX_DIMENSION,
            timeout_secs: 30,
            strategy: ExecutionStrategy::Direct,
            recognition_batch_size: 32,
        }
    }
}

impl PipelineConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn preparer(&self) -> ImagePreparer {
        ImagePreparer::new(self.max_width, self.max_height)
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            strategy: self.strategy,
            timeout: self.timeout(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// ONNX backend tuning derived from this config
    pub fn onnx_options(&self) -> OnnxOptions {
        OnnxOptions {
            intra_threads: self.models.intra_threads.max(1),
            recognition_batch_size: self.pipeline.recognition_batch_size.max(1),
            box_extraction: self.detection.clone(),
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read config {:?}", path))?;
    let config: AppConfig =
        toml::from_str(&content).with_context(|| format!("Invalid config file {:?}", path))?;
    Ok(config)
}

/// Load configuration, falling back to defaults if the file does not exist
pub fn load_or_default(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(AppConfig::default())
    }
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

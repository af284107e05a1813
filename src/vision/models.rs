//! Model catalog and management for ONNX Runtime
//!
//! Lists the supported detection/recognition architectures and handles
//! locating, downloading and loading their ONNX files.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use ort::session::{builder::GraphOptimizationLevel, Session};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use super::{ModelSlot, TileSize};

/// Environment variable that disables model downloads
pub const OFFLINE_ENV: &str = "OCR_VISUALIZER_OFFLINE";

/// Detection model variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionVariant {
    /// DBNet with a MobileNet V2 backbone
    #[default]
    DbMobilenetV2,
    /// DBNet with a ResNet-50 backbone
    DbResnet50,
}

impl DetectionVariant {
    pub const ALL: [DetectionVariant; 2] = [DetectionVariant::DbMobilenetV2, DetectionVariant::DbResnet50];

    pub fn name(&self) -> &'static str {
        match self {
            DetectionVariant::DbMobilenetV2 => "db_mobilenet_v2",
            DetectionVariant::DbResnet50 => "db_resnet50",
        }
    }

    /// Human readable label
    pub fn label(&self) -> &'static str {
        match self {
            DetectionVariant::DbMobilenetV2 => "DB (MobileNet V2)",
            DetectionVariant::DbResnet50 => "DB (ResNet 50)",
        }
    }

    /// Look a variant up by its architecture name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.name() == name)
    }
}

/// Recognition model variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionVariant {
    /// CRNN with a VGG-16 (batch norm) backbone
    #[default]
    CrnnVgg16Bn,
    /// CRNN with a MobileNet V2 backbone
    CrnnMobilenetV2,
}

impl RecognitionVariant {
    pub const ALL: [RecognitionVariant; 2] = [RecognitionVariant::CrnnVgg16Bn, RecognitionVariant::CrnnMobilenetV2];

    pub fn name(&self) -> &'static str {
        match self {
            RecognitionVariant::CrnnVgg16Bn => "crnn_vgg16_bn",
            RecognitionVariant::CrnnMobilenetV2 => "crnn_mobilenet_v2",
        }
    }

    /// Human readable label
    pub fn label(&self) -> &'static str {
        match self {
            RecognitionVariant::CrnnVgg16Bn => "CRNN (VGG16)",
            RecognitionVariant::CrnnMobilenetV2 => "CRNN (MobileNet V2)",
        }
    }

    /// Look a variant up by its architecture name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.name() == name)
    }
}

/// What a model's raw output scores are
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScoreKind {
    /// Already in [0, 1]
    Probabilities,
    /// Unbounded; detection maps need a sigmoid, recognition a softmax
    Logits,
}

/// Identifies one model variant and the tile size it expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelConfig {
    pub slot: ModelSlot,
    pub architecture: &'static str,
    pub input_size: TileSize,
    pub scores: ScoreKind,
}

impl DetectionVariant {
    /// Output of the exported graph; the DB exports stop before the sigmoid
    pub fn scores(&self) -> ScoreKind {
        match self {
            DetectionVariant::DbMobilenetV2 | DetectionVariant::DbResnet50 => ScoreKind::Logits,
        }
    }
}

impl From<DetectionVariant> for ModelConfig {
    fn from(variant: DetectionVariant) -> Self {
        Self {
            slot: ModelSlot::Detection,
            architecture: variant.name(),
            input_size: TileSize::new(512, 512),
            scores: variant.scores(),
        }
    }
}

impl From<RecognitionVariant> for ModelConfig {
    fn from(variant: RecognitionVariant) -> Self {
        Self {
            slot: ModelSlot::Recognition,
            architecture: variant.name(),
            input_size: TileSize::new(32, 128),
            scores: ScoreKind::Logits,
        }
    }
}

impl fmt::Display for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}x{})",
            self.architecture, self.input_size.height, self.input_size.width
        )
    }
}

/// Model manifest tracking downloaded models
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelManifest {
    pub version: String,
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub architecture: String,
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: Option<String>,
    pub downloaded_at: u64,
}

impl Default for ModelManifest {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            models: Vec::new(),
        }
    }
}

/// Model manager for locating, downloading and caching ONNX models
#[derive(Debug, Clone)]
pub struct ModelManager {
    models_dir: PathBuf,
    /// Base URL models are fetched from, `{base}/{architecture}/model.onnx`
    download_base_url: Option<String>,
}

impl ModelManager {
    /// Create a model manager in the application data directory
    pub fn new() -> Result<Self> {
        let data_dir = crate::storage::get_data_dir()?;
        Self::with_dir(data_dir.join("models"))
    }

    /// Create model manager with custom directory
    pub fn with_dir(models_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&models_dir)
            .with_context(|| format!("Failed to create models directory {:?}", models_dir))?;
        Ok(Self {
            models_dir,
            download_base_url: None,
        })
    }

    /// Set the base URL missing models are downloaded from
    pub fn with_download_base_url(mut self, url: Option<String>) -> Self {
        self.download_base_url = url.map(|u| u.trim_end_matches('/').to_string());
        self
    }

    /// Get the models directory path
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Get the path to a model file
    pub fn model_path(&self, config: &ModelConfig) -> PathBuf {
        self.models_dir.join(config.architecture).join("model.onnx")
    }

    /// Check if a model file is present and non-empty
    pub fn is_model_available(&self, config: &ModelConfig) -> bool {
        std::fs::metadata(self.model_path(config))
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
    }

    /// Return the model path, downloading the file first if needed (blocking)
    pub fn ensure_model(&self, config: &ModelConfig) -> Result<PathBuf> {
        let path = self.model_path(config);

        if self.is_model_available(config) {
            debug!("Model {} already available at {:?}", config.architecture, path);
            return Ok(path);
        }

        let Some(base_url) = &self.download_base_url else {
            anyhow::bail!(
                "Model file {:?} not found and no download URL is configured",
                path
            );
        };

        if std::env::var(OFFLINE_ENV).is_ok() {
            anyhow::bail!(
                "Offline mode: cannot download models. Place the {} model at {:?}",
                config.architecture,
                path
            );
        }

        let url = format!("{}/{}/model.onnx", base_url, config.architecture);
        info!("Downloading {} model from {}", config.architecture, url);

        let rt = Runtime::new().context("Failed to create tokio runtime")?;
        rt.block_on(async { self.download_file_async(&url, &path).await })?;

        if !self.is_model_available(config) {
            anyhow::bail!("Download completed but model verification failed");
        }

        if let Err(e) = self.update_manifest_for_model(config) {
            warn!("Failed to update model manifest: {}", e);
        }

        info!("Successfully downloaded {} model", config.architecture);
        Ok(path)
    }

    /// Async download implementation
    async fn download_file_async(&self, url: &str, path: &Path) -> Result<()> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .context("Failed to create HTTP client")?;

        let response = client
            .get(url)
            .send()
            .await
            .context("Failed to send download request")?;

        if !response.status().is_success() {
            anyhow::bail!("Download failed with status {}: {}", response.status(), url);
        }

        debug!("Download size: {:?} bytes", response.content_length());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("tmp");
        let mut file = std::fs::File::create(&temp_path).context("Failed to create temp file")?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Error reading download stream")?;
            file.write_all(&chunk).context("Failed to write to temp file")?;
        }

        file.flush().context("Failed to flush temp file")?;
        drop(file);

        std::fs::rename(&temp_path, path)
            .context("Failed to move downloaded file to final location")?;

        Ok(())
    }

    /// Record a downloaded model in the manifest
    fn update_manifest_for_model(&self, config: &ModelConfig) -> Result<()> {
        let mut manifest = self.load_manifest().unwrap_or_default();

        let path = self.model_path(config);
        let data = std::fs::read(&path)?;
        let hash = format!("{:x}", Sha256::digest(&data));

        let model_info = ModelInfo {
            architecture: config.architecture.to_string(),
            filename: format!("{}/model.onnx", config.architecture),
            size_bytes: data.len() as u64,
            sha256: Some(hash),
            downloaded_at: unix_now(),
        };

        if let Some(existing) = manifest
            .models
            .iter_mut()
            .find(|m| m.architecture == model_info.architecture)
        {
            *existing = model_info;
        } else {
            manifest.models.push(model_info);
        }

        self.save_manifest(&manifest)
    }

    /// Check a model file against the checksum recorded in the manifest
    pub fn verify_model(&self, config: &ModelConfig) -> Result<bool> {
        let manifest = self.load_manifest()?;
        let Some(info) = manifest
            .models
            .iter()
            .find(|m| m.architecture == config.architecture)
        else {
            return Ok(true);
        };
        let Some(expected) = &info.sha256 else {
            return Ok(true);
        };

        let data = std::fs::read(self.model_path(config))?;
        Ok(&format!("{:x}", Sha256::digest(&data)) == expected)
    }

    /// Load the model manifest
    pub fn load_manifest(&self) -> Result<ModelManifest> {
        let manifest_path = self.models_dir.join("manifest.json");
        if manifest_path.exists() {
            let content = std::fs::read_to_string(&manifest_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(ModelManifest::default())
        }
    }

    /// Save the model manifest
    pub fn save_manifest(&self, manifest: &ModelManifest) -> Result<()> {
        let manifest_path = self.models_dir.join("manifest.json");
        let content = serde_json::to_string_pretty(manifest)?;
        std::fs::write(manifest_path, content)?;
        Ok(())
    }
}

/// ONNX Runtime session wrapper
pub struct OnnxSession {
    session: Session,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl OnnxSession {
    /// Create a new ONNX session from a model file
    pub fn new(model_path: &Path, intra_threads: usize) -> Result<Self> {
        info!("Loading ONNX model from {:?}", model_path);

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)
            .context("Failed to load ONNX model")?;

        let input_names: Vec<String> = session.inputs.iter().map(|i| i.name.clone()).collect();
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();

        info!(
            "Model loaded. Inputs: {:?}, Outputs: {:?}",
            input_names, output_names
        );

        Ok(Self {
            session,
            input_names,
            output_names,
        })
    }

    /// Get the underlying session mutably for running inference
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Get input names
    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    /// Get output names
    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }
}

impl fmt::Debug for OnnxSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnnxSession")
            .field("input_names", &self.input_names)
            .field("output_names", &self.output_names)
            .finish()
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

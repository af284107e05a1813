//! Application Coordinator
//!
//! Wires configuration, model registry, inference coordinator and run
//! controller together, and turns finished runs into reports.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::config::AppConfig;
use crate::run::{RunController, RunOutcome, UploadedFile};
use crate::shared::{PresentationState, RunMetadata, RunPhase};
use crate::vision::{InferenceCoordinator, ModelManager, ModelRegistry, OcrBackend, OnnxBackend, SlotStatus};
use crate::words::Word;

/// Main application coordinator
pub struct OcrApp<B: OcrBackend> {
    config: AppConfig,
    controller: Arc<RunController<B>>,
}

impl OcrApp<OnnxBackend> {
    /// Build the app on the ONNX Runtime backend
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let manager = match &config.models.models_dir {
            Some(dir) => ModelManager::with_dir(dir.clone())?,
            None => ModelManager::new()?,
        }
        .with_download_base_url(config.models.download_base_url.clone());
        info!("Model cache: {:?}", manager.models_dir());

        let backend = Arc::new(OnnxBackend::new(manager, config.onnx_options()));
        Ok(Self::with_backend(config, backend))
    }
}

impl<B: OcrBackend> OcrApp<B> {
    /// Build the app on any backend and start loading the configured models.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_backend(config: AppConfig, backend: Arc<B>) -> Self {
        let registry = Arc::new(ModelRegistry::new(Arc::clone(&backend)));
        let coordinator = Arc::new(InferenceCoordinator::new(
            backend,
            config.pipeline.coordinator_options(),
        ));
        let controller = Arc::new(RunController::new(
            config.pipeline.preparer(),
            registry,
            coordinator,
        ));

        controller.select_detection(config.models.detection);
        controller.select_recognition(config.models.recognition);

        Self { config, controller }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn controller(&self) -> &Arc<RunController<B>> {
        &self.controller
    }

    /// Run the pipeline on one file and report the published state
    pub async fn process(&self, file: UploadedFile) -> RunReport {
        let name = file.name.clone();
        let outcome = self.controller.start_run(file).await;
        RunReport::new(name, &outcome, &self.controller.snapshot())
    }

    /// Lifecycle state of both model slots
    pub fn model_status(&self) -> Vec<SlotStatus> {
        self.controller.registry().status()
    }

    /// Stop workers and release the models
    pub fn shutdown(&self) {
        if self.controller.is_running() {
            info!("Abandoning the run in progress");
        }
        self.controller.reset();
        self.controller.coordinator().shutdown();
        self.controller.registry().unload_all();
        info!("OCR pipeline shut down");
    }
}

/// Serializable summary of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub file: String,
    pub phase: RunPhase,
    pub superseded: bool,
    pub error: Option<String>,
    pub metadata: Option<RunMetadata>,
    pub words: Vec<Word>,
}

impl RunReport {
    fn new(file: String, outcome: &RunOutcome, state: &PresentationState) -> Self {
        // Only report state that belongs to this run
        let own_state = state.token == outcome.token();
        Self {
            file,
            phase: if own_state { state.phase } else { RunPhase::Idle },
            superseded: matches!(outcome, RunOutcome::Superseded { .. }),
            error: match outcome {
                RunOutcome::Failed { error, .. } => Some(error.to_string()),
                _ => None,
            },
            metadata: if own_state { state.metadata.clone() } else { None },
            words: if own_state { state.words.clone() } else { Vec::new() },
        }
    }

    pub fn is_success(&self) -> bool {
        self.phase == RunPhase::Done
    }

    /// Plain-text rendering for the terminal
    pub fn to_text(&self) -> String {
        let mut out = format!("File: {}\n", self.file);
        if let Some(error) = &self.error {
            out.push_str(&format!("Error: {}\n", error));
        }
        if self.superseded {
            out.push_str("Run was superseded\n");
        }
        if let Some(meta) = &self.metadata {
            out.push_str(&format!("Processing time: {}\n", meta.processing_time_label()));
            out.push_str(&format!("File size: {}\n", meta.file_size_label()));
            out.push_str(&format!("Resolution: {}\n", meta.resolution));
            out.push_str(&format!("{}\n", meta.word_count_label()));
        }
        for (index, word) in self.words.iter().enumerate() {
            out.push_str(&format!(
                "{:>4}  {:<24} {:.2}  ({:.3}, {:.3}, {:.3}, {:.3})\n",
                index + 1,
                word.text(),
                word.confidence,
                word.bbox.x_min,
                word.bbox.y_min,
                word.bbox.x_max,
                word.bbox.y_max
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::testing::{png_bytes, FakeBackend};
    use crate::vision::{DetectionVariant, RecognitionVariant, SlotState};

    #[tokio::test]
    async fn test_app_selects_configured_models() {
        let mut config = AppConfig::default();
        config.models.detection = DetectionVariant::DbResnet50;
        config.models.recognition = RecognitionVariant::CrnnMobilenetV2;

        let app = OcrApp::with_backend(config, Arc::new(FakeBackend::new()));
        let status = app.model_status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].config, Some(DetectionVariant::DbResnet50.into()));
        assert_eq!(status[1].config, Some(RecognitionVariant::CrnnMobilenetV2.into()));
        assert!(status.iter().all(|s| s.state != SlotState::Unloaded));
    }

    #[tokio::test]
    async fn test_process_produces_report() {
        let app = OcrApp::with_backend(AppConfig::default(), Arc::new(FakeBackend::new()));
        let report = app
            .process(UploadedFile::new("scan.png", png_bytes(640, 480)))
            .await;

        assert!(report.is_success());
        assert_eq!(report.words.len(), 3);
        let text = report.to_text();
        assert!(text.contains("Resolution: 640x480"));
        assert!(text.contains("3 words identified"));
        assert!(text.contains("hello"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["phase"], "done");
        assert_eq!(json["words"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_report() {
        let app = OcrApp::with_backend(AppConfig::default(), Arc::new(FakeBackend::new()));
        let report = app.process(UploadedFile::new("bad.png", vec![0, 1, 2])).await;
        assert!(!report.is_success());
        assert!(report.error.is_some());
        assert!(report.to_text().contains("Error: Failed to decode image"));
    }

    #[tokio::test]
    async fn test_shutdown_unloads_models() {
        let app = OcrApp::with_backend(AppConfig::default(), Arc::new(FakeBackend::new()));
        app.process(UploadedFile::new("scan.png", png_bytes(64, 64))).await;
        app.shutdown();
        assert!(app.model_status().iter().all(|s| s.state == SlotState::Unloaded));
        assert!(app.controller().snapshot().words.is_empty());
    }
}

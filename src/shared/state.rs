//! Presentation-facing state of the OCR pipeline

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::run::RunToken;
use crate::vision::{HeatmapBuffer, RasterImage};
use crate::words::Word;

/// Where the current run is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Idle,
    Preparing,
    Inferring,
    Reconciling,
    Done,
    Failed,
}

impl RunPhase {
    /// Whether a run is in progress
    pub fn is_busy(&self) -> bool {
        matches!(self, RunPhase::Preparing | RunPhase::Inferring | RunPhase::Reconciling)
    }
}

/// Facts about a completed run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetadata {
    /// Wall time from upload to publish
    pub processing_time: Duration,
    /// Uploaded file size in bytes
    pub file_size: u64,
    /// Source image resolution, e.g. "2000x1000"
    pub resolution: String,
    pub word_count: usize,
}

impl RunMetadata {
    /// e.g. "1.23 seconds"
    pub fn processing_time_label(&self) -> String {
        format!("{:.2} seconds", self.processing_time.as_secs_f64())
    }

    /// File size in megabytes, e.g. "0.48 MB"
    pub fn file_size_label(&self) -> String {
        format!("{:.2} MB", self.file_size as f64 / (1024.0 * 1024.0))
    }

    pub fn word_count_label(&self) -> String {
        match self.word_count {
            0 => "No words identified".to_string(),
            n => format!("{} words identified", n),
        }
    }
}

/// Everything the presentation layer renders
#[derive(Debug, Clone, Default)]
pub struct PresentationState {
    pub phase: RunPhase,
    /// Prepared image of the latest upload
    pub image: Option<Arc<RasterImage>>,
    pub words: Vec<Word>,
    pub heatmap: Option<Arc<HeatmapBuffer>>,
    pub metadata: Option<RunMetadata>,
    /// Decoding and downscaling in progress
    pub loading_image: bool,
    /// Detection and recognition in progress
    pub extracting_words: bool,
    /// Message of the last failed run
    pub error: Option<String>,
    /// Token of the run this state belongs to
    pub token: RunToken,
}

impl PresentationState {
    /// Drop displayed results
    pub fn clear_results(&mut self) {
        self.words.clear();
        self.heatmap = None;
        self.metadata = None;
    }

    /// Clear both progress indicators
    pub fn clear_flags(&mut self) {
        self.loading_image = false;
        self.extracting_words = false;
    }

    pub fn active_word(&self) -> Option<&Word> {
        self.words.iter().find(|w| w.is_active)
    }
}

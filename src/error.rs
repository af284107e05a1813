//! Pipeline error types
//!
//! Every failure a run can hit is one of these variants. The run controller
//! turns them into the error signal shown to the presentation layer.

use std::time::Duration;
use thiserror::Error;

use crate::vision::ModelSlot;

/// Errors produced while preparing, loading or running OCR
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// Uploaded bytes are not a decodable image
    #[error("Failed to decode image: {0}")]
    Decode(String),

    /// A model slot was used before it reached the ready state
    #[error("{slot} model is not ready")]
    ModelNotReady { slot: ModelSlot },

    /// Fetching or parsing a model failed; the slot stays unloaded
    #[error("Failed to load {slot} model '{architecture}': {message}")]
    LoadFailure {
        slot: ModelSlot,
        architecture: &'static str,
        message: String,
    },

    /// Detection or recognition raised an error
    #[error("{stage} failed: {message}")]
    Inference { stage: &'static str, message: String },

    /// The run exceeded its time budget
    #[error("OCR run timed out after {0:?}")]
    Timeout(Duration),

    /// The run was superseded by a newer run or a configuration change
    #[error("OCR run was cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Wrap a stage error as an inference failure
    pub fn inference(stage: &'static str, err: impl std::fmt::Display) -> Self {
        PipelineError::Inference {
            stage,
            message: format!("{:#}", err),
        }
    }

    /// Whether this error should be surfaced to the user
    pub fn is_reportable(&self) -> bool {
        !matches!(self, PipelineError::Cancelled)
    }
}

impl From<image::ImageError> for PipelineError {
    fn from(err: image::ImageError) -> Self {
        PipelineError::Decode(err.to_string())
    }
}

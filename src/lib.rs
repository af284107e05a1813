//! OCR Visualizer - text detection and recognition pipeline
//!
//! Takes an uploaded image, prepares it, runs a detection model (confidence
//! heatmap plus word boxes) and a recognition model (text per box), and
//! keeps the resulting word list consistent while runs overlap and models
//! are swapped.

pub mod app;
pub mod config;
pub mod error;
pub mod run;
pub mod shared;
pub mod storage;
pub mod vision;
pub mod words;

pub use app::{OcrApp, RunReport};
pub use error::PipelineError;
pub use run::{RunController, RunOutcome, UploadedFile};

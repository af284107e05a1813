//! Inference backend seam
//!
//! The pipeline never runs a neural network itself. It drives an
//! [`OcrBackend`], which loads model handles and runs the two stages on them.
//! All methods are blocking and are called from the blocking thread pool or
//! from an offloaded worker thread.

use anyhow::Result;

use super::detection::{extract_bounding_boxes, BoxExtractionConfig};
use super::{BoundingBox, HeatmapBuffer, ModelConfig, ModelSlot, RasterImage, TileSize, WordCandidate};

/// Detection and recognition model execution
pub trait OcrBackend: Send + Sync + 'static {
    /// Opaque loaded model handle
    type Model: Send + Sync + 'static;

    /// Fetch and load a model for `slot`
    fn load_model(&self, slot: ModelSlot, config: &ModelConfig) -> Result<Self::Model>;

    /// Run the detection model and return its confidence heatmap
    fn detect(&self, model: &Self::Model, image: &RasterImage, size: TileSize) -> Result<HeatmapBuffer>;

    /// Turn a heatmap into candidate word boxes
    fn extract_boxes(&self, heatmap: &HeatmapBuffer) -> Vec<BoundingBox> {
        extract_bounding_boxes(heatmap, &BoxExtractionConfig::default())
    }

    /// Decode the text inside each box, preserving box order
    fn recognize(
        &self,
        model: &Self::Model,
        image: &RasterImage,
        boxes: &[BoundingBox],
        size: TileSize,
    ) -> Result<Vec<WordCandidate>>;
}

//! Vision/OCR Layer
//!
//! Prepares uploaded images and runs text detection and recognition on them.
//! Inference itself sits behind the [`OcrBackend`] trait:
//! - ONNX Runtime models (`onnx`) for real use
//! - A deterministic fake (`testing`) for unit tests

pub mod backend;
pub mod coordinator;
pub mod detection;
pub mod models;
pub mod onnx;
pub mod preprocess;
pub mod registry;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

use anyhow::Result;
use image::{GrayImage, Luma, RgbImage};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use backend::OcrBackend;
pub use coordinator::{CoordinatorOptions, InferenceCoordinator};
pub use detection::BoxExtractionConfig;
pub use models::{DetectionVariant, ModelConfig, ModelManager, RecognitionVariant, ScoreKind};
pub use onnx::OnnxBackend;
pub use preprocess::ImagePreparer;
pub use registry::{LoadedModel, ModelRegistry, SlotState, SlotStatus};

/// The two model slots of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelSlot {
    /// Text detection (heatmap of likely text regions)
    Detection,
    /// Text recognition (decodes text inside a region)
    Recognition,
}

impl ModelSlot {
    /// Both slots, detection first
    pub const ALL: [ModelSlot; 2] = [ModelSlot::Detection, ModelSlot::Recognition];

    pub(crate) fn index(self) -> usize {
        match self {
            ModelSlot::Detection => 0,
            ModelSlot::Recognition => 1,
        }
    }
}

impl fmt::Display for ModelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSlot::Detection => f.write_str("detection"),
            ModelSlot::Recognition => f.write_str("recognition"),
        }
    }
}

/// Model input tile size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileSize {
    pub height: u32,
    pub width: u32,
}

impl TileSize {
    pub const fn new(height: u32, width: u32) -> Self {
        Self { height, width }
    }
}

/// How detection and recognition are executed for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Run both stages on the blocking thread pool of the current runtime
    #[default]
    Direct,
    /// Send the image to an isolated worker thread that owns its own models
    Offloaded,
}

/// A decoded, possibly downscaled, RGB image ready for inference
#[derive(Debug, Clone)]
pub struct RasterImage {
    pixels: RgbImage,
    /// Size of the uploaded file in bytes
    source_size: u64,
    /// Dimensions before downscaling
    source_dimensions: (u32, u32),
}

impl RasterImage {
    /// Wrap prepared pixels together with the source file facts
    pub fn new(pixels: RgbImage, source_size: u64, source_dimensions: (u32, u32)) -> Self {
        Self {
            pixels,
            source_size,
            source_dimensions,
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Get image dimensions as (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn source_size(&self) -> u64 {
        self.source_size
    }

    pub fn source_dimensions(&self) -> (u32, u32) {
        self.source_dimensions
    }

    /// Resolution of the uploaded image, e.g. "2000x1000"
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.source_dimensions.0, self.source_dimensions.1)
    }

    /// Copy out the pixels covered by a normalized bounding box
    pub fn crop(&self, bbox: &BoundingBox) -> RgbImage {
        let (x, y, w, h) = bbox.to_pixels(self.width(), self.height());
        image::imageops::crop_imm(&self.pixels, x, y, w.max(1), h.max(1)).to_image()
    }
}

/// Detection confidence scores, one per heatmap cell, in [0, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct HeatmapBuffer {
    width: u32,
    height: u32,
    scores: Vec<f32>,
}

impl HeatmapBuffer {
    /// Create a heatmap from row-major scores
    pub fn new(width: u32, height: u32, scores: Vec<f32>) -> Result<Self> {
        let expected = (width as usize) * (height as usize);
        if scores.len() != expected {
            anyhow::bail!(
                "Heatmap {}x{} needs {} scores, got {}",
                width,
                height,
                expected,
                scores.len()
            );
        }
        Ok(Self {
            width,
            height,
            scores,
        })
    }

    /// An all-zero heatmap
    pub fn zeros(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            scores: vec![0.0; (width as usize) * (height as usize)],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw row-major scores
    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    /// Score at a cell
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.scores[(y * self.width + x) as usize]
    }

    /// Highest score in the map (0.0 when empty)
    pub fn max_score(&self) -> f32 {
        self.scores.iter().copied().fold(0.0, f32::max)
    }

    /// Render as an 8-bit grayscale image
    pub fn to_luma(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            Luma([(self.get(x, y).clamp(0.0, 1.0) * 255.0).round() as u8])
        })
    }
}

/// Axis-aligned box in normalized [0, 1] image coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

impl BoundingBox {
    /// Create a box, clamping and ordering the coordinates
    pub fn new(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
        Self {
            x_min: x_min.min(x_max).clamp(0.0, 1.0),
            y_min: y_min.min(y_max).clamp(0.0, 1.0),
            x_max: x_max.max(x_min).clamp(0.0, 1.0),
            y_max: y_max.max(y_min).clamp(0.0, 1.0),
        }
    }

    pub fn width(&self) -> f32 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> f32 {
        self.y_max - self.y_min
    }

    /// Corner points, clockwise from top-left
    pub fn polygon(&self) -> [(f32, f32); 4] {
        [
            (self.x_min, self.y_min),
            (self.x_max, self.y_min),
            (self.x_max, self.y_max),
            (self.x_min, self.y_max),
        ]
    }

    /// Pixel bounds (x, y, width, height) for an image of the given size
    pub fn to_pixels(&self, img_width: u32, img_height: u32) -> (u32, u32, u32, u32) {
        let x = ((self.x_min * img_width as f32).floor() as u32).min(img_width.saturating_sub(1));
        let y = ((self.y_min * img_height as f32).floor() as u32).min(img_height.saturating_sub(1));
        let x_end = ((self.x_max * img_width as f32).ceil() as u32).min(img_width);
        let y_end = ((self.y_max * img_height as f32).ceil() as u32).min(img_height);
        (x, y, x_end.saturating_sub(x), y_end.saturating_sub(y))
    }
}

/// A detected region with its decoded text, before identity assignment
#[derive(Debug, Clone, PartialEq)]
pub struct WordCandidate {
    /// Region in normalized image coordinates
    pub bbox: BoundingBox,
    /// Decoded text tokens, in reading order
    pub tokens: Vec<String>,
    /// Mean recognition confidence (0.0 - 1.0)
    pub confidence: f32,
}

/// Output of one detection + recognition pass
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    pub heatmap: HeatmapBuffer,
    pub candidates: Vec<WordCandidate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounding_box_normalizes_order() {
        let bbox = BoundingBox::new(0.8, 0.6, 0.2, 1.4);
        assert_eq!(bbox.x_min, 0.2);
        assert_eq!(bbox.x_max, 0.8);
        assert_eq!(bbox.y_min, 0.6);
        assert_eq!(bbox.y_max, 1.0);
    }

    #[test]
    fn test_bounding_box_to_pixels() {
        let bbox = BoundingBox::new(0.25, 0.5, 0.75, 1.0);
        assert_eq!(bbox.to_pixels(200, 100), (50, 50, 100, 50));
    }

    #[test]
    fn test_polygon_corners() {
        let bbox = BoundingBox::new(0.1, 0.2, 0.3, 0.4);
        let poly = bbox.polygon();
        assert_eq!(poly[0], (0.1, 0.2));
        assert_eq!(poly[2], (0.3, 0.4));
    }

    #[test]
    fn test_heatmap_rejects_wrong_length() {
        assert!(HeatmapBuffer::new(4, 4, vec![0.0; 15]).is_err());
        assert!(HeatmapBuffer::new(4, 4, vec![0.0; 16]).is_ok());
    }

    #[test]
    fn test_heatmap_to_luma() {
        let heatmap = HeatmapBuffer::new(2, 1, vec![0.0, 1.0]).unwrap();
        let luma = heatmap.to_luma();
        assert_eq!(luma.get_pixel(0, 0).0[0], 0);
        assert_eq!(luma.get_pixel(1, 0).0[0], 255);
        assert_eq!(heatmap.max_score(), 1.0);
    }

    #[test]
    fn test_raster_crop_and_resolution() {
        let raster = RasterImage::new(RgbImage::new(100, 50), 1234, (2000, 1000));
        assert_eq!(raster.resolution(), "2000x1000");
        let crop = raster.crop(&BoundingBox::new(0.0, 0.0, 0.5, 0.5));
        assert_eq!(crop.dimensions(), (50, 25));
    }

    #[test]
    fn test_slot_display() {
        assert_eq!(ModelSlot::Detection.to_string(), "detection");
        assert_eq!(ModelSlot::Recognition.to_string(), "recognition");
    }
}

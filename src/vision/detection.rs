//! Text region extraction from detection heatmaps
//!
//! Binarizes the confidence map, cleans it up with a morphological opening and
//! turns each connected blob into a bounding box. Boxes are expanded to make
//! up for the shrunk text kernels DBNet-style models predict.

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{BoundingBox, HeatmapBuffer};

/// Parameters for turning a heatmap into boxes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoxExtractionConfig {
    /// Score above which a heatmap cell counts as text (0.0 - 1.0)
    pub bin_threshold: f32,
    /// Radius of the morphological opening (0 disables it)
    pub opening_radius: u8,
    /// Blobs no wider or no taller than this (in heatmap cells) are dropped
    pub min_size: u32,
    /// Expansion ratio applied to each blob, relative to area / perimeter
    pub unclip_ratio: f32,
}

impl Default for BoxExtractionConfig {
    fn default() -> Self {
        Self {
            bin_threshold: 0.3,
            opening_radius: 1,
            min_size: 2,
            unclip_ratio: 1.8,
        }
    }
}

/// Per-blob extent accumulated while scanning the label image
#[derive(Debug, Clone, Copy)]
struct Extent {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
}

impl Extent {
    fn new(x: u32, y: u32) -> Self {
        Self {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
        }
    }

    fn include(&mut self, x: u32, y: u32) {
        self.min_x = self.min_x.min(x);
        self.min_y = self.min_y.min(y);
        self.max_x = self.max_x.max(x);
        self.max_y = self.max_y.max(y);
    }
}

/// Extract normalized word boxes from a heatmap.
///
/// Boxes come out in label order, which follows the raster scan of the
/// heatmap (top-most blob first).
pub fn extract_bounding_boxes(heatmap: &HeatmapBuffer, config: &BoxExtractionConfig) -> Vec<BoundingBox> {
    let (width, height) = (heatmap.width(), heatmap.height());
    if width == 0 || height == 0 {
        return Vec::new();
    }

    let binary = binarize(heatmap, config.bin_threshold);
    let binary = if config.opening_radius > 0 {
        imageproc::morphology::open(&binary, Norm::LInf, config.opening_radius)
    } else {
        binary
    };

    let labels = connected_components(&binary, Connectivity::Eight, Luma([0u8]));

    // Label ids are assigned in scan order starting at 1
    let mut extents: Vec<Option<Extent>> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let id = label.0[0] as usize;
        if id == 0 {
            continue;
        }
        if extents.len() < id {
            extents.resize(id, None);
        }
        if let Some(extent) = extents[id - 1].as_mut() {
            extent.include(x, y);
        } else {
            extents[id - 1] = Some(Extent::new(x, y));
        }
    }

    let boxes: Vec<BoundingBox> = extents
        .into_iter()
        .flatten()
        .filter_map(|extent| to_box(extent, width, height, config))
        .collect();

    debug!(
        "Extracted {} boxes from {}x{} heatmap (threshold {})",
        boxes.len(),
        width,
        height,
        config.bin_threshold
    );

    boxes
}

/// Threshold the heatmap into a 0/255 mask
fn binarize(heatmap: &HeatmapBuffer, threshold: f32) -> GrayImage {
    GrayImage::from_fn(heatmap.width(), heatmap.height(), |x, y| {
        if heatmap.get(x, y) >= threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Expand a blob and normalize it to [0, 1] coordinates
fn to_box(extent: Extent, width: u32, height: u32, config: &BoxExtractionConfig) -> Option<BoundingBox> {
    let w = (extent.max_x - extent.min_x + 1) as f32;
    let h = (extent.max_y - extent.min_y + 1) as f32;

    if w <= config.min_size as f32 || h <= config.min_size as f32 {
        return None;
    }

    let offset = (w * h * config.unclip_ratio) / (2.0 * (w + h));

    let x_min = (extent.min_x as f32 - offset).max(0.0);
    let y_min = (extent.min_y as f32 - offset).max(0.0);
    let x_max = (extent.max_x as f32 + 1.0 + offset).min(width as f32);
    let y_max = (extent.max_y as f32 + 1.0 + offset).min(height as f32);

    Some(BoundingBox::new(
        x_min / width as f32,
        y_min / height as f32,
        x_max / width as f32,
        y_max / height as f32,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Heatmap with full-confidence rectangles (x, y, w, h) painted on it
    fn heatmap_with(width: u32, height: u32, rects: &[(u32, u32, u32, u32)]) -> HeatmapBuffer {
        let mut scores = vec![0.0f32; (width * height) as usize];
        for &(rx, ry, rw, rh) in rects {
            for y in ry..ry + rh {
                for x in rx..rx + rw {
                    scores[(y * width + x) as usize] = 0.95;
                }
            }
        }
        HeatmapBuffer::new(width, height, scores).unwrap()
    }

    #[test]
    fn test_empty_heatmap_has_no_boxes() {
        let heatmap = HeatmapBuffer::zeros(64, 64);
        assert!(extract_bounding_boxes(&heatmap, &BoxExtractionConfig::default()).is_empty());
    }

    #[test]
    fn test_two_blobs_in_scan_order() {
        let heatmap = heatmap_with(100, 100, &[(60, 10, 20, 8), (10, 50, 30, 10)]);
        let boxes = extract_bounding_boxes(&heatmap, &BoxExtractionConfig::default());
        assert_eq!(boxes.len(), 2);
        // Upper blob first
        assert!(boxes[0].y_min < boxes[1].y_min);
        assert!(boxes[0].x_min > 0.5);
        assert!(boxes[1].x_max < 0.5);
    }

    #[test]
    fn test_boxes_are_expanded_and_clamped() {
        let config = BoxExtractionConfig::default();
        let heatmap = heatmap_with(100, 100, &[(0, 0, 20, 10)]);
        let boxes = extract_bounding_boxes(&heatmap, &config);
        assert_eq!(boxes.len(), 1);
        let bbox = boxes[0];
        assert_eq!(bbox.x_min, 0.0);
        assert_eq!(bbox.y_min, 0.0);
        // offset = 20 * 10 * 1.8 / 60 = 6 cells
        assert!((bbox.x_max - 0.26).abs() < 1e-4);
        assert!((bbox.y_max - 0.16).abs() < 1e-4);
    }

    #[test]
    fn test_tiny_blobs_are_dropped() {
        let config = BoxExtractionConfig {
            opening_radius: 0,
            ..Default::default()
        };
        let heatmap = heatmap_with(50, 50, &[(5, 5, 2, 2), (20, 20, 10, 6)]);
        let boxes = extract_bounding_boxes(&heatmap, &config);
        assert_eq!(boxes.len(), 1);
    }

    #[test]
    fn test_min_size_is_exclusive() {
        let config = BoxExtractionConfig {
            opening_radius: 0,
            min_size: 2,
            ..Default::default()
        };
        // 2 cells wide is dropped, 3x3 is kept
        let heatmap = heatmap_with(50, 50, &[(5, 5, 2, 6), (20, 20, 3, 3)]);
        let boxes = extract_bounding_boxes(&heatmap, &config);
        assert_eq!(boxes.len(), 1);
        assert!(boxes[0].x_min > 0.3);
    }

    #[test]
    fn test_threshold_controls_detection() {
        let mut scores = vec![0.0f32; 40 * 40];
        for y in 10..20 {
            for x in 5..30 {
                scores[y * 40 + x] = 0.4;
            }
        }
        let heatmap = HeatmapBuffer::new(40, 40, scores).unwrap();

        let low = BoxExtractionConfig::default();
        assert_eq!(extract_bounding_boxes(&heatmap, &low).len(), 1);

        let high = BoxExtractionConfig {
            bin_threshold: 0.5,
            ..Default::default()
        };
        assert!(extract_bounding_boxes(&heatmap, &high).is_empty());
    }
}

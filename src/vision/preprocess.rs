//! Image preparation and tensor conversion
//!
//! Decodes uploaded bytes into a canonical RGB raster (downscaled to fit the
//! configured bounds) and converts rasters into normalized NCHW tensors for
//! the ONNX models.

use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use tracing::debug;

use super::RasterImage;
use crate::error::PipelineError;

/// Default maximum width/height of a prepared image
pub const DEFAULT_MAX_DIMENSION: u32 = 1024;

/// Decodes and downscales uploaded images
#[derive(Debug, Clone)]
pub struct ImagePreparer {
    max_width: u32,
    max_height: u32,
    filter: FilterType,
}

impl Default for ImagePreparer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DIMENSION, DEFAULT_MAX_DIMENSION)
    }
}

impl ImagePreparer {
    /// Create a preparer with the given bounds
    pub fn new(max_width: u32, max_height: u32) -> Self {
        Self {
            max_width: max_width.max(1),
            max_height: max_height.max(1),
            filter: FilterType::Triangle,
        }
    }

    pub fn max_dimensions(&self) -> (u32, u32) {
        (self.max_width, self.max_height)
    }

    /// Decode `bytes` and downscale the result to fit the bounds
    pub fn prepare(&self, bytes: &[u8]) -> Result<RasterImage, PipelineError> {
        let decoded = image::load_from_memory(bytes)?;
        let rgb = decoded.to_rgb8();
        let (width, height) = rgb.dimensions();

        if width == 0 || height == 0 {
            return Err(PipelineError::Decode(format!(
                "Image has no pixels ({}x{})",
                width, height
            )));
        }

        let (out_w, out_h) = self.target_dimensions(width, height);
        let pixels = if (out_w, out_h) == (width, height) {
            rgb
        } else {
            debug!(
                "Downscaling image from {}x{} to {}x{}",
                width, height, out_w, out_h
            );
            image::imageops::resize(&rgb, out_w, out_h, self.filter)
        };

        Ok(RasterImage::new(pixels, bytes.len() as u64, (width, height)))
    }

    /// Output dimensions for an image of the given size. Never upscales.
    pub fn target_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        let scale = f64::min(
            self.max_width as f64 / width as f64,
            self.max_height as f64 / height as f64,
        );

        if scale >= 1.0 {
            return (width, height);
        }

        let out_w = ((width as f64 * scale).round() as u32).clamp(1, self.max_width);
        let out_h = ((height as f64 * scale).round() as u32).clamp(1, self.max_height);
        (out_w, out_h)
    }
}

/// Per-channel normalization constants
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalization {
    /// Statistics the detection models were trained with
    pub const DETECTION: Normalization = Normalization {
        mean: [0.798, 0.785, 0.772],
        std: [0.264, 0.2749, 0.287],
    };

    /// Statistics the recognition models were trained with
    pub const RECOGNITION: Normalization = Normalization {
        mean: [0.694, 0.695, 0.693],
        std: [0.299, 0.296, 0.301],
    };
}

/// Resize an RGB image to exactly `width` x `height`
pub fn resize_exact(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    image::imageops::resize(image, width, height, FilterType::Triangle)
}

/// Pack RGB images of identical size into a normalized NCHW batch tensor
pub fn to_nchw_batch(images: &[RgbImage], norm: &Normalization) -> Array4<f32> {
    let (w, h) = images.first().map(|i| i.dimensions()).unwrap_or((0, 0));
    let mut tensor = Array4::<f32>::zeros((images.len(), 3, h as usize, w as usize));

    for (n, image) in images.iter().enumerate() {
        for (x, y, pixel) in image.enumerate_pixels() {
            if x >= w || y >= h {
                continue;
            }
            for c in 0..3 {
                let value = pixel.0[c] as f32 / 255.0;
                tensor[[n, c, y as usize, x as usize]] = (value - norm.mean[c]) / norm.std[c];
            }
        }
    }

    tensor
}

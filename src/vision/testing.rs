//! Deterministic in-process backend for tests

use anyhow::{bail, Result};
use image::{ImageFormat, Rgb, RgbImage};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use super::backend::OcrBackend;
use super::{BoundingBox, HeatmapBuffer, ModelConfig, ModelSlot, RasterImage, TileSize, WordCandidate};

/// Model handle produced by [`FakeBackend`]
#[derive(Debug)]
pub(crate) struct FakeModel {
    pub config: ModelConfig,
}

/// Backend whose heatmap holds one horizontal stripe per configured word
pub(crate) struct FakeBackend {
    load_delay: Duration,
    words: Vec<&'static str>,
    failing_models: Mutex<HashSet<&'static str>>,
    loads: Mutex<Vec<&'static str>>,
    active_loads: AtomicUsize,
    max_active_loads: AtomicUsize,
    /// Detection delay keyed by image width
    detect_delays: Mutex<HashMap<u32, Duration>>,
    detect_calls: AtomicUsize,
    fail_detection: AtomicBool,
    fail_recognition: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            load_delay: Duration::ZERO,
            words: vec!["hello", "ocr", "world"],
            failing_models: Mutex::new(HashSet::new()),
            loads: Mutex::new(Vec::new()),
            active_loads: AtomicUsize::new(0),
            max_active_loads: AtomicUsize::new(0),
            detect_delays: Mutex::new(HashMap::new()),
            detect_calls: AtomicUsize::new(0),
            fail_detection: AtomicBool::new(false),
            fail_recognition: AtomicBool::new(false),
        }
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn with_words(mut self, words: &[&'static str]) -> Self {
        self.words = words.to_vec();
        self
    }

    /// Make detection on images of `width` pixels take `delay`
    pub fn with_detect_delay(self, width: u32, delay: Duration) -> Self {
        self.detect_delays.lock().insert(width, delay);
        self
    }

    pub fn fail_model(&self, architecture: &'static str) {
        self.failing_models.lock().insert(architecture);
    }

    pub fn heal_model(&self, architecture: &'static str) {
        self.failing_models.lock().remove(architecture);
    }

    pub fn set_fail_detection(&self, fail: bool) {
        self.fail_detection.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_recognition(&self, fail: bool) {
        self.fail_recognition.store(fail, Ordering::SeqCst);
    }

    pub fn load_count(&self) -> usize {
        self.loads.lock().len()
    }

    pub fn loaded_architectures(&self) -> Vec<&'static str> {
        self.loads.lock().clone()
    }

    pub fn max_concurrent_loads(&self) -> usize {
        self.max_active_loads.load(Ordering::SeqCst)
    }

    pub fn detect_calls(&self) -> usize {
        self.detect_calls.load(Ordering::SeqCst)
    }
}

impl OcrBackend for FakeBackend {
    type Model = FakeModel;

    fn load_model(&self, slot: ModelSlot, config: &ModelConfig) -> Result<FakeModel> {
        let active = self.active_loads.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_loads.fetch_max(active, Ordering::SeqCst);
        thread::sleep(self.load_delay);
        self.active_loads.fetch_sub(1, Ordering::SeqCst);

        self.loads.lock().push(config.architecture);
        if config.slot != slot {
            bail!("{} is not a {} model", config.architecture, slot);
        }
        if self.failing_models.lock().contains(config.architecture) {
            bail!("weights for {} are corrupt", config.architecture);
        }
        Ok(FakeModel { config: *config })
    }

    fn detect(&self, _model: &FakeModel, image: &RasterImage, _size: TileSize) -> Result<HeatmapBuffer> {
        self.detect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.detect_delays.lock().get(&image.width()).copied();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        if self.fail_detection.load(Ordering::SeqCst) {
            bail!("synthetic detection failure");
        }

        // One 80x6 stripe per word, 16 cells apart
        let width = 128u32;
        let height = (16 * (self.words.len() as u32 + 1)).max(16);
        let mut scores = vec![0.0f32; (width * height) as usize];
        for i in 0..self.words.len() as u32 {
            let top = 8 + 16 * i;
            for y in top..top + 6 {
                for x in 10..90 {
                    scores[(y * width + x) as usize] = 0.9;
                }
            }
        }
        HeatmapBuffer::new(width, height, scores)
    }

    fn recognize(
        &self,
        _model: &FakeModel,
        _image: &RasterImage,
        boxes: &[BoundingBox],
        _size: TileSize,
    ) -> Result<Vec<WordCandidate>> {
        if self.fail_recognition.load(Ordering::SeqCst) {
            bail!("synthetic recognition failure");
        }
        Ok(boxes
            .iter()
            .enumerate()
            .map(|(i, bbox)| WordCandidate {
                bbox: *bbox,
                tokens: vec![self.words[i % self.words.len()].to_string()],
                confidence: 0.9,
            })
            .collect())
    }
}

/// Encode a solid-color PNG of the given size
pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([240, 240, 240]));
    let mut buffer = Cursor::new(Vec::new());
    img.write_to(&mut buffer, ImageFormat::Png)
        .expect("PNG encoding into memory cannot fail");
    buffer.into_inner()
}

/// A prepared raster of the given size
pub(crate) fn raster(width: u32, height: u32) -> RasterImage {
    RasterImage::new(RgbImage::new(width, height), 0, (width, height))
}

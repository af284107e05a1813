//! ONNX Runtime backend
//!
//! Runs DBNet-style detection models (score map output, logits or
//! probabilities per the catalog) and CRNN recognition models (CTC logits
//! output) exported to ONNX.

use anyhow::{Context, Result};
use ndarray::Array4;
use ort::value::TensorRef;
use parking_lot::Mutex;
use tracing::debug;

use super::backend::OcrBackend;
use super::detection::{extract_bounding_boxes, BoxExtractionConfig};
use super::models::{ModelConfig, ModelManager, OnnxSession, ScoreKind};
use super::preprocess::{resize_exact, to_nchw_batch, Normalization};
use super::{BoundingBox, HeatmapBuffer, ModelSlot, RasterImage, TileSize, WordCandidate};

/// Characters the recognition models decode to; the CTC blank follows the last one
pub const VOCAB: &str = "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~°£€¥¢฿àâéèêëîïôùûüçÀÂÉÈÊËÎÏÔÙÛÜÇ";

/// Tuning for the ONNX backend
#[derive(Debug, Clone)]
pub struct OnnxOptions {
    /// Intra-op threads per session
    pub intra_threads: usize,
    /// Word crops per recognition forward pass
    pub recognition_batch_size: usize,
    /// Heatmap to box conversion
    pub box_extraction: BoxExtractionConfig,
}

impl Default for OnnxOptions {
    fn default() -> Self {
        Self {
            intra_threads: 4,
            recognition_batch_size: 32,
            box_extraction: BoxExtractionConfig::default(),
        }
    }
}

/// A loaded ONNX model
#[derive(Debug)]
pub struct OnnxModel {
    config: ModelConfig,
    session: Mutex<OnnxSession>,
}

impl OnnxModel {
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Run the model on one input tensor and copy out its first output
    fn run(&self, input: &Array4<f32>) -> Result<(Vec<i64>, Vec<f32>)> {
        let mut guard = self.session.lock();
        let input_name = guard
            .input_names()
            .first()
            .cloned()
            .context("Model has no inputs")?;
        let output_name = guard
            .output_names()
            .first()
            .cloned()
            .context("Model has no outputs")?;

        let tensor = TensorRef::from_array_view(input.view())?;
        let outputs = guard
            .session_mut()
            .run(ort::inputs![input_name.as_str() => tensor])
            .with_context(|| format!("{} forward pass failed", self.config.architecture))?;

        let (shape, data) = outputs[output_name.as_str()]
            .try_extract_tensor::<f32>()
            .with_context(|| format!("Failed to extract output tensor '{}' as f32", output_name))?;

        Ok((shape.iter().copied().collect(), data.to_vec()))
    }
}

/// Backend running exported models through ONNX Runtime
#[derive(Debug, Clone)]
pub struct OnnxBackend {
    manager: ModelManager,
    options: OnnxOptions,
}

impl OnnxBackend {
    pub fn new(manager: ModelManager, options: OnnxOptions) -> Self {
        Self { manager, options }
    }

    pub fn manager(&self) -> &ModelManager {
        &self.manager
    }
}

impl OcrBackend for OnnxBackend {
    type Model = OnnxModel;

    fn load_model(&self, slot: ModelSlot, config: &ModelConfig) -> Result<OnnxModel> {
        if config.slot != slot {
            anyhow::bail!("{} is not a {} model", config.architecture, slot);
        }

        let path = self.manager.ensure_model(config)?;
        if !self.manager.verify_model(config)? {
            anyhow::bail!("Checksum mismatch for {:?}", path);
        }

        let session = OnnxSession::new(&path, self.options.intra_threads)?;
        Ok(OnnxModel {
            config: *config,
            session: Mutex::new(session),
        })
    }

    fn detect(&self, model: &OnnxModel, image: &RasterImage, size: TileSize) -> Result<HeatmapBuffer> {
        let tile = resize_exact(image.pixels(), size.width, size.height);
        let input = to_nchw_batch(std::slice::from_ref(&tile), &Normalization::DETECTION);

        let (shape, scores) = model.run(&input)?;
        let (width, height) = heatmap_dimensions(&shape)?;
        HeatmapBuffer::new(width, height, to_probabilities(model.config.scores, scores))
    }

    fn extract_boxes(&self, heatmap: &HeatmapBuffer) -> Vec<BoundingBox> {
        extract_bounding_boxes(heatmap, &self.options.box_extraction)
    }

    fn recognize(
        &self,
        model: &OnnxModel,
        image: &RasterImage,
        boxes: &[BoundingBox],
        size: TileSize,
    ) -> Result<Vec<WordCandidate>> {
        let vocab: Vec<char> = VOCAB.chars().collect();
        let mut candidates = Vec::with_capacity(boxes.len());

        for (batch_index, chunk) in boxes.chunks(self.options.recognition_batch_size.max(1)).enumerate() {
            let crops: Vec<_> = chunk
                .iter()
                .map(|bbox| resize_exact(&image.crop(bbox), size.width, size.height))
                .collect();
            let input = to_nchw_batch(&crops, &Normalization::RECOGNITION);

            let (shape, logits) = model
                .run(&input)
                .with_context(|| format!("recognition batch {}", batch_index))?;

            let [batch, steps, classes] = shape[..] else {
                anyhow::bail!("Expected [batch, steps, classes] logits, got {:?}", shape);
            };
            if batch as usize != chunk.len() {
                anyhow::bail!("Model returned {} sequences for {} crops", batch, chunk.len());
            }

            let (steps, classes) = (steps as usize, classes as usize);
            for (i, bbox) in chunk.iter().enumerate() {
                let sequence = &logits[i * steps * classes..(i + 1) * steps * classes];
                let (text, confidence) = ctc_greedy_decode(sequence, steps, classes, &vocab);
                candidates.push(WordCandidate {
                    bbox: *bbox,
                    tokens: if text.is_empty() { Vec::new() } else { vec![text] },
                    confidence,
                });
            }
        }

        debug!("Recognized {} words", candidates.len());
        Ok(candidates)
    }
}

/// Heatmap (width, height) from a detection output shape
fn heatmap_dimensions(shape: &[i64]) -> Result<(u32, u32)> {
    match *shape {
        [1, 1, h, w] | [1, h, w, 1] | [1, h, w] => Ok((w as u32, h as u32)),
        _ => anyhow::bail!("Unexpected detection output shape {:?}", shape),
    }
}

/// Map a raw detection output to per-cell probabilities
fn to_probabilities(kind: ScoreKind, mut scores: Vec<f32>) -> Vec<f32> {
    if kind == ScoreKind::Logits {
        scores.iter_mut().for_each(|v| *v = sigmoid(*v));
    }
    scores
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Greedy CTC decoding of one `[steps, classes]` logit sequence.
///
/// Index `vocab.len()` (and anything past it) is the blank. Returns the text
/// and the mean probability of the emitted characters.
pub fn ctc_greedy_decode(logits: &[f32], steps: usize, classes: usize, vocab: &[char]) -> (String, f32) {
    let mut text = String::new();
    let mut prob_sum = 0.0f32;
    let mut emitted = 0usize;
    let mut previous: Option<usize> = None;

    for step in logits.chunks(classes).take(steps) {
        let (best, best_logit) = step
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |acc, (i, v)| if v > acc.1 { (i, v) } else { acc });

        let is_blank = best >= vocab.len();
        if !is_blank && previous != Some(best) {
            let denom: f32 = step.iter().map(|v| (v - best_logit).exp()).sum();
            prob_sum += 1.0 / denom;
            emitted += 1;
            text.push(vocab[best]);
        }
        previous = Some(best);
    }

    let confidence = if emitted == 0 { 0.0 } else { prob_sum / emitted as f32 };
    (text, confidence)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logit_maps_always_get_sigmoid() {
        // Logits that happen to sit inside [0, 1] are still logits
        let scores = to_probabilities(ScoreKind::Logits, vec![0.0, 0.5, 1.0]);
        assert!((scores[0] - 0.5).abs() < 1e-6);
        assert!((scores[1] - 0.622_459).abs() < 1e-5);
        assert!((scores[2] - 0.731_058_6).abs() < 1e-5);

        let probabilities = to_probabilities(ScoreKind::Probabilities, vec![0.0, 0.5, 1.0]);
        assert_eq!(probabilities, vec![0.0, 0.5, 1.0]);
    }

    /// One-hot-ish logits picking `indices` in order
    fn logits_for(indices: &[usize], classes: usize) -> Vec<f32> {
        let mut logits = vec![0.0f32; indices.len() * classes];
        for (step, &idx) in indices.iter().enumerate() {
            logits[step * classes + idx] = 10.0;
        }
        logits
    }

    #[test]
    fn test_ctc_collapses_repeats_and_blanks() {
        let vocab: Vec<char> = "abc".chars().collect();
        let blank = 3;
        let logits = logits_for(&[0, 0, blank, 0, 1, 1, blank, 2], 4);
        let (text, confidence) = ctc_greedy_decode(&logits, 8, 4, &vocab);
        assert_eq!(text, "aabc");
        assert!(confidence > 0.99);
    }

    #[test]
    fn test_ctc_all_blank_is_empty() {
        let vocab: Vec<char> = "ab".chars().collect();
        let logits = logits_for(&[2, 2, 2], 3);
        let (text, confidence) = ctc_greedy_decode(&logits, 3, 3, &vocab);
        assert!(text.is_empty());
        assert_eq!(confidence, 0.0);
    }

    #[test]
    fn test_heatmap_dimensions_layouts() {
        assert_eq!(heatmap_dimensions(&[1, 1, 512, 256]).unwrap(), (256, 512));
        assert_eq!(heatmap_dimensions(&[1, 512, 256, 1]).unwrap(), (256, 512));
        assert_eq!(heatmap_dimensions(&[1, 512, 256]).unwrap(), (256, 512));
        assert!(heatmap_dimensions(&[2, 3, 512, 512]).is_err());
    }

    #[test]
    fn test_vocab_has_expected_size() {
        assert_eq!(VOCAB.chars().count(), 126);
    }

    #[test]
    fn test_load_model_rejects_wrong_slot() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = ModelManager::with_dir(dir.path().to_path_buf()).unwrap();
        let backend = OnnxBackend::new(manager, OnnxOptions::default());
        let config = ModelConfig::from(crate::vision::DetectionVariant::DbMobilenetV2);
        let err = backend.load_model(ModelSlot::Recognition, &config).unwrap_err();
        assert!(err.to_string().contains("is not a recognition model"));
    }
}

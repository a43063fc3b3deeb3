use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::{imageops, imageops::FilterType, ImageBuffer, Rgb, RgbImage};
use tract_onnx::prelude::*;

use crate::embed::detect::{nms, FaceBox, FaceDetector};
use crate::embed::pipeline::FacePipeline;
use crate::embed::FaceEmbedder;
use crate::frame::Frame;
use crate::identity::Embedding;

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>>;

/// Input edge length of the reference face-recognition models.
pub const DEFAULT_INPUT_SIZE: u32 = 112;

/// BlazeFace short-range input edge length.
const DETECTOR_INPUT_SIZE: u32 = 128;

/// BlazeFace short-range anchor count.
const NUM_ANCHORS: usize = 896;

/// Values per anchor in the regressor output (box plus six keypoints).
const REGRESSOR_STRIDE: usize = 16;

const NMS_IOU_THRESHOLD: f32 = 0.3;

/// Default detector confidence.
pub const DEFAULT_FACE_CONFIDENCE: f32 = 0.5;

/// Build the production detect-then-embed pipeline from two ONNX models.
pub fn tract_pipeline(
    detector_path: &Path,
    recognizer_path: &Path,
    confidence: f32,
) -> Result<FacePipeline> {
    let detector = TractFaceDetector::new(detector_path, confidence)?;
    let recognizer = TractRecognizer::new(recognizer_path)?;
    Ok(FacePipeline::new(Box::new(detector), Box::new(recognizer)))
}

fn load_plan(model_path: &Path, side: usize) -> Result<Plan> {
    tract_onnx::onnx()
        .model_for_path(model_path)
        .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
        .with_input_fact(
            0,
            InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
        )
        .context("failed to set input fact")?
        .into_optimized()
        .context("failed to optimize ONNX model")?
        .into_runnable()
        .context("failed to build runnable ONNX model")
}

/// Resize `frame` to `side x side` and lay it out as NCHW with `normalize` per channel value.
fn nchw_input(frame: &Frame, side: u32, normalize: impl Fn(u8) -> f32) -> Result<Tensor> {
    let image: ImageBuffer<Rgb<u8>, &[u8]> =
        ImageBuffer::from_raw(frame.width, frame.height, frame.pixels()).ok_or_else(|| {
            anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                frame.width as usize * frame.height as usize * 3,
                frame.width,
                frame.height,
                frame.pixels().len()
            )
        })?;
    let resized: RgbImage = imageops::resize(&image, side, side, FilterType::Triangle);
    let raw = resized.as_raw();
    let s = side as usize;
    let input = tract_ndarray::Array4::from_shape_fn((1, 3, s, s), |(_, c, y, x)| {
        normalize(raw[(y * s + x) * 3 + c])
    });
    Ok(input.into_tensor())
}

fn output_values(outputs: &TVec<TValue>, index: usize) -> Result<Vec<f32>> {
    let output = outputs
        .get(index)
        .ok_or_else(|| anyhow!("model produced {} outputs, expected output {}", outputs.len(), index))?;
    Ok(output
        .to_array_view::<f32>()
        .context("model output tensor was not f32")?
        .iter()
        .copied()
        .collect())
}

// ----------------------------------------------------------------------------
// Detector
// ----------------------------------------------------------------------------

/// BlazeFace (short-range) face detector on tract.
///
/// Input is the frame resized to 128x128 in `[0, 1]`. Output 0 holds per-anchor
/// box regressions, output 1 the per-anchor logits.
pub struct TractFaceDetector {
    model: Plan,
    confidence: f32,
    anchors: Vec<[f32; 2]>,
}

impl TractFaceDetector {
    pub fn new(model_path: &Path, confidence: f32) -> Result<Self> {
        let model = load_plan(model_path, DETECTOR_INPUT_SIZE as usize)?;
        Ok(Self {
            model,
            confidence,
            anchors: generate_anchors(),
        })
    }
}

impl FaceDetector for TractFaceDetector {
    fn name(&self) -> &'static str {
        "blazeface"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceBox>> {
        let input = nchw_input(frame, DETECTOR_INPUT_SIZE, |v| v as f32 / 255.0)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("face detection inference failed")?;
        let regressors = output_values(&outputs, 0)?;
        let logits = output_values(&outputs, 1)?;
        Ok(decode_detections(
            &regressors,
            &logits,
            &self.anchors,
            self.confidence,
            frame.width,
            frame.height,
        ))
    }

    fn warm_up(&mut self) -> Result<()> {
        let side = DETECTOR_INPUT_SIZE;
        let blank = Frame::new(vec![0u8; (side * side * 3) as usize], side, side, 0);
        self.detect(&blank).map(|_| ())
    }
}

/// Anchor centres for the 16x16 (2 per cell) and 8x8 (6 per cell) feature maps.
fn generate_anchors() -> Vec<[f32; 2]> {
    let mut anchors = Vec::with_capacity(NUM_ANCHORS);
    for (stride, per_cell) in [(8usize, 2usize), (16, 6)] {
        let grid = DETECTOR_INPUT_SIZE as usize / stride;
        for y in 0..grid {
            for x in 0..grid {
                let cx = (x as f32 + 0.5) / grid as f32;
                let cy = (y as f32 + 0.5) / grid as f32;
                anchors.extend(std::iter::repeat([cx, cy]).take(per_cell));
            }
        }
    }
    anchors
}

fn decode_detections(
    regressors: &[f32],
    logits: &[f32],
    anchors: &[[f32; 2]],
    confidence: f32,
    frame_width: u32,
    frame_height: u32,
) -> Vec<FaceBox> {
    let input = DETECTOR_INPUT_SIZE as f32;
    let (fw, fh) = (frame_width as f32, frame_height as f32);
    let mut boxes = Vec::new();
    for (i, (&logit, anchor)) in logits.iter().zip(anchors).enumerate() {
        let score = sigmoid(logit);
        if score < confidence {
            continue;
        }
        let offset = i * REGRESSOR_STRIDE;
        let Some(reg) = regressors.get(offset..offset + 4) else {
            break;
        };
        let cx = anchor[0] + reg[0] / input;
        let cy = anchor[1] + reg[1] / input;
        let w = reg[2] / input;
        let h = reg[3] / input;

        let x1 = ((cx - w / 2.0) * fw).max(0.0);
        let y1 = ((cy - h / 2.0) * fh).max(0.0);
        let x2 = ((cx + w / 2.0) * fw).min(fw);
        let y2 = ((cy + h / 2.0) * fh).min(fh);
        if x2 <= x1 || y2 <= y1 {
            continue;
        }
        boxes.push(FaceBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            score,
        });
    }
    nms(boxes, NMS_IOU_THRESHOLD)
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

// ----------------------------------------------------------------------------
// Recognizer
// ----------------------------------------------------------------------------

/// ONNX face-recognition model on tract, fed with face crops.
///
/// The crop is resized to the model input, normalised to `(x - 127.5) / 128`
/// in NCHW order, and the first output tensor is taken as the descriptor.
pub struct TractRecognizer {
    model: Plan,
    input_size: u32,
}

impl TractRecognizer {
    pub fn new(model_path: &Path) -> Result<Self> {
        Self::with_input_size(model_path, DEFAULT_INPUT_SIZE)
    }

    pub fn with_input_size(model_path: &Path, input_size: u32) -> Result<Self> {
        let model = load_plan(model_path, input_size as usize)?;
        Ok(Self { model, input_size })
    }
}

impl FaceEmbedder for TractRecognizer {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn embed(&mut self, face: &Frame) -> Result<Option<Embedding>> {
        let input = nchw_input(face, self.input_size, |v| (v as f32 - 127.5) / 128.0)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let values = output_values(&outputs, 0)?;

        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if !norm.is_finite() || norm < 1e-6 {
            return Ok(None);
        }
        Embedding::new(values).map(Some)
    }

    fn warm_up(&mut self) -> Result<()> {
        let side = self.input_size;
        let blank = Frame::new(vec![0u8; (side * side * 3) as usize], side, side, 0);
        self.embed(&blank).map(|_| ())
    }
}

//! Face localisation ahead of embedding.

use anyhow::Result;

use crate::frame::Frame;

/// Axis-aligned face box in frame pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector confidence in `[0, 1]`.
    pub score: f32,
}

impl FaceBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn iou(&self, other: &FaceBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);
        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        inter / (self.area() + other.area() - inter)
    }
}

/// Face detection backend.
///
/// An empty result means "no face", which is a normal per-frame outcome.
pub trait FaceDetector: Send {
    fn name(&self) -> &'static str;

    fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceBox>>;

    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Greedy non-maximum suppression, highest score first.
pub fn nms(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut keep: Vec<FaceBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if keep.iter().all(|kept| kept.iou(&candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// The face to identify: highest score, larger box on equal scores.
pub fn most_prominent(boxes: &[FaceBox]) -> Option<FaceBox> {
    boxes.iter().copied().max_by(|a, b| {
        a.score
            .total_cmp(&b.score)
            .then_with(|| a.area().total_cmp(&b.area()))
    })
}

/// Copy `face`, grown by `margin` of its size on every side, out of `frame`.
///
/// Returns `None` when the clamped crop is narrower or shorter than `min_side`.
pub fn crop_face(frame: &Frame, face: &FaceBox, margin: f32, min_side: u32) -> Option<Frame> {
    let frame_w = frame.width as f32;
    let frame_h = frame.height as f32;
    let mx = face.width.max(0.0) * margin;
    let my = face.height.max(0.0) * margin;

    let x0 = (face.x - mx).floor().clamp(0.0, frame_w) as u32;
    let y0 = (face.y - my).floor().clamp(0.0, frame_h) as u32;
    let x1 = (face.x + face.width + mx).ceil().clamp(0.0, frame_w) as u32;
    let y1 = (face.y + face.height + my).ceil().clamp(0.0, frame_h) as u32;
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    let (width, height) = (x1 - x0, y1 - y0);
    if width < min_side.max(1) || height < min_side.max(1) {
        return None;
    }

    let stride = frame.width as usize * 3;
    let src = frame.pixels();
    if src.len() < stride * frame.height as usize {
        return None;
    }
    let mut pixels = Vec::with_capacity(width as usize * height as usize * 3);
    for y in y0..y1 {
        let row = y as usize * stride;
        pixels.extend_from_slice(&src[row + x0 as usize * 3..row + x1 as usize * 3]);
    }
    Some(Frame::new(pixels, width, height, frame.sequence))
}

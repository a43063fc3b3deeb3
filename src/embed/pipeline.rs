use anyhow::Result;

use crate::embed::detect::{crop_face, most_prominent, FaceDetector};
use crate::embed::FaceEmbedder;
use crate::frame::Frame;
use crate::identity::Embedding;

/// Fraction of the face box added on every side before cropping.
pub const DEFAULT_FACE_MARGIN: f32 = 0.1;

/// Crops narrower or shorter than this many pixels are not embedded.
pub const DEFAULT_MIN_FACE_SIDE: u32 = 8;

/// Detect, crop the most prominent face, embed the crop.
///
/// Frames without a detected face produce no embedding, so an empty doorway
/// can neither enroll nor match.
pub struct FacePipeline {
    detector: Box<dyn FaceDetector>,
    recognizer: Box<dyn FaceEmbedder>,
    margin: f32,
    min_face_side: u32,
}

impl FacePipeline {
    /// `recognizer` receives face crops, never whole frames.
    pub fn new(detector: Box<dyn FaceDetector>, recognizer: Box<dyn FaceEmbedder>) -> Self {
        Self {
            detector,
            recognizer,
            margin: DEFAULT_FACE_MARGIN,
            min_face_side: DEFAULT_MIN_FACE_SIDE,
        }
    }

    pub fn with_margin(mut self, margin: f32) -> Self {
        self.margin = margin.max(0.0);
        self
    }

    pub fn with_min_face_side(mut self, side: u32) -> Self {
        self.min_face_side = side;
        self
    }
}

impl FaceEmbedder for FacePipeline {
    fn name(&self) -> &'static str {
        "pipeline"
    }

    fn embed(&mut self, frame: &Frame) -> Result<Option<Embedding>> {
        let faces = self.detector.detect(frame)?;
        let Some(face) = most_prominent(&faces) else {
            return Ok(None);
        };
        let Some(crop) = crop_face(frame, &face, self.margin, self.min_face_side) else {
            log::debug!(
                "face in frame {} too small to embed ({:.0}x{:.0})",
                frame.sequence,
                face.width,
                face.height
            );
            return Ok(None);
        };
        self.recognizer.embed(&crop)
    }

    fn warm_up(&mut self) -> Result<()> {
        self.detector.warm_up()?;
        self.recognizer.warm_up()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::detect::FaceBox;
    use std::sync::{Arc, Mutex};

    struct FixedDetector(Vec<FaceBox>);

    impl FaceDetector for FixedDetector {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn detect(&mut self, _frame: &Frame) -> Result<Vec<FaceBox>> {
            Ok(self.0.clone())
        }
    }

    /// Records crop sizes and returns a constant descriptor.
    struct CropRecorder(Arc<Mutex<Vec<(u32, u32)>>>);

    impl FaceEmbedder for CropRecorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn embed(&mut self, frame: &Frame) -> Result<Option<Embedding>> {
            self.0.lock().unwrap().push((frame.width, frame.height));
            Embedding::new(vec![1.0, 0.0]).map(Some)
        }
    }

    fn frame() -> Frame {
        Frame::new(vec![100u8; 64 * 48 * 3], 64, 48, 3)
    }

    fn pipeline(boxes: Vec<FaceBox>) -> (FacePipeline, Arc<Mutex<Vec<(u32, u32)>>>) {
        let crops = Arc::new(Mutex::new(Vec::new()));
        let pipeline = FacePipeline::new(
            Box::new(FixedDetector(boxes)),
            Box::new(CropRecorder(crops.clone())),
        )
        .with_margin(0.0);
        (pipeline, crops)
    }

    fn face(x: f32, y: f32, side: f32, score: f32) -> FaceBox {
        FaceBox {
            x,
            y,
            width: side,
            height: side,
            score,
        }
    }

    #[test]
    fn frame_without_face_is_never_embedded() {
        let (mut pipeline, crops) = pipeline(Vec::new());
        assert!(pipeline.embed(&frame()).unwrap().is_none());
        assert!(crops.lock().unwrap().is_empty());
    }

    #[test]
    fn only_the_most_confident_face_crop_is_embedded() {
        let (mut pipeline, crops) = pipeline(vec![
            face(0.0, 0.0, 10.0, 0.6),
            face(20.0, 10.0, 24.0, 0.95),
        ]);
        assert!(pipeline.embed(&frame()).unwrap().is_some());
        assert_eq!(*crops.lock().unwrap(), vec![(24, 24)]);
    }

    #[test]
    fn faces_below_minimum_size_are_skipped() {
        let (pipeline, crops) = pipeline(vec![face(10.0, 10.0, 4.0, 0.99)]);
        let mut pipeline = pipeline.with_min_face_side(8);
        assert!(pipeline.embed(&frame()).unwrap().is_none());
        assert!(crops.lock().unwrap().is_empty());
    }
}

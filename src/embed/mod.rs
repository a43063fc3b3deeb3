//! Face embedders.
//!
//! An embedder turns one decoded frame into at most one fixed-length face
//! descriptor. "No face" is `Ok(None)`, a normal per-frame outcome.
//!
//! Production embedding is detect-then-embed (`FacePipeline`): a detector
//! localises the face and only the crop reaches the recognition model.
//! `StubEmbedder` has no detector and exists for tests.

use anyhow::Result;

use crate::config::IntercomConfig;
use crate::frame::Frame;
use crate::identity::Embedding;

pub mod detect;
mod pipeline;
mod stub;
#[cfg(feature = "backend-tract")]
mod tract;

pub use detect::{FaceBox, FaceDetector};
pub use pipeline::{FacePipeline, DEFAULT_FACE_MARGIN, DEFAULT_MIN_FACE_SIDE};
pub use stub::StubEmbedder;
#[cfg(feature = "backend-tract")]
pub use tract::{tract_pipeline, TractFaceDetector, TractRecognizer};

/// Face embedding backend.
///
/// Implementations treat the frame as read-only and must not retain pixels
/// beyond the `embed` call.
pub trait FaceEmbedder: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Compute the descriptor of the most prominent face, if any.
    fn embed(&mut self, frame: &Frame) -> Result<Option<Embedding>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Build the configured detect-then-embed pipeline.
///
/// `Ok(None)` means face recognition is unavailable: no detector or model is
/// configured, or the crate was built without `backend-tract`. Callers must
/// then refuse recognition and enrollment rather than embed whole frames.
pub fn from_config(cfg: &IntercomConfig) -> Result<Option<Box<dyn FaceEmbedder>>> {
    let (Some(detector_path), Some(model_path)) = (&cfg.detector_path, &cfg.model_path) else {
        log::error!("face recognition disabled: embedder.detector_path and embedder.model_path are required");
        return Ok(None);
    };
    build_pipeline(detector_path, model_path, cfg.face_confidence)
}

#[cfg(feature = "backend-tract")]
fn build_pipeline(
    detector_path: &std::path::Path,
    model_path: &std::path::Path,
    confidence: f32,
) -> Result<Option<Box<dyn FaceEmbedder>>> {
    let mut pipeline = tract_pipeline(detector_path, model_path, confidence)?;
    pipeline.warm_up()?;
    log::info!(
        "face pipeline: detector {}, recognizer {}",
        detector_path.display(),
        model_path.display()
    );
    Ok(Some(Box::new(pipeline)))
}

#[cfg(not(feature = "backend-tract"))]
fn build_pipeline(
    detector_path: &std::path::Path,
    model_path: &std::path::Path,
    _confidence: f32,
) -> Result<Option<Box<dyn FaceEmbedder>>> {
    log::error!(
        "face recognition disabled: models {} and {} configured but built without backend-tract",
        detector_path.display(),
        model_path.display()
    );
    Ok(None)
}

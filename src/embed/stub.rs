use anyhow::{anyhow, Result};

use crate::embed::FaceEmbedder;
use crate::frame::Frame;
use crate::identity::Embedding;

const GRID: usize = 4;

/// Model-free embedder for development and tests.
///
/// The frame is split into a 4x4 grid and the mean RGB of every cell forms a
/// 48-dimensional vector, centred on the global mean. A uniform frame has no
/// structure and reports no face.
#[derive(Debug, Default)]
pub struct StubEmbedder;

impl StubEmbedder {
    pub fn new() -> Self {
        Self
    }
}

impl FaceEmbedder for StubEmbedder {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn embed(&mut self, frame: &Frame) -> Result<Option<Embedding>> {
        let width = frame.width as usize;
        let height = frame.height as usize;
        let pixels = frame.pixels();
        if width < GRID || height < GRID {
            return Ok(None);
        }
        if pixels.len() != width * height * 3 {
            return Err(anyhow!(
                "expected {} RGB bytes, received {}",
                width * height * 3,
                pixels.len()
            ));
        }

        let mut sums = [0f64; GRID * GRID * 3];
        let mut counts = [0u64; GRID * GRID];
        for y in 0..height {
            let cy = y * GRID / height;
            for x in 0..width {
                let cx = x * GRID / width;
                let cell = cy * GRID + cx;
                let idx = (y * width + x) * 3;
                for c in 0..3 {
                    sums[cell * 3 + c] += f64::from(pixels[idx + c]);
                }
                counts[cell] += 1;
            }
        }

        let mut values: Vec<f32> = sums
            .iter()
            .enumerate()
            .map(|(i, sum)| (sum / counts[i / 3].max(1) as f64) as f32)
            .collect();
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        for v in &mut values {
            *v -= mean;
        }
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm < 1e-3 {
            return Ok(None);
        }
        Embedding::new(values).map(Some)
    }
}

//! Decoded frames and the bounded hand-off queue between ingest and consumers.
//!
//! - `Frame`: immutable decoded image plus capture metadata. Shared as `Arc<Frame>`.
//! - `FrameBuffer`: bounded freshest-wins queue. The producer never blocks; consumers poll.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

/// Reference queue capacity between the ingestor and its consumers.
pub const DEFAULT_BUFFER_FRAMES: usize = 10;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One decoded image from the camera stream.
///
/// Pixels are packed RGB8. The JPEG slice the frame was decoded from is kept
/// alongside so the relay can forward it without re-encoding.
pub struct Frame {
    pixels: Vec<u8>,
    jpeg: Vec<u8>,

    pub width: u32,
    pub height: u32,

    /// Monotonically increasing per ingestor, starting at 1.
    pub sequence: u64,

    /// Wall-clock capture time.
    pub captured_at: SystemTime,

    capture_instant: Instant,
}

impl Frame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, sequence: u64) -> Self {
        Self {
            pixels,
            jpeg: Vec::new(),
            width,
            height,
            sequence,
            captured_at: SystemTime::now(),
            capture_instant: Instant::now(),
        }
    }

    /// Attach the encoded bytes this frame was decoded from.
    pub fn with_jpeg(mut self, jpeg: Vec<u8>) -> Self {
        self.jpeg = jpeg;
        self
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Source JPEG bytes; empty for frames that were not decoded from a stream.
    pub fn jpeg(&self) -> &[u8] {
        &self.jpeg
    }

    pub fn age(&self) -> Duration {
        self.capture_instant.elapsed()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Pixel content stays out of logs.
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("jpeg_bytes", &self.jpeg.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer
// ----------------------------------------------------------------------------

/// Bounded frame queue with a freshest-wins policy.
///
/// - `push` never blocks; when full it evicts the oldest frame first
/// - `get` never blocks; it returns `None` when empty
///
/// There is no consumer backpressure. The ingestor is authoritative and
/// consumers are expected to keep up or lose the oldest frames.
pub struct FrameBuffer {
    queue: Mutex<VecDeque<Arc<Frame>>>,
    capacity: usize,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Enqueue a frame. Returns true when an older frame was evicted to make room.
    pub fn push(&self, frame: Arc<Frame>) -> bool {
        let mut queue = self.lock();
        let mut evicted = false;
        while queue.len() >= self.capacity {
            queue.pop_front();
            evicted = true;
        }
        queue.push_back(frame);
        evicted
    }

    /// Non-blocking pop of the oldest queued frame.
    pub fn get(&self) -> Option<Arc<Frame>> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every queued frame.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Arc<Frame>>> {
        // The queue holds no invariant a panicking holder could break.
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_FRAMES)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

//! Camera stream ingestion.
//!
//! - `mjpeg`: marker-based JPEG extraction and decode
//! - `stream`: connection lifecycle, capture thread, current-frame slot
//!
//! The ingestion layer MUST NOT:
//! - Block on a slow consumer (the frame queue is freshest-wins)
//! - Terminate the process on any stream, decode or connect failure
//! - Log frame content

pub mod mjpeg;
pub mod stream;

pub use mjpeg::{decode_jpeg, encode_jpeg, MjpegParser};
pub use stream::{HttpConnector, StreamConfig, StreamConnector, StreamIngestor, StreamStatus};

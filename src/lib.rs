//! Doorbell intercom face identification.
//!
//! A camera serves MJPEG over HTTP. This crate keeps a live view of that
//! stream, decides from it whether the person at the door is enrolled, and
//! fires the door latch on a confident match.
//!
//! # Module Structure
//!
//! - `frame`: decoded frames and the bounded freshest-wins `FrameBuffer`
//! - `ingest`: MJPEG parsing and the `StreamIngestor` capture thread
//! - `watchdog`: periodic liveness check that restarts a stalled stream
//! - `identity`: embeddings, identities and the persisted `IdentityStore`
//! - `matching`: cosine similarity and the recognition decision
//! - `enroll`: the enrollment state machine
//! - `embed`: face detection and embedding (detect-then-embed pipeline, tract ONNX, stub)
//! - `intercom`: recognition and enrollment against the live stream
//! - `dispatch`: command table drained from a channel
//! - `relay`: HTTP re-stream of the current frame plus `/health`
//! - `transport`: MQTT command topics and the MQTT door latch
//! - `config`: layered JSON + environment configuration
//!
//! # Failure model
//!
//! Nothing here terminates the process. Stream, decode, embedding and
//! persistence failures degrade to "no result" or "disconnected" and are
//! logged through the `log` facade.

pub mod config;
pub mod dispatch;
pub mod embed;
pub mod enroll;
pub mod frame;
pub mod identity;
pub mod ingest;
pub mod intercom;
pub mod lock;
pub mod matching;
pub mod relay;
pub mod transport;
pub mod watchdog;

pub use config::IntercomConfig;
pub use dispatch::{Command, CommandDispatcher, CommandKind};
pub use embed::{FaceBox, FaceDetector, FaceEmbedder, FacePipeline, StubEmbedder};
pub use enroll::{EnrollmentOutcome, EnrollmentSession, OfferResult, SessionOutcome};
pub use frame::{Frame, FrameBuffer, DEFAULT_BUFFER_FRAMES};
pub use identity::{Embedding, Identity, IdentityStore};
pub use ingest::{StreamConfig, StreamConnector, StreamIngestor, StreamStatus};
pub use intercom::{HealthReport, Intercom, IntercomSettings, RecognitionOutcome};
pub use lock::{DoorLock, LogDoorLock};
pub use matching::{cosine_similarity, ActivationWindow, MatchDecision, MatchingEngine};
pub use relay::{FrameFeed, RelayConfig, RelayHandle, RelayServer};
pub use watchdog::{CheckOutcome, Supervised, WatchdogConfig, WatchdogHandle, WatchdogMonitor};

#[cfg(feature = "backend-tract")]
pub use embed::{tract_pipeline, TractFaceDetector, TractRecognizer};

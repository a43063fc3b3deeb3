//! The intercom core: recognition and enrollment against the live stream.
//!
//! `Intercom` ties the stream, the identity store, the embedder and the door
//! lock together and exposes the command surface collaborators drive
//! (`capture_face`, `learn_new_face`, `unlock`) plus the read-only queries
//! they poll (`health`, `frame_available`, `identity_count`).
//!
//! Both long-running commands run on the caller's thread and poll frames
//! cooperatively; neither holds the stream lock beyond a snapshot.

use anyhow::anyhow;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};

use crate::embed::FaceEmbedder;
use crate::enroll::{EnrollmentOutcome, EnrollmentSession, OfferResult, SessionOutcome};
use crate::frame::Frame;
use crate::identity::{Embedding, Identity, IdentityStore};
use crate::ingest::{StreamIngestor, StreamStatus};
use crate::lock::DoorLock;
use crate::matching::{ActivationWindow, MatchDecision, MatchingEngine};
use crate::relay::FrameFeed;

#[derive(Clone, Debug)]
pub struct IntercomSettings {
    pub recognition_threshold: f32,
    pub recognition_window: Duration,
    pub dedup_threshold: f32,
    pub enrollment_window: Duration,
    pub unlock_on_enroll: bool,
    pub store_path: PathBuf,
    /// Back-off when no frame is queued.
    pub poll_interval: Duration,
}

impl Default for IntercomSettings {
    fn default() -> Self {
        Self {
            recognition_threshold: crate::matching::DEFAULT_RECOGNITION_THRESHOLD,
            recognition_window: Duration::from_secs(30),
            dedup_threshold: crate::enroll::DEFAULT_DEDUP_THRESHOLD,
            enrollment_window: Duration::from_secs(5),
            unlock_on_enroll: true,
            store_path: PathBuf::from("faces_data.json"),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Result of one `capture_face` activation.
#[derive(Clone, Debug, PartialEq)]
pub enum RecognitionOutcome {
    Finished {
        /// Last decision reached; `None` when no frame held a face.
        decision: Option<MatchDecision>,
        frames_examined: usize,
        unlocked: bool,
    },
    StreamUnavailable,
    /// No face detector/recognizer is configured; the door stays shut.
    RecognitionDisabled,
}

/// Stream and store health as reported on `/health`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub connected: bool,
    pub frames: u64,
    pub last_frame_age_ms: Option<u64>,
    pub identities: usize,
}

impl HealthReport {
    pub fn from_status(status: &StreamStatus, identities: usize) -> Self {
        Self {
            status: if status.connected { "ok" } else { "degraded" },
            connected: status.connected,
            frames: status.frames_received,
            last_frame_age_ms: status
                .last_frame_age()
                .map(|age| u64::try_from(age.as_millis()).unwrap_or(u64::MAX)),
            identities,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.connected
    }
}

pub struct Intercom {
    stream: Arc<StreamIngestor>,
    store: Arc<RwLock<IdentityStore>>,
    engine: MatchingEngine,
    embedder: Option<Mutex<Box<dyn FaceEmbedder>>>,
    lock: Arc<dyn DoorLock>,
    settings: IntercomSettings,
}

impl Intercom {
    pub fn new(
        stream: Arc<StreamIngestor>,
        store: IdentityStore,
        embedder: Box<dyn FaceEmbedder>,
        lock: Arc<dyn DoorLock>,
        settings: IntercomSettings,
    ) -> Self {
        Self {
            stream,
            store: Arc::new(RwLock::new(store)),
            engine: MatchingEngine::new(settings.recognition_threshold),
            embedder: Some(Mutex::new(embedder)),
            lock,
            settings,
        }
    }

    /// An intercom that relays the stream and honours manual unlocks but
    /// refuses recognition and enrollment.
    pub fn without_recognition(
        stream: Arc<StreamIngestor>,
        store: IdentityStore,
        lock: Arc<dyn DoorLock>,
        settings: IntercomSettings,
    ) -> Self {
        Self {
            stream,
            store: Arc::new(RwLock::new(store)),
            engine: MatchingEngine::new(settings.recognition_threshold),
            embedder: None,
            lock,
            settings,
        }
    }

    pub fn recognition_enabled(&self) -> bool {
        self.embedder.is_some()
    }

    pub fn stream(&self) -> &Arc<StreamIngestor> {
        &self.stream
    }

    pub fn settings(&self) -> &IntercomSettings {
        &self.settings
    }

    /// Run one recognition activation.
    ///
    /// Polls frames for the recognition window and stops at the first
    /// recognized face, unlocking exactly once.
    pub fn capture_face(&self) -> RecognitionOutcome {
        if !self.recognition_enabled() {
            log::warn!("recognition requested but face recognition is not configured");
            return RecognitionOutcome::RecognitionDisabled;
        }
        if !self.ensure_stream() {
            return RecognitionOutcome::StreamUnavailable;
        }
        log::info!(
            "recognition started ({}s window)",
            self.settings.recognition_window.as_secs_f32()
        );

        self.stream.frames().clear();
        let mut window = ActivationWindow::open(Instant::now(), self.settings.recognition_window);
        let mut frames_examined = 0usize;
        let mut last_decision = None;

        while window.is_open(Instant::now()) {
            let Some(frame) = self.stream.next_frame() else {
                std::thread::sleep(self.settings.poll_interval);
                continue;
            };
            frames_examined += 1;
            let Some(query) = self.embed_frame(&frame) else {
                continue;
            };

            let decision = self.engine.match_embedding(&query, &self.read_store());
            match &decision {
                MatchDecision::Recognized { name, score } => {
                    log::info!("recognized {} ({:.1}%)", name, score * 100.0);
                    window.unlock_once(self.lock.as_ref());
                }
                MatchDecision::Unknown {
                    best_score: Some(score),
                } => log::info!("unknown face (best {:.1}%)", score * 100.0),
                MatchDecision::Unknown { best_score: None } => {
                    log::info!("unknown face (no identities enrolled)")
                }
            }
            last_decision = Some(decision);
        }

        if !window.unlocked() {
            log::info!(
                "recognition window closed without a match ({} frames)",
                frames_examined
            );
        }
        RecognitionOutcome::Finished {
            decision: last_decision,
            frames_examined,
            unlocked: window.unlocked(),
        }
    }

    /// Run one enrollment session and commit its result.
    pub fn learn_new_face(&self, name: Option<String>) -> EnrollmentOutcome {
        if !self.recognition_enabled() {
            log::warn!("enrollment requested but face recognition is not configured");
            return EnrollmentOutcome::RecognitionDisabled;
        }
        if !self.ensure_stream() {
            return EnrollmentOutcome::StreamUnavailable;
        }

        let mut session = EnrollmentSession::new(
            name,
            self.settings.enrollment_window,
            self.settings.dedup_threshold,
        );
        if self.read_store().contains(session.name()) {
            log::warn!("identity {} already enrolled; not overwriting", session.name());
            return EnrollmentOutcome::Inconclusive {
                name: session.name().to_string(),
            };
        }
        log::info!(
            "enrollment started for {} ({}s window)",
            session.name(),
            self.settings.enrollment_window.as_secs_f32()
        );

        self.stream.frames().clear();
        while !session.is_expired(Instant::now()) {
            let Some(frame) = self.stream.next_frame() else {
                std::thread::sleep(self.settings.poll_interval);
                continue;
            };
            let Some(embedding) = self.embed_frame(&frame) else {
                continue;
            };
            let result = {
                let store = self.read_store();
                session.offer(embedding, &store)
            };
            match result {
                OfferResult::Accepted => log::info!(
                    "captured embedding {} for {}",
                    session.accepted().len(),
                    session.name()
                ),
                OfferResult::KnownIdentity { name, similarity } => log::info!(
                    "face already enrolled as {} ({:.1}%)",
                    name,
                    similarity * 100.0
                ),
                OfferResult::DuplicateInSession { similarity } => log::debug!(
                    "near-duplicate capture skipped ({:.1}%)",
                    similarity * 100.0
                ),
            }
        }

        let name = session.name().to_string();
        match session.finish() {
            Ok(SessionOutcome::Empty { name }) => {
                log::info!("enrollment of {} collected nothing", name);
                EnrollmentOutcome::Inconclusive { name }
            }
            Ok(SessionOutcome::Collected(identity)) => self.commit(identity),
            Err(err) => {
                log::error!("enrollment of {} failed: {:#}", name, err);
                EnrollmentOutcome::Inconclusive { name }
            }
        }
    }

    pub fn unlock(&self) {
        if let Err(err) = self.lock.unlock() {
            log::error!("door unlock failed: {:#}", err);
        }
    }

    pub fn identity_count(&self) -> usize {
        self.read_store().len()
    }

    pub fn identity_names(&self) -> Vec<String> {
        self.read_store()
            .names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    pub fn frame_available(&self) -> bool {
        self.stream.frame_available()
    }

    pub fn stream_status(&self) -> StreamStatus {
        self.stream.status()
    }

    pub fn health(&self) -> HealthReport {
        HealthReport::from_status(&self.stream.status(), self.identity_count())
    }

    fn commit(&self, identity: Identity) -> EnrollmentOutcome {
        let name = identity.name().to_string();
        let embeddings = identity.embeddings().len();

        let snapshot = {
            let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
            if let Err(err) = store.insert(identity) {
                log::warn!("enrollment of {} not committed: {:#}", name, err);
                return EnrollmentOutcome::Inconclusive { name };
            }
            store.clone()
        };

        let persisted = match snapshot.save(&self.settings.store_path) {
            Ok(()) => true,
            Err(err) => {
                log::error!("failed to persist identities: {:#}", err);
                false
            }
        };
        log::info!("enrolled {} with {} embeddings", name, embeddings);

        if self.settings.unlock_on_enroll {
            self.unlock();
        }
        EnrollmentOutcome::Enrolled {
            name,
            embeddings,
            persisted,
        }
    }

    fn ensure_stream(&self) -> bool {
        if self.stream.is_capturing() {
            return true;
        }
        match self.stream.start() {
            Ok(()) => true,
            Err(err) => {
                log::error!("stream unavailable: {:#}", err);
                false
            }
        }
    }

    fn embed_frame(&self, frame: &Frame) -> Option<Embedding> {
        let embedder = self.embedder.as_ref()?;
        let result = embedder
            .lock()
            .map_err(|_| anyhow!("embedder lock poisoned"))
            .and_then(|mut embedder| embedder.embed(frame));
        match result {
            Ok(Some(embedding)) => Some(embedding),
            Ok(None) => {
                log::debug!("no face in frame {}", frame.sequence);
                None
            }
            Err(err) => {
                log::debug!("embedding failed for frame {}: {:#}", frame.sequence, err);
                None
            }
        }
    }

    fn read_store(&self) -> RwLockReadGuard<'_, IdentityStore> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FrameFeed for Intercom {
    fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.stream.current_frame()
    }

    fn health(&self) -> HealthReport {
        Intercom::health(self)
    }
}


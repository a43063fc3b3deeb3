mod common;

use anyhow::Result;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{fast_stream_config, CameraControl, FakeCamera, Scene};
use intercom_faceid::{
    DoorLock, EnrollmentOutcome, FaceBox, FaceDetector, FaceEmbedder, FacePipeline, Frame,
    IdentityStore, Intercom, IntercomSettings, MatchDecision, RecognitionOutcome,
    StreamIngestor, StubEmbedder,
};

#[derive(Default)]
struct CountingLock(AtomicUsize);

impl CountingLock {
    fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl DoorLock for CountingLock {
    fn unlock(&self) -> Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn settings(store_path: &Path) -> IntercomSettings {
    IntercomSettings {
        recognition_window: Duration::from_millis(300),
        enrollment_window: Duration::from_millis(300),
        store_path: store_path.to_path_buf(),
        poll_interval: Duration::from_millis(5),
        ..IntercomSettings::default()
    }
}

/// Reports the bounding box of every pixel darker than 60 as one face.
struct DarkRegionDetector;

impl FaceDetector for DarkRegionDetector {
    fn name(&self) -> &'static str {
        "dark-region"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<FaceBox>> {
        let width = frame.width as usize;
        let mut bounds: Option<(usize, usize, usize, usize)> = None;
        for (i, rgb) in frame.pixels().chunks_exact(3).enumerate() {
            if rgb[0] >= 60 {
                continue;
            }
            let (x, y) = (i % width, i / width);
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }
        Ok(bounds
            .map(|(x0, y0, x1, y1)| FaceBox {
                x: x0 as f32,
                y: y0 as f32,
                width: (x1 - x0 + 1) as f32,
                height: (y1 - y0 + 1) as f32,
                score: 0.9,
            })
            .into_iter()
            .collect())
    }
}

fn intercom_with(
    scene: Scene,
    store: IdentityStore,
    settings: IntercomSettings,
) -> (Intercom, CameraControl, Arc<CountingLock>) {
    intercom_with_embedder(scene, store, settings, Box::new(StubEmbedder::new()))
}

fn intercom_with_embedder(
    scene: Scene,
    store: IdentityStore,
    settings: IntercomSettings,
    embedder: Box<dyn FaceEmbedder>,
) -> (Intercom, CameraControl, Arc<CountingLock>) {
    let (camera, control) = FakeCamera::new(scene);
    let stream = Arc::new(StreamIngestor::with_connector(
        fast_stream_config(),
        Box::new(camera),
    ));
    let lock = Arc::new(CountingLock::default());
    let intercom = Intercom::new(stream, store, embedder, lock.clone(), settings);
    (intercom, control, lock)
}

#[test]
fn enroll_then_recognize_unlocks_once_per_activation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("faces_data.json");
    let (intercom, control, lock) = intercom_with(Scene::Alice, IdentityStore::new(), settings(&path));

    // The stream is started on demand.
    match intercom.learn_new_face(Some("alice".to_string())) {
        EnrollmentOutcome::Enrolled {
            name,
            embeddings,
            persisted,
        } => {
            assert_eq!(name, "alice");
            // Every later frame of the same scene is a near-duplicate.
            assert_eq!(embeddings, 1);
            assert!(persisted);
        }
        other => panic!("unexpected enrollment outcome {:?}", other),
    }
    assert_eq!(intercom.identity_count(), 1);
    assert_eq!(lock.count(), 1, "enrollment unlocks by default");

    match intercom.capture_face() {
        RecognitionOutcome::Finished {
            decision: Some(MatchDecision::Recognized { name, score }),
            unlocked,
            ..
        } => {
            assert_eq!(name, "alice");
            assert!(score > 0.99);
            assert!(unlocked);
        }
        other => panic!("unexpected recognition outcome {:?}", other),
    }
    assert_eq!(lock.count(), 2);

    control.show(Scene::Bob);
    match intercom.capture_face() {
        RecognitionOutcome::Finished {
            decision,
            frames_examined,
            unlocked,
        } => {
            assert!(frames_examined > 0);
            assert!(!unlocked);
            match decision {
                Some(MatchDecision::Unknown {
                    best_score: Some(score),
                }) => assert!(score < 0.5),
                other => panic!("unexpected decision {:?}", other),
            }
        }
        other => panic!("unexpected recognition outcome {:?}", other),
    }
    assert_eq!(lock.count(), 2);

    let reloaded = IdentityStore::load(&path).unwrap();
    assert_eq!(reloaded.names(), vec!["alice"]);
    assert_eq!(reloaded.get("alice").unwrap().embeddings().len(), 1);

    intercom.stream().stop();
}

#[test]
fn known_face_and_empty_scene_are_inconclusive() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("faces_data.json");
    let (intercom, control, lock) = intercom_with(Scene::Alice, IdentityStore::new(), settings(&path));

    assert!(matches!(
        intercom.learn_new_face(Some("alice".to_string())),
        EnrollmentOutcome::Enrolled { .. }
    ));

    // Same face under another name is rejected against the store.
    assert_eq!(
        intercom.learn_new_face(Some("alice-again".to_string())),
        EnrollmentOutcome::Inconclusive {
            name: "alice-again".to_string()
        }
    );

    // Name already taken.
    control.show(Scene::Bob);
    assert_eq!(
        intercom.learn_new_face(Some("alice".to_string())),
        EnrollmentOutcome::Inconclusive {
            name: "alice".to_string()
        }
    );

    control.show(Scene::Empty);
    assert!(matches!(
        intercom.learn_new_face(Some("carol".to_string())),
        EnrollmentOutcome::Inconclusive { .. }
    ));
    match intercom.capture_face() {
        RecognitionOutcome::Finished {
            decision, unlocked, ..
        } => {
            assert!(decision.is_none());
            assert!(!unlocked);
        }
        other => panic!("unexpected recognition outcome {:?}", other),
    }

    assert_eq!(intercom.identity_names(), vec!["alice".to_string()]);
    assert_eq!(lock.count(), 1);
    intercom.stream().stop();
}

#[test]
fn enrollment_without_unlock_and_failed_persist() {
    let dir = tempfile::tempdir().unwrap();
    // A directory where the file should be makes the save fail.
    let path = dir.path().join("occupied");
    std::fs::create_dir(&path).unwrap();
    let mut settings = settings(&path);
    settings.unlock_on_enroll = false;
    let (intercom, _control, lock) = intercom_with(Scene::Bob, IdentityStore::new(), settings);

    match intercom.learn_new_face(None) {
        EnrollmentOutcome::Enrolled {
            name, persisted, ..
        } => {
            assert!(!persisted);
            // Timestamp-derived default name.
            assert_eq!(name.len(), "2024-01-01_00-00-00".len());
        }
        other => panic!("unexpected enrollment outcome {:?}", other),
    }
    // In-memory store keeps the identity even though the save failed.
    assert_eq!(intercom.identity_count(), 1);
    assert_eq!(lock.count(), 0);
    intercom.stream().stop();
}

#[test]
fn unreachable_stream_reports_unavailable() {
    struct Refused;

    impl intercom_faceid::StreamConnector for Refused {
        fn connect(&self) -> Result<Box<dyn std::io::Read + Send>> {
            Err(anyhow::anyhow!("connection refused"))
        }

        fn describe(&self) -> String {
            "fake://refused".to_string()
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let stream = Arc::new(StreamIngestor::with_connector(
        fast_stream_config(),
        Box::new(Refused),
    ));
    let lock = Arc::new(CountingLock::default());
    let intercom = Intercom::new(
        stream,
        IdentityStore::new(),
        Box::new(StubEmbedder::new()),
        lock.clone(),
        settings(&dir.path().join("faces.json")),
    );

    assert_eq!(intercom.capture_face(), RecognitionOutcome::StreamUnavailable);
    assert_eq!(
        intercom.learn_new_face(Some("dave".to_string())),
        EnrollmentOutcome::StreamUnavailable
    );
    assert!(!intercom.health().is_healthy());
    assert_eq!(lock.count(), 0);
}

#[test]
fn faceless_scene_never_enrolls_or_unlocks_through_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("faces_data.json");
    let pipeline = FacePipeline::new(Box::new(DarkRegionDetector), Box::new(StubEmbedder::new()));
    let (intercom, control, lock) = intercom_with_embedder(
        Scene::Hallway,
        IdentityStore::new(),
        settings(&path),
        Box::new(pipeline),
    );

    // The hallway has structure but no face.
    assert_eq!(
        intercom.learn_new_face(Some("hallway".to_string())),
        EnrollmentOutcome::Inconclusive {
            name: "hallway".to_string()
        }
    );
    assert_eq!(intercom.identity_count(), 0);
    assert!(!path.exists());
    match intercom.capture_face() {
        RecognitionOutcome::Finished {
            decision,
            frames_examined,
            unlocked,
        } => {
            assert!(frames_examined > 0);
            assert!(decision.is_none());
            assert!(!unlocked);
        }
        other => panic!("unexpected recognition outcome {:?}", other),
    }
    assert_eq!(lock.count(), 0);

    control.show(Scene::Alice);
    assert!(matches!(
        intercom.learn_new_face(Some("alice".to_string())),
        EnrollmentOutcome::Enrolled { .. }
    ));
    match intercom.capture_face() {
        RecognitionOutcome::Finished {
            decision: Some(MatchDecision::Recognized { name, .. }),
            unlocked,
            ..
        } => {
            assert_eq!(name, "alice");
            assert!(unlocked);
        }
        other => panic!("unexpected recognition outcome {:?}", other),
    }
    assert_eq!(lock.count(), 2);
    intercom.stream().stop();
}

#[test]
fn intercom_without_recognition_refuses_both_commands() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("faces_data.json");
    let (camera, control) = FakeCamera::new(Scene::Alice);
    let stream = Arc::new(StreamIngestor::with_connector(
        fast_stream_config(),
        Box::new(camera),
    ));
    let lock = Arc::new(CountingLock::default());
    let intercom =
        Intercom::without_recognition(stream, IdentityStore::new(), lock.clone(), settings(&path));

    assert!(!intercom.recognition_enabled());
    assert_eq!(
        intercom.learn_new_face(Some("alice".to_string())),
        EnrollmentOutcome::RecognitionDisabled
    );
    assert_eq!(intercom.capture_face(), RecognitionOutcome::RecognitionDisabled);
    assert_eq!(intercom.identity_count(), 0);
    assert_eq!(lock.count(), 0);
    // Refused before the stream is touched.
    assert_eq!(control.connects(), 0);
    assert!(!path.exists());
}

//! In-memory camera used by the integration tests.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use std::io::{Cursor, ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use intercom_faceid::ingest::encode_jpeg;
use intercom_faceid::{StreamConfig, StreamConnector};

pub const SIDE: u32 = 32;

/// What the fake camera is currently looking at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scene {
    /// Uniform grey: no structure, no face.
    Empty,
    /// Dark left half, bright right half.
    Alice,
    /// Dark top half, bright bottom half.
    Bob,
    /// Left-to-right brightness ramp with nothing dark in view.
    Hallway,
}

pub fn scene_jpeg(scene: Scene) -> Vec<u8> {
    let side = SIDE as usize;
    let mut pixels = Vec::with_capacity(side * side * 3);
    for y in 0..side {
        for x in 0..side {
            let v = match scene {
                Scene::Empty => 128,
                Scene::Alice => {
                    if x < side / 2 {
                        30
                    } else {
                        220
                    }
                }
                Scene::Bob => {
                    if y < side / 2 {
                        30
                    } else {
                        220
                    }
                }
                Scene::Hallway => (100 + x * 100 / side) as u8,
            };
            pixels.extend_from_slice(&[v, v, v]);
        }
    }
    encode_jpeg(&pixels, SIDE, SIDE, 95).expect("encode fixture")
}

/// One-shot read failure the camera injects into the open connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// The next read returns `Ok(0)`.
    Eof,
    /// The next read fails with `ConnectionReset`.
    Reset,
}

/// Shared control surface for a `FakeCamera`.
#[derive(Clone)]
pub struct CameraControl {
    scene: Arc<Mutex<Scene>>,
    frozen: Arc<AtomicBool>,
    offline: Arc<AtomicBool>,
    fault: Arc<Mutex<Option<Fault>>>,
    connects: Arc<AtomicUsize>,
}

impl CameraControl {
    pub fn show(&self, scene: Scene) {
        *self.scene.lock().unwrap() = scene;
    }

    /// Stop sending frames while keeping the connection open.
    pub fn freeze(&self, frozen: bool) {
        self.frozen.store(frozen, Ordering::SeqCst);
    }

    /// While offline, connects are refused and open readers get reset.
    pub fn offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn inject(&self, fault: Fault) {
        *self.fault.lock().unwrap() = Some(fault);
    }

    /// Connection attempts so far, refused ones included.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

/// Connector serving one multipart frame of the current scene every few milliseconds.
pub struct FakeCamera {
    control: CameraControl,
    frame_interval: Duration,
}

impl FakeCamera {
    pub fn new(scene: Scene) -> (Self, CameraControl) {
        let control = CameraControl {
            scene: Arc::new(Mutex::new(scene)),
            frozen: Arc::new(AtomicBool::new(false)),
            offline: Arc::new(AtomicBool::new(false)),
            fault: Arc::new(Mutex::new(None)),
            connects: Arc::new(AtomicUsize::new(0)),
        };
        (
            Self {
                control: control.clone(),
                frame_interval: Duration::from_millis(10),
            },
            control,
        )
    }
}

impl StreamConnector for FakeCamera {
    fn connect(&self) -> Result<Box<dyn Read + Send>> {
        self.control.connects.fetch_add(1, Ordering::SeqCst);
        if self.control.offline.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        Ok(Box::new(CameraReader {
            control: self.control.clone(),
            frame_interval: self.frame_interval,
            pending: Cursor::new(Vec::new()),
        }))
    }

    fn describe(&self) -> String {
        "fake://doorbell".to_string()
    }
}

struct CameraReader {
    control: CameraControl,
    frame_interval: Duration,
    pending: Cursor<Vec<u8>>,
}

impl Read for CameraReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.control.offline.load(Ordering::SeqCst) {
            std::thread::sleep(self.frame_interval);
            return Err(std::io::Error::new(ErrorKind::ConnectionReset, "offline"));
        }
        match self.control.fault.lock().unwrap().take() {
            Some(Fault::Eof) => return Ok(0),
            Some(Fault::Reset) => {
                return Err(std::io::Error::new(ErrorKind::ConnectionReset, "reset"))
            }
            None => {}
        }
        let read = self.pending.read(buf)?;
        if read > 0 {
            return Ok(read);
        }
        std::thread::sleep(self.frame_interval);
        if self.control.frozen.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(ErrorKind::TimedOut, "no data"));
        }
        let scene = *self.control.scene.lock().unwrap();
        let mut part = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        part.extend_from_slice(&scene_jpeg(scene));
        part.extend_from_slice(b"\r\n");
        self.pending = Cursor::new(part);
        self.pending.read(buf)
    }
}

pub fn fast_stream_config() -> StreamConfig {
    StreamConfig {
        url: "fake://doorbell".to_string(),
        max_retry_attempts: 2,
        retry_delay: Duration::from_millis(10),
        restart_pause: Duration::from_millis(10),
        chunk_size: 512,
        buffer_capacity: 4,
        ..StreamConfig::default()
    }
}

pub fn wait_for(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

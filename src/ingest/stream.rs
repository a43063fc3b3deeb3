//! Resilient MJPEG-over-HTTP stream ingestor.
//!
//! `StreamIngestor` owns the camera connection and a single capture thread.
//! The capture thread:
//! - Reads fixed-size chunks and extracts marker-delimited JPEG frames
//! - Stores each decoded frame as the current-frame snapshot
//! - Enqueues each decoded frame into the shared `FrameBuffer`
//! - Reconnects after a short pause on any fatal read error
//!
//! Connection attempts use a fixed attempt count and a fixed delay between
//! attempts. There is no exponential backoff.

use anyhow::{anyhow, Context, Result};
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use url::Url;

use super::mjpeg::{decode_jpeg, MjpegParser, MAX_BUFFER_BYTES};
use crate::frame::{Frame, FrameBuffer, DEFAULT_BUFFER_FRAMES};

const FRAME_RATE_LOG_INTERVAL: Duration = Duration::from_secs(5);
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Configuration for a `StreamIngestor`.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// MJPEG endpoint. Only http(s) is accepted.
    pub url: String,
    /// Connection attempts per start or restart.
    pub max_retry_attempts: u32,
    /// Fixed delay between connection attempts.
    pub retry_delay: Duration,
    /// Pause between a fatal read error and the reconnect.
    pub restart_pause: Duration,
    pub connect_timeout: Duration,
    /// Per-read timeout. A timed-out read counts as "no data yet", not as an error.
    pub read_timeout: Duration,
    pub chunk_size: usize,
    pub buffer_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:81/stream".to_string(),
            max_retry_attempts: 3,
            retry_delay: Duration::from_secs(5),
            restart_pause: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(1),
            chunk_size: 1024,
            buffer_capacity: DEFAULT_BUFFER_FRAMES,
        }
    }
}

/// Opens the byte stream the ingestor reads from.
pub trait StreamConnector: Send + Sync {
    /// Establish a fresh connection. Each call must return a new reader.
    fn connect(&self) -> Result<Box<dyn Read + Send>>;

    /// Human-readable source description for logs.
    fn describe(&self) -> String;
}

/// HTTP MJPEG connector backed by `ureq`.
pub struct HttpConnector {
    url: String,
    agent: ureq::Agent,
}

impl HttpConnector {
    pub fn new(url: &str, connect_timeout: Duration, read_timeout: Duration) -> Result<Self> {
        let parsed = Url::parse(url).context("parse stream url")?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported stream scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .timeout_read(read_timeout)
            .build();
        Ok(Self {
            url: url.to_string(),
            agent,
        })
    }
}

impl StreamConnector for HttpConnector {
    fn connect(&self) -> Result<Box<dyn Read + Send>> {
        let response = self
            .agent
            .get(&self.url)
            .call()
            .with_context(|| format!("connect to mjpeg stream {}", self.url))?;
        if response.status() != 200 {
            return Err(anyhow!(
                "mjpeg stream {} returned status {}",
                self.url,
                response.status()
            ));
        }
        let content_type = response.header("Content-Type").unwrap_or("");
        if !content_type.to_lowercase().contains("multipart") {
            log::debug!(
                "stream content type '{}' is not multipart; scanning for jpeg markers anyway",
                content_type
            );
        }
        Ok(Box::new(response.into_reader()))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Point-in-time view of the stream state.
#[derive(Clone, Debug, Default)]
pub struct StreamStatus {
    /// The ingestor has been started and not stopped.
    pub capturing: bool,
    /// A connection is currently open.
    pub connected: bool,
    pub frames_received: u64,
    pub connected_at: Option<Instant>,
    pub last_frame_at: Option<Instant>,
    pub last_error: Option<String>,
}

impl StreamStatus {
    pub fn last_frame_age(&self) -> Option<Duration> {
        self.last_frame_at.map(|at| at.elapsed())
    }

    /// Instant the watchdog measures staleness from.
    pub fn liveness_reference(&self) -> Option<Instant> {
        self.last_frame_at.or(self.connected_at)
    }
}

#[derive(Default)]
struct StreamState {
    capturing: bool,
    connected: bool,
    connected_at: Option<Instant>,
    last_frame_at: Option<Instant>,
    frame_count: u64,
    current: Option<Arc<Frame>>,
    last_error: Option<String>,
}

struct CaptureHandle {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

struct Shared {
    config: StreamConfig,
    connector: Box<dyn StreamConnector>,
    state: Mutex<StreamState>,
    frames: Arc<FrameBuffer>,
}

/// Owns the camera connection, the capture thread and the current-frame slot.
pub struct StreamIngestor {
    shared: Arc<Shared>,
    lifecycle: Mutex<Option<CaptureHandle>>,
}

impl StreamIngestor {
    /// Ingestor reading from `config.url` over HTTP.
    pub fn new(config: StreamConfig) -> Result<Self> {
        let connector =
            HttpConnector::new(&config.url, config.connect_timeout, config.read_timeout)?;
        Ok(Self::with_connector(config, Box::new(connector)))
    }

    /// Ingestor reading from an arbitrary connector.
    pub fn with_connector(config: StreamConfig, connector: Box<dyn StreamConnector>) -> Self {
        let frames = Arc::new(FrameBuffer::new(config.buffer_capacity));
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                state: Mutex::new(StreamState::default()),
                frames,
            }),
            lifecycle: Mutex::new(None),
        }
    }

    /// Connect and start the capture thread.
    ///
    /// On failure after all attempts the ingestor reports disconnected and keeps
    /// serving the last cached frame. Starting a running ingestor is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lock_lifecycle();
        self.start_locked(&mut lifecycle)
    }

    /// Stop the capture thread and release the connection. Idempotent.
    pub fn stop(&self) {
        let mut lifecycle = self.lock_lifecycle();
        self.stop_locked(&mut lifecycle);
    }

    /// `stop()` followed by `start()`, holding the lifecycle lock throughout.
    ///
    /// Unlike `start()`, a failed connect does not end capture: the error is
    /// returned, but the capture thread keeps reconnecting until `stop()`.
    pub fn restart(&self) -> Result<()> {
        let mut lifecycle = self.lock_lifecycle();
        self.restart_locked(&mut lifecycle)
    }

    /// Restart unless another start/stop/restart is in progress.
    ///
    /// Returns `Ok(false)` when the restart was skipped.
    pub fn try_restart(&self) -> Result<bool> {
        let mut lifecycle = match self.lifecycle.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Ok(false),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        self.restart_locked(&mut lifecycle)?;
        Ok(true)
    }

    pub fn status(&self) -> StreamStatus {
        let state = self.shared.lock_state();
        StreamStatus {
            capturing: state.capturing,
            connected: state.connected,
            frames_received: state.frame_count,
            connected_at: state.connected_at,
            last_frame_at: state.last_frame_at,
            last_error: state.last_error.clone(),
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.shared.lock_state().capturing
    }

    /// Snapshot of the most recently decoded frame.
    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        self.shared.lock_state().current.clone()
    }

    /// Non-blocking pop from the ordered frame queue.
    pub fn next_frame(&self) -> Option<Arc<Frame>> {
        self.shared.frames.get()
    }

    /// True when the ordered queue holds at least one frame.
    pub fn frame_available(&self) -> bool {
        !self.shared.frames.is_empty()
    }

    pub fn frames(&self) -> &Arc<FrameBuffer> {
        &self.shared.frames
    }

    pub fn source(&self) -> String {
        self.shared.connector.describe()
    }

    fn start_locked(&self, lifecycle: &mut Option<CaptureHandle>) -> Result<()> {
        if lifecycle.is_some() {
            log::info!("mjpeg stream already running");
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let reader = match self.shared.connect_with_retries(&stop) {
            Ok(reader) => reader,
            Err(err) => {
                self.shared.mark_stopped(Some(format!("{:#}", err)));
                return Err(err);
            }
        };
        self.spawn_capture(lifecycle, stop, Ok(reader))
    }

    fn restart_locked(&self, lifecycle: &mut Option<CaptureHandle>) -> Result<()> {
        log::info!("restarting mjpeg stream {}", self.shared.connector.describe());
        // Still capturing across the restart; only the connection drops.
        self.join_capture(lifecycle);
        self.shared.lock_state().connected = false;

        let stop = Arc::new(AtomicBool::new(false));
        match self.shared.connect_with_retries(&stop) {
            Ok(reader) => self.spawn_capture(lifecycle, stop, Ok(reader)),
            Err(err) => {
                let reason = format!("{:#}", err);
                {
                    let mut state = self.shared.lock_state();
                    state.capturing = true;
                    state.connected = false;
                    state.last_error = Some(reason.clone());
                }
                self.spawn_capture(lifecycle, stop, Err(reason))?;
                Err(err.context("restart connect failed; reconnecting in background"))
            }
        }
    }

    /// Start the capture thread. With `Err(reason)` the thread begins in its
    /// reconnect loop instead of reading.
    fn spawn_capture(
        &self,
        lifecycle: &mut Option<CaptureHandle>,
        stop: Arc<AtomicBool>,
        initial: std::result::Result<Box<dyn Read + Send>, String>,
    ) -> Result<()> {
        let shared = self.shared.clone();
        let stop_thread = stop.clone();
        let join = match std::thread::Builder::new()
            .name("mjpeg-capture".to_string())
            .spawn(move || shared.capture_loop(initial, &stop_thread))
        {
            Ok(join) => join,
            Err(err) => {
                self.shared.mark_stopped(Some(err.to_string()));
                return Err(anyhow::Error::new(err).context("spawn mjpeg capture thread"));
            }
        };
        *lifecycle = Some(CaptureHandle { stop, join });
        Ok(())
    }

    fn stop_locked(&self, lifecycle: &mut Option<CaptureHandle>) {
        self.join_capture(lifecycle);
        self.shared.mark_stopped(None);
    }

    fn join_capture(&self, lifecycle: &mut Option<CaptureHandle>) {
        if let Some(handle) = lifecycle.take() {
            handle.stop.store(true, Ordering::SeqCst);
            if handle.join.join().is_err() {
                log::warn!("mjpeg capture thread panicked");
            }
            log::info!("mjpeg stream capture stopped");
        }
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Option<CaptureHandle>> {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for StreamIngestor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect_with_retries(&self, stop: &AtomicBool) -> Result<Box<dyn Read + Send>> {
        let attempts = self.config.max_retry_attempts.max(1);
        let source = self.connector.describe();
        for attempt in 1..=attempts {
            if stop.load(Ordering::SeqCst) {
                return Err(anyhow!("stream stopped while connecting"));
            }
            match self.connector.connect() {
                Ok(reader) => {
                    let mut state = self.lock_state();
                    state.capturing = true;
                    state.connected = true;
                    state.connected_at = Some(Instant::now());
                    state.last_error = None;
                    log::info!("mjpeg stream connected: {}", source);
                    return Ok(reader);
                }
                Err(err) => {
                    log::error!(
                        "failed to connect to mjpeg stream (attempt {}/{}): {:#}",
                        attempt,
                        attempts,
                        err
                    );
                    self.lock_state().last_error = Some(format!("{:#}", err));
                }
            }
            if attempt < attempts {
                log::info!("retrying in {:?}", self.config.retry_delay);
                sleep_unless_stopped(stop, self.config.retry_delay);
            }
        }
        Err(anyhow!(
            "failed to connect to mjpeg stream {} after {} attempts",
            source,
            attempts
        ))
    }

    fn capture_loop(
        &self,
        initial: std::result::Result<Box<dyn Read + Send>, String>,
        stop: &AtomicBool,
    ) {
        let mut reader = match initial {
            Ok(reader) => reader,
            Err(reason) => match self.reconnect(stop, reason) {
                Some(reader) => reader,
                None => return,
            },
        };
        let mut parser = MjpegParser::with_limit(MAX_BUFFER_BYTES);
        let mut chunk = vec![0u8; self.config.chunk_size.max(1)];
        let mut window_start = Instant::now();
        let mut window_frames = 0u64;

        while !stop.load(Ordering::SeqCst) {
            let fatal = match reader.read(&mut chunk) {
                Ok(0) => Some(anyhow!("no data received from stream")),
                Ok(read) => {
                    for jpeg in parser.push(&chunk[..read]) {
                        if self.deliver(jpeg) {
                            window_frames += 1;
                        }
                    }
                    None
                }
                Err(err) if is_no_data(err.kind()) => {
                    if err.kind() == ErrorKind::WouldBlock {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    None
                }
                Err(err) => Some(anyhow::Error::new(err).context("read mjpeg chunk")),
            };

            if let Some(err) = fatal {
                log::error!("error in stream capture: {:#}", err);
                drop(reader);
                parser.reset();
                match self.reconnect(stop, format!("{:#}", err)) {
                    Some(fresh) => reader = fresh,
                    None => break,
                }
            }

            if window_start.elapsed() >= FRAME_RATE_LOG_INTERVAL {
                let fps = window_frames as f64 / window_start.elapsed().as_secs_f64();
                log::info!("current frame rate: {:.2} fps", fps);
                window_start = Instant::now();
                window_frames = 0;
            }
        }
    }

    /// Reconnect after a fatal error. Keeps trying until stopped.
    fn reconnect(&self, stop: &AtomicBool, reason: String) -> Option<Box<dyn Read + Send>> {
        {
            let mut state = self.lock_state();
            state.connected = false;
            state.last_error = Some(reason);
        }
        sleep_unless_stopped(stop, self.config.restart_pause);
        loop {
            if stop.load(Ordering::SeqCst) {
                return None;
            }
            log::info!("attempting to restart the mjpeg stream");
            match self.connect_with_retries(stop) {
                Ok(reader) => return Some(reader),
                Err(err) => {
                    log::error!("stream restart failed: {:#}", err);
                    sleep_unless_stopped(stop, self.config.retry_delay);
                }
            }
        }
    }

    /// Decode and publish one JPEG slice. Returns false when the slice was dropped.
    fn deliver(&self, jpeg: Vec<u8>) -> bool {
        let (pixels, width, height) = match decode_jpeg(&jpeg) {
            Ok(decoded) => decoded,
            Err(err) => {
                log::warn!(
                    "dropping undecodable frame ({} bytes): {:#}",
                    jpeg.len(),
                    err
                );
                return false;
            }
        };

        let frame = {
            let mut state = self.lock_state();
            state.frame_count += 1;
            let frame =
                Arc::new(Frame::new(pixels, width, height, state.frame_count).with_jpeg(jpeg));
            state.current = Some(frame.clone());
            state.last_frame_at = Some(Instant::now());
            if state.frame_count % 100 == 0 {
                log::debug!("received {} frames", state.frame_count);
            }
            frame
        };

        // Enqueue outside the state lock.
        if self.frames.push(frame) {
            log::trace!("frame buffer full; evicted oldest frame");
        }
        true
    }

    fn mark_stopped(&self, error: Option<String>) {
        let mut state = self.lock_state();
        state.capturing = false;
        state.connected = false;
        if error.is_some() {
            state.last_error = error;
        }
    }
}

fn is_no_data(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}

fn sleep_unless_stopped(stop: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

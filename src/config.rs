use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::StreamConfig;
use crate::intercom::IntercomSettings;
use crate::relay::RelayConfig;
use crate::watchdog::WatchdogConfig;

const DEFAULT_STREAM_URL: &str = "http://127.0.0.1:81/stream";
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 5000;
const DEFAULT_RESTART_PAUSE_MS: u64 = 1000;
const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;
const DEFAULT_BUFFER_CAPACITY: usize = 10;
const DEFAULT_WATCHDOG_TICK_SECS: u64 = 10;
const DEFAULT_STALE_AFTER_SECS: u64 = 30;
const DEFAULT_RECOGNITION_THRESHOLD: f32 = 0.5;
const DEFAULT_RECOGNITION_WINDOW_SECS: u64 = 30;
const DEFAULT_DEDUP_THRESHOLD: f32 = 0.7;
const DEFAULT_ENROLLMENT_WINDOW_SECS: u64 = 5;
const DEFAULT_STORE_PATH: &str = "faces_data.json";
const DEFAULT_RELAY_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_FACE_CONFIDENCE: f32 = 0.5;

#[derive(Debug, Deserialize, Default)]
struct IntercomConfigFile {
    stream: Option<StreamConfigFile>,
    watchdog: Option<WatchdogConfigFile>,
    recognition: Option<RecognitionConfigFile>,
    enrollment: Option<EnrollmentConfigFile>,
    store: Option<StoreConfigFile>,
    relay: Option<RelayConfigFile>,
    embedder: Option<EmbedderConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    url: Option<String>,
    max_retry_attempts: Option<u32>,
    retry_delay_ms: Option<u64>,
    restart_pause_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    buffer_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct WatchdogConfigFile {
    tick_secs: Option<u64>,
    stale_after_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RecognitionConfigFile {
    threshold: Option<f32>,
    window_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct EnrollmentConfigFile {
    dedup_threshold: Option<f32>,
    window_secs: Option<u64>,
    unlock_on_enroll: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct StoreConfigFile {
    path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct RelayConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct EmbedderConfigFile {
    detector_path: Option<PathBuf>,
    model_path: Option<PathBuf>,
    face_confidence: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct IntercomConfig {
    pub stream: StreamConfig,
    pub watchdog: WatchdogConfig,
    pub recognition_threshold: f32,
    pub recognition_window: Duration,
    pub dedup_threshold: f32,
    pub enrollment_window: Duration,
    pub unlock_on_enroll: bool,
    pub store_path: PathBuf,
    pub relay_addr: String,
    /// Face detector model. Recognition is disabled unless both models are set.
    pub detector_path: Option<PathBuf>,
    /// Face recognition (embedding) model.
    pub model_path: Option<PathBuf>,
    pub face_confidence: f32,
}

impl IntercomConfig {
    /// Defaults, then the JSON file named by `INTERCOM_CONFIG`, then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("INTERCOM_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Built-in defaults only.
    pub fn defaults() -> Self {
        Self::from_file(IntercomConfigFile::default())
    }

    fn from_file(file: IntercomConfigFile) -> Self {
        let stream_file = file.stream.unwrap_or_default();
        let stream = StreamConfig {
            url: stream_file
                .url
                .unwrap_or_else(|| DEFAULT_STREAM_URL.to_string()),
            max_retry_attempts: stream_file
                .max_retry_attempts
                .unwrap_or(DEFAULT_RETRY_ATTEMPTS),
            retry_delay: Duration::from_millis(
                stream_file.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
            ),
            restart_pause: Duration::from_millis(
                stream_file
                    .restart_pause_ms
                    .unwrap_or(DEFAULT_RESTART_PAUSE_MS),
            ),
            read_timeout: Duration::from_millis(
                stream_file
                    .read_timeout_ms
                    .unwrap_or(DEFAULT_READ_TIMEOUT_MS),
            ),
            buffer_capacity: stream_file
                .buffer_capacity
                .unwrap_or(DEFAULT_BUFFER_CAPACITY),
            ..StreamConfig::default()
        };

        let watchdog_file = file.watchdog.unwrap_or_default();
        let watchdog = WatchdogConfig {
            tick: Duration::from_secs(
                watchdog_file
                    .tick_secs
                    .unwrap_or(DEFAULT_WATCHDOG_TICK_SECS),
            ),
            stale_after: Duration::from_secs(
                watchdog_file
                    .stale_after_secs
                    .unwrap_or(DEFAULT_STALE_AFTER_SECS),
            ),
        };

        let recognition = file.recognition.unwrap_or_default();
        let enrollment = file.enrollment.unwrap_or_default();
        let embedder = file.embedder.unwrap_or_default();
        Self {
            stream,
            watchdog,
            recognition_threshold: recognition
                .threshold
                .unwrap_or(DEFAULT_RECOGNITION_THRESHOLD),
            recognition_window: Duration::from_secs(
                recognition
                    .window_secs
                    .unwrap_or(DEFAULT_RECOGNITION_WINDOW_SECS),
            ),
            dedup_threshold: enrollment
                .dedup_threshold
                .unwrap_or(DEFAULT_DEDUP_THRESHOLD),
            enrollment_window: Duration::from_secs(
                enrollment
                    .window_secs
                    .unwrap_or(DEFAULT_ENROLLMENT_WINDOW_SECS),
            ),
            unlock_on_enroll: enrollment.unlock_on_enroll.unwrap_or(true),
            store_path: file
                .store
                .and_then(|store| store.path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_PATH)),
            relay_addr: file
                .relay
                .and_then(|relay| relay.addr)
                .unwrap_or_else(|| DEFAULT_RELAY_ADDR.to_string()),
            detector_path: embedder.detector_path,
            model_path: embedder.model_path,
            face_confidence: embedder
                .face_confidence
                .unwrap_or(DEFAULT_FACE_CONFIDENCE),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = env_nonempty("INTERCOM_STREAM_URL") {
            self.stream.url = url;
        }
        if let Some(retries) = env_nonempty("INTERCOM_STREAM_RETRIES") {
            self.stream.max_retry_attempts = retries
                .parse()
                .map_err(|_| anyhow!("INTERCOM_STREAM_RETRIES must be a positive integer"))?;
        }
        if let Some(threshold) = env_nonempty("INTERCOM_RECOGNITION_THRESHOLD") {
            self.recognition_threshold = threshold
                .parse()
                .map_err(|_| anyhow!("INTERCOM_RECOGNITION_THRESHOLD must be a number"))?;
        }
        if let Some(threshold) = env_nonempty("INTERCOM_DEDUP_THRESHOLD") {
            self.dedup_threshold = threshold
                .parse()
                .map_err(|_| anyhow!("INTERCOM_DEDUP_THRESHOLD must be a number"))?;
        }
        if let Some(flag) = env_nonempty("INTERCOM_UNLOCK_ON_ENROLL") {
            self.unlock_on_enroll = parse_bool(&flag)
                .ok_or_else(|| anyhow!("INTERCOM_UNLOCK_ON_ENROLL must be true or false"))?;
        }
        if let Some(path) = env_nonempty("INTERCOM_FACES_PATH") {
            self.store_path = PathBuf::from(path);
        }
        if let Some(addr) = env_nonempty("INTERCOM_RELAY_ADDR") {
            self.relay_addr = addr;
        }
        if let Some(path) = env_nonempty("INTERCOM_DETECTOR_PATH") {
            self.detector_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_nonempty("INTERCOM_MODEL_PATH") {
            self.model_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.stream.url)
            .map_err(|e| anyhow!("invalid stream url {}: {}", self.stream.url, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!(
                "stream url must use http or https: {}",
                self.stream.url
            ));
        }
        if self.stream.max_retry_attempts == 0 {
            return Err(anyhow!("stream.max_retry_attempts must be at least 1"));
        }
        if self.stream.buffer_capacity == 0 {
            return Err(anyhow!("stream.buffer_capacity must be greater than zero"));
        }
        for (name, value) in [
            ("stream.retry_delay_ms", self.stream.retry_delay),
            ("stream.restart_pause_ms", self.stream.restart_pause),
            ("stream.read_timeout_ms", self.stream.read_timeout),
            ("watchdog.tick_secs", self.watchdog.tick),
            ("watchdog.stale_after_secs", self.watchdog.stale_after),
            ("recognition.window_secs", self.recognition_window),
            ("enrollment.window_secs", self.enrollment_window),
        ] {
            if value.is_zero() {
                return Err(anyhow!("{} must be greater than zero", name));
            }
        }
        for (name, value) in [
            ("recognition.threshold", self.recognition_threshold),
            ("enrollment.dedup_threshold", self.dedup_threshold),
        ] {
            if !(-1.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within [-1, 1], got {}", name, value));
            }
        }
        if !(self.face_confidence > 0.0 && self.face_confidence < 1.0) {
            return Err(anyhow!(
                "embedder.face_confidence must be within (0, 1), got {}",
                self.face_confidence
            ));
        }
        if self.detector_path.is_some() != self.model_path.is_some() {
            return Err(anyhow!(
                "embedder.detector_path and embedder.model_path must be set together"
            ));
        }
        if self.store_path.as_os_str().is_empty() {
            return Err(anyhow!("store.path must not be empty"));
        }
        Ok(())
    }

    pub fn intercom_settings(&self) -> IntercomSettings {
        IntercomSettings {
            recognition_threshold: self.recognition_threshold,
            recognition_window: self.recognition_window,
            dedup_threshold: self.dedup_threshold,
            enrollment_window: self.enrollment_window,
            unlock_on_enroll: self.unlock_on_enroll,
            store_path: self.store_path.clone(),
            ..IntercomSettings::default()
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            addr: self.relay_addr.clone(),
            ..RelayConfig::default()
        }
    }
}

fn read_config_file(path: &Path) -> Result<IntercomConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

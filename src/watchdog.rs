//! Stream liveness watchdog.
//!
//! Every tick the monitor moves from `Idle` to `Checking`, inspects the
//! supervised stream and returns to `Idle`. A stream that claims to be
//! capturing but has produced no frame for longer than `stale_after` is
//! restarted. A restart already in progress is never doubled up.

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, select, tick, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::ingest::{StreamIngestor, StreamStatus};

/// Something the watchdog can observe and restart.
pub trait Supervised: Send + Sync {
    fn status(&self) -> StreamStatus;

    /// Restart unless a start/stop/restart is already running.
    /// Returns `Ok(false)` when skipped.
    fn try_restart(&self) -> Result<bool>;
}

impl Supervised for StreamIngestor {
    fn status(&self) -> StreamStatus {
        StreamIngestor::status(self)
    }

    fn try_restart(&self) -> Result<bool> {
        StreamIngestor::try_restart(self)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct WatchdogConfig {
    pub tick: Duration,
    pub stale_after: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(10),
            stale_after: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchdogState {
    Idle,
    Checking,
}

/// What a single check decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckOutcome {
    NotCapturing,
    Fresh,
    Restarted,
    /// Stale, but another transition held the lifecycle lock.
    RestartSkipped,
    RestartFailed,
}

pub struct WatchdogMonitor {
    target: Arc<dyn Supervised>,
    config: WatchdogConfig,
    state: WatchdogState,
    restarts: u64,
    failed_restarts: u64,
}

impl WatchdogMonitor {
    pub fn new(target: Arc<dyn Supervised>, config: WatchdogConfig) -> Self {
        Self {
            target,
            config,
            state: WatchdogState::Idle,
            restarts: 0,
            failed_restarts: 0,
        }
    }

    pub fn state(&self) -> WatchdogState {
        self.state
    }

    /// Restarts that reconnected.
    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    /// Restarts whose connect failed. The stream keeps reconnecting on its own.
    pub fn failed_restarts(&self) -> u64 {
        self.failed_restarts
    }

    /// True when the stream is capturing and its last frame is older than `stale_after`.
    pub fn is_stale(status: &StreamStatus, now: Instant, stale_after: Duration) -> bool {
        if !status.capturing {
            return false;
        }
        match status.liveness_reference() {
            Some(reference) => now.saturating_duration_since(reference) > stale_after,
            None => false,
        }
    }

    /// Run one check as of `now`.
    pub fn check(&mut self, now: Instant) -> CheckOutcome {
        self.state = WatchdogState::Checking;
        let outcome = self.check_inner(now);
        self.state = WatchdogState::Idle;
        outcome
    }

    fn check_inner(&mut self, now: Instant) -> CheckOutcome {
        let status = self.target.status();
        if !status.capturing {
            return CheckOutcome::NotCapturing;
        }
        if !Self::is_stale(&status, now, self.config.stale_after) {
            return CheckOutcome::Fresh;
        }

        log::warn!(
            "no frames received for {:?}; restarting stream",
            self.config.stale_after
        );
        match self.target.try_restart() {
            Ok(true) => {
                self.restarts += 1;
                CheckOutcome::Restarted
            }
            Ok(false) => {
                log::info!("stream transition already in progress; skipping restart");
                CheckOutcome::RestartSkipped
            }
            Err(err) => {
                self.failed_restarts += 1;
                log::error!("watchdog restart failed: {:#}", err);
                CheckOutcome::RestartFailed
            }
        }
    }

    /// Run the monitor on its own thread until the handle is stopped or dropped.
    pub fn spawn(mut self) -> Result<WatchdogHandle> {
        let (shutdown, shutdown_rx) = bounded::<()>(1);
        let ticker = tick(self.config.tick);
        let join = std::thread::Builder::new()
            .name("stream-watchdog".to_string())
            .spawn(move || loop {
                select! {
                    recv(ticker) -> instant => {
                        let now = instant.unwrap_or_else(|_| Instant::now());
                        self.check(now);
                    }
                    recv(shutdown_rx) -> _ => break,
                }
            })
            .map_err(|e| anyhow!("spawn watchdog thread: {}", e))?;
        Ok(WatchdogHandle {
            shutdown: Some(shutdown),
            join: Some(join),
        })
    }
}

pub struct WatchdogHandle {
    shutdown: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl WatchdogHandle {
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        // Dropping the sender wakes the select.
        self.shutdown.take();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::warn!("watchdog thread panicked");
            }
        }
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

//! Door latch seam.

use anyhow::Result;

/// The unlock side effect. Implementations must be cheap to call and must not panic.
pub trait DoorLock: Send + Sync {
    fn unlock(&self) -> Result<()>;
}

/// Logs the unlock and does nothing else. Used when no latch transport is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogDoorLock;

impl DoorLock for LogDoorLock {
    fn unlock(&self) -> Result<()> {
        log::info!("door unlock requested (no latch transport configured)");
        Ok(())
    }
}

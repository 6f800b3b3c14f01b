// At most one active job per device id

use crate::{WipeError, WipeResult};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct DeviceLockTable {
    active: Mutex<HashSet<String>>,
    released: Notify,
}

impl DeviceLockTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn active(&self) -> MutexGuard<'_, HashSet<String>> {
        // The set stays consistent even if a holder panicked
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self, device_id: &str) -> bool {
        self.active().contains(device_id)
    }

    pub fn try_acquire(self: &Arc<Self>, device_id: &str) -> WipeResult<DeviceLease> {
        if !self.active().insert(device_id.to_string()) {
            return Err(WipeError::DeviceBusy(device_id.to_string()));
        }
        tracing::debug!(device = device_id, "Device lease acquired");
        Ok(DeviceLease {
            table: Arc::clone(self),
            device_id: device_id.to_string(),
        })
    }

    /// Wait until the device is free, then take it
    pub async fn acquire(self: &Arc<Self>, device_id: &str) -> DeviceLease {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed
            notified.as_mut().enable();

            if let Ok(lease) = self.try_acquire(device_id) {
                return lease;
            }
            tracing::debug!(device = device_id, "Device busy, waiting for release");
            notified.await;
        }
    }

    fn release(&self, device_id: &str) {
        self.active().remove(device_id);
        tracing::debug!(device = device_id, "Device lease released");
        self.released.notify_waiters();
    }
}

/// Exclusive claim on a device; released on drop
#[derive(Debug)]
pub struct DeviceLease {
    table: Arc<DeviceLockTable>,
    device_id: String,
}

impl DeviceLease {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.table.release(&self.device_id);
    }
}

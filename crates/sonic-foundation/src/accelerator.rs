//! Device memory budget.
//!
//! Tracks what the resident bundle and the running job hold on the single
//! accelerator. Job reservations go through [`DeviceReservation`] so they are
//! returned on every exit path.
//!
//! [`DeviceReservation`]: sonic_kernel::model::DeviceReservation

use parking_lot::Mutex;
use sonic_kernel::error::InferenceError;
use sonic_kernel::model::{Accelerator, DeviceId};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Usage {
    /// Bundle weights, fixed after load.
    resident: u64,
    /// Transient job allocations.
    used: u64,
    peak: u64,
}

/// Byte-accounted [`Accelerator`] with a fixed capacity.
#[derive(Debug)]
pub struct MemoryBudget {
    device: DeviceId,
    capacity: u64,
    usage: Mutex<Usage>,
    reclaims: AtomicU64,
}

impl MemoryBudget {
    pub fn new(device: DeviceId, capacity_bytes: u64) -> Self {
        Self {
            device,
            capacity: capacity_bytes,
            usage: Mutex::new(Usage::default()),
            reclaims: AtomicU64::new(0),
        }
    }

    /// Pin bytes for resident weights. Fails when they do not fit.
    pub fn pin_resident(&self, bytes: u64) -> Result<(), InferenceError> {
        let mut usage = self.usage.lock();
        let available = self.available(&usage);
        if bytes > available {
            return Err(InferenceError::OutOfMemory {
                requested: bytes,
                available,
            });
        }
        usage.resident += bytes;
        Ok(())
    }

    pub fn resident_bytes(&self) -> u64 {
        self.usage.lock().resident
    }

    pub fn peak_bytes(&self) -> u64 {
        self.usage.lock().peak
    }

    /// How many times [`Accelerator::reclaim`] has run.
    pub fn reclaim_count(&self) -> u64 {
        self.reclaims.load(Ordering::Relaxed)
    }

    fn available(&self, usage: &Usage) -> u64 {
        self.capacity
            .saturating_sub(usage.resident)
            .saturating_sub(usage.used)
    }
}

impl Accelerator for MemoryBudget {
    fn device(&self) -> DeviceId {
        self.device
    }

    fn capacity_bytes(&self) -> u64 {
        self.capacity.saturating_sub(self.usage.lock().resident)
    }

    fn in_use_bytes(&self) -> u64 {
        self.usage.lock().used
    }

    fn try_reserve(&self, bytes: u64) -> Result<(), InferenceError> {
        let mut usage = self.usage.lock();
        let available = self.available(&usage);
        if bytes > available {
            return Err(InferenceError::OutOfMemory {
                requested: bytes,
                available,
            });
        }
        usage.used += bytes;
        usage.peak = usage.peak.max(usage.used);
        debug!(device = %self.device, bytes, in_use = usage.used, "Device memory reserved");
        Ok(())
    }

    fn release(&self, bytes: u64) {
        let mut usage = self.usage.lock();
        usage.used = usage.used.saturating_sub(bytes);
    }

    fn reclaim(&self) {
        let mut usage = self.usage.lock();
        if usage.used > 0 {
            warn!(
                device = %self.device,
                leaked = usage.used,
                "Reclaiming device memory still held after a failed run"
            );
        }
        usage.used = 0;
        self.reclaims.fetch_add(1, Ordering::Relaxed);
    }
}

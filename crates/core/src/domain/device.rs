// Device Pool - exclusive accelerator slots handed to one job at a time

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::job::JobId;

/// Identifier of the CPU pseudo-device used when no accelerator is configured
pub const CPU_DEVICE: &str = "cpu";

/// Device identifier (GPU index as reported by the driver, or `cpu`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn cpu() -> Self {
        Self(CPU_DEVICE.to_string())
    }

    pub fn is_cpu(&self) -> bool {
        self.0 == CPU_DEVICE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Allocation state of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "job_id", rename_all = "snake_case")]
pub enum DeviceState {
    Free,
    Held(JobId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSlot {
    pub device_id: DeviceId,
    pub state: DeviceState,
}

/// Point-in-time copy of the pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub devices: Vec<DeviceSlot>,
    pub max_concurrent: usize,
}

impl PoolSnapshot {
    pub fn held_count(&self) -> usize {
        self.devices
            .iter()
            .filter(|slot| matches!(slot.state, DeviceState::Held(_)))
            .count()
    }

    pub fn free_devices(&self) -> Vec<DeviceId> {
        self.devices
            .iter()
            .filter(|slot| slot.state == DeviceState::Free)
            .map(|slot| slot.device_id.clone())
            .collect()
    }

    /// Device currently held by `job_id`, if any
    pub fn holder_of(&self, job_id: &str) -> Option<&DeviceId> {
        self.devices.iter().find_map(|slot| match &slot.state {
            DeviceState::Held(holder) if holder == job_id => Some(&slot.device_id),
            _ => None,
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Device pool busy: {held} device(s) still held")]
    Busy { held: usize },

    #[error("Device pool state poisoned")]
    Poisoned,
}

struct PoolState {
    slots: Vec<DeviceSlot>,
    max_concurrent: usize,
}

impl PoolState {
    /// Deduplicate, fall back to the CPU slot, clamp concurrency to `1..=devices`
    fn build(devices: Vec<DeviceId>, max_concurrent: usize) -> Self {
        let mut unique: Vec<DeviceId> = Vec::with_capacity(devices.len());
        for device in devices {
            if !unique.contains(&device) {
                unique.push(device);
            }
        }
        if unique.is_empty() {
            warn!("No devices configured, falling back to CPU pseudo-device");
            unique.push(DeviceId::cpu());
        }

        let device_count = unique.len();
        if max_concurrent > device_count {
            warn!(
                max_concurrent,
                device_count, "max_concurrent exceeds device count, clamping"
            );
        }
        let max_concurrent = max_concurrent.clamp(1, device_count);

        Self {
            slots: unique
                .into_iter()
                .map(|device_id| DeviceSlot {
                    device_id,
                    state: DeviceState::Free,
                })
                .collect(),
            max_concurrent,
        }
    }

    fn held_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.state, DeviceState::Held(_)))
            .count()
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            devices: self.slots.clone(),
            max_concurrent: self.max_concurrent,
        }
    }
}

/// Thread-safe device pool.
///
/// The set of devices is fixed between reconfigurations, and a reconfiguration
/// is refused while any device is held so a running job never loses track of
/// its device.
pub struct DevicePool {
    state: Mutex<PoolState>,
}

impl DevicePool {
    pub fn new(devices: Vec<DeviceId>, max_concurrent: usize) -> Self {
        let state = PoolState::build(devices, max_concurrent);
        info!(
            devices = ?state.slots.iter().map(|s| s.device_id.as_str()).collect::<Vec<_>>(),
            max_concurrent = state.max_concurrent,
            "Device pool initialized"
        );
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, PoolState>, PoolError> {
        self.state.lock().map_err(|_| PoolError::Poisoned)
    }

    /// Hand out the first free device, or `None` when the pool is exhausted
    /// or the concurrency limit is reached. Never blocks beyond the lock.
    pub fn acquire(&self, job_id: &JobId) -> Result<Option<DeviceId>, PoolError> {
        let mut state = self.lock()?;

        if state.held_count() >= state.max_concurrent {
            return Ok(None);
        }
        if state
            .slots
            .iter()
            .any(|slot| slot.state == DeviceState::Held(job_id.clone()))
        {
            warn!(job_id = %job_id, "Job already holds a device, refusing second acquire");
            return Ok(None);
        }

        let slot = match state.slots.iter_mut().find(|s| s.state == DeviceState::Free) {
            Some(slot) => slot,
            None => return Ok(None),
        };
        slot.state = DeviceState::Held(job_id.clone());
        debug!(job_id = %job_id, device = %slot.device_id, "Device acquired");
        Ok(Some(slot.device_id.clone()))
    }

    /// Return a device to the pool. Releasing a free or unknown device is a
    /// logged no-op.
    pub fn release(&self, device: &DeviceId) -> Result<(), PoolError> {
        let mut state = self.lock()?;

        match state.slots.iter_mut().find(|s| &s.device_id == device) {
            Some(slot) => match std::mem::replace(&mut slot.state, DeviceState::Free) {
                DeviceState::Held(job_id) => {
                    debug!(job_id = %job_id, device = %device, "Device released");
                }
                DeviceState::Free => {
                    warn!(device = %device, "Release of a device that was not held");
                }
            },
            None => {
                warn!(device = %device, "Release of a device unknown to the pool");
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Result<PoolSnapshot, PoolError> {
        Ok(self.lock()?.snapshot())
    }

    pub fn held_count(&self) -> Result<usize, PoolError> {
        Ok(self.lock()?.held_count())
    }

    /// Effective concurrency limit after clamping
    pub fn capacity(&self) -> Result<usize, PoolError> {
        Ok(self.lock()?.max_concurrent)
    }

    pub fn device_count(&self) -> Result<usize, PoolError> {
        Ok(self.lock()?.slots.len())
    }

    /// Replace the whole device set. Rejected with `Busy` while any device is
    /// held; on rejection nothing changes.
    pub fn reconfigure(
        &self,
        devices: Vec<DeviceId>,
        max_concurrent: usize,
    ) -> Result<PoolSnapshot, PoolError> {
        let mut state = self.lock()?;

        let held = state.held_count();
        if held > 0 {
            return Err(PoolError::Busy { held });
        }

        *state = PoolState::build(devices, max_concurrent);
        info!(
            devices = state.slots.len(),
            max_concurrent = state.max_concurrent,
            "Device pool reconfigured"
        );
        Ok(state.snapshot())
    }

    /// Force every device back to free, recovering from a poisoned lock.
    /// Only the loop supervisor calls this, after it has finalized every job
    /// it was tracking.
    pub fn reset(&self) -> usize {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.state.clear_poison();

        let mut freed = 0;
        for slot in state.slots.iter_mut() {
            if let DeviceState::Held(job_id) = &slot.state {
                warn!(job_id = %job_id, device = %slot.device_id, "Force-releasing device");
                slot.state = DeviceState::Free;
                freed += 1;
            }
        }
        freed
    }
}

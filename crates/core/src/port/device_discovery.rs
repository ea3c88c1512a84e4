// Device Discovery Port

use crate::domain::DeviceId;
use async_trait::async_trait;

/// Enumerates the accelerators present on this host.
///
/// Discovery failures are not errors: an empty list makes the pool fall
/// back to the CPU pseudo-device.
#[async_trait]
pub trait DeviceDiscovery: Send + Sync {
    async fn discover(&self) -> Vec<DeviceId>;
}

/// Fixed device list, used when devices are configured explicitly
pub struct StaticDevices {
    devices: Vec<DeviceId>,
}

impl StaticDevices {
    pub fn new(devices: Vec<DeviceId>) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl DeviceDiscovery for StaticDevices {
    async fn discover(&self) -> Vec<DeviceId> {
        self.devices.clone()
    }
}

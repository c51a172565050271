use crate::device::DeviceType;
use serde::Serialize;

/// Device types a backend can attach to a live VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HotplugSupport {
    pub block: bool,
    pub vfio: bool,
    pub network: bool,
}

/// Optional operations a hypervisor backend implements.
///
/// Orchestrators query this before calling an operation that would otherwise
/// fail with [`Error::Unsupported`](crate::Error::Unsupported).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackendCapabilities {
    /// Block devices can be attached before boot, which also enables
    /// passing a block-backed container rootfs straight to the VM.
    pub block_devices: bool,
    pub hotplug: HotplugSupport,
    /// The VM can be suspended and resumed in place.
    pub pause_resume: bool,
    /// Maximum vCPUs the backend supports. None means no known limit.
    pub max_vcpus: Option<u32>,
    /// Maximum guest memory in MiB. None means no known limit.
    pub max_memory_mb: Option<u32>,
}

impl BackendCapabilities {
    pub fn supports_hotplug(&self, device_type: DeviceType) -> bool {
        match device_type {
            DeviceType::Block => self.hotplug.block,
            DeviceType::Vfio => self.hotplug.vfio,
            DeviceType::Network => self.hotplug.network,
            DeviceType::Image
            | DeviceType::Filesystem
            | DeviceType::Serial
            | DeviceType::Console
            | DeviceType::SerialPort => false,
        }
    }
}

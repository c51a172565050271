//! Device taxonomy and the per-pod device table.
//!
//! A [`Device`] is a payload tagged by its [`DeviceType`]. The core never
//! looks inside a payload; it only decides when a device of a given type may
//! be attached. Backends translate payloads into hypervisor arguments.

use crate::capabilities::BackendCapabilities;
use crate::config::HypervisorConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    Image,
    Filesystem,
    Network,
    Serial,
    Block,
    Console,
    SerialPort,
    Vfio,
}

impl DeviceType {
    pub const ALL: [DeviceType; 8] = [
        DeviceType::Image,
        DeviceType::Filesystem,
        DeviceType::Network,
        DeviceType::Serial,
        DeviceType::Block,
        DeviceType::Console,
        DeviceType::SerialPort,
        DeviceType::Vfio,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Image => "image",
            DeviceType::Filesystem => "filesystem",
            DeviceType::Network => "network",
            DeviceType::Serial => "serial",
            DeviceType::Block => "block",
            DeviceType::Console => "console",
            DeviceType::SerialPort => "serial-port",
            DeviceType::Vfio => "vfio",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A read-only guest image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDevice {
    pub id: String,
    pub path: PathBuf,
}

/// A host directory shared into the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsDevice {
    pub id: String,
    pub host_path: PathBuf,
    pub mount_tag: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

/// A tap-backed network interface, prepared by the network collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetDevice {
    pub id: String,
    pub tap_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

/// A virtio-serial controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialDevice {
    pub id: String,
}

/// A block device or disk image file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDevice {
    pub id: String,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
}

/// A guest console exposed on a host socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleDevice {
    pub id: String,
    pub socket_path: PathBuf,
}

/// A named virtio-serial port exposed on a host socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialPortDevice {
    pub id: String,
    pub name: String,
    pub socket_path: PathBuf,
}

/// A host PCI device passed through with VFIO, addressed by its BDF
/// (`0000:01:00.0`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfioDevice {
    pub id: String,
    pub host_bdf: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Device {
    Image(ImageDevice),
    Filesystem(FsDevice),
    Network(NetDevice),
    Serial(SerialDevice),
    Block(BlockDevice),
    Console(ConsoleDevice),
    SerialPort(SerialPortDevice),
    Vfio(VfioDevice),
}

impl Device {
    pub fn device_type(&self) -> DeviceType {
        match self {
            Device::Image(_) => DeviceType::Image,
            Device::Filesystem(_) => DeviceType::Filesystem,
            Device::Network(_) => DeviceType::Network,
            Device::Serial(_) => DeviceType::Serial,
            Device::Block(_) => DeviceType::Block,
            Device::Console(_) => DeviceType::Console,
            Device::SerialPort(_) => DeviceType::SerialPort,
            Device::Vfio(_) => DeviceType::Vfio,
        }
    }

    /// Identifier unique within one pod.
    pub fn id(&self) -> &str {
        match self {
            Device::Image(d) => &d.id,
            Device::Filesystem(d) => &d.id,
            Device::Network(d) => &d.id,
            Device::Serial(d) => &d.id,
            Device::Block(d) => &d.id,
            Device::Console(d) => &d.id,
            Device::SerialPort(d) => &d.id,
            Device::Vfio(d) => &d.id,
        }
    }
}

/// Devices currently attached to one pod, in attach order.
#[derive(Debug, Clone, Default)]
pub struct DeviceTable {
    devices: Vec<Device>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, device: Device) -> Result<()> {
        if device.id().is_empty() {
            return Err(Error::InvalidArgument("device id must not be empty".to_string()));
        }
        if self.contains(device.id()) {
            return Err(Error::InvalidArgument(format!(
                "device {} is already attached",
                device.id()
            )));
        }
        self.devices.push(device);
        Ok(())
    }

    pub fn detach(&mut self, id: &str) -> Result<Device> {
        let pos = self
            .devices
            .iter()
            .position(|d| d.id() == id)
            .ok_or_else(|| Error::NotFound(format!("device {id}")))?;
        Ok(self.devices.remove(pos))
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Device> {
        self.devices.iter()
    }

    pub fn of_type(&self, device_type: DeviceType) -> impl Iterator<Item = &Device> {
        self.devices
            .iter()
            .filter(move |d| d.device_type() == device_type)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }
}

/// Where a container's root filesystem lives on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRootfs {
    pub container_id: String,
    /// Mounted rootfs directory.
    pub mount_source: PathBuf,
    /// Block device backing the mount, when the storage driver has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_device: Option<PathBuf>,
}

/// Picks the device that exposes a container rootfs to the VM.
///
/// A block-backed rootfs is handed over as the block device itself unless the
/// config or the backend rules that out; everything else is shared as a
/// filesystem.
pub fn rootfs_device(
    config: &HypervisorConfig,
    capabilities: &BackendCapabilities,
    rootfs: &ContainerRootfs,
) -> Device {
    match &rootfs.block_device {
        Some(path) if !config.disable_block_device_use && capabilities.block_devices => {
            Device::Block(BlockDevice {
                id: format!("drive-{}", rootfs.container_id),
                path: path.clone(),
                read_only: false,
            })
        }
        _ => Device::Filesystem(FsDevice {
            id: format!("fs-{}", rootfs.container_id),
            host_path: rootfs.mount_source.clone(),
            mount_tag: rootfs.container_id.clone(),
            read_only: false,
        }),
    }
}

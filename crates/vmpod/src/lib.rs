//! Hypervisor abstraction for running pods inside lightweight VMs.
//!
//! An orchestrator picks a backend by [`HypervisorType`], gets a fresh
//! instance from [`new_hypervisor`] for each pod, and drives it through the
//! [`Hypervisor`] trait:
//!
//! ```rust,no_run
//! use vmpod::{HypervisorConfig, HypervisorType, PodConfig, new_hypervisor};
//! use vmpod::{start_channel, stop_channel};
//!
//! # async fn example() -> vmpod::Result<()> {
//! let hypervisor = new_hypervisor(HypervisorType::Qemu)?;
//! hypervisor
//!     .init(HypervisorConfig::new("/usr/share/vmpod/vmlinuz", "/usr/share/vmpod/rootfs.img"))
//!     .await?;
//! hypervisor.create_pod(&PodConfig::new("pod-1")).await?;
//!
//! let (started, booted) = start_channel();
//! let (stop_tx, stop) = stop_channel();
//! hypervisor.start_pod(started, stop).await?;
//! booted.await.expect("backend dropped the start signal")?;
//!
//! // ... hotplug devices, pause, resume ...
//!
//! hypervisor.stop_pod().await?;
//! # drop(stop_tx);
//! # Ok(())
//! # }
//! ```
//!
//! Optional operations (pause/resume, hotplug per device type) are advertised
//! by [`Hypervisor::capabilities`]; calling one a backend lacks fails with
//! [`Error::Unsupported`].

mod backend;

pub use backend::{HypervisorType, MockHypervisor, available_backends, new_hypervisor};
#[cfg(target_os = "linux")]
pub use backend::QemuHypervisor;

pub use vmpod_core::{
    BackendCapabilities, Error, HotplugSupport, Hypervisor, PodState, Result, StartSignal,
    StopSignal, start_channel, stop_channel,
};

// Configuration
pub use vmpod_core::{DEFAULT_MEMORY_MIB, DEFAULT_VCPUS, HypervisorConfig, Param, ParamSet};
pub use vmpod_core::{PodConfig, ResourceConfig};

// Devices
pub use vmpod_core::{
    BlockDevice, ConsoleDevice, ContainerRootfs, Device, DeviceType, FsDevice, ImageDevice,
    NetDevice, SerialDevice, SerialPortDevice, VfioDevice, rootfs_device,
};

// Host probes
pub use vmpod_core::host;
pub use vmpod_core::HostInfo;

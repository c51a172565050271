pub mod backend;
pub mod capabilities;
pub mod config;
pub mod device;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod params;
pub mod pod;

pub use backend::{Hypervisor, StartSignal, StopSignal, start_channel, stop_channel};
pub use capabilities::{BackendCapabilities, HotplugSupport};
pub use config::{DEFAULT_MEMORY_MIB, DEFAULT_VCPUS, HypervisorConfig};
pub use device::{
    BlockDevice, ConsoleDevice, ContainerRootfs, Device, DeviceTable, DeviceType, FsDevice,
    ImageDevice, NetDevice, SerialDevice, SerialPortDevice, VfioDevice, rootfs_device,
};
pub use error::{Error, Result};
pub use host::{HostInfo, PROC_CPUINFO, PROC_MEMINFO, is_running_nested, total_memory_kb};
pub use lifecycle::{PodLifecycle, PodState};
pub use params::{Param, ParamSet};
pub use pod::{PodConfig, ResourceConfig};

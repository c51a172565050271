//! QEMU argv and guest kernel command line construction.

use std::path::Path;
use vmpod_core::{
    Device, DeviceTable, HypervisorConfig, Param, ParamSet, ResourceConfig, Result,
};

pub(crate) const DEFAULT_MACHINE_TYPE: &str = "pc";
pub(crate) const QMP_SOCKET: &str = "qmp.sock";
pub(crate) const CONSOLE_SOCKET: &str = "console.sock";

const ROOT_IMAGE_ID: &str = "image0";
const CONSOLE_ID: &str = "console0";
const CONSOLE_SERIAL_ID: &str = "serial0";
const HUGEPAGES_PATH: &str = "/dev/hugepages";
const MEMORY_SLOTS: u32 = 2;

/// Kernel parameters every guest boots with, ahead of the debug switches and
/// the caller's own parameters.
fn default_kernel_params() -> ParamSet {
    ParamSet::deserialize([
        "root=/dev/vda1",
        "rootflags=data=ordered,errors=remount-ro",
        "rootfstype=ext4",
        "rw",
        "tsc=reliable",
        "no_timer_check",
        "rcupdate.rcu_expedited=1",
        "i8042.direct=1",
        "i8042.dumbkbd=1",
        "i8042.nopnp=1",
        "i8042.noaux=1",
        "noreplace-smp",
        "reboot=k",
        "panic=1",
        "console=hvc0",
        "console=hvc1",
        "iommu=off",
        "cryptomgr.notests",
        "net.ifnames=0",
    ])
}

fn debug_kernel_params(debug: bool) -> ParamSet {
    if debug {
        ParamSet::deserialize(["debug", "systemd.show_status=true", "systemd.log_level=debug"])
    } else {
        ParamSet::deserialize(["quiet", "systemd.show_status=false"])
    }
}

pub(crate) fn kernel_cmdline(config: &HypervisorConfig) -> String {
    let mut params = default_kernel_params();
    params
        .extend_from(&debug_kernel_params(config.debug))
        .extend_from(&config.kernel_params);
    params.to_cmdline()
}

/// Inputs to one QEMU launch.
pub(crate) struct LaunchPlan<'a> {
    pub config: &'a HypervisorConfig,
    pub resources: ResourceConfig,
    pub host_memory_kb: u64,
    pub nested: bool,
    pub pod_dir: &'a Path,
    pub devices: &'a DeviceTable,
}

impl LaunchPlan<'_> {
    pub(crate) fn argv(&self) -> Result<Vec<String>> {
        Ok(self.params()?.serialize(""))
    }

    fn params(&self) -> Result<ParamSet> {
        let mut params = ParamSet::new();

        let machine = if self.config.hypervisor_machine_type.is_empty() {
            DEFAULT_MACHINE_TYPE
        } else {
            &self.config.hypervisor_machine_type
        };
        params.add(Param::new("-machine", format!("{machine},accel=kvm")))?;

        // Guests cannot use the PMU when the host itself is virtualized.
        let cpu = if self.nested { "host,pmu=off" } else { "host" };
        params.add(Param::new("-cpu", cpu))?;
        params.add(Param::new("-smp", self.resources.vcpus.to_string()))?;

        let memory_mb = self.resources.memory_mb;
        let max_mb = (self.host_memory_kb / 1024).max(u64::from(memory_mb));
        params.add(Param::new(
            "-m",
            format!("{memory_mb}M,slots={MEMORY_SLOTS},maxmem={max_mb}M"),
        ))?;

        if self.config.huge_pages {
            params.add(Param::new(
                "-object",
                format!(
                    "memory-backend-file,id=mem0,size={memory_mb}M,mem-path={HUGEPAGES_PATH},share=on,prealloc=on"
                ),
            ))?;
            params.add(Param::new("-numa", "node,memdev=mem0"))?;
        } else if self.config.mem_prealloc {
            params.add(Param::flag("-mem-prealloc"))?;
        }

        if self.config.realtime {
            let mlock = if self.config.mlock { "on" } else { "off" };
            params.add(Param::new("-realtime", format!("mlock={mlock}")))?;
        }

        params.add(Param::new(
            "-kernel",
            self.config.kernel_path.display().to_string(),
        ))?;
        params.add(Param::new("-append", kernel_cmdline(self.config)))?;

        params.add(Param::new(
            "-drive",
            format!(
                "file={},if=none,id={ROOT_IMAGE_ID},format=raw,readonly=on",
                self.config.image_path.display()
            ),
        ))?;
        params.add(Param::new(
            "-device",
            format!("virtio-blk-pci,drive={ROOT_IMAGE_ID}"),
        ))?;

        params.add(Param::new(
            "-qmp",
            format!(
                "unix:{},server=on,wait=off",
                self.pod_dir.join(QMP_SOCKET).display()
            ),
        ))?;

        params.add(Param::new(
            "-device",
            format!("virtio-serial-pci,id={CONSOLE_SERIAL_ID}"),
        ))?;
        params.add(Param::new(
            "-chardev",
            format!(
                "socket,id={CONSOLE_ID},path={},server=on,wait=off",
                self.pod_dir.join(CONSOLE_SOCKET).display()
            ),
        ))?;
        params.add(Param::new(
            "-device",
            format!("virtconsole,chardev={CONSOLE_ID}"),
        ))?;

        for flag in ["-nographic", "-nodefaults", "-no-user-config"] {
            params.add(Param::flag(flag))?;
        }

        for device in self.devices.iter() {
            for param in device_params(device) {
                params.add(param)?;
            }
        }

        params.extend_from(&self.config.hypervisor_params);
        Ok(params)
    }
}

/// Command line for a device attached before boot.
fn device_params(device: &Device) -> Vec<Param> {
    match device {
        Device::Image(image) => vec![
            Param::new(
                "-drive",
                format!(
                    "file={},if=none,id={},format=raw,readonly=on",
                    image.path.display(),
                    image.id
                ),
            ),
            Param::new("-device", format!("virtio-blk-pci,drive={}", image.id)),
        ],
        Device::Filesystem(fs) => {
            let mut fsdev = format!(
                "local,id={},path={},security_model=none",
                fs.id,
                fs.host_path.display()
            );
            if fs.read_only {
                fsdev.push_str(",readonly=on");
            }
            vec![
                Param::new("-fsdev", fsdev),
                Param::new(
                    "-device",
                    format!("virtio-9p-pci,fsdev={},mount_tag={}", fs.id, fs.mount_tag),
                ),
            ]
        }
        Device::Network(net) => {
            let mut nic = format!("virtio-net-pci,netdev={}", net.id);
            if let Some(mac) = &net.mac {
                nic.push_str(&format!(",mac={mac}"));
            }
            vec![
                Param::new(
                    "-netdev",
                    format!(
                        "tap,id={},ifname={},script=no,downscript=no",
                        net.id, net.tap_name
                    ),
                ),
                Param::new("-device", nic),
            ]
        }
        Device::Serial(serial) => vec![Param::new(
            "-device",
            format!("virtio-serial-pci,id={}", serial.id),
        )],
        Device::Block(block) => {
            let mut drive = format!(
                "file={},if=none,id={},format=raw,cache=none,aio=threads",
                block.path.display(),
                block.id
            );
            if block.read_only {
                drive.push_str(",readonly=on");
            }
            vec![
                Param::new("-drive", drive),
                Param::new(
                    "-device",
                    format!("virtio-blk-pci,drive={0},id={0}", block.id),
                ),
            ]
        }
        Device::Console(console) => vec![
            Param::new(
                "-chardev",
                format!(
                    "socket,id={},path={},server=on,wait=off",
                    console.id,
                    console.socket_path.display()
                ),
            ),
            Param::new("-device", format!("virtconsole,chardev={}", console.id)),
        ],
        Device::SerialPort(port) => vec![
            Param::new(
                "-chardev",
                format!(
                    "socket,id={},path={},server=on,wait=off",
                    port.id,
                    port.socket_path.display()
                ),
            ),
            Param::new(
                "-device",
                format!("virtserialport,chardev={},name={}", port.id, port.name),
            ),
        ],
        Device::Vfio(vfio) => vec![Param::new(
            "-device",
            format!("vfio-pci,host={},id={}", vfio.host_bdf, vfio.id),
        )],
    }
}

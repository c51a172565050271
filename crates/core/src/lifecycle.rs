//! Pod state machine shared by every backend.
//!
//! ```text
//! Uninitialized -> Created -> Running <-> Paused -> Stopped
//! ```
//!
//! `Stopped` is terminal: a stopped backend instance is discarded.

use crate::capabilities::BackendCapabilities;
use crate::config::HypervisorConfig;
use crate::device::{Device, DeviceTable, DeviceType};
use crate::error::{Error, Result};
use crate::pod::PodConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodState {
    Uninitialized,
    Created,
    Running,
    Paused,
    Stopped,
}

impl PodState {
    /// Fails with [`Error::InvalidState`] unless `self` is one of `allowed`.
    pub fn ensure(self, operation: &'static str, allowed: &[PodState]) -> Result<()> {
        if allowed.contains(&self) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation,
                state: self,
            })
        }
    }
}

impl fmt::Display for PodState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PodState::Uninitialized => "uninitialized",
            PodState::Created => "created",
            PodState::Running => "running",
            PodState::Paused => "paused",
            PodState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Bookkeeping every backend keeps for its pod.
///
/// Backends hold this behind their per-pod lock, so device table access is
/// serialized with lifecycle transitions.
#[derive(Debug, Default)]
pub struct PodLifecycle {
    state: Option<PodState>,
    config: Option<HypervisorConfig>,
    pod: Option<PodConfig>,
    launched: bool,
    pub devices: DeviceTable,
}

impl PodLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PodState {
        self.state.unwrap_or(PodState::Uninitialized)
    }

    pub fn config(&self) -> Option<&HypervisorConfig> {
        self.config.as_ref()
    }

    pub fn pod(&self) -> Option<&PodConfig> {
        self.pod.as_ref()
    }

    /// Whether `start_pod` has been issued, successful or not.
    pub fn launched(&self) -> bool {
        self.launched
    }

    /// Fails unless `init` has not run yet.
    pub fn check_init(&self) -> Result<()> {
        self.state().ensure("init", &[PodState::Uninitialized])?;
        if self.config.is_some() {
            return Err(Error::InvalidState {
                operation: "init",
                state: self.state(),
            });
        }
        Ok(())
    }

    /// Stores an already validated config.
    pub fn initialize(&mut self, config: HypervisorConfig) -> Result<()> {
        self.check_init()?;
        self.config = Some(config);
        Ok(())
    }

    /// The stored config, or `InvalidState` when `init` has not run.
    pub fn require_config(&self, operation: &'static str) -> Result<&HypervisorConfig> {
        self.config.as_ref().ok_or(Error::InvalidState {
            operation,
            state: self.state(),
        })
    }

    pub fn check_create(&self) -> Result<&HypervisorConfig> {
        self.state().ensure("create_pod", &[PodState::Uninitialized])?;
        self.require_config("create_pod")
    }

    pub fn mark_created(&mut self, pod: PodConfig) {
        self.pod = Some(pod);
        self.state = Some(PodState::Created);
    }

    pub fn check_start(&self) -> Result<()> {
        self.state().ensure("start_pod", &[PodState::Created])?;
        if self.launched {
            return Err(Error::InvalidState {
                operation: "start_pod",
                state: self.state(),
            });
        }
        Ok(())
    }

    /// Records a launch attempt, whether or not the VM actually came up.
    pub fn mark_launched(&mut self) {
        self.launched = true;
    }

    /// Moves a launched pod to `Running`. Returns false if the pod left
    /// `Created` while booting, e.g. because it was stopped.
    pub fn mark_booted(&mut self) -> bool {
        if self.state() != PodState::Created || !self.launched {
            return false;
        }
        self.state = Some(PodState::Running);
        true
    }

    /// Stop is legal while running or paused, and after any launch attempt
    /// that never finished booting, including one that failed to spawn.
    pub fn check_stop(&self) -> Result<()> {
        match self.state() {
            PodState::Running | PodState::Paused => Ok(()),
            PodState::Created if self.launched => Ok(()),
            state => Err(Error::InvalidState {
                operation: "stop_pod",
                state,
            }),
        }
    }

    pub fn mark_stopped(&mut self) {
        self.devices.clear();
        self.state = Some(PodState::Stopped);
    }

    pub fn check_pause(&self, capabilities: &BackendCapabilities) -> Result<()> {
        if !capabilities.pause_resume {
            return Err(Error::Unsupported("pause".to_string()));
        }
        self.state().ensure("pause_pod", &[PodState::Running])
    }

    pub fn check_resume(&self, capabilities: &BackendCapabilities) -> Result<()> {
        if !capabilities.pause_resume {
            return Err(Error::Unsupported("resume".to_string()));
        }
        self.state().ensure("resume_pod", &[PodState::Paused])
    }

    pub fn mark_paused(&mut self) {
        self.state = Some(PodState::Paused);
    }

    pub fn mark_resumed(&mut self) {
        self.state = Some(PodState::Running);
    }

    /// Static attach is only legal after `init` and before the pod starts.
    /// Any device type may be attached this way.
    pub fn check_static_attach(&self) -> Result<()> {
        self.state()
            .ensure("add_device", &[PodState::Uninitialized, PodState::Created])?;
        self.require_config("add_device")?;
        if self.launched {
            return Err(Error::InvalidState {
                operation: "add_device",
                state: self.state(),
            });
        }
        Ok(())
    }

    /// Hotplug needs backend support for the type and a live VM.
    pub fn check_hotplug(
        &self,
        capabilities: &BackendCapabilities,
        device_type: DeviceType,
        operation: &'static str,
    ) -> Result<()> {
        if !capabilities.supports_hotplug(device_type) {
            return Err(Error::Unsupported(format!(
                "hotplug of {device_type} devices"
            )));
        }
        self.state()
            .ensure(operation, &[PodState::Running, PodState::Paused])
    }

    /// Looks up the attached device a hotplug removal targets.
    pub fn attached(&self, device: &Device) -> Result<&Device> {
        self.devices
            .get(device.id())
            .ok_or_else(|| Error::NotFound(format!("device {}", device.id())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::HotplugSupport;
    use crate::device::{BlockDevice, VfioDevice};
    use std::path::PathBuf;

    fn initialized() -> PodLifecycle {
        let mut config = HypervisorConfig::new("/k", "/i");
        config.validate().unwrap();
        let mut lifecycle = PodLifecycle::new();
        lifecycle.initialize(config).unwrap();
        lifecycle
    }

    fn running() -> PodLifecycle {
        let mut lifecycle = initialized();
        lifecycle.mark_created(PodConfig::new("pod"));
        lifecycle.mark_launched();
        assert!(lifecycle.mark_booted());
        lifecycle
    }

    fn block_hotplug() -> BackendCapabilities {
        BackendCapabilities {
            block_devices: true,
            hotplug: HotplugSupport {
                block: true,
                ..Default::default()
            },
            pause_resume: true,
            ..Default::default()
        }
    }

    fn block(id: &str) -> Device {
        Device::Block(BlockDevice {
            id: id.to_string(),
            path: PathBuf::from("/dev/sdb"),
            read_only: false,
        })
    }

    mod pod_state {
        use super::*;

        #[test]
        fn ensure_accepts_listed_state() {
            assert!(PodState::Running.ensure("op", &[PodState::Running]).is_ok());
        }

        #[test]
        fn ensure_reports_operation_and_state() {
            let err = PodState::Stopped
                .ensure("pause_pod", &[PodState::Running])
                .unwrap_err();
            assert!(matches!(
                err,
                Error::InvalidState {
                    operation: "pause_pod",
                    state: PodState::Stopped
                }
            ));
        }

        #[test]
        fn serializes_lowercase() {
            assert_eq!(
                serde_json::to_string(&PodState::Paused).unwrap(),
                "\"paused\""
            );
        }
    }

    mod transitions {
        use super::*;

        #[test]
        fn starts_uninitialized() {
            assert_eq!(PodLifecycle::new().state(), PodState::Uninitialized);
        }

        #[test]
        fn init_twice_is_invalid() {
            let mut lifecycle = initialized();
            let err = lifecycle
                .initialize(HypervisorConfig::new("/k", "/i"))
                .unwrap_err();
            assert!(matches!(err, Error::InvalidState { .. }));
        }

        #[test]
        fn create_requires_init() {
            let err = PodLifecycle::new().check_create().unwrap_err();
            assert!(matches!(
                err,
                Error::InvalidState {
                    operation: "create_pod",
                    ..
                }
            ));
        }

        #[test]
        fn start_only_once() {
            let mut lifecycle = initialized();
            lifecycle.mark_created(PodConfig::new("pod"));
            lifecycle.check_start().unwrap();
            lifecycle.mark_launched();
            assert!(lifecycle.check_start().is_err());
        }

        #[test]
        fn stop_before_launch_is_invalid() {
            let mut lifecycle = initialized();
            lifecycle.mark_created(PodConfig::new("pod"));
            assert!(lifecycle.check_stop().is_err());
            lifecycle.mark_launched();
            assert!(lifecycle.check_stop().is_ok());
        }

        #[test]
        fn booted_after_stop_is_ignored() {
            let mut lifecycle = initialized();
            lifecycle.mark_created(PodConfig::new("pod"));
            lifecycle.mark_launched();
            lifecycle.mark_stopped();
            assert!(!lifecycle.mark_booted());
            assert_eq!(lifecycle.state(), PodState::Stopped);
        }

        #[test]
        fn pause_resume_cycle() {
            let mut lifecycle = running();
            let caps = block_hotplug();
            lifecycle.check_pause(&caps).unwrap();
            lifecycle.mark_paused();
            assert!(lifecycle.check_pause(&caps).is_err());
            lifecycle.check_resume(&caps).unwrap();
            lifecycle.mark_resumed();
            assert_eq!(lifecycle.state(), PodState::Running);
        }

        #[test]
        fn pause_without_capability_is_unsupported() {
            let lifecycle = running();
            let err = lifecycle
                .check_pause(&BackendCapabilities::default())
                .unwrap_err();
            assert!(matches!(err, Error::Unsupported(_)));
        }

        #[test]
        fn stopped_clears_devices() {
            let mut lifecycle = running();
            lifecycle.devices.attach(block("vdb")).unwrap();
            lifecycle.mark_stopped();
            assert!(lifecycle.devices.is_empty());
            assert!(lifecycle.check_stop().is_err());
        }
    }

    mod device_contract {
        use super::*;

        #[test]
        fn static_attach_before_start() {
            let mut lifecycle = initialized();
            lifecycle.check_static_attach().unwrap();
            lifecycle.mark_created(PodConfig::new("pod"));
            lifecycle.check_static_attach().unwrap();
        }

        #[test]
        fn static_attach_requires_init() {
            let err = PodLifecycle::new().check_static_attach().unwrap_err();
            assert!(matches!(err, Error::InvalidState { .. }));
        }

        #[test]
        fn static_attach_while_running_is_invalid() {
            let err = running().check_static_attach().unwrap_err();
            assert!(matches!(
                err,
                Error::InvalidState {
                    operation: "add_device",
                    state: PodState::Running
                }
            ));
        }

        #[test]
        fn hotplug_unsupported_type_wins_over_state() {
            let lifecycle = initialized();
            let err = lifecycle
                .check_hotplug(&block_hotplug(), DeviceType::Vfio, "hotplug_add_device")
                .unwrap_err();
            assert!(matches!(err, Error::Unsupported(_)));
        }

        #[test]
        fn hotplug_before_start_is_invalid() {
            let mut lifecycle = initialized();
            lifecycle.mark_created(PodConfig::new("pod"));
            let err = lifecycle
                .check_hotplug(&block_hotplug(), DeviceType::Block, "hotplug_add_device")
                .unwrap_err();
            assert!(matches!(err, Error::InvalidState { .. }));
        }

        #[test]
        fn hotplug_allowed_while_paused() {
            let mut lifecycle = running();
            lifecycle.mark_paused();
            lifecycle
                .check_hotplug(&block_hotplug(), DeviceType::Block, "hotplug_add_device")
                .unwrap();
        }

        #[test]
        fn attached_lookup_by_id() {
            let mut lifecycle = running();
            lifecycle.devices.attach(block("vdb")).unwrap();
            assert!(lifecycle.attached(&block("vdb")).is_ok());

            let vfio = Device::Vfio(VfioDevice {
                id: "gpu0".to_string(),
                host_bdf: "0000:01:00.0".to_string(),
            });
            assert!(matches!(
                lifecycle.attached(&vfio).unwrap_err(),
                Error::NotFound(_)
            ));
        }
    }
}

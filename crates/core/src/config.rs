use crate::error::{Error, Result};
use crate::params::{Param, ParamSet};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// vCPUs assigned when the configuration leaves `default_vcpus` unset.
pub const DEFAULT_VCPUS: u32 = 1;

/// Guest memory in MiB assigned when `default_mem_sz` is unset.
pub const DEFAULT_MEMORY_MIB: u32 = 2048;

/// Declarative configuration for a pod's VM.
///
/// Built by the orchestrator before pod creation and handed to a backend's
/// `init`, which calls [`validate`](Self::validate). After validation only
/// [`add_kernel_param`](Self::add_kernel_param) mutates it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Guest kernel host path.
    pub kernel_path: PathBuf,

    /// Guest root image host path.
    pub image_path: PathBuf,

    /// Hypervisor executable. Empty means search `PATH`.
    pub hypervisor_path: PathBuf,

    /// Never pass a block device backing a container rootfs to the VM;
    /// share the mounted filesystem instead.
    pub disable_block_device_use: bool,

    /// Extra guest kernel parameters, appended after the backend defaults.
    pub kernel_params: ParamSet,

    /// Extra hypervisor parameters, appended to the hypervisor argv.
    pub hypervisor_params: ParamSet,

    /// Machine type to emulate. Empty selects the backend default.
    pub hypervisor_machine_type: String,

    /// Turn on debug output in the hypervisor and guest kernel.
    pub debug: bool,

    /// Default vCPU count; a pod's own resources override it.
    pub default_vcpus: u32,

    /// Default memory size in MiB; a pod's own resources override it.
    pub default_mem_sz: u32,

    /// Pre-allocate guest memory.
    pub mem_prealloc: bool,

    /// Back guest memory with huge pages.
    pub huge_pages: bool,

    /// Enable realtime scheduling.
    pub realtime: bool,

    /// Lock guest memory when `realtime` is on. Leaving it off lets VM
    /// memory be swapped out for higher density.
    pub mlock: bool,

    /// Skip the adjustments made when running on top of another VMM.
    pub disable_nesting_checks: bool,
}

impl HypervisorConfig {
    pub fn new(kernel_path: impl Into<PathBuf>, image_path: impl Into<PathBuf>) -> Self {
        Self {
            kernel_path: kernel_path.into(),
            image_path: image_path.into(),
            ..Self::default()
        }
    }

    /// Checks required fields, then fills unset resource defaults in place.
    ///
    /// The two steps always run together so a config is never observed as
    /// validated but still missing its defaults.
    pub fn validate(&mut self) -> Result<()> {
        self.check()?;
        self.canonicalize();
        Ok(())
    }

    fn check(&self) -> Result<()> {
        if self.kernel_path.as_os_str().is_empty() {
            return Err(Error::MissingField("kernel_path"));
        }

        if self.image_path.as_os_str().is_empty() {
            return Err(Error::MissingField("image_path"));
        }

        Ok(())
    }

    fn canonicalize(&mut self) {
        if self.default_vcpus == 0 {
            self.default_vcpus = DEFAULT_VCPUS;
        }

        if self.default_mem_sz == 0 {
            self.default_mem_sz = DEFAULT_MEMORY_MIB;
        }
    }

    /// Appends a guest kernel parameter.
    pub fn add_kernel_param(&mut self, param: Param) -> Result<()> {
        self.kernel_params.add(param)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod validate {
        use super::*;

        #[test]
        fn fills_zero_resources_with_defaults() {
            let mut config = HypervisorConfig::new("/k", "/i");
            config.validate().unwrap();
            assert_eq!(config.default_vcpus, 1);
            assert_eq!(config.default_mem_sz, 2048);
        }

        #[test]
        fn keeps_explicit_resources() {
            let mut config = HypervisorConfig {
                default_vcpus: 4,
                default_mem_sz: 512,
                ..HypervisorConfig::new("/k", "/i")
            };
            config.validate().unwrap();
            assert_eq!(config.default_vcpus, 4);
            assert_eq!(config.default_mem_sz, 512);
        }

        #[test]
        fn missing_kernel_path_fails_first() {
            let mut config = HypervisorConfig::default();
            let err = config.validate().unwrap_err();
            assert!(matches!(err, Error::MissingField("kernel_path")));
        }

        #[test]
        fn missing_kernel_path_fails_regardless_of_other_fields() {
            let mut config = HypervisorConfig {
                default_vcpus: 2,
                debug: true,
                ..HypervisorConfig::new("", "/i")
            };
            let err = config.validate().unwrap_err();
            assert!(matches!(err, Error::MissingField("kernel_path")));
        }

        #[test]
        fn missing_image_path_fails() {
            let mut config = HypervisorConfig::new("/k", "");
            let err = config.validate().unwrap_err();
            assert!(matches!(err, Error::MissingField("image_path")));
        }

        #[test]
        fn failed_validation_does_not_fill_defaults() {
            let mut config = HypervisorConfig::new("/k", "");
            let _ = config.validate();
            assert_eq!(config.default_vcpus, 0);
            assert_eq!(config.default_mem_sz, 0);
        }

        #[test]
        fn feature_toggles_are_independent() {
            let mut config = HypervisorConfig {
                mem_prealloc: true,
                huge_pages: true,
                realtime: true,
                mlock: false,
                disable_nesting_checks: true,
                ..HypervisorConfig::new("/k", "/i")
            };
            assert!(config.validate().is_ok());
        }
    }

    mod kernel_params {
        use super::*;

        #[test]
        fn add_appends_in_order() {
            let mut config = HypervisorConfig::new("/k", "/i");
            config.add_kernel_param(Param::new("a", "1")).unwrap();
            config.add_kernel_param(Param::flag("b")).unwrap();
            assert_eq!(config.kernel_params.to_cmdline(), "a=1 b");
        }

        #[test]
        fn add_rejects_empty_key() {
            let mut config = HypervisorConfig::new("/k", "/i");
            let err = config.add_kernel_param(Param::new("", "x")).unwrap_err();
            assert!(matches!(err, Error::InvalidArgument(_)));
            assert!(config.kernel_params.is_empty());
        }
    }

    mod serialization {
        use super::*;

        #[test]
        fn missing_fields_default() {
            let config: HypervisorConfig =
                serde_json::from_str(r#"{"kernel_path":"/k","image_path":"/i"}"#).unwrap();
            assert_eq!(config, HypervisorConfig::new("/k", "/i"));
        }

        #[test]
        fn kernel_params_roundtrip() {
            let mut config = HypervisorConfig::new("/k", "/i");
            config.add_kernel_param(Param::new("console", "hvc0")).unwrap();
            let json = serde_json::to_string(&config).unwrap();
            let deserialized: HypervisorConfig = serde_json::from_str(&json).unwrap();
            assert_eq!(deserialized.kernel_params.get("console"), Some("hvc0"));
        }
    }
}

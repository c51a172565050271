use crate::capabilities::BackendCapabilities;
use crate::config::HypervisorConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Per-pod request handed to `create_pod`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodConfig {
    pub id: String,
    /// Overrides `HypervisorConfig::default_vcpus`.
    pub vcpus: Option<u32>,
    /// Overrides `HypervisorConfig::default_mem_sz`, in MiB.
    pub memory_mb: Option<u32>,
}

/// vCPU and memory sizing after pod overrides are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub vcpus: u32,
    pub memory_mb: u32,
}

impl PodConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = Some(vcpus);
        self
    }

    pub fn with_memory_mb(mut self, memory_mb: u32) -> Self {
        self.memory_mb = Some(memory_mb);
        self
    }

    /// Resolves the pod's sizing against a validated config and the limits a
    /// backend advertises.
    pub fn resources(
        &self,
        config: &HypervisorConfig,
        capabilities: &BackendCapabilities,
    ) -> Result<ResourceConfig> {
        if self.id.is_empty() {
            return Err(Error::ConfigInvalid("pod id must not be empty".to_string()));
        }

        let vcpus = self.vcpus.unwrap_or(config.default_vcpus);
        let memory_mb = self.memory_mb.unwrap_or(config.default_mem_sz);

        if vcpus == 0 {
            return Err(Error::ConfigInvalid("vcpus must be at least 1".to_string()));
        }
        if memory_mb == 0 {
            return Err(Error::ConfigInvalid(
                "memory_mb must be at least 1".to_string(),
            ));
        }

        if let Some(max) = capabilities.max_vcpus.filter(|max| vcpus > *max) {
            return Err(Error::ConfigInvalid(format!(
                "{vcpus} vcpus exceeds backend maximum of {max}"
            )));
        }
        if let Some(max) = capabilities.max_memory_mb.filter(|max| memory_mb > *max) {
            return Err(Error::ConfigInvalid(format!(
                "{memory_mb} MiB exceeds backend maximum of {max} MiB"
            )));
        }

        Ok(ResourceConfig { vcpus, memory_mb })
    }
}

impl ResourceConfig {
    /// Fails with `ResourceExhausted` when the guest would not fit in host RAM.
    pub fn ensure_fits(&self, host_memory_kb: u64) -> Result<()> {
        let requested_kb = u64::from(self.memory_mb) * 1024;
        if requested_kb > host_memory_kb {
            return Err(Error::ResourceExhausted(format!(
                "pod requests {} MiB but host has {} MiB",
                self.memory_mb,
                host_memory_kb / 1024
            )));
        }
        Ok(())
    }
}

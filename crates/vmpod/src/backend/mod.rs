mod mock;

pub use mock::MockHypervisor;
#[cfg(target_os = "linux")]
pub use vmpod_linux_qemu::QemuHypervisor;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use vmpod_core::{Error, Hypervisor, Result};

/// Backend discriminant, as named in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorType {
    Qemu,
    Mock,
}

impl HypervisorType {
    pub const ALL: [HypervisorType; 2] = [HypervisorType::Qemu, HypervisorType::Mock];

    pub fn as_str(self) -> &'static str {
        match self {
            HypervisorType::Qemu => "qemu",
            HypervisorType::Mock => "mock",
        }
    }
}

impl fmt::Display for HypervisorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HypervisorType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "qemu" => Ok(HypervisorType::Qemu),
            "mock" => Ok(HypervisorType::Mock),
            other => Err(Error::InvalidArgument(format!(
                "unknown hypervisor type {other:?}"
            ))),
        }
    }
}

/// Creates a fresh backend instance for one pod.
pub fn new_hypervisor(kind: HypervisorType) -> Result<Box<dyn Hypervisor>> {
    match kind {
        HypervisorType::Mock => Ok(Box::new(MockHypervisor::new())),
        #[cfg(target_os = "linux")]
        HypervisorType::Qemu => Ok(Box::new(QemuHypervisor::new())),
        #[cfg(not(target_os = "linux"))]
        HypervisorType::Qemu => Err(Error::Unsupported(
            "the qemu backend requires a Linux host".to_string(),
        )),
    }
}

/// One fresh instance of every backend buildable on this host.
pub fn available_backends() -> Vec<(HypervisorType, Box<dyn Hypervisor>)> {
    HypervisorType::ALL
        .into_iter()
        .filter_map(|kind| match new_hypervisor(kind) {
            Ok(backend) => Some((kind, backend)),
            Err(e) => {
                tracing::debug!(backend = %kind, error = %e, "backend not built on this host");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    mod hypervisor_type {
        use super::*;

        #[test]
        fn parses_known_names() {
            assert_eq!("qemu".parse::<HypervisorType>().unwrap(), HypervisorType::Qemu);
            assert_eq!("mock".parse::<HypervisorType>().unwrap(), HypervisorType::Mock);
        }

        #[test]
        fn parsing_is_exact() {
            for name in ["QEMU", "Mock", " qemu", "kvm", ""] {
                let err = name.parse::<HypervisorType>().unwrap_err();
                assert!(matches!(err, Error::InvalidArgument(_)), "{name:?}");
            }
        }

        #[test]
        fn display_round_trips() {
            for kind in HypervisorType::ALL {
                assert_eq!(kind.to_string().parse::<HypervisorType>().unwrap(), kind);
            }
        }

        #[test]
        fn serializes_lowercase() {
            assert_eq!(
                serde_json::to_string(&HypervisorType::Qemu).unwrap(),
                "\"qemu\""
            );
        }
    }

    mod factory {
        use super::*;

        #[test]
        fn mock_is_always_available() {
            let backend = new_hypervisor(HypervisorType::Mock).unwrap();
            assert_eq!(backend.name(), "mock");
            assert!(backend.is_available());
        }

        #[cfg(target_os = "linux")]
        #[test]
        fn qemu_is_built_on_linux() {
            let backend = new_hypervisor(HypervisorType::Qemu).unwrap();
            assert_eq!(backend.name(), "qemu");
        }

        #[cfg(not(target_os = "linux"))]
        #[test]
        fn qemu_is_unsupported_elsewhere() {
            let err = new_hypervisor(HypervisorType::Qemu).unwrap_err();
            assert!(matches!(err, Error::Unsupported(_)));
        }

        #[test]
        fn listing_includes_mock() {
            let backends = available_backends();
            let (_, mock) = backends
                .iter()
                .find(|(kind, _)| *kind == HypervisorType::Mock)
                .unwrap();
            assert!(mock.is_available());
            assert_eq!(mock.name(), "mock");
        }
    }
}

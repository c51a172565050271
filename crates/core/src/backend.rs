use crate::capabilities::BackendCapabilities;
use crate::config::HypervisorConfig;
use crate::device::Device;
use crate::error::Result;
use crate::lifecycle::PodState;
use crate::pod::PodConfig;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::oneshot;

/// Fired once by the backend when the VM finished booting, or failed to.
#[derive(Debug)]
pub struct StartSignal(oneshot::Sender<Result<()>>);

impl StartSignal {
    pub fn fire(self, result: Result<()>) {
        if let Err(unsent) = self.0.send(result) {
            tracing::debug!(result = ?unsent, "start signal receiver dropped");
        }
    }
}

/// Creates a start signal and the receiver the caller waits on.
pub fn start_channel() -> (StartSignal, oneshot::Receiver<Result<()>>) {
    let (tx, rx) = oneshot::channel();
    (StartSignal(tx), rx)
}

/// Fired once by the caller to request shutdown of a running pod from outside
/// the `stop_pod` path, e.g. after a guest-initiated halt.
#[derive(Debug)]
pub struct StopSignal(oneshot::Receiver<()>);

impl StopSignal {
    /// Waits for the request. Returns false if the sender was dropped, which
    /// means the signal will never fire.
    pub async fn wait(self) -> bool {
        self.0.await.is_ok()
    }
}

/// Creates a stop signal and the sender the caller fires it with.
pub fn stop_channel() -> (oneshot::Sender<()>, StopSignal) {
    let (tx, rx) = oneshot::channel();
    (tx, StopSignal(rx))
}

/// One hypervisor backend instance drives exactly one pod.
///
/// Operations outside their legal lifecycle state fail with
/// [`Error::InvalidState`](crate::Error::InvalidState). Once a pod is
/// stopped the instance is discarded.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_available(&self) -> bool;
    fn capabilities(&self) -> &BackendCapabilities;
    async fn state(&self) -> PodState;

    /// Validates `config`, filling its defaults, and locates whatever the
    /// backend needs on the host.
    async fn init(&self, config: HypervisorConfig) -> Result<()>;
    async fn create_pod(&self, pod: &PodConfig) -> Result<()>;

    /// Launches the VM and returns without waiting for boot. Boot completion
    /// or failure is reported on `started`; `stop` is watched until the pod
    /// stops.
    async fn start_pod(&self, started: StartSignal, stop: StopSignal) -> Result<()>;
    async fn stop_pod(&self) -> Result<()>;
    async fn pause_pod(&self) -> Result<()>;
    async fn resume_pod(&self) -> Result<()>;

    /// Attaches a device before the VM starts.
    async fn add_device(&self, device: Device) -> Result<()>;
    async fn hotplug_add_device(&self, device: Device) -> Result<()>;
    async fn hotplug_remove_device(&self, device: &Device) -> Result<()>;

    /// Host path of the pod's console socket, if the backend exposes one.
    async fn pod_console(&self, pod_id: &str) -> Option<PathBuf>;
}

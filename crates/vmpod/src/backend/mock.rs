use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};
use vmpod_core::{
    BackendCapabilities, Device, Error, HotplugSupport, Hypervisor, HypervisorConfig, PodConfig,
    PodLifecycle, PodState, Result, StartSignal, StopSignal,
};

/// Backend with no VM behind it.
///
/// It enforces the same lifecycle and device rules as a real backend and
/// boots instantly, which makes it the backend of choice for orchestrator
/// tests.
pub struct MockHypervisor {
    capabilities: BackendCapabilities,
    pod: Arc<Mutex<MockPod>>,
}

#[derive(Default)]
struct MockPod {
    lifecycle: PodLifecycle,
    halt: Option<oneshot::Sender<()>>,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self {
            capabilities: BackendCapabilities {
                block_devices: true,
                hotplug: HotplugSupport {
                    block: true,
                    vfio: false,
                    network: false,
                },
                pause_resume: true,
                max_vcpus: None,
                max_memory_mb: None,
            },
            pod: Arc::new(Mutex::new(MockPod::default())),
        }
    }

    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Devices currently attached, in attach order.
    pub async fn devices(&self) -> Vec<Device> {
        self.pod.lock().await.lifecycle.devices.iter().cloned().collect()
    }

    /// The config stored by `init`, with defaults filled.
    pub async fn config(&self) -> Option<HypervisorConfig> {
        self.pod.lock().await.lifecycle.config().cloned()
    }
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    async fn state(&self) -> PodState {
        self.pod.lock().await.lifecycle.state()
    }

    async fn init(&self, mut config: HypervisorConfig) -> Result<()> {
        let mut pod = self.pod.lock().await;
        pod.lifecycle.check_init()?;
        config.validate()?;
        pod.lifecycle.initialize(config)
    }

    async fn create_pod(&self, pod_config: &PodConfig) -> Result<()> {
        let mut pod = self.pod.lock().await;
        let config = pod.lifecycle.check_create()?;
        let resources = pod_config.resources(config, &self.capabilities)?;
        tracing::debug!(
            pod = %pod_config.id,
            vcpus = resources.vcpus,
            memory_mb = resources.memory_mb,
            "mock pod created"
        );
        pod.lifecycle.mark_created(pod_config.clone());
        Ok(())
    }

    async fn start_pod(&self, started: StartSignal, stop: StopSignal) -> Result<()> {
        let mut pod = self.pod.lock().await;
        pod.lifecycle.check_start()?;
        pod.lifecycle.mark_launched();
        pod.lifecycle.mark_booted();

        let (halt_tx, halt_rx) = oneshot::channel();
        pod.halt = Some(halt_tx);
        drop(pod);

        tracing::debug!("mock pod running");
        started.fire(Ok(()));

        let shared = Arc::clone(&self.pod);
        tokio::spawn(async move {
            tokio::select! {
                requested = stop.wait() => {
                    if requested {
                        let mut pod = shared.lock().await;
                        if pod.lifecycle.check_stop().is_ok() {
                            pod.halt = None;
                            pod.lifecycle.mark_stopped();
                            tracing::debug!("mock pod stopped on request");
                        }
                    }
                }
                _ = halt_rx => {}
            }
        });
        Ok(())
    }

    async fn stop_pod(&self) -> Result<()> {
        let mut pod = self.pod.lock().await;
        pod.lifecycle.check_stop()?;
        if let Some(halt) = pod.halt.take() {
            let _ = halt.send(());
        }
        pod.lifecycle.mark_stopped();
        tracing::debug!("mock pod stopped");
        Ok(())
    }

    async fn pause_pod(&self) -> Result<()> {
        let mut pod = self.pod.lock().await;
        pod.lifecycle.check_pause(&self.capabilities)?;
        pod.lifecycle.mark_paused();
        Ok(())
    }

    async fn resume_pod(&self) -> Result<()> {
        let mut pod = self.pod.lock().await;
        pod.lifecycle.check_resume(&self.capabilities)?;
        pod.lifecycle.mark_resumed();
        Ok(())
    }

    async fn add_device(&self, device: Device) -> Result<()> {
        let mut pod = self.pod.lock().await;
        pod.lifecycle.check_static_attach()?;
        pod.lifecycle.devices.attach(device)
    }

    async fn hotplug_add_device(&self, device: Device) -> Result<()> {
        let mut pod = self.pod.lock().await;
        pod.lifecycle.check_hotplug(
            &self.capabilities,
            device.device_type(),
            "hotplug_add_device",
        )?;
        if pod.lifecycle.devices.contains(device.id()) {
            return Err(Error::InvalidArgument(format!(
                "device {} is already attached",
                device.id()
            )));
        }
        pod.lifecycle.devices.attach(device)
    }

    async fn hotplug_remove_device(&self, device: &Device) -> Result<()> {
        let mut pod = self.pod.lock().await;
        pod.lifecycle.check_hotplug(
            &self.capabilities,
            device.device_type(),
            "hotplug_remove_device",
        )?;
        let id = pod.lifecycle.attached(device)?.id().to_string();
        pod.lifecycle.devices.detach(&id).map(|_| ())
    }

    async fn pod_console(&self, _pod_id: &str) -> Option<PathBuf> {
        None
    }
}

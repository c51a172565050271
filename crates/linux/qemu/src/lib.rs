//! QEMU hypervisor backend for vmpod.
//!
//! Each [`QemuHypervisor`] drives a single `qemu-system-*` process for one
//! pod and controls it over QMP.
//!
//! # Requirements
//!
//! - Linux host with KVM (`/dev/kvm` must be accessible)
//! - A QEMU system emulator for the host architecture, either on `PATH` or
//!   named by `HypervisorConfig::hypervisor_path`
//!
//! # Example
//!
//! ```no_run
//! use vmpod_core::Hypervisor;
//! use vmpod_linux_qemu::QemuHypervisor;
//!
//! let backend = QemuHypervisor::new();
//! if backend.is_available() {
//!     println!("QEMU is available");
//! }
//! ```

mod args;
mod qmp;

use args::{CONSOLE_SOCKET, LaunchPlan, QMP_SOCKET};
use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use qmp::QmpClient;
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use vmpod_core::{
    BackendCapabilities, Device, Error, HotplugSupport, Hypervisor, HypervisorConfig, PodConfig,
    PodLifecycle, PodState, Result, StartSignal, StopSignal, host,
};

pub const DEFAULT_RUN_DIR: &str = "/run/vmpod";
pub const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

const QMP_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEVICE_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Binary searched on `PATH` when the config names none.
pub fn default_binary_name() -> String {
    format!("qemu-system-{}", std::env::consts::ARCH)
}

/// QEMU hypervisor backend.
pub struct QemuHypervisor {
    capabilities: BackendCapabilities,
    meminfo: PathBuf,
    cpuinfo: PathBuf,
    run_dir: PathBuf,
    boot_timeout: Duration,
    shutdown_timeout: Duration,
    pod: Arc<Mutex<QemuPod>>,
}

#[derive(Default)]
struct QemuPod {
    lifecycle: PodLifecycle,
    binary: Option<PathBuf>,
    host_memory_kb: u64,
    nested: bool,
    pod_dir: Option<PathBuf>,
    child: Option<Child>,
    qmp: Option<QmpClient>,
    halt: Option<oneshot::Sender<()>>,
    /// Block nodes created by `blockdev-add`, keyed by device id.
    block_nodes: HashSet<String>,
}

impl QemuHypervisor {
    pub fn new() -> Self {
        Self {
            capabilities: BackendCapabilities {
                block_devices: true,
                hotplug: HotplugSupport {
                    block: true,
                    vfio: true,
                    network: false,
                },
                pause_resume: true,
                max_vcpus: None,
                max_memory_mb: None,
            },
            meminfo: PathBuf::from(host::PROC_MEMINFO),
            cpuinfo: PathBuf::from(host::PROC_CPUINFO),
            run_dir: PathBuf::from(DEFAULT_RUN_DIR),
            boot_timeout: DEFAULT_BOOT_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            pod: Arc::new(Mutex::new(QemuPod::default())),
        }
    }

    /// Reads host memory and CPU flags from these files instead of `/proc`.
    pub fn with_host_sources(
        mut self,
        meminfo: impl Into<PathBuf>,
        cpuinfo: impl Into<PathBuf>,
    ) -> Self {
        self.meminfo = meminfo.into();
        self.cpuinfo = cpuinfo.into();
        self
    }

    /// Directory under which each pod gets its socket directory.
    pub fn with_run_dir(mut self, run_dir: impl Into<PathBuf>) -> Self {
        self.run_dir = run_dir.into();
        self
    }

    pub fn with_boot_timeout(mut self, timeout: Duration) -> Self {
        self.boot_timeout = timeout;
        self
    }

    /// Grace period between asking QEMU to exit and killing it.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    fn kvm_available() -> bool {
        Path::new("/dev/kvm").exists()
    }

    fn resolve_binary(config: &HypervisorConfig) -> Result<PathBuf> {
        if config.hypervisor_path.as_os_str().is_empty() {
            let name = default_binary_name();
            return which::which(&name).map_err(|_| Error::BinaryNotFound(name));
        }

        if config.hypervisor_path.is_file() {
            Ok(config.hypervisor_path.clone())
        } else {
            Err(Error::BinaryNotFound(
                config.hypervisor_path.display().to_string(),
            ))
        }
    }
}

impl Default for QemuHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hypervisor for QemuHypervisor {
    fn name(&self) -> &'static str {
        "qemu"
    }

    fn is_available(&self) -> bool {
        Self::kvm_available() && which::which(default_binary_name()).is_ok()
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
        let binary = Self::resolve_binary(&config)?;
        let host_memory_kb = host::total_memory_kb(&self.meminfo)?;
        let nested = if config.disable_nesting_checks {
            false
        } else {
            host::is_running_nested(&self.cpuinfo)?
        };

        tracing::info!(
            binary = %binary.display(),
            host_memory_kb,
            nested,
            "qemu backend initialized"
        );

        pod.binary = Some(binary);
        pod.host_memory_kb = host_memory_kb;
        pod.nested = nested;
        pod.lifecycle.initialize(config)
    }

    async fn create_pod(&self, pod_config: &PodConfig) -> Result<()> {
        let mut pod = self.pod.lock().await;
        let config = pod.lifecycle.check_create()?;

        if pod_config.id.contains('/') {
            return Err(Error::ConfigInvalid(format!(
                "pod id {:?} must not contain '/'",
                pod_config.id
            )));
        }
        let resources = pod_config.resources(config, &self.capabilities)?;
        resources.ensure_fits(pod.host_memory_kb)?;

        let pod_dir = self.run_dir.join(&pod_config.id);
        tokio::fs::create_dir_all(&pod_dir).await?;

        tracing::info!(
            pod = %pod_config.id,
            vcpus = resources.vcpus,
            memory_mb = resources.memory_mb,
            "pod created"
        );
        pod.pod_dir = Some(pod_dir);
        pod.lifecycle.mark_created(pod_config.clone());
        Ok(())
    }

    async fn start_pod(&self, started: StartSignal, stop: StopSignal) -> Result<()> {
        let mut pod = self.pod.lock().await;
        pod.lifecycle.check_start()?;
        // A failed attempt still leaves a pod dir behind, so it has to be
        // stoppable from here on.
        pod.lifecycle.mark_launched();

        let (argv, pod_id, pod_dir) = pod.launch_plan(&self.capabilities)?;
        let binary = pod.binary.clone().ok_or(Error::InvalidState {
            operation: "start_pod",
            state: pod.lifecycle.state(),
        })?;

        tracing::debug!(pod = %pod_id, binary = %binary.display(), ?argv, "launching qemu");
        let child = Command::new(&binary)
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::LaunchFailed(format!("failed to spawn {}: {e}", binary.display()))
            })?;

        let (halt_tx, halt_rx) = oneshot::channel();
        pod.child = Some(child);
        pod.halt = Some(halt_tx);
        tracing::info!(pod = %pod_id, "qemu launched");

        let supervisor = Supervisor {
            pod: Arc::clone(&self.pod),
            pod_id,
            qmp_path: pod_dir.join(QMP_SOCKET),
            boot_timeout: self.boot_timeout,
            shutdown_timeout: self.shutdown_timeout,
        };
        tokio::spawn(supervisor.run(started, stop, halt_rx));
        Ok(())
    }

    async fn stop_pod(&self) -> Result<()> {
        let mut pod = self.pod.lock().await;
        pod.lifecycle.check_stop()?;

        if let Some(halt) = pod.halt.take() {
            let _ = halt.send(());
        }
        pod.teardown(self.shutdown_timeout).await
    }

    async fn pause_pod(&self) -> Result<()> {
        let mut pod = self.pod.lock().await;
        pod.lifecycle.check_pause(&self.capabilities)?;
        pod.qmp("pause_pod")?.execute("stop", None).await?;
        pod.lifecycle.mark_paused();
        tracing::info!("pod paused");
        Ok(())
    }

    async fn resume_pod(&self) -> Result<()> {
        let mut pod = self.pod.lock().await;
        pod.lifecycle.check_resume(&self.capabilities)?;
        pod.qmp("resume_pod")?.execute("cont", None).await?;
        pod.lifecycle.mark_resumed();
        tracing::info!("pod resumed");
        Ok(())
    }

    async fn add_device(&self, device: Device) -> Result<()> {
        let mut pod = self.pod.lock().await;
        pod.lifecycle.check_static_attach()?;
        tracing::debug!(device = %device.id(), kind = %device.device_type(), "device attached");
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

        let qmp = pod.qmp("hotplug_add_device")?;
        let node = match &device {
            Device::Block(block) => {
                qmp.execute(
                    "blockdev-add",
                    Some(qmp::blockdev_add(&block.id, &block.path, block.read_only)),
                )
                .await?;
                let added = qmp
                    .execute(
                        "device_add",
                        Some(json!({"driver": "virtio-blk-pci", "id": block.id, "drive": block.id})),
                    )
                    .await;
                if let Err(e) = added {
                    tracing::warn!(device = %block.id, error = %e, "device_add failed, releasing block node");
                    if let Err(cleanup) = qmp
                        .execute("blockdev-del", Some(json!({"node-name": block.id})))
                        .await
                    {
                        tracing::warn!(device = %block.id, error = %cleanup, "failed to release block node");
                    }
                    return Err(e);
                }
                Some(block.id.clone())
            }
            Device::Vfio(vfio) => {
                qmp.execute(
                    "device_add",
                    Some(json!({"driver": "vfio-pci", "id": vfio.id, "host": vfio.host_bdf})),
                )
                .await?;
                None
            }
            other => {
                return Err(Error::Unsupported(format!(
                    "hotplug of {} devices",
                    other.device_type()
                )));
            }
        };

        tracing::info!(device = %device.id(), kind = %device.device_type(), "device hotplugged");
        if let Some(node) = node {
            pod.block_nodes.insert(node);
        }
        pod.lifecycle.devices.attach(device)
    }

    /// Once QEMU reports the device gone it leaves the table, even if freeing
    /// its block node fails afterwards. Only nodes created by hotplug are
    /// freed; statically attached drives belong to their `-drive` backend.
    async fn hotplug_remove_device(&self, device: &Device) -> Result<()> {
        let mut pod = self.pod.lock().await;
        pod.lifecycle.check_hotplug(
            &self.capabilities,
            device.device_type(),
            "hotplug_remove_device",
        )?;
        let id = pod.lifecycle.attached(device)?.id().to_string();

        let qmp = pod.qmp("hotplug_remove_device")?;
        qmp.execute("device_del", Some(json!({"id": id}))).await?;
        qmp.wait_for_event("DEVICE_DELETED", &id, DEVICE_RELEASE_TIMEOUT)
            .await?;

        pod.lifecycle.devices.detach(&id)?;
        tracing::info!(device = %id, "device unplugged");

        if pod.block_nodes.remove(&id) {
            let qmp = pod.qmp("hotplug_remove_device")?;
            if let Err(e) = qmp
                .execute("blockdev-del", Some(json!({"node-name": id})))
                .await
            {
                tracing::warn!(device = %id, error = %e, "failed to release block node");
                return Err(e);
            }
        }
        Ok(())
    }

    async fn pod_console(&self, pod_id: &str) -> Option<PathBuf> {
        let pod = self.pod.lock().await;
        match (pod.lifecycle.pod(), &pod.pod_dir) {
            (Some(created), Some(dir)) if created.id == pod_id => Some(dir.join(CONSOLE_SOCKET)),
            _ => None,
        }
    }
}

impl QemuPod {
    /// Builds the argv for the created pod.
    fn launch_plan(
        &self,
        capabilities: &BackendCapabilities,
    ) -> Result<(Vec<String>, String, PathBuf)> {
        let config = self.lifecycle.require_config("start_pod")?;
        let (pod_config, pod_dir) = match (self.lifecycle.pod(), &self.pod_dir) {
            (Some(pod_config), Some(pod_dir)) => (pod_config, pod_dir),
            _ => {
                return Err(Error::InvalidState {
                    operation: "start_pod",
                    state: self.lifecycle.state(),
                });
            }
        };

        let plan = LaunchPlan {
            config,
            resources: pod_config.resources(config, capabilities)?,
            host_memory_kb: self.host_memory_kb,
            nested: self.nested,
            pod_dir,
            devices: &self.lifecycle.devices,
        };
        Ok((plan.argv()?, pod_config.id.clone(), pod_dir.clone()))
    }

    fn qmp(&mut self, operation: &'static str) -> Result<&mut QmpClient> {
        let state = self.lifecycle.state();
        self.qmp
            .as_mut()
            .ok_or(Error::InvalidState { operation, state })
    }

    /// Exit status if QEMU already exited.
    fn exit_status(&mut self) -> Result<Option<std::process::ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => Ok(child.try_wait()?),
            None => Err(Error::LaunchFailed("qemu process is gone".to_string())),
        }
    }

    /// Stops QEMU and reclaims everything the pod held. Resources are released
    /// even when the graceful path fails; the failure is still reported.
    async fn teardown(&mut self, grace: Duration) -> Result<()> {
        let mut failure = None;

        let asked = match self.qmp.take() {
            Some(mut qmp) => match qmp.quit().await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "QMP quit failed");
                    false
                }
            },
            None => false,
        };

        if let Some(mut child) = self.child.take() {
            if !asked {
                if let Some(id) = child.id() {
                    let pid = Pid::from_raw(id as i32);
                    if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
                        tracing::warn!(error = %e, "failed to send SIGTERM to qemu");
                    }
                }
            }

            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!(%status, "qemu exited"),
                Ok(Err(e)) => failure = Some(format!("failed to reap qemu: {e}")),
                Err(_) => {
                    tracing::warn!(
                        grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                        "qemu did not exit, killing"
                    );
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "failed to kill qemu");
                    }
                    failure = Some(format!(
                        "qemu did not exit within {}ms and was killed",
                        grace.as_millis()
                    ));
                }
            }
        }

        if let Some(dir) = self.pod_dir.take() {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "failed to remove pod directory");
                    failure.get_or_insert_with(|| format!("failed to remove {}: {e}", dir.display()));
                }
            }
        }

        self.halt = None;
        self.block_nodes.clear();
        self.lifecycle.mark_stopped();
        tracing::info!("pod stopped");

        match failure {
            Some(reason) => Err(Error::ShutdownFailed(reason)),
            None => Ok(()),
        }
    }
}

/// A pod discarded without `stop_pod` still gives back its directory. The
/// child, if any, is killed by `kill_on_drop`.
impl Drop for QemuPod {
    fn drop(&mut self) {
        if let Some(dir) = self.pod_dir.take() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(dir = %dir.display(), error = %e, "failed to remove pod directory");
                }
            }
        }
    }
}

/// Background task owning a launched pod's start and stop signals.
struct Supervisor {
    pod: Arc<Mutex<QemuPod>>,
    pod_id: String,
    qmp_path: PathBuf,
    boot_timeout: Duration,
    shutdown_timeout: Duration,
}

impl Supervisor {
    async fn run(
        self,
        started: StartSignal,
        stop: StopSignal,
        mut halt: oneshot::Receiver<()>,
    ) {
        let booted = tokio::select! {
            result = tokio::time::timeout(self.boot_timeout, self.wait_for_qmp()) => {
                result.unwrap_or_else(|_| {
                    Err(Error::BootTimeout {
                        timeout_ms: u64::try_from(self.boot_timeout.as_millis()).unwrap_or(u64::MAX),
                    })
                })
            }
            _ = &mut halt => Err(Error::LaunchFailed(
                "pod was stopped before boot completed".to_string(),
            )),
        };

        let client = match booted {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(pod = %self.pod_id, error = %e, "pod failed to boot");
                started.fire(Err(e));
                return;
            }
        };

        {
            let mut pod = self.pod.lock().await;
            if !pod.lifecycle.mark_booted() {
                let state = pod.lifecycle.state();
                drop(pod);
                started.fire(Err(Error::InvalidState {
                    operation: "start_pod",
                    state,
                }));
                return;
            }
            pod.qmp = Some(client);
        }
        tracing::info!(pod = %self.pod_id, "pod running");
        started.fire(Ok(()));

        tokio::select! {
            requested = stop.wait() => {
                if !requested {
                    return;
                }
                let mut pod = self.pod.lock().await;
                if pod.lifecycle.check_stop().is_ok() {
                    tracing::info!(pod = %self.pod_id, "stop requested");
                    if let Err(e) = pod.teardown(self.shutdown_timeout).await {
                        tracing::warn!(pod = %self.pod_id, error = %e, "pod teardown failed");
                    }
                }
            }
            _ = &mut halt => {}
        }
    }

    async fn wait_for_qmp(&self) -> Result<QmpClient> {
        loop {
            if let Some(status) = self.pod.lock().await.exit_status()? {
                return Err(Error::LaunchFailed(format!(
                    "qemu exited during boot with {status}"
                )));
            }

            match QmpClient::connect(&self.qmp_path).await {
                Ok(client) => return Ok(client),
                Err(e) => tracing::trace!(pod = %self.pod_id, error = %e, "QMP not ready"),
            }
            tokio::time::sleep(QMP_POLL_INTERVAL).await;
        }
    }
}

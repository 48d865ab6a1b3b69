//! VMM process supervision: spawn, configure, reattach, control.
//!
//! [`VmmLauncher`] is the capability the engine holds; the production
//! implementation spawns a Firecracker process inside the VM's network
//! namespace and drives its API socket. A launched or reconnected VMM is a
//! [`VmmHandle`]: pause, resume, stop, ping.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::VmmConfig;
use crate::constants::{
    CONSOLE_FIFO_NAME, CONSOLE_LOG_NAME, KERNEL_IMAGE_NAME, METRICS_FIFO_NAME, ROOTFS_IMAGE_NAME,
    VMM_LOG_NAME, VMM_SOCKET_NAME,
};
use crate::error::{Error, Result};
use crate::network::types::VmNetwork;
use crate::vmm::api::{
    BootSource, Drive, LoggerConfig, MachineConfig, MetricsConfig, NetworkInterface, VmmApiClient,
};
use crate::vmm::types::VmSpec;

/// Everything a launcher needs to bring one VMM up.
#[derive(Debug, Clone)]
pub struct LaunchParams {
    /// VM id.
    pub vm_id: String,
    /// Per-VM directory for the socket and logs.
    pub vm_dir: PathBuf,
    /// Chroot root holding the prepared assets.
    pub chroot_root: PathBuf,
    /// Network namespace to start the VMM in.
    pub netns: Option<String>,
    /// Composed kernel command line.
    pub kernel_args: String,
    /// VM spec (cpu, memory, storage).
    pub spec: VmSpec,
    /// Network binding, when one exists.
    pub network: Option<VmNetwork>,
}

/// A live VMM.
#[async_trait]
pub trait VmmHandle: Send + Sync + std::fmt::Debug {
    /// Pause the guest. Bounded by `timeout`; the process and socket stay.
    async fn pause(&self, timeout: Duration) -> Result<()>;
    /// Resume a paused guest.
    async fn resume(&self) -> Result<()>;
    /// Terminate the VMM process. Only delete and engine shutdown call this.
    async fn stop(&self) -> Result<()>;
    /// Probe the control socket.
    async fn ping(&self) -> Result<()>;
}

/// Capability that creates and re-attaches VMM handles.
#[async_trait]
pub trait VmmLauncher: Send + Sync {
    /// Spawn and boot a VMM; returns once the guest is executing.
    async fn launch(&self, params: LaunchParams) -> Result<Arc<dyn VmmHandle>>;
    /// Re-attach to an existing VMM via its control socket.
    async fn reconnect(&self, vm_id: &str, socket_path: &Path) -> Result<Arc<dyn VmmHandle>>;
}

/// Production Firecracker process handle.
#[derive(Debug)]
pub struct Machine {
    vm_id: String,
    api: VmmApiClient,
    child: Mutex<Option<Child>>,
}

#[async_trait]
impl VmmHandle for Machine {
    async fn pause(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.api.pause()).await {
            Ok(result) => result,
            Err(_) => Err(Error::VmmTimeout {
                vm_id: self.vm_id.clone(),
                operation: "pause".to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn resume(&self) -> Result<()> {
        self.api.resume().await
    }

    async fn stop(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if let Err(e) = child.kill().await {
                tracing::warn!(vm_id = %self.vm_id, error = %e, "failed to kill VMM process");
            }
            let _ = child.wait().await;
            *guard = None;
        } else {
            // Reconnected handle with no child: ask the guest to power off.
            if let Err(e) = self.api.send_ctrl_alt_del().await {
                tracing::warn!(vm_id = %self.vm_id, error = %e, "failed to signal VMM shutdown");
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.api.instance_info().await.map(drop)
    }
}

/// Launcher spawning real Firecracker processes.
pub struct FirecrackerLauncher {
    config: VmmConfig,
}

impl FirecrackerLauncher {
    /// Launcher over the VMM configuration.
    pub fn new(config: VmmConfig) -> Self {
        Self { config }
    }

    fn make_fifo(path: &Path) -> Result<()> {
        match mkfifo(path, Mode::from_bits_truncate(0o644)) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::EEXIST) => Ok(()),
            Err(e) => Err(Error::Io {
                what: "mkfifo".to_string(),
                path: path.to_path_buf(),
                source: std::io::Error::from(e),
            }),
        }
    }

    async fn spawn_process(&self, params: &LaunchParams, socket_path: &Path) -> Result<Child> {
        let mut command = match &params.netns {
            Some(ns) => {
                let mut command = Command::new("ip");
                command.arg("netns").arg("exec").arg(ns);
                command.arg(&self.config.firecracker_bin);
                command
            }
            None => Command::new(&self.config.firecracker_bin),
        };
        command
            .arg("--api-sock")
            .arg(socket_path)
            .arg("--id")
            .arg(&params.vm_id)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);

        let mut child = command.spawn().map_err(|source| Error::VmmSpawn {
            vm_id: params.vm_id.clone(),
            source,
        })?;

        // Guest serial console arrives on the VMM's stdout; capture it to
        // console.log for the duration of the process.
        let console_log = params.vm_dir.join(CONSOLE_LOG_NAME);
        if let Some(stdout) = child.stdout.take() {
            pump_to_file(stdout, console_log.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump_to_file(stderr, console_log);
        }

        Ok(child)
    }

    async fn wait_for_socket(
        &self,
        params: &LaunchParams,
        child: &mut Child,
        api: &VmmApiClient,
    ) -> Result<()> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.boot_timeout_ms);
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(Error::VmmSpawn {
                    vm_id: params.vm_id.clone(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("VMM exited during boot: {status}"),
                    ),
                });
            }
            if api.socket_path().exists() && api.instance_info().await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::VmmSocketTimeout {
                    vm_id: params.vm_id.clone(),
                    path: api.socket_path().to_path_buf(),
                    timeout_ms: self.config.boot_timeout_ms,
                });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn configure(&self, params: &LaunchParams, api: &VmmApiClient) -> Result<()> {
        api.put_logger(&LoggerConfig {
            log_path: params.vm_dir.join(VMM_LOG_NAME).to_string_lossy().into_owned(),
            level: "Debug".to_string(),
        })
        .await?;

        api.put_metrics(&MetricsConfig {
            metrics_path: params
                .chroot_root
                .join(METRICS_FIFO_NAME)
                .to_string_lossy()
                .into_owned(),
        })
        .await?;

        api.put_machine_config(&MachineConfig {
            vcpu_count: params.spec.cpu.vcpu_count,
            mem_size_mib: params.spec.memory.size_bytes / (1024 * 1024),
            smt: false,
        })
        .await?;

        let initrd_path = (!params.spec.boot.initrd_path.is_empty()).then(|| {
            let name = Path::new(&params.spec.boot.initrd_path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "initrd.img".to_string());
            params.chroot_root.join(name).to_string_lossy().into_owned()
        });
        api.put_boot_source(&BootSource {
            kernel_image_path: params
                .chroot_root
                .join(KERNEL_IMAGE_NAME)
                .to_string_lossy()
                .into_owned(),
            boot_args: params.kernel_args.clone(),
            initrd_path,
        })
        .await?;

        for (i, disk) in params.spec.storage.iter().enumerate() {
            let is_root = disk.is_root_device || i == 0;
            let drive_id = if disk.id.is_empty() {
                if is_root {
                    "rootfs".to_string()
                } else {
                    format!("drive_{i}")
                }
            } else {
                disk.id.clone()
            };
            // Root devices always use the standardized name that asset
            // preparation creates, not the caller's original path.
            let file_name = if is_root {
                ROOTFS_IMAGE_NAME.to_string()
            } else {
                Path::new(&disk.path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| format!("disk_{i}.img"))
            };
            api.put_drive(&Drive {
                drive_id,
                path_on_host: params.chroot_root.join(file_name).to_string_lossy().into_owned(),
                is_root_device: is_root,
                is_read_only: disk.read_only,
            })
            .await?;
        }

        if let Some(network) = &params.network {
            api.put_network_interface(&NetworkInterface {
                iface_id: "eth0".to_string(),
                host_dev_name: network.tap_device.clone(),
                guest_mac: network.mac.clone(),
            })
            .await?;
        }

        Ok(())
    }
}

fn pump_to_file(mut reader: impl tokio::io::AsyncRead + Unpin + Send + 'static, path: PathBuf) {
    tokio::spawn(async move {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await;
        match file {
            Ok(mut file) => {
                let _ = tokio::io::copy(&mut reader, &mut file).await;
                let _ = file.flush().await;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to open console log");
            }
        }
    });
}

#[async_trait]
impl VmmLauncher for FirecrackerLauncher {
    async fn launch(&self, params: LaunchParams) -> Result<Arc<dyn VmmHandle>> {
        tokio::fs::create_dir_all(&params.vm_dir)
            .await
            .map_err(|source| Error::Io {
                what: "create vm dir".to_string(),
                path: params.vm_dir.clone(),
                source,
            })?;
        tokio::fs::create_dir_all(&params.chroot_root)
            .await
            .map_err(|source| Error::Io {
                what: "create chroot root".to_string(),
                path: params.chroot_root.clone(),
                source,
            })?;

        // FIFOs before the process: the metrics FIFO for the metering
        // collector, the console FIFO for external tailing.
        Self::make_fifo(&params.chroot_root.join(METRICS_FIFO_NAME))?;
        Self::make_fifo(&params.vm_dir.join(CONSOLE_FIFO_NAME))?;

        let socket_path = params.vm_dir.join(VMM_SOCKET_NAME);
        let _ = tokio::fs::remove_file(&socket_path).await;

        tracing::info!(
            vm_id = %params.vm_id,
            socket = %socket_path.display(),
            netns = ?params.netns,
            "starting VMM"
        );
        let api = VmmApiClient::new(&socket_path);
        let mut child = self.spawn_process(&params, &socket_path).await?;

        if let Err(e) = self.wait_for_socket(&params, &mut child, &api).await {
            let _ = child.kill().await;
            return Err(e);
        }

        if let Err(e) = self.configure(&params, &api).await {
            let _ = child.kill().await;
            return Err(e);
        }
        if let Err(e) = api.instance_start().await {
            let _ = child.kill().await;
            return Err(e);
        }

        tracing::info!(vm_id = %params.vm_id, "VMM started and guest executing");
        Ok(Arc::new(Machine {
            vm_id: params.vm_id,
            api,
            child: Mutex::new(Some(child)),
        }))
    }

    async fn reconnect(&self, vm_id: &str, socket_path: &Path) -> Result<Arc<dyn VmmHandle>> {
        if !socket_path.exists() {
            return Err(Error::VmmConnect {
                path: socket_path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "control socket not found - VMM process may have been terminated",
                ),
            });
        }

        tracing::info!(
            vm_id = %vm_id,
            socket_path = %socket_path.display(),
            "connecting to existing VMM socket"
        );
        let api = VmmApiClient::new(socket_path);
        let machine = Machine {
            vm_id: vm_id.to_string(),
            api,
            child: Mutex::new(None),
        };
        machine.ping().await?;

        tracing::info!(vm_id = %vm_id, "reconnected to VMM process");
        Ok(Arc::new(machine))
    }
}

pub mod fake {
    //! Scriptable launcher and handles for engine tests.

    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// State of one fake VMM.
    #[derive(Debug)]
    pub struct FakeVmmHandle {
        /// VM id.
        pub vm_id: String,
        /// `Running` / `Paused` / `Stopped`.
        pub state: Mutex<&'static str>,
        /// Pause call count.
        pub pause_calls: AtomicUsize,
        /// Resume call count.
        pub resume_calls: AtomicUsize,
    }

    #[async_trait]
    impl VmmHandle for FakeVmmHandle {
        async fn pause(&self, _timeout: Duration) -> Result<()> {
            self.pause_calls.fetch_add(1, Ordering::SeqCst);
            *self.state.lock().unwrap() = "Paused";
            Ok(())
        }

        async fn resume(&self) -> Result<()> {
            self.resume_calls.fetch_add(1, Ordering::SeqCst);
            *self.state.lock().unwrap() = "Running";
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            *self.state.lock().unwrap() = "Stopped";
            Ok(())
        }

        async fn ping(&self) -> Result<()> {
            if *self.state.lock().unwrap() == "Stopped" {
                return Err(Error::VmmConnect {
                    path: PathBuf::from("/dev/null"),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "stopped"),
                });
            }
            Ok(())
        }
    }

    /// Launcher tracking fake VMMs by socket path.
    pub struct FakeVmmLauncher {
        handles: Mutex<HashMap<String, Arc<FakeVmmHandle>>>,
        live_sockets: Mutex<HashSet<PathBuf>>,
        launch_count: AtomicUsize,
        fail_next_launch: Mutex<bool>,
    }

    impl FakeVmmLauncher {
        /// Empty launcher.
        pub fn new() -> Self {
            Self {
                handles: Mutex::new(HashMap::new()),
                live_sockets: Mutex::new(HashSet::new()),
                launch_count: AtomicUsize::new(0),
                fail_next_launch: Mutex::new(false),
            }
        }

        /// Make the next launch fail, as a broken VMM binary would.
        pub fn fail_next_launch(&self) {
            *self.fail_next_launch.lock().unwrap() = true;
        }

        /// Total successful launches.
        pub fn launch_count(&self) -> usize {
            self.launch_count.load(Ordering::SeqCst)
        }

        /// The fake handle of a VM.
        pub fn handle(&self, vm_id: &str) -> Option<Arc<FakeVmmHandle>> {
            self.handles.lock().unwrap().get(vm_id).cloned()
        }

        /// Simulate a host restart: every process is gone and every socket
        /// is stale.
        pub fn kill_all(&self) {
            self.live_sockets.lock().unwrap().clear();
            for handle in self.handles.lock().unwrap().values() {
                *handle.state.lock().unwrap() = "Stopped";
            }
        }
    }

    impl Default for FakeVmmLauncher {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl VmmLauncher for FakeVmmLauncher {
        async fn launch(&self, params: LaunchParams) -> Result<Arc<dyn VmmHandle>> {
            if std::mem::take(&mut *self.fail_next_launch.lock().unwrap()) {
                return Err(Error::VmmSpawn {
                    vm_id: params.vm_id,
                    source: std::io::Error::new(std::io::ErrorKind::Other, "scripted failure"),
                });
            }
            let handle = Arc::new(FakeVmmHandle {
                vm_id: params.vm_id.clone(),
                state: Mutex::new("Running"),
                pause_calls: AtomicUsize::new(0),
                resume_calls: AtomicUsize::new(0),
            });
            self.handles
                .lock()
                .unwrap()
                .insert(params.vm_id.clone(), handle.clone());
            self.live_sockets
                .lock()
                .unwrap()
                .insert(params.vm_dir.join(VMM_SOCKET_NAME));
            self.launch_count.fetch_add(1, Ordering::SeqCst);
            Ok(handle)
        }

        async fn reconnect(&self, vm_id: &str, socket_path: &Path) -> Result<Arc<dyn VmmHandle>> {
            if !self.live_sockets.lock().unwrap().contains(socket_path) {
                return Err(Error::VmmConnect {
                    path: socket_path.to_path_buf(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "socket gone"),
                });
            }
            self.handles
                .lock()
                .unwrap()
                .get(vm_id)
                .cloned()
                .map(|handle| handle as Arc<dyn VmmHandle>)
                .ok_or_else(|| Error::VmmConnect {
                    path: socket_path.to_path_buf(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such vm"),
                })
        }
    }
}

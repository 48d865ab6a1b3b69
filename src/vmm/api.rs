//! VMM control API over its Unix-domain socket.
//!
//! Firecracker exposes an HTTP/1.1 API on a per-VM socket. This client
//! keeps no connection state: each call dials the socket, performs one
//! request, and lets the connection drop, which matches how the socket
//! behaves across VMM pauses and service restarts. Deadlines are the
//! caller's job (the engine wraps calls in timeouts).

use std::path::{Path, PathBuf};

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::net::UnixStream;

use crate::error::{self, Error, Result};

/// Boot source configuration.
#[derive(Debug, Clone, Serialize)]
pub struct BootSource {
    /// Kernel image path as the VMM sees it.
    pub kernel_image_path: String,
    /// Composed kernel command line.
    pub boot_args: String,
    /// Optional init ramdisk path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initrd_path: Option<String>,
}

/// One block device.
#[derive(Debug, Clone, Serialize)]
pub struct Drive {
    /// Drive id, unique per VM.
    pub drive_id: String,
    /// Image path as the VMM sees it.
    pub path_on_host: String,
    /// Whether the guest boots from this drive.
    pub is_root_device: bool,
    /// Whether the guest sees the drive read-only.
    pub is_read_only: bool,
}

/// One network interface backed by a TAP device.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkInterface {
    /// Interface id, unique per VM.
    pub iface_id: String,
    /// TAP device the VMM reads and writes frames on.
    pub host_dev_name: String,
    /// Guest MAC address.
    pub guest_mac: String,
}

/// Machine shape.
#[derive(Debug, Clone, Serialize)]
pub struct MachineConfig {
    /// Number of vCPUs.
    pub vcpu_count: u32,
    /// Guest memory in MiB.
    pub mem_size_mib: u64,
    /// Simultaneous multithreading.
    pub smt: bool,
}

/// Metrics sink configuration.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsConfig {
    /// Path of the metrics FIFO.
    pub metrics_path: String,
}

/// VMM logger configuration.
#[derive(Debug, Clone, Serialize)]
pub struct LoggerConfig {
    /// Path of the VMM's own log file.
    pub log_path: String,
    /// Log level.
    pub level: String,
}

#[derive(Debug, Clone, Serialize)]
struct ActionBody {
    action_type: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct VmStateBody {
    state: &'static str,
}

/// Instance description returned by `GET /`.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceInfo {
    /// VMM-assigned instance id.
    #[serde(default)]
    pub id: String,
    /// Instance state (`Not started`, `Running`, `Paused`).
    pub state: String,
    /// VMM version string.
    #[serde(default)]
    pub vmm_version: String,
}

/// One VMM's API client.
#[derive(Debug, Clone)]
pub struct VmmApiClient {
    socket_path: PathBuf,
}

impl VmmApiClient {
    /// Client for the VMM listening on `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// The control socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Configure the boot source.
    pub async fn put_boot_source(&self, boot: &BootSource) -> Result<()> {
        self.put("/boot-source", boot).await
    }

    /// Configure a drive.
    pub async fn put_drive(&self, drive: &Drive) -> Result<()> {
        self.put(&format!("/drives/{}", drive.drive_id), drive).await
    }

    /// Configure a network interface.
    pub async fn put_network_interface(&self, iface: &NetworkInterface) -> Result<()> {
        self.put(&format!("/network-interfaces/{}", iface.iface_id), iface)
            .await
    }

    /// Configure the machine shape.
    pub async fn put_machine_config(&self, config: &MachineConfig) -> Result<()> {
        self.put("/machine-config", config).await
    }

    /// Configure the metrics FIFO.
    pub async fn put_metrics(&self, metrics: &MetricsConfig) -> Result<()> {
        self.put("/metrics", metrics).await
    }

    /// Configure the VMM logger.
    pub async fn put_logger(&self, logger: &LoggerConfig) -> Result<()> {
        self.put("/logger", logger).await
    }

    /// Start guest execution.
    pub async fn instance_start(&self) -> Result<()> {
        self.put(
            "/actions",
            &ActionBody {
                action_type: "InstanceStart",
            },
        )
        .await
    }

    /// Ask the guest to shut down via Ctrl-Alt-Del.
    pub async fn send_ctrl_alt_del(&self) -> Result<()> {
        self.put(
            "/actions",
            &ActionBody {
                action_type: "SendCtrlAltDel",
            },
        )
        .await
    }

    /// Pause the guest's vCPUs. The process and socket survive.
    pub async fn pause(&self) -> Result<()> {
        self.patch("/vm", &VmStateBody { state: "Paused" }).await
    }

    /// Resume a paused guest.
    pub async fn resume(&self) -> Result<()> {
        self.patch("/vm", &VmStateBody { state: "Resumed" }).await
    }

    /// Describe the instance; doubles as a liveness probe for the socket.
    pub async fn instance_info(&self) -> Result<InstanceInfo> {
        let (status, body) = self.request(Method::GET, "/", None).await?;
        if !status.is_success() {
            return Err(Error::VmmApi {
                method: "GET".to_string(),
                uri: "/".to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        serde_json::from_slice(&body).map_err(|e| Error::VmmApi {
            method: "GET".to_string(),
            uri: "/".to_string(),
            status: status.as_u16(),
            body: format!("unparseable instance info: {e}"),
        })
    }

    async fn put<T: Serialize>(&self, uri: &str, body: &T) -> Result<()> {
        self.send_json(Method::PUT, uri, body).await
    }

    async fn patch<T: Serialize>(&self, uri: &str, body: &T) -> Result<()> {
        self.send_json(Method::PATCH, uri, body).await
    }

    async fn send_json<T: Serialize>(&self, method: Method, uri: &str, body: &T) -> Result<()> {
        let payload = serde_json::to_vec(body).map_err(|e| Error::VmmApi {
            method: method.to_string(),
            uri: uri.to_string(),
            status: 0,
            body: format!("failed to serialize request: {e}"),
        })?;
        let (status, response) = self.request(method.clone(), uri, Some(payload)).await?;
        if !status.is_success() {
            return Err(Error::VmmApi {
                method: method.to_string(),
                uri: uri.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&response).into_owned(),
            });
        }
        Ok(())
    }

    async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Bytes)> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .context(error::VmmConnectSnafu {
                path: self.socket_path.clone(),
            })?;
        let io = TokioIo::new(stream);
        let (mut sender, connection) = hyper::client::conn::http1::handshake(io)
            .await
            .context(error::VmmHttpSnafu)?;
        tokio::spawn(async move {
            let _ = connection.await;
        });

        let request = Request::builder()
            .method(method.clone())
            .uri(uri)
            .header("Host", "localhost")
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| Error::VmmApi {
                method: method.to_string(),
                uri: uri.to_string(),
                status: 0,
                body: format!("failed to build request: {e}"),
            })?;

        let response = sender
            .send_request(request)
            .await
            .context(error::VmmHttpSnafu)?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .context(error::VmmHttpSnafu)?
            .to_bytes();
        Ok((status, bytes))
    }
}

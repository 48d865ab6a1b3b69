//! Metrics FIFO reader.
//!
//! The VMM writes a continuous stream of JSON objects to the per-VM
//! metrics FIFO. A reader that opens the FIFO late can land mid-object, so
//! decoding retries a few times on syntax errors. The whole read is bounded
//! by a wall-clock timeout; a silent stream yields a zero-valued snapshot,
//! never an error, because the VM may simply be starting up.

use std::path::Path;

use chrono::Utc;
use serde::Deserialize;

use crate::constants::{METRICS_DECODE_ATTEMPTS, METRICS_READ_TIMEOUT_MS};
use crate::vmm::types::VmMetricsSnapshot;

#[derive(Debug, Default, Deserialize)]
struct RawMetrics {
    #[serde(default)]
    block: Vec<RawBlockMetrics>,
    #[serde(default)]
    net: Vec<RawNetMetrics>,
}

#[derive(Debug, Default, Deserialize)]
struct RawBlockMetrics {
    #[serde(default)]
    read_bytes: i64,
    #[serde(default)]
    write_bytes: i64,
}

#[derive(Debug, Default, Deserialize)]
struct RawNetMetrics {
    #[serde(default)]
    rx_bytes: i64,
    #[serde(default)]
    tx_bytes: i64,
}

fn zero_snapshot() -> VmMetricsSnapshot {
    VmMetricsSnapshot {
        timestamp: Utc::now().timestamp(),
        ..VmMetricsSnapshot::default()
    }
}

fn aggregate(raw: RawMetrics) -> VmMetricsSnapshot {
    let mut snapshot = zero_snapshot();
    for block in &raw.block {
        snapshot.disk_read_bytes += block.read_bytes;
        snapshot.disk_write_bytes += block.write_bytes;
    }
    for net in &raw.net {
        snapshot.network_rx_bytes += net.rx_bytes;
        snapshot.network_tx_bytes += net.tx_bytes;
    }
    snapshot
}

fn decode_stream(mut reader: impl std::io::Read) -> Option<RawMetrics> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(metrics) = try_decode(&buf) {
            return Some(metrics);
        }
        if buf.len() > 1 << 20 {
            break;
        }
    }
    try_decode(&buf)
}

/// Try to decode one complete metrics object from the buffer. The writer
/// may have been mid-object when the FIFO was opened, so decoding starts at
/// each top-level `{` (one at the start of the buffer or following a `}`)
/// for a bounded number of attempts.
fn try_decode(buf: &[u8]) -> Option<RawMetrics> {
    let mut attempts = 0;
    let mut prev_significant: Option<u8> = None;
    for (i, byte) in buf.iter().enumerate() {
        if *byte == b'{' && matches!(prev_significant, None | Some(b'}')) {
            if attempts >= METRICS_DECODE_ATTEMPTS {
                break;
            }
            attempts += 1;
            let mut stream =
                serde_json::Deserializer::from_slice(&buf[i..]).into_iter::<RawMetrics>();
            if let Some(Ok(metrics)) = stream.next() {
                return Some(metrics);
            }
        }
        if !byte.is_ascii_whitespace() {
            prev_significant = Some(*byte);
        }
    }
    None
}

/// Read one metrics snapshot for a VM from its FIFO. Timeouts and decode
/// failures return zeros.
pub async fn read_snapshot(vm_id: &str, fifo_path: &Path) -> VmMetricsSnapshot {
    let path = fifo_path.to_path_buf();
    let read_task = tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path).ok()?;
        decode_stream(file)
    });

    let timeout = std::time::Duration::from_millis(METRICS_READ_TIMEOUT_MS);
    match tokio::time::timeout(timeout, read_task).await {
        Ok(Ok(Some(raw))) => {
            let snapshot = aggregate(raw);
            tracing::debug!(
                vm_id = %vm_id,
                disk_read_bytes = snapshot.disk_read_bytes,
                disk_write_bytes = snapshot.disk_write_bytes,
                network_rx_bytes = snapshot.network_rx_bytes,
                network_tx_bytes = snapshot.network_tx_bytes,
                "read VMM metrics"
            );
            snapshot
        }
        Ok(Ok(None)) => {
            tracing::warn!(vm_id = %vm_id, fifo_path = %fifo_path.display(), "failed to decode metrics stream");
            zero_snapshot()
        }
        Ok(Err(e)) => {
            tracing::warn!(vm_id = %vm_id, error = %e, "metrics read task failed");
            zero_snapshot()
        }
        Err(_) => {
            // The blocking reader may stay parked on the FIFO until a writer
            // appears; it holds no locks and exits with the process.
            tracing::debug!(vm_id = %vm_id, "timeout reading metrics FIFO");
            zero_snapshot()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn aggregates_block_and_net_counters() {
        let raw: RawMetrics = serde_json::from_str(
            r#"{
                "vcpu": [{"exit_reasons": {"io": 5}}],
                "block": [
                    {"read_bytes": 100, "write_bytes": 50, "read_count": 3, "write_count": 1},
                    {"read_bytes": 10, "write_bytes": 5}
                ],
                "net": [{"rx_bytes": 7, "tx_bytes": 9, "rx_packets": 1, "tx_packets": 2}]
            }"#,
        )
        .unwrap();
        let snapshot = aggregate(raw);
        assert_eq!(snapshot.disk_read_bytes, 110);
        assert_eq!(snapshot.disk_write_bytes, 55);
        assert_eq!(snapshot.network_rx_bytes, 7);
        assert_eq!(snapshot.network_tx_bytes, 9);
    }

    #[test]
    fn decoder_skips_mid_object_garbage() {
        // Simulates opening the FIFO mid-object: a truncated tail followed
        // by complete objects.
        let data = br#"bytes": 1} {"block": [{"read_bytes": 42, "write_bytes": 0}], "net": []}"#;
        let raw = decode_stream(&data[..]).expect("recovers after broken prefix");
        assert_eq!(raw.block[0].read_bytes, 42);
    }

    #[test]
    fn empty_stream_yields_none() {
        assert!(decode_stream(&b""[..]).is_none());
    }

    #[tokio::test]
    async fn missing_fifo_returns_zeros() {
        let dir = TempDir::new().unwrap();
        let snapshot = read_snapshot("ud-1", &dir.path().join("metrics.fifo")).await;
        assert_eq!(snapshot.disk_read_bytes, 0);
        assert_eq!(snapshot.network_rx_bytes, 0);
        assert!(snapshot.timestamp > 0);
    }

    #[tokio::test]
    async fn regular_file_with_stream_is_read() {
        // A regular file stands in for the FIFO: same read path.
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.fifo");
        std::fs::write(
            &path,
            r#"{"block": [{"read_bytes": 5, "write_bytes": 6}], "net": [{"rx_bytes": 1, "tx_bytes": 2}]}"#,
        )
        .unwrap();
        let snapshot = read_snapshot("ud-1", &path).await;
        assert_eq!(snapshot.disk_read_bytes, 5);
        assert_eq!(snapshot.network_tx_bytes, 2);
    }
}

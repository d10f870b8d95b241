//! Dissector boundary
//!
//! The protocol dissector is an external tool (tshark). This module owns
//! the subprocess call and turns its JSON output into an ordered stream of
//! `PacketRecord`s. Everything below the packet-record level is opaque to
//! the rest of the pipeline.

use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};

/// One packet as produced by the dissector. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketRecord {
    /// Epoch seconds, fractional
    pub timestamp: f64,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: String,
    /// Frame length in bytes
    pub length: u64,
}

#[derive(Debug)]
pub enum DissectError {
    /// tshark is not on PATH
    ToolMissing(String),
    /// tshark ran but exited non-zero
    ToolFailed(String),
    /// tshark output was not the JSON we expect
    Malformed(String),
}

impl std::fmt::Display for DissectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ToolMissing(e) => write!(f, "dissector not found: {}", e),
            Self::ToolFailed(e) => write!(f, "dissector failed: {}", e),
            Self::Malformed(e) => write!(f, "dissector output malformed: {}", e),
        }
    }
}

impl std::error::Error for DissectError {}

/// Check that the dissector tool is runnable. Called once at startup;
/// a missing dissector is fatal for the whole process.
pub fn check_available() -> Result<(), DissectError> {
    Command::new("tshark")
        .arg("--version")
        .output()
        .map(|_| ())
        .map_err(|e| DissectError::ToolMissing(e.to_string()))
}

/// Dissect one capture file into time-ordered packet records.
pub fn dissect_file(path: &Path) -> Result<Vec<PacketRecord>, DissectError> {
    let output = Command::new("tshark")
        .arg("-r")
        .arg(path)
        .args(["-T", "json"])
        .output()
        .map_err(|e| DissectError::ToolMissing(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DissectError::ToolFailed(stderr.trim().to_string()));
    }

    let frames: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout)
        .map_err(|e| DissectError::Malformed(e.to_string()))?;

    let mut packets: Vec<PacketRecord> = frames
        .iter()
        .filter_map(extract_packet)
        .collect();

    // tshark emits frames in capture order already; sorting keeps the
    // session builder's ordering contract independent of that.
    packets.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));

    log::debug!("dissected {} packets from {}", packets.len(), path.display());
    Ok(packets)
}

/// Pull the fields the pipeline cares about out of one tshark frame.
/// Frames without an IP layer are dropped.
fn extract_packet(frame: &serde_json::Value) -> Option<PacketRecord> {
    let layers = frame.get("_source")?.get("layers")?;

    let frame_layer = layers.get("frame")?;
    let timestamp = frame_layer
        .get("frame.time_epoch")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<f64>().ok())?;
    let length = frame_layer
        .get("frame.len")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    let ip = layers.get("ip")?;
    let src_ip = ip.get("ip.src")?.as_str()?.to_string();
    let dst_ip = ip.get("ip.dst")?.as_str()?.to_string();

    let (protocol, src_port, dst_port) = if let Some(tcp) = layers.get("tcp") {
        ("tcp", port_of(tcp, "tcp.srcport"), port_of(tcp, "tcp.dstport"))
    } else if let Some(udp) = layers.get("udp") {
        ("udp", port_of(udp, "udp.srcport"), port_of(udp, "udp.dstport"))
    } else {
        ("ip", 0, 0)
    };

    Some(PacketRecord {
        timestamp,
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        protocol: protocol.to_string(),
        length,
    })
}

fn port_of(layer: &serde_json::Value, field: &str) -> u16 {
    layer
        .get(field)
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

//! Session aggregation
//!
//! Folds a time-ordered packet stream into session records keyed by the
//! 5-tuple, and tracks per-source destination diversity over a trailing
//! time window. Output order is first-seen order, so repeated runs over
//! the same capture produce identical files.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::logic::dissect::PacketRecord;

/// Session grouping key: (src_ip, dst_ip, src_port, dst_port, protocol)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: String,
}

impl SessionKey {
    fn of(packet: &PacketRecord) -> Self {
        Self {
            src_ip: packet.src_ip.clone(),
            dst_ip: packet.dst_ip.clone(),
            src_port: packet.src_port,
            dst_port: packet.dst_port,
            protocol: packet.protocol.clone(),
        }
    }
}

/// Aggregated view of all packets sharing a 5-tuple within one capture file.
/// Finalized once the packet stream ends; never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// last_seen - first_seen, seconds, always >= 0
    pub duration: f64,
    pub total_bytes: u64,
    pub packet_count: u64,
    /// Rate over the session lifetime. A zero-duration session (single
    /// packet, or identical timestamps) reports its packet count as the
    /// rate, so the field is always defined.
    pub packets_per_second: f64,
    /// Distinct destinations the source contacted within the trailing
    /// window ending at this session's last_seen
    pub unique_destination_count: u64,
}

/// Time-bounded multiset of (timestamp, destination) pairs for one source.
///
/// Entries are kept in insertion order (the packet stream is time-ordered)
/// and evicted lazily: inserts and queries prune everything older than the
/// window trailing the newest timestamp seen.
#[derive(Debug)]
pub struct DestinationWindow {
    window_secs: f64,
    entries: Vec<(f64, String)>,
}

impl DestinationWindow {
    pub fn new(window_secs: f64) -> Self {
        Self {
            window_secs,
            entries: Vec::new(),
        }
    }

    /// Record a contacted destination and evict entries older than the
    /// window relative to `ts`.
    pub fn insert(&mut self, ts: f64, destination: &str) {
        self.entries.push((ts, destination.to_string()));
        self.prune(ts);
    }

    /// Distinct destinations contacted within (end - window, end].
    pub fn unique_within(&mut self, end: f64) -> u64 {
        self.prune(self.newest().unwrap_or(end));
        let start = end - self.window_secs;
        let mut seen: Vec<&str> = self
            .entries
            .iter()
            .filter(|(ts, _)| *ts > start && *ts <= end)
            .map(|(_, dst)| dst.as_str())
            .collect();
        seen.sort_unstable();
        seen.dedup();
        seen.len() as u64
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn newest(&self) -> Option<f64> {
        self.entries.last().map(|(ts, _)| *ts)
    }

    fn prune(&mut self, now: f64) {
        let cutoff = now - self.window_secs;
        self.entries.retain(|(ts, _)| *ts > cutoff);
    }
}

/// Running aggregate for one session while packets are still arriving.
struct SessionAccum {
    first_seen: f64,
    last_seen: f64,
    total_bytes: u64,
    packet_count: u64,
}

/// Folds packet records into finalized sessions.
pub struct SessionBuilder {
    diversity_window_secs: f64,
    order: Vec<SessionKey>,
    sessions: HashMap<SessionKey, SessionAccum>,
    windows: HashMap<String, DestinationWindow>,
}

impl SessionBuilder {
    pub fn new(diversity_window_secs: f64) -> Self {
        Self {
            diversity_window_secs,
            order: Vec::new(),
            sessions: HashMap::new(),
            windows: HashMap::new(),
        }
    }

    /// Fold one packet into its session and the source's diversity window.
    pub fn push(&mut self, packet: &PacketRecord) {
        let key = SessionKey::of(packet);

        match self.sessions.get_mut(&key) {
            Some(accum) => {
                accum.last_seen = accum.last_seen.max(packet.timestamp);
                accum.total_bytes += packet.length;
                accum.packet_count += 1;
            }
            None => {
                self.sessions.insert(
                    key.clone(),
                    SessionAccum {
                        first_seen: packet.timestamp,
                        last_seen: packet.timestamp,
                        total_bytes: packet.length,
                        packet_count: 1,
                    },
                );
                self.order.push(key.clone());
            }
        }

        self.windows
            .entry(packet.src_ip.clone())
            .or_insert_with(|| DestinationWindow::new(self.diversity_window_secs))
            .insert(packet.timestamp, &packet.dst_ip);
    }

    /// Finalize all sessions in first-seen order.
    pub fn finish(mut self) -> Vec<SessionRecord> {
        let mut records = Vec::with_capacity(self.order.len());

        for key in &self.order {
            let accum = match self.sessions.remove(key) {
                Some(a) => a,
                None => continue,
            };

            let duration = (accum.last_seen - accum.first_seen).max(0.0);
            let packets_per_second = if duration > 0.0 {
                accum.packet_count as f64 / duration
            } else {
                accum.packet_count as f64
            };

            let unique_destination_count = self
                .windows
                .get_mut(&key.src_ip)
                .map(|w| w.unique_within(accum.last_seen))
                .unwrap_or(0);

            records.push(SessionRecord {
                src_ip: key.src_ip.clone(),
                dst_ip: key.dst_ip.clone(),
                src_port: key.src_port,
                dst_port: key.dst_port,
                protocol: key.protocol.clone(),
                first_seen: epoch_to_datetime(accum.first_seen),
                last_seen: epoch_to_datetime(accum.last_seen),
                duration,
                total_bytes: accum.total_bytes,
                packet_count: accum.packet_count,
                packets_per_second,
                unique_destination_count,
            });
        }

        records
    }
}

/// Build sessions from a time-ordered packet stream. Empty input yields
/// an empty output, not an error.
pub fn build_sessions(packets: &[PacketRecord], diversity_window_secs: f64) -> Vec<SessionRecord> {
    let mut builder = SessionBuilder::new(diversity_window_secs);
    for packet in packets {
        builder.push(packet);
    }
    builder.finish()
}

fn epoch_to_datetime(epoch: f64) -> DateTime<Utc> {
    let secs = epoch.floor() as i64;
    let nanos = ((epoch - epoch.floor()) * 1e9).round() as u32;
    DateTime::from_timestamp(secs, nanos.min(999_999_999)).unwrap_or_default()
}

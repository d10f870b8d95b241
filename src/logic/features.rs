//! Feature Layout - Centralized Feature Definition
//!
//! The model artifact is versioned implicitly by the feature set it was
//! trained on. This module is the single source of truth for that set:
//! order, names, and the layout hash embedded in every artifact.
//!
//! Rules: add, remove, or reorder a feature -> increment FEATURE_VERSION.

use crc32fast::Hasher;

use crate::logic::session::SessionRecord;

/// Current feature layout version
pub const FEATURE_VERSION: u8 = 1;

/// Feature names in the exact order they appear in the vector
pub const FEATURE_LAYOUT: &[&str] = &[
    "duration",
    "total_bytes",
    "packet_count",
    "packets_per_second",
    "unique_destination_count",
];

/// Total number of features. Must match FEATURE_LAYOUT.len().
pub const FEATURE_COUNT: usize = 5;

/// Compute the CRC32 hash of the feature layout. Used to detect
/// artifact/session schema drift at scoring time.
pub fn layout_hash() -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&[FEATURE_VERSION]);
    for name in FEATURE_LAYOUT {
        hasher.update(name.as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize()
}

/// Check whether an artifact's layout matches the current one.
pub fn is_layout_compatible(version: u8, hash: u32) -> bool {
    version == FEATURE_VERSION && hash == layout_hash()
}

/// Extract the numeric feature vector of a session, in layout order.
pub fn feature_vector(session: &SessionRecord) -> [f64; FEATURE_COUNT] {
    [
        session.duration,
        session.total_bytes as f64,
        session.packet_count as f64,
        session.packets_per_second,
        session.unique_destination_count as f64,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn session() -> SessionRecord {
        SessionRecord {
            src_ip: "10.0.0.1".to_string(),
            dst_ip: "10.0.0.2".to_string(),
            src_port: 4000,
            dst_port: 80,
            protocol: "tcp".to_string(),
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            duration: 2.0,
            total_bytes: 300,
            packet_count: 2,
            packets_per_second: 1.0,
            unique_destination_count: 5,
        }
    }

    #[test]
    fn test_feature_count_matches_layout() {
        assert_eq!(FEATURE_LAYOUT.len(), FEATURE_COUNT);
    }

    #[test]
    fn test_layout_hash_stable_and_nonzero() {
        assert_eq!(layout_hash(), layout_hash());
        assert_ne!(layout_hash(), 0);
    }

    #[test]
    fn test_layout_compatibility() {
        assert!(is_layout_compatible(FEATURE_VERSION, layout_hash()));
        assert!(!is_layout_compatible(FEATURE_VERSION + 1, layout_hash()));
        assert!(!is_layout_compatible(FEATURE_VERSION, layout_hash() ^ 1));
    }

    #[test]
    fn test_feature_vector_order() {
        let v = feature_vector(&session());
        assert_eq!(v, [2.0, 300.0, 2.0, 1.0, 5.0]);
    }
}

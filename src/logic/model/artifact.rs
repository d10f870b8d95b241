//! Model artifact
//!
//! One persisted JSON blob bundling everything a Score call needs:
//! normalization parameters, the trained forest, the decision threshold
//! and the calibration range the [0,1] score mapping is anchored to.
//! Read-only during scoring; written only by training.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::logic::features::{FEATURE_COUNT, FEATURE_LAYOUT, FEATURE_VERSION};
use crate::logic::model::forest::IsolationForest;

/// Per-feature normalization parameters fitted at training time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizationParams {
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
}

impl NormalizationParams {
    /// Z-score one feature vector. The std floor keeps constant features
    /// from producing a division fault.
    pub fn normalize(&self, features: &[f64; FEATURE_COUNT]) -> [f64; FEATURE_COUNT] {
        let mut out = [0.0; FEATURE_COUNT];
        for i in 0..FEATURE_COUNT {
            let mean = self.means.get(i).copied().unwrap_or(0.0);
            let std = self.stds.get(i).copied().unwrap_or(1.0).max(1e-8);
            out[i] = (features[i] - mean) / std;
        }
        out
    }
}

/// Persisted bundle of normalization parameters and the trained model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    /// Feature layout the artifact was trained on
    pub feature_version: u8,
    pub layout_hash: u32,
    pub feature_names: Vec<String>,
    pub normalization: NormalizationParams,
    pub forest: IsolationForest,
    /// Decision value at the (1 - contamination) quantile of the training set
    pub threshold: f64,
    /// Range of training decision values; anchors the [0,1] score mapping
    pub calibration_min: f64,
    pub calibration_max: f64,
    pub contamination: f64,
    pub trained_at: DateTime<Utc>,
}

impl ModelArtifact {
    pub fn new(
        normalization: NormalizationParams,
        forest: IsolationForest,
        threshold: f64,
        calibration_min: f64,
        calibration_max: f64,
        contamination: f64,
    ) -> Self {
        Self {
            feature_version: FEATURE_VERSION,
            layout_hash: crate::logic::features::layout_hash(),
            feature_names: FEATURE_LAYOUT.iter().map(|s| s.to_string()).collect(),
            normalization,
            forest,
            threshold,
            calibration_min,
            calibration_max,
            contamination,
            trained_at: Utc::now(),
        }
    }

    /// Map a raw decision value onto [0,1] using the frozen calibration
    /// range. Monotonic; values outside the training range clamp.
    pub fn calibrated_score(&self, decision: f64) -> f64 {
        let range = self.calibration_max - self.calibration_min;
        if range <= 0.0 {
            return 0.0;
        }
        ((decision - self.calibration_min) / range).clamp(0.0, 1.0)
    }

    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ArtifactError::Io(e.to_string()))?;
        }
        let json = serde_json::to_string(self).map_err(|e| ArtifactError::Encode(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| ArtifactError::Io(e.to_string()))?;
        log::info!("model artifact saved to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ArtifactError::Io(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| ArtifactError::Decode(e.to_string()))
    }
}

#[derive(Debug)]
pub enum ArtifactError {
    Io(String),
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for ArtifactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "artifact I/O error: {}", e),
            Self::Encode(e) => write!(f, "artifact encode error: {}", e),
            Self::Decode(e) => write!(f, "artifact decode error: {}", e),
        }
    }
}

impl std::error::Error for ArtifactError {}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn artifact() -> ModelArtifact {
        let data = Array2::from_shape_vec((16, FEATURE_COUNT), vec![0.5; 16 * FEATURE_COUNT])
            .unwrap();
        let forest = IsolationForest::fit(&data, 10, 42);
        ModelArtifact::new(
            NormalizationParams {
                means: vec![0.0; FEATURE_COUNT],
                stds: vec![1.0; FEATURE_COUNT],
            },
            forest,
            0.6,
            0.2,
            0.8,
            0.1,
        )
    }

    #[test]
    fn test_calibrated_score_clamps() {
        let a = artifact();
        assert_eq!(a.calibrated_score(0.1), 0.0);
        assert_eq!(a.calibrated_score(0.9), 1.0);
        assert!((a.calibrated_score(0.5) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_uses_std_floor() {
        let params = NormalizationParams {
            means: vec![1.0; FEATURE_COUNT],
            stds: vec![0.0; FEATURE_COUNT],
        };
        let out = params.normalize(&[1.0; FEATURE_COUNT]);
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");

        let a = artifact();
        a.save(&path).unwrap();
        let b = ModelArtifact::load(&path).unwrap();

        assert_eq!(a.layout_hash, b.layout_hash);
        assert_eq!(a.threshold, b.threshold);
        assert_eq!(a.feature_names, b.feature_names);
    }
}

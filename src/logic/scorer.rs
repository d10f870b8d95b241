//! Anomaly scoring
//!
//! Two operations against a shared artifact: `train` fits the
//! normalization parameters and the outlier model, `score` applies them.
//! Score is a pure function of (sessions, artifact) - identical inputs
//! always produce identical outputs, because the calibration range the
//! [0,1] mapping uses is frozen into the artifact at training time.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::constants::MIN_TRAINING_SESSIONS;
use crate::logic::features::{self, FEATURE_COUNT};
use crate::logic::model::forest::{IsolationForest, DEFAULT_TREES};
use crate::logic::model::{artifact::NormalizationParams, ModelArtifact};
use crate::logic::session::SessionRecord;

/// Seed for the forest RNG; fixed for reproducible training runs.
const TRAIN_SEED: u64 = 42;

/// A session plus its anomaly verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredSession {
    #[serde(flatten)]
    pub session: SessionRecord,
    /// Normalized [0,1]; higher means more unusual
    pub anomaly_score: f64,
    /// 1 iff the raw decision value crossed the model threshold
    pub is_anomaly: u8,
}

#[derive(Debug)]
pub enum ScorerError {
    /// Too few sessions to train on
    InsufficientData { got: usize, need: usize },
    /// Artifact and session feature sets have drifted apart
    SchemaMismatch(String),
}

impl std::fmt::Display for ScorerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientData { got, need } => {
                write!(f, "insufficient training data: {} sessions, need {}", got, need)
            }
            Self::SchemaMismatch(e) => write!(f, "feature schema mismatch: {}", e),
        }
    }
}

impl std::error::Error for ScorerError {}

/// Fit normalization parameters and the outlier model on `sessions`.
///
/// `contamination` is the expected anomalous fraction; it sets the
/// decision threshold at the matching quantile of the training scores.
pub fn train(sessions: &[SessionRecord], contamination: f64) -> Result<ModelArtifact, ScorerError> {
    if sessions.len() < MIN_TRAINING_SESSIONS {
        return Err(ScorerError::InsufficientData {
            got: sessions.len(),
            need: MIN_TRAINING_SESSIONS,
        });
    }

    let matrix = feature_matrix(sessions)?;
    let normalization = fit_normalization(&matrix);
    let normalized = normalize_matrix(&matrix, &normalization);

    log::info!(
        "training outlier model on {} sessions (contamination {:.2})",
        sessions.len(),
        contamination
    );
    let forest = IsolationForest::fit(&normalized, DEFAULT_TREES, TRAIN_SEED);

    let mut decisions: Vec<f64> = (0..normalized.nrows())
        .map(|i| forest.decision(&normalized.row(i).to_vec()))
        .collect();

    let calibration_min = decisions.iter().copied().fold(f64::INFINITY, f64::min);
    let calibration_max = decisions.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    decisions.sort_by(|a, b| a.total_cmp(b));
    let cut = (((1.0 - contamination) * decisions.len() as f64).floor() as usize)
        .min(decisions.len() - 1);
    let threshold = decisions[cut];

    let flagged = decisions.iter().filter(|&&d| d >= threshold).count();
    log::info!(
        "model trained: threshold {:.4}, {} of {} training sessions flagged ({:.1}%)",
        threshold,
        flagged,
        decisions.len(),
        100.0 * flagged as f64 / decisions.len() as f64
    );

    Ok(ModelArtifact::new(
        normalization,
        forest,
        threshold,
        calibration_min,
        calibration_max,
        contamination,
    ))
}

/// Score sessions against a trained artifact. Pure and deterministic.
pub fn score(
    sessions: &[SessionRecord],
    artifact: &ModelArtifact,
) -> Result<Vec<ScoredSession>, ScorerError> {
    if !features::is_layout_compatible(artifact.feature_version, artifact.layout_hash) {
        return Err(ScorerError::SchemaMismatch(format!(
            "artifact trained on layout v{} (hash {:08x}), current is v{} (hash {:08x})",
            artifact.feature_version,
            artifact.layout_hash,
            features::FEATURE_VERSION,
            features::layout_hash(),
        )));
    }

    let mut scored = Vec::with_capacity(sessions.len());
    for session in sessions {
        let vector = checked_features(session)?;
        let normalized = artifact.normalization.normalize(&vector);
        let decision = artifact.forest.decision(&normalized);

        scored.push(ScoredSession {
            session: session.clone(),
            anomaly_score: artifact.calibrated_score(decision),
            is_anomaly: u8::from(decision >= artifact.threshold),
        });
    }

    Ok(scored)
}

fn checked_features(session: &SessionRecord) -> Result<[f64; FEATURE_COUNT], ScorerError> {
    let vector = features::feature_vector(session);
    for (i, v) in vector.iter().enumerate() {
        if !v.is_finite() {
            return Err(ScorerError::SchemaMismatch(format!(
                "feature '{}' is not finite for session {}:{} -> {}:{}",
                features::FEATURE_LAYOUT[i],
                session.src_ip,
                session.src_port,
                session.dst_ip,
                session.dst_port,
            )));
        }
    }
    Ok(vector)
}

fn feature_matrix(sessions: &[SessionRecord]) -> Result<Array2<f64>, ScorerError> {
    let mut data = Vec::with_capacity(sessions.len() * FEATURE_COUNT);
    for session in sessions {
        data.extend_from_slice(&checked_features(session)?);
    }
    Array2::from_shape_vec((sessions.len(), FEATURE_COUNT), data)
        .map_err(|e| ScorerError::SchemaMismatch(e.to_string()))
}

fn fit_normalization(matrix: &Array2<f64>) -> NormalizationParams {
    let n = matrix.nrows() as f64;
    let mut means = Vec::with_capacity(FEATURE_COUNT);
    let mut stds = Vec::with_capacity(FEATURE_COUNT);

    for col in matrix.columns() {
        let mean = col.sum() / n;
        let variance = col.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        means.push(mean);
        stds.push(variance.sqrt());
    }

    NormalizationParams { means, stds }
}

fn normalize_matrix(matrix: &Array2<f64>, params: &NormalizationParams) -> Array2<f64> {
    let mut out = matrix.clone();
    for (j, mut col) in out.columns_mut().into_iter().enumerate() {
        let mean = params.means[j];
        let std = params.stds[j].max(1e-8);
        col.mapv_inplace(|v| (v - mean) / std);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn session(duration: f64, bytes: u64, count: u64, dests: u64) -> SessionRecord {
        let pps = if duration > 0.0 {
            count as f64 / duration
        } else {
            count as f64
        };
        SessionRecord {
            src_ip: "10.0.0.1".to_string(),
            dst_ip: "10.0.0.2".to_string(),
            src_port: 4000,
            dst_port: 80,
            protocol: "tcp".to_string(),
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            duration,
            total_bytes: bytes,
            packet_count: count,
            packets_per_second: pps,
            unique_destination_count: dests,
        }
    }

    /// 90 unremarkable sessions plus 10 loud ones.
    fn training_set() -> Vec<SessionRecord> {
        let mut sessions = Vec::new();
        for i in 0..90 {
            sessions.push(session(
                1.0 + (i % 10) as f64 * 0.1,
                1_000 + (i % 7) as u64 * 50,
                10 + (i % 5) as u64,
                1 + (i % 3) as u64,
            ));
        }
        for i in 0..10 {
            sessions.push(session(0.0, 5_000_000 + i * 100_000, 90_000, 200));
        }
        sessions
    }

    #[test]
    fn test_insufficient_data() {
        let sessions = vec![session(1.0, 100, 1, 1); 3];
        match train(&sessions, 0.1) {
            Err(ScorerError::InsufficientData { got: 3, .. }) => {}
            other => panic!("expected InsufficientData, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_train_flags_roughly_contamination_fraction() {
        let sessions = training_set();
        let artifact = train(&sessions, 0.1).unwrap();
        let scored = score(&sessions, &artifact).unwrap();

        let flagged = scored.iter().filter(|s| s.is_anomaly == 1).count();
        assert!(
            (5..=20).contains(&flagged),
            "expected ~10 flagged out of 100, got {}",
            flagged
        );
    }

    #[test]
    fn test_outliers_score_higher() {
        let sessions = training_set();
        let artifact = train(&sessions, 0.1).unwrap();
        let scored = score(&sessions, &artifact).unwrap();

        let max_normal = scored[..90]
            .iter()
            .map(|s| s.anomaly_score)
            .fold(0.0, f64::max);
        let min_loud = scored[90..]
            .iter()
            .map(|s| s.anomaly_score)
            .fold(1.0, f64::min);
        assert!(min_loud > max_normal);
    }

    #[test]
    fn test_score_range_invariant() {
        let sessions = training_set();
        let artifact = train(&sessions, 0.1).unwrap();
        for s in score(&sessions, &artifact).unwrap() {
            assert!((0.0..=1.0).contains(&s.anomaly_score));
            assert!(s.is_anomaly == 0 || s.is_anomaly == 1);
        }
    }

    #[test]
    fn test_score_is_deterministic() {
        let sessions = training_set();
        let artifact = train(&sessions, 0.1).unwrap();

        let a = score(&sessions, &artifact).unwrap();
        let b = score(&sessions, &artifact).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.anomaly_score.to_bits(), y.anomaly_score.to_bits());
            assert_eq!(x.is_anomaly, y.is_anomaly);
        }
    }

    #[test]
    fn test_schema_mismatch_on_layout_drift() {
        let sessions = training_set();
        let mut artifact = train(&sessions, 0.1).unwrap();
        artifact.layout_hash ^= 1;

        match score(&sessions, &artifact) {
            Err(ScorerError::SchemaMismatch(_)) => {}
            other => panic!("expected SchemaMismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_schema_mismatch_on_non_finite_feature() {
        let sessions = training_set();
        let artifact = train(&sessions, 0.1).unwrap();

        let mut bad = session(1.0, 100, 1, 1);
        bad.packets_per_second = f64::NAN;
        assert!(matches!(
            score(&[bad], &artifact),
            Err(ScorerError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_scored_session_flattens_in_json() {
        let sessions = training_set();
        let artifact = train(&sessions, 0.1).unwrap();
        let scored = score(&sessions[..1], &artifact).unwrap();

        let json = serde_json::to_value(&scored[0]).unwrap();
        assert!(json.get("src_ip").is_some());
        assert!(json.get("anomaly_score").is_some());
        assert!(json.get("is_anomaly").is_some());
        assert!(json.get("session").is_none());
    }
}

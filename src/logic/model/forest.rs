//! Isolation forest
//!
//! Native implementation of the isolation-based outlier model: anomalous
//! points isolate in fewer random splits, so short average path lengths
//! mean high anomaly scores. Trained with a fixed seed so repeated runs
//! over the same data produce the same forest.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Number of trees in the ensemble
pub const DEFAULT_TREES: usize = 100;

/// Per-tree subsample ceiling
pub const MAX_SAMPLES: usize = 256;

/// Euler-Mascheroni constant, for the average-path normalizer
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
    Leaf {
        size: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tree {
    root: Node,
}

/// A trained ensemble. Read-only after fit; scoring borrows immutably.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<Tree>,
    sample_size: usize,
}

impl IsolationForest {
    /// Fit the forest on a row-per-sample matrix with a seeded RNG.
    pub fn fit(data: &Array2<f64>, n_trees: usize, seed: u64) -> Self {
        let n_rows = data.nrows();
        let sample_size = n_rows.min(MAX_SAMPLES);
        let height_limit = (sample_size.max(2) as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(seed);

        let trees = (0..n_trees)
            .map(|_| {
                let indices = sample_indices(&mut rng, n_rows, sample_size);
                Tree {
                    root: build_node(data, &indices, 0, height_limit, &mut rng),
                }
            })
            .collect();

        Self { trees, sample_size }
    }

    /// Anomaly decision value in (0, 1]; higher means more anomalous.
    pub fn decision(&self, point: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        let total: f64 = self
            .trees
            .iter()
            .map(|tree| path_length(&tree.root, point, 0))
            .sum();
        let avg_path = total / self.trees.len() as f64;
        let normalizer = average_path_length(self.sample_size);
        if normalizer <= 0.0 {
            return 0.0;
        }
        2f64.powf(-avg_path / normalizer)
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }
}

/// Draw `k` distinct row indices out of `n`.
fn sample_indices(rng: &mut StdRng, n: usize, k: usize) -> Vec<usize> {
    let mut pool: Vec<usize> = (0..n).collect();
    for i in 0..k.min(n) {
        let j = rng.gen_range(i..n);
        pool.swap(i, j);
    }
    pool.truncate(k);
    pool
}

fn build_node(
    data: &Array2<f64>,
    indices: &[usize],
    depth: usize,
    height_limit: usize,
    rng: &mut StdRng,
) -> Node {
    if indices.len() <= 1 || depth >= height_limit {
        return Node::Leaf {
            size: indices.len(),
        };
    }

    // Only features that still vary across this partition can split it.
    let n_features = data.ncols();
    let splittable: Vec<(usize, f64, f64)> = (0..n_features)
        .filter_map(|f| {
            let mut min = f64::INFINITY;
            let mut max = f64::NEG_INFINITY;
            for &i in indices {
                let v = data[[i, f]];
                min = min.min(v);
                max = max.max(v);
            }
            (max > min).then_some((f, min, max))
        })
        .collect();

    if splittable.is_empty() {
        return Node::Leaf {
            size: indices.len(),
        };
    }

    let (feature, min, max) = splittable[rng.gen_range(0..splittable.len())];
    let threshold = rng.gen_range(min..max);

    let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = indices
        .iter()
        .copied()
        .partition(|&i| data[[i, feature]] < threshold);

    Node::Split {
        feature,
        threshold,
        left: Box::new(build_node(data, &left_idx, depth + 1, height_limit, rng)),
        right: Box::new(build_node(data, &right_idx, depth + 1, height_limit, rng)),
    }
}

fn path_length(node: &Node, point: &[f64], depth: usize) -> f64 {
    match node {
        Node::Leaf { size } => depth as f64 + average_path_length(*size),
        Node::Split {
            feature,
            threshold,
            left,
            right,
        } => {
            let value = point.get(*feature).copied().unwrap_or(0.0);
            if value < *threshold {
                path_length(left, point, depth + 1)
            } else {
                path_length(right, point, depth + 1)
            }
        }
    }
}

/// Expected path length of an unsuccessful BST search over `n` points.
fn average_path_length(n: usize) -> f64 {
    if n < 2 {
        return 0.0;
    }
    let n = n as f64;
    2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    /// Tight cluster around the origin plus one far outlier.
    fn cluster_with_outlier() -> Array2<f64> {
        let mut rows: Vec<f64> = Vec::new();
        for i in 0..50 {
            rows.push((i % 5) as f64 * 0.1);
            rows.push((i % 7) as f64 * 0.1);
        }
        rows.push(50.0);
        rows.push(50.0);
        Array2::from_shape_vec((51, 2), rows).unwrap()
    }

    #[test]
    fn test_outlier_scores_higher_than_inliers() {
        let data = cluster_with_outlier();
        let forest = IsolationForest::fit(&data, DEFAULT_TREES, 42);

        let outlier = forest.decision(&[50.0, 50.0]);
        let inlier = forest.decision(&[0.1, 0.1]);
        assert!(
            outlier > inlier,
            "outlier {} should exceed inlier {}",
            outlier,
            inlier
        );
    }

    #[test]
    fn test_decision_range() {
        let data = cluster_with_outlier();
        let forest = IsolationForest::fit(&data, DEFAULT_TREES, 42);
        for row in data.rows() {
            let d = forest.decision(row.as_slice().unwrap());
            assert!(d > 0.0 && d <= 1.0, "decision {} out of range", d);
        }
    }

    #[test]
    fn test_fixed_seed_reproducible() {
        let data = cluster_with_outlier();
        let a = IsolationForest::fit(&data, 20, 42);
        let b = IsolationForest::fit(&data, 20, 42);
        for row in data.rows() {
            let p = row.as_slice().unwrap();
            assert_eq!(a.decision(p), b.decision(p));
        }
    }

    #[test]
    fn test_serialization_roundtrip_preserves_decisions() {
        let data = cluster_with_outlier();
        let forest = IsolationForest::fit(&data, 20, 42);
        let json = serde_json::to_string(&forest).unwrap();
        let restored: IsolationForest = serde_json::from_str(&json).unwrap();
        assert_eq!(forest.decision(&[50.0, 50.0]), restored.decision(&[50.0, 50.0]));
    }

    #[test]
    fn test_average_path_length_edges() {
        assert_eq!(average_path_length(0), 0.0);
        assert_eq!(average_path_length(1), 0.0);
        assert!(average_path_length(256) > average_path_length(16));
    }
}

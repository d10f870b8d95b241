//! Model Module - Outlier Model & Artifact
//!
//! The outlier model is a black-box capability behind two operations:
//! fit a forest on a normalized feature matrix, score a vector against
//! it. The artifact bundles the trained forest with the normalization
//! parameters so scoring needs nothing else.

pub mod artifact;
pub mod forest;

pub use artifact::{ArtifactError, ModelArtifact};
pub use forest::IsolationForest;

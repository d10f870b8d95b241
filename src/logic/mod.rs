//! Logic Module - Pipeline Stages & Engines
//!
//! The pipeline runs capture files through four stages:
//! dissect -> session aggregation -> anomaly scoring -> triage.

pub mod capture;
pub mod config;
pub mod dissect;
pub mod features;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod scorer;
pub mod session;
pub mod triage;

//! # regatta-analysis
//!
//! Batch track-analysis core for the Regatta Suite: ingests decoded GPS
//! tracks from one or more boats and derives, from boat motion alone, the
//! true-wind field over the race area and a catalog of scored strategic
//! events (tacks, jibes, wind shifts, laylines, mark roundings).
//!
//! The crate is a pure library: synchronous, no I/O, no transport
//! assumptions. Inputs and outputs are the plain `serde` value types of
//! [`race_types`]; warnings travel in a per-call diagnostics bag rather
//! than a log. Parallelism belongs to the host: run many [`Session`]s
//! side by side; they share nothing.
//!
//! ## Pipeline
//!
//! Data flows strictly downstream:
//!
//! 1. [`anomaly::AnomalyDetector`] — GPS outlier removal
//! 2. [`quality::QualityMetricsCalculator`] — completeness/accuracy/consistency scoring
//! 3. [`wind::WindEstimator`] — per-boat wind observations
//! 4. [`wind_field::WindFieldFusionSystem`] — multi-boat field fusion and prediction
//! 5. [`strategy::StrategyDetector`] — strategy points over tracks and field
//! 6. [`polar::OptimalVmgCalculator`] — polar targets used by 3 and 5
//!
//! [`session::Session`] owns one analysis run end to end.

pub mod angles;
pub mod anomaly;
pub mod config;
pub mod error;
pub mod geo;
pub mod polar;
pub mod quality;
pub mod session;
pub mod strategy;
pub mod wind;
pub mod wind_field;

pub use config::AnalysisConfig;
pub use error::{AbortFlag, Analysis, Diagnostics, EngineError};
pub use session::{BoatReport, Session, SessionReport};

/// Shared value types, re-exported for downstream convenience.
pub use race_types as types;

//! error.rs — Engine error kinds, diagnostics bag, abort flag
//!
//! Three error kinds exist and only one of them is a hard failure:
//! - `InvalidInput` propagates as `Err` and names the offending field.
//! - Insufficient data surfaces as an empty result plus a warning in the
//!   diagnostics bag, never as a failure.
//! - An abort surfaces as a partial result with the `aborted` marker set.
//!
//! The engine never logs, writes or prints; everything a caller might want
//! to know about a run travels in the per-call [`Diagnostics`].

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Structurally malformed input. No partial result is produced.
    #[error("invalid input in `{field}`: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    /// Structurally valid but too sparse for the requested analysis. Most
    /// entry points report this through [`Diagnostics`] instead; the variant
    /// exists for constructors that cannot return an empty-but-valid value.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// The caller's abort flag was set before the operation could start.
    /// Mid-operation aborts return partial results with the aborted marker.
    #[error("operation aborted by caller")]
    AbortRequested,
}

impl EngineError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        EngineError::InvalidInput {
            field,
            reason: reason.into(),
        }
    }
}

// ── Diagnostics bag ───────────────────────────────────────────────────────────

/// Warnings and counters accumulated during one analysis call.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub warnings: Vec<String>,
    /// Input records skipped for per-record issues (NaN heading, bad fix)
    pub skipped_records: u32,
    /// Observations rejected before entering a fusion buffer
    pub malformed_observations: u32,
    /// Set when the input was too sparse for the requested analysis
    pub insufficient_data: bool,
    /// Set when the caller's abort flag interrupted the operation
    pub aborted: bool,
}

impl Diagnostics {
    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn skip_record(&mut self) {
        self.skipped_records += 1;
    }

    /// Fold another call's diagnostics into this one.
    pub fn merge(&mut self, other: Diagnostics) {
        self.warnings.extend(other.warnings);
        self.skipped_records += other.skipped_records;
        self.malformed_observations += other.malformed_observations;
        self.insufficient_data |= other.insufficient_data;
        self.aborted |= other.aborted;
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
            && self.skipped_records == 0
            && self.malformed_observations == 0
            && !self.insufficient_data
            && !self.aborted
    }
}

/// A successful result together with its diagnostics.
#[derive(Debug, Clone)]
pub struct Analysis<T> {
    pub value: T,
    pub diagnostics: Diagnostics,
}

impl<T> Analysis<T> {
    pub fn clean(value: T) -> Self {
        Self {
            value,
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn with(value: T, diagnostics: Diagnostics) -> Self {
        Self { value, diagnostics }
    }

    /// Empty-ish result for too-sparse input, with the marker set and a
    /// caller-readable reason.
    pub fn insufficient(value: T, reason: impl Into<String>) -> Self {
        let mut diagnostics = Diagnostics::default();
        diagnostics.insufficient_data = true;
        diagnostics.warn(reason);
        Self { value, diagnostics }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Analysis<U> {
        Analysis {
            value: f(self.value),
            diagnostics: self.diagnostics,
        }
    }
}

// ── Abort flag ────────────────────────────────────────────────────────────────

/// Cooperative cancellation handle. Long operations check it at coarse
/// granularity (per grid row, per maneuver window) and return partial
/// results with `diagnostics.aborted` set. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

//! config.rs — Analysis configuration
//!
//! One flat struct carries every recognized knob. Defaults reproduce the
//! reference analysis; hosts deserialize overrides from wherever they keep
//! configuration (the engine itself owns no files or environment).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AnalysisConfig {
    // [anomaly]
    /// Speed-threshold in standard deviations above the mean; larger means
    /// fewer anomalies. Must be ≥ 0.
    pub speed_multiplier: f64,

    // [maneuvers]
    /// Minimum heading swing to register a maneuver, degrees (15–120)
    pub min_tack_angle_deg: f64,
    /// Maximum duration of the swing itself, seconds
    pub maneuver_window_s: f64,
    /// A leg must hold its heading this long to count as sustained, seconds
    pub min_leg_duration_s: f64,

    // [wind shifts]
    /// Minimum direction change to call a shift, degrees
    pub min_shift_angle_deg: f64,
    /// A shift must persist this long, seconds
    pub min_shift_duration_s: f64,

    // [fusion]
    /// Temporal radius for observation inclusion around a field timestamp, seconds
    pub fusion_half_window_s: f64,
    /// Field resolution
    pub fusion_grid_nx: usize,
    pub fusion_grid_ny: usize,
    /// Spatial kernel width, meters
    pub fusion_sigma_spatial_m: f64,
    /// Temporal kernel width, seconds
    pub fusion_sigma_temporal_s: f64,
    /// Cells below this total kernel weight are marked no-data
    pub fusion_weight_floor: f64,
    /// Rolling observation buffer size; oldest evicted beyond this
    pub fusion_buffer_capacity: usize,

    // [prediction]
    /// Confidence-decay time constant τ for short-horizon prediction, seconds
    pub prediction_decay_s: f64,

    // [estimator]
    /// Fuse per-maneuver and VMG candidates by confidence. When false the
    /// estimator emits its raw candidates with confidence 1.
    pub use_bayesian: bool,

    // [strategy]
    /// Reference VMG loss for maneuver evaluation, knots
    pub vmg_loss_ref_kts: f64,
    /// Proximity that counts as "at the mark", meters
    pub mark_rounding_distance_m: f64,
    /// A layline call requires the opposite-tack ray to pass this close, meters
    pub layline_tolerance_m: f64,

    // [caches]
    /// Angle-difference LRU capacity (≥ 1024 recommended)
    pub cache_capacity_angle_diff: usize,
    /// Wind-field cache capacity, entries
    pub cache_capacity_field: usize,

    // [quality]
    /// Above this row count the quality binner samples, keeping all problem
    /// rows and stratified temporal coverage
    pub quality_sampling_threshold: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            speed_multiplier: 3.0,
            min_tack_angle_deg: 30.0,
            maneuver_window_s: 20.0,
            min_leg_duration_s: 15.0,
            min_shift_angle_deg: 5.0,
            min_shift_duration_s: 60.0,
            fusion_half_window_s: 300.0,
            fusion_grid_nx: 20,
            fusion_grid_ny: 20,
            fusion_sigma_spatial_m: 500.0,
            fusion_sigma_temporal_s: 120.0,
            fusion_weight_floor: 1e-3,
            fusion_buffer_capacity: 4096,
            prediction_decay_s: 600.0,
            use_bayesian: true,
            vmg_loss_ref_kts: 2.0,
            mark_rounding_distance_m: 50.0,
            layline_tolerance_m: 100.0,
            cache_capacity_angle_diff: 1024,
            cache_capacity_field: 16,
            quality_sampling_threshold: 50_000,
        }
    }
}

impl AnalysisConfig {
    /// Reject configurations outside their documented domains.
    pub fn validate(&self) -> Result<(), crate::error::EngineError> {
        use crate::error::EngineError;
        if !(self.speed_multiplier >= 0.0) {
            return Err(EngineError::invalid(
                "speed_multiplier",
                format!("must be ≥ 0, got {}", self.speed_multiplier),
            ));
        }
        if !(15.0..=120.0).contains(&self.min_tack_angle_deg) {
            return Err(EngineError::invalid(
                "min_tack_angle_deg",
                format!("must be in 15–120°, got {}", self.min_tack_angle_deg),
            ));
        }
        if self.fusion_grid_nx == 0 || self.fusion_grid_ny == 0 {
            return Err(EngineError::invalid(
                "fusion_grid",
                "grid dimensions must be non-zero",
            ));
        }
        if self.fusion_half_window_s <= 0.0 || self.prediction_decay_s <= 0.0 {
            return Err(EngineError::invalid(
                "fusion_half_window_s",
                "temporal constants must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        AnalysisConfig::default().validate().unwrap();
    }

    #[test]
    fn nan_speed_multiplier_rejected() {
        let cfg = AnalysisConfig {
            speed_multiplier: f64::NAN,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn deserializes_partial_overrides() {
        let cfg: AnalysisConfig =
            serde_json::from_str(r#"{ "speedMultiplier": 2.5, "fusionGridNx": 10 }"#).unwrap();
        assert_eq!(cfg.speed_multiplier, 2.5);
        assert_eq!(cfg.fusion_grid_nx, 10);
        assert_eq!(cfg.fusion_grid_ny, 20);
    }
}

//! wind_field.rs — Multi-boat wind-field fusion and prediction
//!
//! A rolling buffer of wind observations from every source (per-boat
//! estimators, external instruments) is rasterized on demand into a
//! `WindField` snapshot with a Gaussian product kernel in space and time.
//! Fields are cached per (timestamp, resolution, bbox) and invalidated by
//! any insertion that lands inside a cached window.
//!
//! Prediction is one-way: it consumes a finished field plus an advection
//! estimate and never reaches back into the buffer.

use std::collections::HashMap;

use race_types::{AdvectionVector, BoundingBox, WindField, WindObservation};
use tracing::debug;

use crate::angles::wrap_deg;
use crate::config::AnalysisConfig;
use crate::error::{AbortFlag, Analysis, Diagnostics};
use crate::geo::{haversine_m, EnuFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FieldKey {
    timestamp_ms: i64,
    nx: usize,
    ny: usize,
    bbox_bits: [u64; 4],
}

impl FieldKey {
    fn new(timestamp_ms: i64, nx: usize, ny: usize, bbox: &BoundingBox) -> Self {
        Self {
            timestamp_ms,
            nx,
            ny,
            bbox_bits: [
                bbox.lat_min.to_bits(),
                bbox.lon_min.to_bits(),
                bbox.lat_max.to_bits(),
                bbox.lon_max.to_bits(),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct WindFieldFusionSystem {
    config: AnalysisConfig,
    /// Sorted by a total observation order; front is oldest. Observations
    /// are immutable once inserted.
    buffer: Vec<WindObservation>,
    cache: HashMap<FieldKey, WindField>,
    /// Insertion order of cache keys, for bounded eviction
    cache_order: Vec<FieldKey>,
}

impl WindFieldFusionSystem {
    pub fn new(config: AnalysisConfig) -> Self {
        Self {
            config,
            buffer: Vec::new(),
            cache: HashMap::new(),
            cache_order: Vec::new(),
        }
    }

    pub fn observation_count(&self) -> usize {
        self.buffer.len()
    }

    /// Insert one observation. Malformed observations are counted and
    /// skipped; they never reach a field. An exact duplicate of an
    /// already-buffered observation is dropped without touching the field
    /// cache, so re-running a session's insertions never double-weights a
    /// source. Returns whether the observation entered the buffer.
    pub fn insert(&mut self, obs: WindObservation) -> Analysis<bool> {
        let mut diagnostics = Diagnostics::default();
        if !obs.is_well_formed() {
            diagnostics.malformed_observations += 1;
            diagnostics.warn("observation with non-finite position/direction/speed skipped");
            return Analysis::with(false, diagnostics);
        }
        let obs = WindObservation {
            direction_deg: wrap_deg(obs.direction_deg),
            confidence: obs.confidence.clamp(0.0, 1.0),
            ..obs
        };

        let at = self
            .buffer
            .partition_point(|existing| observation_order(existing, &obs) == std::cmp::Ordering::Less);
        if self
            .buffer
            .get(at)
            .is_some_and(|existing| observation_order(existing, &obs) == std::cmp::Ordering::Equal)
        {
            return Analysis::with(false, diagnostics);
        }

        self.invalidate_window(obs.timestamp_ms);
        self.buffer.insert(at, obs);
        if self.buffer.len() > self.config.fusion_buffer_capacity {
            // Front of the sorted buffer is the oldest timestamp
            let evicted = self.buffer.remove(0);
            self.invalidate_window(evicted.timestamp_ms);
        }
        Analysis::with(true, diagnostics)
    }

    /// Insert a batch; the count of accepted observations comes back with
    /// the merged diagnostics.
    pub fn insert_many(
        &mut self,
        observations: impl IntoIterator<Item = WindObservation>,
    ) -> Analysis<usize> {
        let mut diagnostics = Diagnostics::default();
        let mut accepted = 0usize;
        for obs in observations {
            let one = self.insert(obs);
            if one.value {
                accepted += 1;
            }
            diagnostics.merge(one.diagnostics);
        }
        Analysis::with(accepted, diagnostics)
    }

    /// Rasterize the wind over `bbox` at `timestamp_ms` using every buffered
    /// observation within the configured half-window. An empty window yields
    /// an all-no-data field, not an error.
    pub fn field_at(
        &mut self,
        timestamp_ms: i64,
        bbox: BoundingBox,
        abort: &AbortFlag,
    ) -> Analysis<WindField> {
        let (nx, ny) = (self.config.fusion_grid_nx, self.config.fusion_grid_ny);
        let key = FieldKey::new(timestamp_ms, nx, ny, &bbox);
        if let Some(cached) = self.cache.get(&key) {
            return Analysis::clean(cached.clone());
        }

        let mut diagnostics = Diagnostics::default();
        let half_window_ms = (self.config.fusion_half_window_s * 1000.0) as i64;
        let selected: Vec<&WindObservation> = self
            .buffer
            .iter()
            .filter(|o| (o.timestamp_ms - timestamp_ms).abs() <= half_window_ms)
            .collect();

        let mut field = WindField::empty(timestamp_ms, bbox, nx, ny);
        if selected.is_empty() {
            diagnostics.insufficient_data = true;
            diagnostics.warn("no observations in fusion window; field is all no-data");
            return Analysis::with(field, diagnostics);
        }

        let sigma_s2 = 2.0 * self.config.fusion_sigma_spatial_m.powi(2);
        let sigma_t2 = 2.0 * self.config.fusion_sigma_temporal_s.powi(2);
        let t_field = timestamp_ms as f64 / 1000.0;

        let mut aborted = false;
        'rows: for row in 0..ny {
            if abort.is_set() {
                aborted = true;
                break 'rows;
            }
            for col in 0..nx {
                let center = field.cell_center(row, col);
                let mut sum_w = 0.0;
                let mut sum_sin = 0.0;
                let mut sum_cos = 0.0;
                let mut sum_speed = 0.0;
                for o in &selected {
                    let d = haversine_m(center, race_types::LatLon::new(o.lat, o.lon));
                    let dt = o.t_secs() - t_field;
                    let w = (-d * d / sigma_s2).exp() * (-dt * dt / sigma_t2).exp() * o.confidence;
                    if w <= 0.0 {
                        continue;
                    }
                    let rad = o.direction_deg.to_radians();
                    sum_w += w;
                    sum_sin += w * rad.sin();
                    sum_cos += w * rad.cos();
                    sum_speed += w * o.speed_kts;
                }
                if sum_w < self.config.fusion_weight_floor {
                    continue; // no-data cell stays at confidence 0
                }
                field.direction[row][col] = wrap_deg(sum_sin.atan2(sum_cos).to_degrees());
                field.speed[row][col] = sum_speed / sum_w;
                field.confidence[row][col] = sum_w.min(1.0);
            }
        }

        field.advection = self.estimate_advection(timestamp_ms);

        if aborted {
            diagnostics.aborted = true;
            diagnostics.warn("field fusion aborted; partial rows returned");
            return Analysis::with(field, diagnostics);
        }

        debug!(
            ts = timestamp_ms,
            observations = selected.len(),
            "wind field rasterized"
        );
        self.cache_insert(key, field.clone());
        Analysis::with(field, diagnostics)
    }

    /// Short-horizon prediction: translate a finished field along its
    /// advection vector and decay confidence by exp(-Δt/τ). Consumes only
    /// the field value and the advection estimate.
    pub fn predict(&self, field: &WindField, target_timestamp_ms: i64) -> WindField {
        let dt_s = (target_timestamp_ms - field.timestamp_ms) as f64 / 1000.0;
        if dt_s <= 0.0 {
            let mut copy = field.clone();
            copy.timestamp_ms = target_timestamp_ms;
            return copy;
        }
        let advection = field.advection.unwrap_or(AdvectionVector {
            east_mps: 0.0,
            north_mps: 0.0,
        });
        let decay = (-dt_s / self.config.prediction_decay_s).exp();
        let frame = EnuFrame::new(field.bbox.center());

        let mut out = WindField::empty(target_timestamp_ms, field.bbox, field.nx, field.ny);
        out.advection = field.advection;
        for row in 0..field.ny {
            for col in 0..field.nx {
                let center = out.cell_center(row, col);
                // Value advected INTO this cell left from upstream
                let (e, n) = frame.to_enu(center);
                let source = frame.from_enu(e - advection.east_mps * dt_s, n - advection.north_mps * dt_s);
                let Some((src_row, src_col)) = field.cell_at(source) else {
                    continue;
                };
                let conf = field.confidence[src_row][src_col];
                if conf <= 0.0 {
                    continue;
                }
                out.direction[row][col] = field.direction[src_row][src_col];
                out.speed[row][col] = field.speed[src_row][src_col];
                out.confidence[row][col] = (conf * decay).clamp(0.0, 1.0);
            }
        }
        out
    }

    /// Confidence-weighted linear regression of observation displacement
    /// against time over the fusion window around `timestamp_ms`. None when
    /// the window holds too few observations or no temporal spread.
    fn estimate_advection(&self, timestamp_ms: i64) -> Option<AdvectionVector> {
        let window_ms = (self.config.fusion_half_window_s * 1000.0) as i64;
        let recent: Vec<&WindObservation> = self
            .buffer
            .iter()
            .filter(|o| (o.timestamp_ms - timestamp_ms).abs() <= window_ms)
            .collect();
        if recent.len() < 4 {
            return None;
        }

        let anchor = race_types::LatLon::new(recent[0].lat, recent[0].lon);
        let frame = EnuFrame::new(anchor);
        let mut sw = 0.0;
        let mut st = 0.0;
        let mut se = 0.0;
        let mut sn = 0.0;
        let mut stt = 0.0;
        let mut ste = 0.0;
        let mut stn = 0.0;
        for o in &recent {
            let w = o.confidence.max(1e-3);
            let t = o.t_secs();
            let (e, n) = frame.to_enu(race_types::LatLon::new(o.lat, o.lon));
            sw += w;
            st += w * t;
            se += w * e;
            sn += w * n;
            stt += w * t * t;
            ste += w * t * e;
            stn += w * t * n;
        }
        let mt = st / sw;
        let var_t = stt / sw - mt * mt;
        if var_t <= 1e-6 {
            return None;
        }
        let east_mps = (ste / sw - mt * (se / sw)) / var_t;
        let north_mps = (stn / sw - mt * (sn / sw)) / var_t;
        Some(AdvectionVector { east_mps, north_mps })
    }

    fn invalidate_window(&mut self, timestamp_ms: i64) {
        let half_window_ms = (self.config.fusion_half_window_s * 1000.0) as i64;
        self.cache_order
            .retain(|k| (k.timestamp_ms - timestamp_ms).abs() > half_window_ms);
        self.cache
            .retain(|k, _| (k.timestamp_ms - timestamp_ms).abs() > half_window_ms);
    }

    fn cache_insert(&mut self, key: FieldKey, field: WindField) {
        if self.cache.len() >= self.config.cache_capacity_field.max(1) {
            if let Some(oldest) = self.cache_order.first().copied() {
                self.cache.remove(&oldest);
                self.cache_order.remove(0);
            }
        }
        self.cache.insert(key, field);
        self.cache_order.push(key);
    }
}

/// Total order over observations: primary key timestamp, then every payload
/// field. Makes buffer contents (and therefore fusion sums) independent of
/// insertion order.
fn observation_order(a: &WindObservation, b: &WindObservation) -> std::cmp::Ordering {
    a.timestamp_ms
        .cmp(&b.timestamp_ms)
        .then_with(|| a.lat.total_cmp(&b.lat))
        .then_with(|| a.lon.total_cmp(&b.lon))
        .then_with(|| a.direction_deg.total_cmp(&b.direction_deg))
        .then_with(|| a.speed_kts.total_cmp(&b.speed_kts))
        .then_with(|| a.confidence.total_cmp(&b.confidence))
        .then_with(|| (a.source as u8).cmp(&(b.source as u8)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use race_types::WindSource;

    fn obs(ts_s: i64, lat: f64, lon: f64, dir: f64, speed: f64, conf: f64) -> WindObservation {
        WindObservation {
            timestamp_ms: ts_s * 1000,
            lat,
            lon,
            direction_deg: dir,
            speed_kts: speed,
            confidence: conf,
            source: WindSource::External,
        }
    }

    fn race_box() -> BoundingBox {
        BoundingBox::new(54.398, 10.198, 54.402, 10.202)
    }

    fn system() -> WindFieldFusionSystem {
        WindFieldFusionSystem::new(AnalysisConfig::default())
    }

    #[test]
    fn single_observation_gives_a_uniform_field() {
        let mut sys = system();
        sys.insert(obs(100, 54.4, 10.2, 180.0, 12.0, 0.9));
        let field = sys.field_at(100_000, race_box(), &AbortFlag::new()).value;
        assert!(!field.is_empty());
        for row in 0..field.ny {
            for col in 0..field.nx {
                assert!(field.confidence[row][col] > 0.0);
                assert_abs_diff_eq!(field.direction[row][col], 180.0, epsilon = 1e-9);
                assert_abs_diff_eq!(field.speed[row][col], 12.0, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn empty_window_yields_no_data_field_not_error() {
        let mut sys = system();
        sys.insert(obs(100, 54.4, 10.2, 180.0, 12.0, 0.9));
        // A million seconds past anything in the buffer
        let out = sys.field_at(1_000_000_000, race_box(), &AbortFlag::new());
        assert!(out.value.is_empty());
        assert!(out.diagnostics.insufficient_data);
        assert!(out
            .value
            .confidence
            .iter()
            .flatten()
            .all(|c| *c == 0.0));
    }

    #[test]
    fn malformed_observations_are_counted_and_skipped() {
        let mut sys = system();
        let out = sys.insert(obs(100, f64::NAN, 10.2, 180.0, 12.0, 0.9));
        assert!(!out.value);
        assert_eq!(out.diagnostics.malformed_observations, 1);
        assert_eq!(sys.observation_count(), 0);
    }

    #[test]
    fn insertion_order_does_not_change_the_field() {
        let observations = vec![
            obs(90, 54.399, 10.199, 350.0, 9.0, 0.9),
            obs(100, 54.401, 10.201, 10.0, 11.0, 0.4),
            obs(110, 54.4, 10.2, 0.0, 10.0, 0.7),
            obs(95, 54.4005, 10.1995, 355.0, 9.5, 0.6),
        ];
        let mut forward = system();
        for o in observations.clone() {
            forward.insert(o);
        }
        let mut reversed = system();
        for o in observations.into_iter().rev() {
            reversed.insert(o);
        }
        let a = forward.field_at(100_000, race_box(), &AbortFlag::new()).value;
        let b = reversed.field_at(100_000, race_box(), &AbortFlag::new()).value;
        assert_eq!(a.direction, b.direction);
        assert_eq!(a.speed, b.speed);
        assert_eq!(a.confidence, b.confidence);
    }

    #[test]
    fn cell_invariants_hold_everywhere() {
        let mut sys = system();
        for i in 0..40 {
            sys.insert(obs(
                80 + i,
                54.398 + (i as f64) * 1e-4,
                10.198 + (i as f64 % 7.0) * 1e-4,
                (i as f64 * 37.0) % 360.0,
                5.0 + (i % 9) as f64,
                0.1 + (i % 10) as f64 / 10.0,
            ));
        }
        let field = sys.field_at(100_000, race_box(), &AbortFlag::new()).value;
        for row in 0..field.ny {
            for col in 0..field.nx {
                let c = field.confidence[row][col];
                let d = field.direction[row][col];
                assert!((0.0..=1.0).contains(&c));
                assert!((0.0..360.0).contains(&d), "direction {d}");
            }
        }
    }

    #[test]
    fn duplicate_observations_are_not_double_buffered() {
        let mut sys = system();
        let o = obs(100, 54.4, 10.2, 180.0, 12.0, 0.9);
        assert!(sys.insert(o.clone()).value);
        let first = sys.field_at(100_000, race_box(), &AbortFlag::new()).value;
        // Re-inserting the same observation is a no-op and must not
        // invalidate the cached field
        assert!(!sys.insert(o).value);
        assert_eq!(sys.observation_count(), 1);
        let second = sys.field_at(100_000, race_box(), &AbortFlag::new()).value;
        assert_eq!(first.confidence, second.confidence);
    }

    #[test]
    fn buffer_is_bounded_and_evicts_oldest() {
        let config = AnalysisConfig {
            fusion_buffer_capacity: 8,
            ..Default::default()
        };
        let mut sys = WindFieldFusionSystem::new(config);
        for i in 0..20 {
            sys.insert(obs(i, 54.4, 10.2, 0.0, 10.0, 0.5));
        }
        assert_eq!(sys.observation_count(), 8);
        // Oldest remaining is t = 12 s
        assert_eq!(sys.buffer[0].timestamp_ms, 12_000);
    }

    #[test]
    fn cache_returns_identical_field_until_invalidated() {
        let mut sys = system();
        sys.insert(obs(100, 54.4, 10.2, 180.0, 12.0, 0.9));
        let first = sys.field_at(100_000, race_box(), &AbortFlag::new()).value;
        let second = sys.field_at(100_000, race_box(), &AbortFlag::new()).value;
        assert_eq!(first.direction, second.direction);

        // An insertion inside the window must invalidate the entry
        sys.insert(obs(110, 54.4, 10.2, 90.0, 8.0, 0.9));
        let third = sys.field_at(100_000, race_box(), &AbortFlag::new()).value;
        assert_ne!(first.direction, third.direction);
    }

    #[test]
    fn abort_returns_partial_field_with_marker() {
        let mut sys = system();
        sys.insert(obs(100, 54.4, 10.2, 180.0, 12.0, 0.9));
        let abort = AbortFlag::new();
        abort.trigger();
        let out = sys.field_at(100_000, race_box(), &abort);
        assert!(out.diagnostics.aborted);
        assert!(out.value.is_empty());
        // A subsequent un-aborted call recomputes cleanly (no poisoned cache)
        let clean = sys.field_at(100_000, race_box(), &AbortFlag::new());
        assert!(!clean.diagnostics.aborted);
        assert!(!clean.value.is_empty());
    }

    #[test]
    fn prediction_decays_confidence_and_keeps_values() {
        let mut sys = system();
        sys.insert(obs(100, 54.4, 10.2, 180.0, 12.0, 0.9));
        let field = sys.field_at(100_000, race_box(), &AbortFlag::new()).value;
        // 600 s ahead with τ = 600 s → decay factor e⁻¹
        let ahead = sys.predict(&field, 700_000);
        let (row, col) = (field.ny / 2, field.nx / 2);
        assert_abs_diff_eq!(ahead.direction[row][col], 180.0, epsilon = 1e-9);
        assert_abs_diff_eq!(ahead.speed[row][col], 12.0, epsilon = 1e-9);
        assert_abs_diff_eq!(
            ahead.confidence[row][col],
            field.confidence[row][col] * (-1.0_f64).exp(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn prediction_translates_along_the_advection_vector() {
        let config = AnalysisConfig::default();
        let sys = WindFieldFusionSystem::new(config);
        let bbox = race_box();
        let mut field = WindField::empty(0, bbox, 20, 20);
        // One confident column on the western edge, drifting east at 1 m/s
        for row in 0..20 {
            field.direction[row][2] = 200.0;
            field.speed[row][2] = 10.0;
            field.confidence[row][2] = 1.0;
        }
        field.advection = Some(AdvectionVector {
            east_mps: 1.0,
            north_mps: 0.0,
        });
        // Cell width ≈ 13 m of longitude; 26 s moves the column two cells east
        let cell_w_m = haversine_m(field.cell_center(10, 2), field.cell_center(10, 3));
        let dt_ms = (2.0 * cell_w_m * 1000.0) as i64;
        let ahead = sys.predict(&field, dt_ms);
        assert!(ahead.confidence[10][4] > 0.0);
        assert_abs_diff_eq!(ahead.direction[10][4], 200.0, epsilon = 1e-9);
        assert_eq!(ahead.confidence[10][2], 0.0);
    }
}

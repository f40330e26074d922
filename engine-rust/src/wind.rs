//! wind.rs — Per-boat wind estimation
//!
//! From one cleaned track, produce a time-series of wind observations:
//! 1. Segment the track into sustained legs and find the maneuvers between
//!    them.
//! 2. Estimate wind per maneuver (the bisector of a tack points into the
//!    wind) and over the whole track (VMG grid search).
//! 3. Fuse the candidates by confidence into the observation series the
//!    field-fusion stage consumes.
//!
//! The estimator owns one bounded LRU over angle-difference results; the
//! heading grids are redundant enough that most lookups hit.

use std::collections::{BTreeMap, HashMap};

use race_types::{BoatTrack, LatLon, WindObservation, WindSource, MPS_PER_KNOT};
use tracing::debug;

use crate::angles::{bisect_deg, circular_mean_weighted, delta_deg, twa_deg, wrap_deg};
use crate::config::AnalysisConfig;
use crate::error::{Analysis, Diagnostics};
use crate::geo::{bearing_deg, haversine_m};
use crate::polar::OptimalVmgCalculator;

/// Coarse stage of the direction search, degrees between candidates. 45°
/// costs a third fewer scoring passes than 30° for no measurable accuracy
/// loss once the refine stage has run.
const COARSE_STEP_DEG: f64 = 45.0;
/// Refine stage spacing around the best coarse candidate, degrees.
const REFINE_STEP_DEG: f64 = 10.0;
/// Wind-speed prior for the polar weighting of the direction search, knots.
const PRIOR_TWS_KTS: f64 = 10.0;
/// Minimum samples for a meaningful VMG correlation.
const MIN_VMG_SAMPLES: usize = 16;

const TACK_CONFIDENCE: f64 = 0.75;
const JIBE_CONFIDENCE: f64 = 0.6;

// ── Maneuvers ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManeuverKind {
    Tack,
    Jibe,
    BearAway,
    HeadUp,
}

/// A heading transition between two sustained legs.
#[derive(Debug, Clone)]
pub struct Maneuver {
    /// Track index of the last pre-turn point
    pub start_idx: usize,
    /// Track index of the first post-turn point
    pub end_idx: usize,
    pub timestamp_ms: i64,
    pub pos: LatLon,
    pub pre_heading_deg: f64,
    pub post_heading_deg: f64,
    /// Signed swing from pre to post, (-180, 180]
    pub swing_deg: f64,
    pub pre_speed_kts: f64,
    pub post_speed_kts: f64,
}

/// One usable track sample: heading and speed resolved from the recorded
/// fields or derived from neighbouring positions.
#[derive(Debug, Clone)]
pub(crate) struct Sample {
    pub(crate) idx: usize,
    pub(crate) t_s: f64,
    pub(crate) heading_deg: f64,
    pub(crate) speed_kts: f64,
    pub(crate) pos: LatLon,
}

/// Resolve a track into samples, skipping records without a usable position
/// or heading. Shared by the wind estimator and the strategy detector.
pub(crate) fn collect_samples(track: &BoatTrack) -> (Vec<Sample>, Diagnostics) {
    let mut diagnostics = Diagnostics::default();
    let points = &track.points;
    let mut samples = Vec::with_capacity(points.len());

    for i in 0..points.len() {
        let p = &points[i];
        if !p.pos().is_finite() || !p.t_secs().is_finite() {
            diagnostics.skip_record();
            continue;
        }
        let heading = match p.heading_deg.filter(|h| h.is_finite()) {
            Some(h) => wrap_deg(h),
            None => {
                // Course over ground stands in for a missing heading
                match points.get(i + 1).filter(|n| n.pos().is_finite()) {
                    Some(next) => bearing_deg(p.pos(), next.pos()),
                    None => match i.checked_sub(1).and_then(|j| points.get(j)) {
                        Some(prev) if prev.pos().is_finite() => bearing_deg(prev.pos(), p.pos()),
                        _ => {
                            diagnostics.skip_record();
                            continue;
                        }
                    },
                }
            }
        };
        let speed_kts = match track.speed_mps(i).filter(|s| s.is_finite()) {
            Some(mps) => mps / MPS_PER_KNOT,
            None => match points.get(i + 1) {
                Some(next) if next.pos().is_finite() => {
                    let dt = (next.t_secs() - p.t_secs()).max(0.1);
                    haversine_m(p.pos(), next.pos()) / dt / MPS_PER_KNOT
                }
                _ => 0.0,
            },
        };
        samples.push(Sample {
            idx: i,
            t_s: p.t_secs(),
            heading_deg: heading,
            speed_kts,
            pos: p.pos(),
        });
    }
    if diagnostics.skipped_records > 0 {
        diagnostics.warn(format!(
            "{} record(s) without usable heading/position skipped",
            diagnostics.skipped_records
        ));
    }
    (samples, diagnostics)
}

#[derive(Debug, Clone)]
struct Leg {
    first: usize, // sample index
    last: usize,
    mean_heading_deg: f64,
    mean_speed_kts: f64,
    duration_s: f64,
}

// ── Angle-difference LRU ──────────────────────────────────────────────────────

/// Bounded LRU over signed angle differences, keyed by the pair rounded to
/// 0.5°. Eviction scans for the stalest stamp; at these capacities a scan
/// on the occasional miss is cheaper than an intrusive list.
#[derive(Debug, Clone)]
struct AngleDiffCache {
    map: HashMap<(i32, i32), (f64, u64)>,
    tick: u64,
    capacity: usize,
}

impl AngleDiffCache {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::with_capacity(capacity.max(1).min(8192)),
            tick: 0,
            capacity: capacity.max(1),
        }
    }

    fn key(a: f64, b: f64) -> (i32, i32) {
        ((a * 2.0).round() as i32, (b * 2.0).round() as i32)
    }

    /// Signed rotation from `reference` to `heading`, cached.
    fn rel(&mut self, heading: f64, reference: f64) -> f64 {
        self.tick += 1;
        let key = Self::key(heading, reference);
        if let Some(entry) = self.map.get_mut(&key) {
            entry.1 = self.tick;
            return entry.0;
        }
        let value = delta_deg(reference, heading);
        if self.map.len() >= self.capacity {
            if let Some(stalest) = self
                .map
                .iter()
                .min_by_key(|(_, (_, stamp))| *stamp)
                .map(|(k, _)| *k)
            {
                self.map.remove(&stalest);
            }
        }
        self.map.insert(key, (value, self.tick));
        value
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

// ── Estimator ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WindEstimator {
    config: AnalysisConfig,
    polar: OptimalVmgCalculator,
    angle_cache: AngleDiffCache,
    /// Best search direction per track fingerprint; refine-only on re-runs
    vmg_direction_cache: HashMap<(String, usize, i64, i64), f64>,
}

impl WindEstimator {
    pub fn new(config: AnalysisConfig, polar: OptimalVmgCalculator) -> Self {
        let cache_capacity = config.cache_capacity_angle_diff;
        Self {
            config,
            polar,
            angle_cache: AngleDiffCache::new(cache_capacity),
            vmg_direction_cache: HashMap::new(),
        }
    }

    /// Full estimation pipeline for one track.
    pub fn estimate_wind(&mut self, track: &BoatTrack) -> Analysis<Vec<WindObservation>> {
        let (samples, mut diagnostics) = collect_samples(track);
        let legs = self.legs_from(&samples);
        let sustained: Vec<&Leg> = legs
            .iter()
            .filter(|l| l.duration_s >= self.config.min_leg_duration_s)
            .collect();
        if sustained.len() < 2 {
            let mut out = Analysis::with(Vec::new(), diagnostics);
            out.diagnostics.insufficient_data = true;
            out.diagnostics.warn(format!(
                "track {} has {} sustained leg(s); wind estimation needs at least 2",
                track.boat_id,
                sustained.len()
            ));
            return out;
        }

        let maneuvers = maneuvers_between(&legs, &samples, &self.config);
        let vmg = self.estimate_from_vmg_analysis_inner(track, &samples);

        let wind_hint = vmg.as_ref().map(|o| o.direction_deg);
        let mut candidates: Vec<WindObservation> = Vec::new();
        if let Some(obs) = vmg {
            candidates.push(obs);
        }
        for m in &maneuvers {
            match self.estimate_from_maneuver(m, wind_hint) {
                Some(obs) => candidates.push(obs),
                None => diagnostics.skip_record(),
            }
        }

        let observations = if self.config.use_bayesian {
            self.fuse_buckets(candidates)
        } else {
            // Non-Bayesian mode: raw candidates, unweighted
            let mut raw = candidates;
            for o in &mut raw {
                o.confidence = 1.0;
            }
            raw
        };

        let mut observations = observations;
        observations.sort_by_key(|o| o.timestamp_ms);
        debug!(
            boat = %track.boat_id,
            maneuvers = maneuvers.len(),
            observations = observations.len(),
            cache = self.angle_cache.len(),
            "wind estimation complete"
        );
        Analysis::with(observations, diagnostics)
    }

    /// Heading transitions of at least `min_tack_angle` between sustained
    /// legs, in track order.
    pub fn detect_maneuvers(&self, track: &BoatTrack) -> Analysis<Vec<Maneuver>> {
        let (samples, diagnostics) = collect_samples(track);
        let legs = self.legs_from(&samples);
        Analysis::with(maneuvers_between(&legs, &samples, &self.config), diagnostics)
    }

    /// Classify a maneuver from its bracketing headings. With a wind
    /// estimate the call never fails: degenerate pairs (identical headings
    /// included) fall back to the sign of the heading change relative to
    /// the wind. Without one, degenerate pairs are unclassifiable and a
    /// swing-magnitude heuristic stands in for the rest.
    pub fn classify_maneuver(
        &self,
        pre_heading_deg: f64,
        post_heading_deg: f64,
        wind_direction_deg: Option<f64>,
    ) -> Option<ManeuverKind> {
        let swing = delta_deg(pre_heading_deg, post_heading_deg);
        match wind_direction_deg {
            Some(wind) => {
                let t0 = twa_deg(pre_heading_deg, wind);
                let t1 = twa_deg(post_heading_deg, wind);
                if t0 * t1 < 0.0 {
                    // Crossed an axis; which one depends on how close to the
                    // wind the endpoints sit
                    if t0.abs() + t1.abs() <= 180.0 {
                        Some(ManeuverKind::Tack)
                    } else {
                        Some(ManeuverKind::Jibe)
                    }
                } else if t1.abs() > t0.abs() {
                    Some(ManeuverKind::BearAway)
                } else {
                    // Ties (the degenerate equal-heading pair) resolve here
                    Some(ManeuverKind::HeadUp)
                }
            }
            None => {
                if swing.abs() < 1e-9 {
                    return None;
                }
                if swing.abs() >= 120.0 {
                    Some(ManeuverKind::Jibe)
                } else {
                    Some(ManeuverKind::Tack)
                }
            }
        }
    }

    /// Wind estimate from a single maneuver: a tack's bisector points into
    /// the wind, a jibe's away from it. Bear-aways and head-ups carry no
    /// usable bisector and yield None.
    pub fn estimate_from_maneuver(
        &self,
        maneuver: &Maneuver,
        wind_hint_deg: Option<f64>,
    ) -> Option<WindObservation> {
        let kind = self.classify_maneuver(
            maneuver.pre_heading_deg,
            maneuver.post_heading_deg,
            wind_hint_deg,
        )?;
        let bisector = bisect_deg(maneuver.pre_heading_deg, maneuver.post_heading_deg);
        let (direction, confidence) = match kind {
            ManeuverKind::Tack => (bisector, TACK_CONFIDENCE),
            ManeuverKind::Jibe => (wrap_deg(bisector + 180.0), JIBE_CONFIDENCE),
            _ => return None,
        };

        let twa = twa_deg(maneuver.pre_heading_deg, direction).abs();
        let boat_speed = (maneuver.pre_speed_kts + maneuver.post_speed_kts) / 2.0;
        let tws = self.polar.invert_tws(twa, boat_speed);

        Some(WindObservation {
            timestamp_ms: maneuver.timestamp_ms,
            lat: maneuver.pos.lat,
            lon: maneuver.pos.lon,
            direction_deg: direction,
            speed_kts: tws.value,
            confidence,
            source: WindSource::Maneuver,
        })
    }

    /// Two-stage grid search for the wind direction that best explains the
    /// speed/heading relationship, scored by polar-weighted correlation.
    pub fn estimate_from_vmg_analysis(&mut self, track: &BoatTrack) -> Option<WindObservation> {
        let (samples, _) = collect_samples(track);
        self.estimate_from_vmg_analysis_inner(track, &samples)
    }

    fn estimate_from_vmg_analysis_inner(
        &mut self,
        track: &BoatTrack,
        samples: &[Sample],
    ) -> Option<WindObservation> {
        if samples.len() < MIN_VMG_SAMPLES {
            return None;
        }

        let fingerprint = (
            track.boat_id.clone(),
            track.points.len(),
            track.points.first().map_or(0, |p| p.timestamp_ms),
            track.points.last().map_or(0, |p| p.timestamp_ms),
        );

        let coarse_best = match self.vmg_direction_cache.get(&fingerprint) {
            // Re-run on the same track: refine around the cached optimum
            Some(cached) => *cached,
            None => {
                let mut best = (0.0, f64::NEG_INFINITY);
                let mut phi = 0.0;
                while phi < 360.0 {
                    let score = self.direction_score(samples, phi);
                    if score > best.1 {
                        best = (phi, score);
                    }
                    phi += COARSE_STEP_DEG;
                }
                best.0
            }
        };

        let mut best = (coarse_best, self.direction_score(samples, coarse_best));
        let mut offset = -COARSE_STEP_DEG + REFINE_STEP_DEG;
        while offset < COARSE_STEP_DEG {
            if offset != 0.0 {
                let phi = wrap_deg(coarse_best + offset);
                let score = self.direction_score(samples, phi);
                if score > best.1 {
                    best = (phi, score);
                }
            }
            offset += REFINE_STEP_DEG;
        }
        let (direction, corr) = best;
        self.vmg_direction_cache.insert(fingerprint, direction);

        // Speed from the polar at the typical sailing angle
        let mut rels: Vec<f64> = samples
            .iter()
            .map(|s| self.angle_cache.rel(s.heading_deg, direction).abs())
            .collect();
        let mut speeds: Vec<f64> = samples.iter().map(|s| s.speed_kts).collect();
        let twa_med = median_in_place(&mut rels);
        let speed_med = median_in_place(&mut speeds);
        let tws = self.polar.invert_tws(twa_med, speed_med);

        let confidence = (0.35 + 0.65 * corr).clamp(0.05, 1.0);
        let mid = &samples[samples.len() / 2];
        Some(WindObservation {
            timestamp_ms: (mid.t_s * 1000.0) as i64,
            lat: mean(samples.iter().map(|s| s.pos.lat)),
            lon: mean(samples.iter().map(|s| s.pos.lon)),
            direction_deg: direction,
            speed_kts: tws.value,
            confidence,
            source: WindSource::Vmg,
        })
    }

    /// Polar-prior-weighted correlation of |relative angle| and boat speed
    /// for a candidate wind direction. One pass over the samples.
    fn direction_score(&mut self, samples: &[Sample], phi: f64) -> f64 {
        let mut sw = 0.0;
        let mut sx = 0.0;
        let mut sy = 0.0;
        let mut sxx = 0.0;
        let mut syy = 0.0;
        let mut sxy = 0.0;
        for s in samples {
            let rel = self.angle_cache.rel(s.heading_deg, phi).abs();
            let w = self.polar.target_speed(rel, PRIOR_TWS_KTS).value.max(1e-3);
            let y = s.speed_kts;
            sw += w;
            sx += w * rel;
            sy += w * y;
            sxx += w * rel * rel;
            syy += w * y * y;
            sxy += w * rel * y;
        }
        if sw <= 0.0 {
            return 0.0;
        }
        let (mx, my) = (sx / sw, sy / sw);
        let cov = sxy / sw - mx * my;
        let vx = (sxx / sw - mx * mx).max(0.0);
        let vy = (syy / sw - my * my).max(0.0);
        if vx <= 1e-12 || vy <= 1e-12 {
            return 0.0;
        }
        cov / (vx.sqrt() * vy.sqrt())
    }

    /// Combine candidate estimates using confidences as weights: a direct
    /// weighted atan2 over precomputed sine/cosine columns.
    pub fn bayesian_fuse(&self, observations: &[WindObservation]) -> Option<WindObservation> {
        if observations.is_empty() {
            return None;
        }
        if observations.len() == 1 {
            return Some(observations[0].clone());
        }

        let n = observations.len();
        let mut weights = Vec::with_capacity(n);
        let mut sins = Vec::with_capacity(n);
        let mut coss = Vec::with_capacity(n);
        for o in observations {
            weights.push(o.confidence);
            let rad = o.direction_deg.to_radians();
            sins.push(rad.sin());
            coss.push(rad.cos());
        }

        let mut sum_w: f64 = weights.iter().sum();
        if sum_w <= 0.0 {
            weights.iter_mut().for_each(|w| *w = 1.0);
            sum_w = n as f64;
        }

        let mut sum_sin = 0.0;
        let mut sum_cos = 0.0;
        let mut sum_speed = 0.0;
        let mut sum_t = 0.0;
        let mut sum_lat = 0.0;
        let mut sum_lon = 0.0;
        for (i, o) in observations.iter().enumerate() {
            let w = weights[i];
            sum_sin += w * sins[i];
            sum_cos += w * coss[i];
            sum_speed += w * o.speed_kts;
            sum_t += w * o.timestamp_ms as f64;
            sum_lat += w * o.lat;
            sum_lon += w * o.lon;
        }

        Some(WindObservation {
            timestamp_ms: (sum_t / sum_w).round() as i64,
            lat: sum_lat / sum_w,
            lon: sum_lon / sum_w,
            direction_deg: wrap_deg(sum_sin.atan2(sum_cos).to_degrees()),
            speed_kts: sum_speed / sum_w,
            confidence: (sum_w / n as f64).clamp(0.0, 1.0),
            source: WindSource::Bayesian,
        })
    }

    /// Fuse candidates in shift-duration buckets so the output is a series,
    /// not a single average over the whole session.
    fn fuse_buckets(&self, candidates: Vec<WindObservation>) -> Vec<WindObservation> {
        let bucket_ms = (self.config.min_shift_duration_s.max(30.0) * 1000.0) as i64;
        let mut buckets: BTreeMap<i64, Vec<WindObservation>> = BTreeMap::new();
        for obs in candidates {
            buckets
                .entry(obs.timestamp_ms.div_euclid(bucket_ms))
                .or_default()
                .push(obs);
        }
        buckets
            .into_values()
            .filter_map(|group| self.bayesian_fuse(&group))
            .collect()
    }

    // ── Leg extraction ───────────────────────────────────────────────────────

    /// Greedy run-building: a sample stays in the current leg while it holds
    /// within half the tack threshold of the leg's running mean heading.
    fn legs_from(&self, samples: &[Sample]) -> Vec<Leg> {
        let split_at = self.config.min_tack_angle_deg / 2.0;
        let mut legs = Vec::new();
        let mut start = 0usize;
        let mut sum_sin = 0.0;
        let mut sum_cos = 0.0;

        let close_leg = |legs: &mut Vec<Leg>, start: usize, end: usize| {
            if end < start {
                return;
            }
            let slice = &samples[start..=end];
            let mean_heading =
                circular_mean_weighted(slice.iter().map(|s| (s.heading_deg, 1.0)))
                    .unwrap_or(slice[0].heading_deg);
            legs.push(Leg {
                first: start,
                last: end,
                mean_heading_deg: mean_heading,
                mean_speed_kts: mean(slice.iter().map(|s| s.speed_kts)),
                duration_s: slice.last().unwrap().t_s - slice[0].t_s,
            });
        };

        for (i, s) in samples.iter().enumerate() {
            if i == start {
                let rad = s.heading_deg.to_radians();
                sum_sin = rad.sin();
                sum_cos = rad.cos();
                continue;
            }
            let running_mean = wrap_deg(sum_sin.atan2(sum_cos).to_degrees());
            if delta_deg(running_mean, s.heading_deg).abs() > split_at {
                close_leg(&mut legs, start, i - 1);
                start = i;
                let rad = s.heading_deg.to_radians();
                sum_sin = rad.sin();
                sum_cos = rad.cos();
            } else {
                let rad = s.heading_deg.to_radians();
                sum_sin += rad.sin();
                sum_cos += rad.cos();
            }
        }
        if !samples.is_empty() {
            close_leg(&mut legs, start, samples.len() - 1);
        }
        legs
    }
}

/// Maneuvers between consecutive sustained legs.
fn maneuvers_between(legs: &[Leg], samples: &[Sample], config: &AnalysisConfig) -> Vec<Maneuver> {
    let mut maneuvers = Vec::new();
    let sustained: Vec<&Leg> = legs
        .iter()
        .filter(|l| l.duration_s >= config.min_leg_duration_s)
        .collect();

    for pair in sustained.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let swing = delta_deg(a.mean_heading_deg, b.mean_heading_deg);
        if swing.abs() < config.min_tack_angle_deg {
            continue;
        }
        let gap_s = samples[b.first].t_s - samples[a.last].t_s;
        if gap_s > config.maneuver_window_s {
            continue;
        }
        let mid = &samples[(a.last + b.first) / 2];
        maneuvers.push(Maneuver {
            start_idx: samples[a.last].idx,
            end_idx: samples[b.first].idx,
            timestamp_ms: (mid.t_s * 1000.0) as i64,
            pos: mid.pos,
            pre_heading_deg: a.mean_heading_deg,
            post_heading_deg: b.mean_heading_deg,
            swing_deg: swing,
            pre_speed_kts: a.mean_speed_kts,
            post_speed_kts: b.mean_speed_kts,
        });
    }
    maneuvers
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut n = 0usize;
    for v in values {
        sum += v;
        n += 1;
    }
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

fn median_in_place(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mid = values.len() / 2;
    let (_, m, _) = values.select_nth_unstable_by(mid, f64::total_cmp);
    *m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::destination;
    use approx::assert_abs_diff_eq;
    use race_types::{SpeedUnit, TrackPoint};

    /// Beating track: headings alternate between 315° and 45° every
    /// `leg_s` seconds, boat speed constant, positions walked accordingly.
    fn beating_track(n: usize, leg_s: i64, speed_kts: f64) -> BoatTrack {
        let mut pos = LatLon::new(54.4, 10.2);
        let mut points = Vec::with_capacity(n);
        for i in 0..n as i64 {
            let heading = if (i / leg_s) % 2 == 0 { 315.0 } else { 45.0 };
            points.push(TrackPoint {
                timestamp_ms: i * 1000,
                lat: pos.lat,
                lon: pos.lon,
                speed: Some(speed_kts),
                heading_deg: Some(heading),
            });
            pos = destination(pos, heading, speed_kts * MPS_PER_KNOT);
        }
        BoatTrack {
            boat_id: "beater".into(),
            points,
            units: SpeedUnit::Knots,
            polar_class: None,
        }
    }

    fn estimator() -> WindEstimator {
        WindEstimator::new(AnalysisConfig::default(), OptimalVmgCalculator::one_design())
    }

    #[test]
    fn beating_track_yields_tacks_at_each_transition() {
        let track = beating_track(400, 60, 5.0);
        let est = estimator();
        let maneuvers = est.detect_maneuvers(&track).value;
        // 400 s of 60 s legs → 6 transitions
        assert_eq!(maneuvers.len(), 6);
        for m in &maneuvers {
            assert!(m.swing_deg.abs() > 80.0, "swing was {}", m.swing_deg);
        }
    }

    #[test]
    fn beating_track_wind_is_near_north() {
        let track = beating_track(400, 60, 5.0);
        let mut est = estimator();
        let out = est.estimate_wind(&track);
        assert!(!out.value.is_empty());
        for obs in &out.value {
            let err = delta_deg(obs.direction_deg, 0.0).abs();
            assert!(err < 5.0, "direction {} off by {err}", obs.direction_deg);
        }
    }

    #[test]
    fn straight_line_track_is_insufficient() {
        let mut pos = LatLon::new(54.4, 10.2);
        let points: Vec<TrackPoint> = (0..300)
            .map(|i| {
                let p = TrackPoint {
                    timestamp_ms: i * 1000,
                    lat: pos.lat,
                    lon: pos.lon,
                    speed: Some(2.0),
                    heading_deg: Some(90.0),
                };
                pos = destination(pos, 90.0, 1.0);
                p
            })
            .collect();
        let track = BoatTrack {
            boat_id: "reacher".into(),
            points,
            units: SpeedUnit::Knots,
            polar_class: None,
        };
        let mut est = estimator();
        let out = est.estimate_wind(&track);
        assert!(out.value.is_empty());
        assert!(out.diagnostics.insufficient_data);
        assert!(!out.diagnostics.warnings.is_empty());
    }

    #[test]
    fn classify_tack_and_jibe_against_known_wind() {
        let est = estimator();
        assert_eq!(
            est.classify_maneuver(315.0, 45.0, Some(0.0)),
            Some(ManeuverKind::Tack)
        );
        assert_eq!(
            est.classify_maneuver(135.0, 225.0, Some(0.0)),
            Some(ManeuverKind::Jibe)
        );
        assert_eq!(
            est.classify_maneuver(45.0, 90.0, Some(0.0)),
            Some(ManeuverKind::BearAway)
        );
        assert_eq!(
            est.classify_maneuver(90.0, 45.0, Some(0.0)),
            Some(ManeuverKind::HeadUp)
        );
    }

    #[test]
    fn degenerate_heading_pair_does_not_panic() {
        let est = estimator();
        // With a wind estimate the tie resolves deterministically
        assert_eq!(
            est.classify_maneuver(90.0, 90.0, Some(0.0)),
            Some(ManeuverKind::HeadUp)
        );
        // Without one it is undefined
        assert_eq!(est.classify_maneuver(90.0, 90.0, None), None);
    }

    #[test]
    fn maneuver_estimate_bisects_the_tack() {
        let est = estimator();
        let m = Maneuver {
            start_idx: 10,
            end_idx: 12,
            timestamp_ms: 60_000,
            pos: LatLon::new(54.4, 10.2),
            pre_heading_deg: 315.0,
            post_heading_deg: 45.0,
            swing_deg: 90.0,
            pre_speed_kts: 5.0,
            post_speed_kts: 4.8,
        };
        let obs = est.estimate_from_maneuver(&m, Some(355.0)).unwrap();
        assert_abs_diff_eq!(obs.direction_deg, 0.0, epsilon = 1e-9);
        assert_eq!(obs.source, WindSource::Maneuver);
        assert!(obs.speed_kts > 0.0);
    }

    #[test]
    fn fuse_weights_lean_toward_confident_observation() {
        let est = estimator();
        let obs = vec![
            WindObservation {
                timestamp_ms: 0,
                lat: 54.4,
                lon: 10.2,
                direction_deg: 350.0,
                speed_kts: 10.0,
                confidence: 0.9,
                source: WindSource::Maneuver,
            },
            WindObservation {
                timestamp_ms: 0,
                lat: 54.4,
                lon: 10.2,
                direction_deg: 10.0,
                speed_kts: 10.0,
                confidence: 0.1,
                source: WindSource::Maneuver,
            },
        ];
        let fused = est.bayesian_fuse(&obs).unwrap();
        assert!(
            delta_deg(fused.direction_deg, 354.0).abs() < 5.0,
            "fused direction {}",
            fused.direction_deg
        );
        assert_abs_diff_eq!(fused.confidence, 0.5, epsilon = 1e-9);
        assert_eq!(fused.source, WindSource::Bayesian);
    }

    #[test]
    fn fuse_is_invariant_under_confidence_rescaling() {
        let est = estimator();
        let base = vec![
            WindObservation {
                timestamp_ms: 1000,
                lat: 54.4,
                lon: 10.2,
                direction_deg: 340.0,
                speed_kts: 9.0,
                confidence: 0.8,
                source: WindSource::Vmg,
            },
            WindObservation {
                timestamp_ms: 3000,
                lat: 54.41,
                lon: 10.21,
                direction_deg: 20.0,
                speed_kts: 12.0,
                confidence: 0.4,
                source: WindSource::Maneuver,
            },
        ];
        let mut scaled = base.clone();
        for o in &mut scaled {
            o.confidence *= 0.5;
        }
        let a = est.bayesian_fuse(&base).unwrap();
        let b = est.bayesian_fuse(&scaled).unwrap();
        assert_abs_diff_eq!(a.direction_deg, b.direction_deg, epsilon = 1e-9);
        assert_abs_diff_eq!(a.speed_kts, b.speed_kts, epsilon = 1e-9);
    }

    #[test]
    fn fuse_handles_empty_single_and_zero_weight() {
        let est = estimator();
        assert!(est.bayesian_fuse(&[]).is_none());

        let single = WindObservation {
            timestamp_ms: 0,
            lat: 54.4,
            lon: 10.2,
            direction_deg: 123.0,
            speed_kts: 7.0,
            confidence: 0.6,
            source: WindSource::Vmg,
        };
        let out = est.bayesian_fuse(std::slice::from_ref(&single)).unwrap();
        assert_abs_diff_eq!(out.direction_deg, 123.0);

        // All-zero confidences fall back to uniform weights
        let zeroed = vec![
            WindObservation {
                confidence: 0.0,
                direction_deg: 80.0,
                ..single.clone()
            },
            WindObservation {
                confidence: 0.0,
                direction_deg: 100.0,
                ..single
            },
        ];
        let fused = est.bayesian_fuse(&zeroed).unwrap();
        assert_abs_diff_eq!(fused.direction_deg, 90.0, epsilon = 1e-9);
    }

    #[test]
    fn angle_cache_stays_bounded() {
        let mut cache = AngleDiffCache::new(64);
        for i in 0..1000 {
            let _ = cache.rel(i as f64 * 0.7, 180.0);
        }
        assert!(cache.len() <= 64);
        // Hot entry survives the churn
        let v = cache.rel(10.0, 180.0);
        assert_abs_diff_eq!(v, delta_deg(180.0, 10.0));
    }

    #[test]
    fn non_bayesian_mode_emits_unweighted_candidates() {
        let track = beating_track(400, 60, 5.0);
        let config = AnalysisConfig {
            use_bayesian: false,
            ..Default::default()
        };
        let mut est = WindEstimator::new(config, OptimalVmgCalculator::one_design());
        let out = est.estimate_wind(&track);
        assert!(!out.value.is_empty());
        assert!(out.value.iter().all(|o| o.confidence == 1.0));
        assert!(out
            .value
            .iter()
            .all(|o| o.source != WindSource::Bayesian));
    }

    /// Track with polar-consistent speeds under a north wind: close-hauled
    /// legs are slower than the reaches, which is the signal the VMG search
    /// keys on.
    fn mixed_course_track() -> BoatTrack {
        let polar = OptimalVmgCalculator::one_design();
        let mut pos = LatLon::new(54.4, 10.2);
        let mut points = Vec::new();
        let legs = [315.0, 45.0, 90.0, 270.0, 315.0, 45.0];
        for (leg_no, heading) in legs.iter().enumerate() {
            let speed = polar.target_speed(twa_deg(*heading, 0.0).abs(), 10.0).value;
            for i in 0..120i64 {
                let t = leg_no as i64 * 120 + i;
                points.push(TrackPoint {
                    timestamp_ms: t * 1000,
                    lat: pos.lat,
                    lon: pos.lon,
                    speed: Some(speed),
                    heading_deg: Some(*heading),
                });
                pos = destination(pos, *heading, speed * MPS_PER_KNOT);
            }
        }
        BoatTrack {
            boat_id: "mixed".into(),
            points,
            units: SpeedUnit::Knots,
            polar_class: None,
        }
    }

    #[test]
    fn vmg_search_recovers_wind_within_refine_step() {
        let track = mixed_course_track();
        let mut est = estimator();
        let obs = est.estimate_from_vmg_analysis(&track).unwrap();
        let err = delta_deg(obs.direction_deg, 0.0).abs();
        assert!(err <= REFINE_STEP_DEG, "direction {}", obs.direction_deg);
        assert!(obs.confidence > 0.5, "confidence {}", obs.confidence);
        // Second call hits the per-track cache and agrees
        let again = est.estimate_from_vmg_analysis(&track).unwrap();
        assert_abs_diff_eq!(again.direction_deg, obs.direction_deg);
    }
}

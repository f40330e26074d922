//! # track-simulator
//!
//! Deterministic synthetic GPS tracks for exercising the analysis engine.
//! Each generator reproduces one canonical race situation:
//! - a straight reach at constant speed (nothing to detect),
//! - a beating leg with regular tacks,
//! - a smooth curve with a single displaced fix,
//! - a course sailed through a sustained wind shift,
//! - a windward rounding of a known mark.
//!
//! Noise comes from a seeded RNG so the same config always produces the
//! same track; set `gps_noise_m` to 0 for exact geometry.

use chrono::{TimeZone, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::Deserialize;

use race_types::{BoatTrack, Fix, LatLon, SpeedUnit, WindObservation};

/// Meters per knot-second.
const MPS_PER_KNOT: f64 = 0.514_444_444_444_444_4;
const EARTH_RADIUS_M: f64 = 6_371_000.0;

// ── Config (populated from config.toml) ───────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    // [area]
    pub start_lat: f64,
    pub start_lon: f64,

    // [sampling]
    pub sample_interval_s: f64,

    // [noise]
    /// 1-σ horizontal GPS noise, meters
    pub gps_noise_m: f64,
    /// 1-σ speed-over-ground noise, knots
    pub speed_noise_kts: f64,
    /// RNG seed; identical seeds give identical tracks
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            start_lat: 54.4,
            start_lon: 10.2,
            sample_interval_s: 1.0,
            gps_noise_m: 0.0,
            speed_noise_kts: 0.0,
            seed: 7,
        }
    }
}

// ── Flat-earth stepping ───────────────────────────────────────────────────────

/// Advance a position by `dist_m` on `bearing_deg`. Flat-earth increments
/// are exact enough for the few-kilometer tracks these generators emit.
pub fn step(pos: LatLon, bearing_deg: f64, dist_m: f64) -> LatLon {
    let rad = bearing_deg.to_radians();
    let north = dist_m * rad.cos();
    let east = dist_m * rad.sin();
    LatLon::new(
        pos.lat + (north / EARTH_RADIUS_M).to_degrees(),
        pos.lon + (east / (EARTH_RADIUS_M * pos.lat.to_radians().cos())).to_degrees(),
    )
}

// ── Generator core ────────────────────────────────────────────────────────────

struct Walker {
    cfg: SimConfig,
    rng: StdRng,
    pos: LatLon,
    fixes: Vec<Fix>,
}

impl Walker {
    fn new(cfg: &SimConfig) -> Self {
        Self {
            cfg: cfg.clone(),
            rng: StdRng::seed_from_u64(cfg.seed),
            pos: LatLon::new(cfg.start_lat, cfg.start_lon),
            fixes: Vec::new(),
        }
    }

    /// Emit one fix at sample `i`, then advance along `heading`.
    fn emit_and_step(&mut self, i: usize, heading_deg: f64, speed_kts: f64) {
        let noise = Normal::new(0.0, self.cfg.gps_noise_m.max(1e-12)).unwrap();
        let speed_noise = Normal::new(0.0, self.cfg.speed_noise_kts.max(1e-12)).unwrap();

        let reported = if self.cfg.gps_noise_m > 0.0 {
            let jitter_bearing = (i as f64 * 73.0) % 360.0;
            step(self.pos, jitter_bearing, noise.sample(&mut self.rng))
        } else {
            self.pos
        };
        let reported_speed = if self.cfg.speed_noise_kts > 0.0 {
            (speed_kts + speed_noise.sample(&mut self.rng)).max(0.0)
        } else {
            speed_kts
        };

        let t_ms = (i as f64 * self.cfg.sample_interval_s * 1000.0) as i64;
        self.fixes.push(Fix {
            ts: Utc.timestamp_millis_opt(t_ms).unwrap(),
            lat: reported.lat,
            lon: reported.lon,
            speed: Some(reported_speed),
            heading_deg: Some(heading_deg),
        });
        self.pos = step(
            self.pos,
            heading_deg,
            speed_kts * MPS_PER_KNOT * self.cfg.sample_interval_s,
        );
    }

    fn into_track(self, boat_id: &str) -> BoatTrack {
        BoatTrack::from_fixes(boat_id, SpeedUnit::Knots, self.fixes)
    }
}

// ── Scenario generators ───────────────────────────────────────────────────────

/// Constant bearing, constant speed. Expected analysis: no anomalies, no
/// maneuvers.
pub fn straight_reach(
    cfg: &SimConfig,
    n: usize,
    bearing_deg: f64,
    speed_kts: f64,
) -> BoatTrack {
    let mut w = Walker::new(cfg);
    for i in 0..n {
        w.emit_and_step(i, bearing_deg, speed_kts);
    }
    w.into_track("sim-reach")
}

/// Upwind beat: headings alternate `wind ± beat_angle` every `leg_s`
/// seconds. Expected analysis: a tack at each transition, estimated wind
/// near `wind_dir_deg`.
pub fn beating_leg(
    cfg: &SimConfig,
    n: usize,
    leg_s: f64,
    wind_dir_deg: f64,
    beat_angle_deg: f64,
    speed_kts: f64,
) -> BoatTrack {
    let mut w = Walker::new(cfg);
    let samples_per_leg = (leg_s / cfg.sample_interval_s).max(1.0) as usize;
    for i in 0..n {
        let side = if (i / samples_per_leg) % 2 == 0 { -1.0 } else { 1.0 };
        let heading = (wind_dir_deg + side * beat_angle_deg).rem_euclid(360.0);
        w.emit_and_step(i, heading, speed_kts);
    }
    w.into_track("sim-beater")
}

/// Smooth gentle curve with the fix at `outlier_idx` displaced by
/// `offset_m`. Expected analysis: exactly that index flagged.
pub fn outlier_jump(cfg: &SimConfig, n: usize, outlier_idx: usize, offset_m: f64) -> BoatTrack {
    let mut w = Walker::new(cfg);
    for i in 0..n {
        // Slowly swinging bearing keeps the curve smooth but not straight
        let heading = 90.0 + 20.0 * (i as f64 / n as f64 * std::f64::consts::TAU).sin();
        w.emit_and_step(i, heading, 4.0);
    }
    let mut track = w.into_track("sim-outlier");
    if let Some(p) = track.points.get_mut(outlier_idx) {
        let moved = step(LatLon::new(p.lat, p.lon), 0.0, offset_m);
        p.lat = moved.lat;
        p.lon = moved.lon;
    }
    track
}

/// Straight sailing whose heading rotates by `shift_deg` at `shift_at_s`
/// and stays there, the way a fleet tracks a permanent shift.
pub fn wind_shift_course(
    cfg: &SimConfig,
    n: usize,
    base_heading_deg: f64,
    shift_at_s: f64,
    shift_deg: f64,
    speed_kts: f64,
) -> BoatTrack {
    let mut w = Walker::new(cfg);
    for i in 0..n {
        let t = i as f64 * cfg.sample_interval_s;
        let heading = if t < shift_at_s {
            base_heading_deg
        } else {
            (base_heading_deg + shift_deg).rem_euclid(360.0)
        };
        w.emit_and_step(i, heading, speed_kts);
    }
    w.into_track("sim-shift")
}

/// Sail north to a mark `mark_dist_m` upwind, round it, run back. Returns
/// the track and the mark position.
pub fn windward_rounding(
    cfg: &SimConfig,
    mark_dist_m: f64,
    speed_kts: f64,
) -> (BoatTrack, LatLon) {
    let mut w = Walker::new(cfg);
    let mark = step(LatLon::new(cfg.start_lat, cfg.start_lon), 0.0, mark_dist_m);
    let step_m = speed_kts * MPS_PER_KNOT * cfg.sample_interval_s;
    let samples_up = (mark_dist_m / step_m).ceil() as usize;
    for i in 0..samples_up {
        w.emit_and_step(i, 0.0, speed_kts);
    }
    for i in samples_up..(2 * samples_up) {
        w.emit_and_step(i, 180.0, speed_kts);
    }
    (w.into_track("sim-rounder"), mark)
}

/// A committee-boat anemometer report.
pub fn external_wind(
    t_s: f64,
    pos: LatLon,
    direction_deg: f64,
    speed_kts: f64,
    confidence: f64,
) -> WindObservation {
    WindObservation::external(
        Utc.timestamp_millis_opt((t_s * 1000.0) as i64).unwrap(),
        pos,
        direction_deg,
        speed_kts,
        Some(confidence),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_track() {
        let cfg = SimConfig {
            gps_noise_m: 2.0,
            speed_noise_kts: 0.3,
            ..Default::default()
        };
        let a = straight_reach(&cfg, 100, 90.0, 4.0);
        let b = straight_reach(&cfg, 100, 90.0, 4.0);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn noiseless_reach_is_perfectly_straight() {
        let cfg = SimConfig::default();
        let track = straight_reach(&cfg, 50, 90.0, 4.0);
        assert_eq!(track.points.len(), 50);
        // Constant latitude on a due-east course
        let lat0 = track.points[0].lat;
        assert!(track
            .points
            .iter()
            .all(|p| (p.lat - lat0).abs() < 1e-9));
    }

    #[test]
    fn beating_leg_alternates_headings() {
        let cfg = SimConfig::default();
        let track = beating_leg(&cfg, 240, 60.0, 0.0, 45.0, 5.0);
        assert_eq!(track.points[0].heading_deg, Some(315.0));
        assert_eq!(track.points[60].heading_deg, Some(45.0));
        assert_eq!(track.points[120].heading_deg, Some(315.0));
    }

    #[test]
    fn outlier_is_displaced_by_the_requested_distance() {
        let cfg = SimConfig::default();
        let clean = outlier_jump(&cfg, 100, 100, 5_000.0); // idx out of range: untouched
        let spiked = outlier_jump(&cfg, 100, 50, 5_000.0);
        let d_lat = (spiked.points[50].lat - clean.points[50].lat).abs();
        assert!((d_lat * 111_195.0 - 5_000.0).abs() < 1.0);
    }

    #[test]
    fn shift_course_changes_heading_once() {
        let cfg = SimConfig::default();
        let track = wind_shift_course(&cfg, 1200, 315.0, 600.0, 15.0, 5.0);
        assert_eq!(track.points[599].heading_deg, Some(315.0));
        assert_eq!(track.points[600].heading_deg, Some(330.0));
        assert_eq!(track.points[1199].heading_deg, Some(330.0));
    }
}

//! strategy.rs — Strategy-point detection
//!
//! Scans a cleaned track against the fused wind field for tacks, jibes,
//! wind shifts, laylines, mark roundings and line crossings, each scored
//! for execution quality. Without a wind input the detector degrades to
//! geometric tack/jibe detection; shift and layline rules are skipped with
//! a warning, never an error.

use race_types::{
    BoatTrack, Course, LatLon, Mark, StrategyDetail, StrategyKind, StrategyPoint, WindField,
};
use tracing::debug;

use crate::angles::{circular_mean, delta_deg, twa_deg, wrap_deg};
use crate::config::AnalysisConfig;
use crate::error::{AbortFlag, Analysis};
use crate::geo::{haversine_m, ray_offset, segments_cross, EnuFrame};
use crate::polar::OptimalVmgCalculator;
use crate::wind::{collect_samples, ManeuverKind, Sample, WindEstimator};

/// Wind shifts are scanned on this cadence along the track, seconds.
const SHIFT_SCAN_STEP_S: f64 = 10.0;
/// Heading change that counts as a rounding at mark proximity, degrees.
const ROUNDING_TURN_DEG: f64 = 45.0;
/// Two same-kind points closer than this in time and space collapse into
/// the higher-scoring one.
const DEDUP_WINDOW_MS: i64 = 30_000;
const DEDUP_RADIUS_M: f64 = 100.0;

/// Wind made available to the detector: a single snapshot, a per-timestamp
/// lookup, or nothing.
pub enum WindInput<'a> {
    Snapshot(&'a WindField),
    Lookup(&'a dyn Fn(i64) -> Option<WindField>),
    None,
}

impl WindInput<'_> {
    /// (direction_deg, speed_kts) at a time and place, if known.
    fn wind_at(&self, timestamp_ms: i64, pos: LatLon) -> Option<(f64, f64)> {
        match self {
            WindInput::Snapshot(field) => field.sample(pos).map(|(d, s, _)| (d, s)),
            WindInput::Lookup(f) => f(timestamp_ms)
                .and_then(|field| field.sample(pos).map(|(d, s, _)| (d, s))),
            WindInput::None => None,
        }
    }

    fn is_none(&self) -> bool {
        matches!(self, WindInput::None)
    }
}

/// Candidate with its temporal extent, for overlap tie-breaking.
struct Candidate {
    timestamp_ms: i64,
    window: (i64, i64),
    pos: LatLon,
    detail: StrategyDetail,
    importance: f64,
    evaluation: f64,
}

#[derive(Debug, Clone)]
pub struct StrategyDetector {
    config: AnalysisConfig,
    polar: OptimalVmgCalculator,
    estimator: WindEstimator,
}

impl StrategyDetector {
    pub fn new(config: AnalysisConfig, polar: OptimalVmgCalculator) -> Self {
        let estimator = WindEstimator::new(config.clone(), polar.clone());
        Self {
            config,
            polar,
            estimator,
        }
    }

    /// Detect all strategy points on a cleaned track. Output is strictly
    /// sorted by timestamp with deterministic ids.
    pub fn detect(
        &self,
        track: &BoatTrack,
        course: &Course,
        wind: &WindInput<'_>,
        abort: &AbortFlag,
    ) -> Analysis<Vec<StrategyPoint>> {
        let (samples, mut diagnostics) = collect_samples(track);
        if samples.len() < 2 {
            let mut out = Analysis::with(Vec::new(), diagnostics);
            out.diagnostics.insufficient_data = true;
            out.diagnostics.warn("track too short for strategy detection");
            return out;
        }
        if wind.is_none() {
            diagnostics.warn(
                "no wind field available; wind-shift and layline detection skipped, \
                 maneuver classification is geometric",
            );
        }

        let mut candidates: Vec<Candidate> = Vec::new();
        let mut aborted = false;

        // Maneuvers (tacks and jibes)
        let maneuvers = self.estimator.detect_maneuvers(track);
        diagnostics.merge(maneuvers.diagnostics);
        for m in &maneuvers.value {
            if abort.is_set() {
                aborted = true;
                break;
            }
            let local_wind = wind.wind_at(m.timestamp_ms, m.pos);
            let kind = self.estimator.classify_maneuver(
                m.pre_heading_deg,
                m.post_heading_deg,
                local_wind.map(|(d, _)| d),
            );
            let Some(kind @ (ManeuverKind::Tack | ManeuverKind::Jibe)) = kind else {
                continue;
            };
            let evaluation = self.evaluate_maneuver(m, kind, local_wind);
            let importance = (m.swing_deg.abs() / 120.0).clamp(0.5, 1.0);
            let detail = match kind {
                ManeuverKind::Tack => StrategyDetail::Tack {
                    entry_heading_deg: m.pre_heading_deg,
                    exit_heading_deg: m.post_heading_deg,
                    swing_deg: m.swing_deg,
                    vmg_loss_kts: self.vmg_loss(m, kind, local_wind),
                },
                ManeuverKind::Jibe => StrategyDetail::Jibe {
                    entry_heading_deg: m.pre_heading_deg,
                    exit_heading_deg: m.post_heading_deg,
                    swing_deg: m.swing_deg,
                    vmg_loss_kts: self.vmg_loss(m, kind, local_wind),
                },
                _ => unreachable!(),
            };
            candidates.push(Candidate {
                timestamp_ms: m.timestamp_ms,
                window: (
                    (samples_t_ms(&samples, m.start_idx)).unwrap_or(m.timestamp_ms),
                    (samples_t_ms(&samples, m.end_idx)).unwrap_or(m.timestamp_ms),
                ),
                pos: m.pos,
                detail,
                importance,
                evaluation,
            });
        }

        // Wind shifts and laylines need wind
        if !wind.is_none() && !aborted {
            candidates.extend(self.detect_wind_shifts(&samples, wind));
            let roundings = self.detect_mark_roundings(&samples, course, abort);
            candidates.extend(self.detect_laylines(&samples, course, wind, &roundings));
            candidates.extend(roundings);
        } else if !aborted {
            candidates.extend(self.detect_mark_roundings(&samples, course, abort));
        }

        // Line crossings
        if !aborted {
            candidates.extend(self.detect_line_crossings(&samples, course));
        }

        let mut points = finalize(candidates, &track.boat_id);
        if aborted {
            diagnostics.aborted = true;
            diagnostics.warn("strategy detection aborted; partial results returned");
        }
        debug!(
            boat = %track.boat_id,
            points = points.len(),
            "strategy detection complete"
        );
        points.sort_by_key(|p| p.timestamp_ms);
        Analysis::with(points, diagnostics)
    }

    /// Execution score: measured VMG through the maneuver against the polar
    /// target, `1 − min(1, loss/loss_ref)`. Without wind, speed retention
    /// through the turn stands in.
    fn evaluate_maneuver(
        &self,
        m: &crate::wind::Maneuver,
        kind: ManeuverKind,
        local_wind: Option<(f64, f64)>,
    ) -> f64 {
        match local_wind {
            Some(_) => {
                let loss = self.vmg_loss(m, kind, local_wind);
                (1.0 - (loss / self.config.vmg_loss_ref_kts).min(1.0)).clamp(0.0, 1.0)
            }
            None => {
                let (fast, slow) = if m.pre_speed_kts >= m.post_speed_kts {
                    (m.pre_speed_kts, m.post_speed_kts)
                } else {
                    (m.post_speed_kts, m.pre_speed_kts)
                };
                if fast <= 0.0 {
                    0.0
                } else {
                    (slow / fast).clamp(0.0, 1.0)
                }
            }
        }
    }

    /// Measured VMG shortfall against the polar target, knots (≥ 0).
    fn vmg_loss(
        &self,
        m: &crate::wind::Maneuver,
        kind: ManeuverKind,
        local_wind: Option<(f64, f64)>,
    ) -> f64 {
        let Some((wind_dir, wind_speed)) = local_wind else {
            return 0.0;
        };
        let twa_pre = twa_deg(m.pre_heading_deg, wind_dir);
        let twa_post = twa_deg(m.post_heading_deg, wind_dir);
        let measured = (m.pre_speed_kts * twa_pre.to_radians().cos().abs()
            + m.post_speed_kts * twa_post.to_radians().cos().abs())
            / 2.0;
        let target = match kind {
            ManeuverKind::Tack => self.polar.target_vmg_upwind(wind_speed),
            ManeuverKind::Jibe => self.polar.target_vmg_downwind(wind_speed),
            _ => return 0.0,
        };
        (target - measured).max(0.0)
    }

    /// Sustained direction changes in the wind input along the track.
    fn detect_wind_shifts(&self, samples: &[Sample], wind: &WindInput<'_>) -> Vec<Candidate> {
        // Wind series on a fixed cadence
        let mut series: Vec<(f64, f64)> = Vec::new(); // (t_s, direction)
        let mut next_t = samples[0].t_s;
        for s in samples {
            if s.t_s + 1e-9 < next_t {
                continue;
            }
            if let Some((dir, _)) = wind.wind_at((s.t_s * 1000.0) as i64, s.pos) {
                series.push((s.t_s, dir));
            }
            next_t = s.t_s + SHIFT_SCAN_STEP_S;
        }
        if series.len() < 4 {
            return Vec::new();
        }

        let window_s = self.config.min_shift_duration_s;
        let min_angle = self.config.min_shift_angle_deg;
        let mut shifts = Vec::new();
        let mut blocked_until = f64::NEG_INFINITY;

        for i in 1..series.len() {
            let (t, _) = series[i];
            if t < blocked_until {
                continue;
            }
            let before: Vec<f64> = series[..i]
                .iter()
                .filter(|(ts, _)| *ts >= t - window_s && *ts < t)
                .map(|(_, d)| *d)
                .collect();
            let after: Vec<f64> = series[i..]
                .iter()
                .filter(|(ts, _)| *ts >= t && *ts <= t + window_s)
                .map(|(_, d)| *d)
                .collect();
            if before.len() < 3 || after.len() < 3 {
                continue;
            }
            let (Some(before_mean), Some(after_mean)) =
                (circular_mean(before.iter().copied()), circular_mean(after.iter().copied()))
            else {
                continue;
            };
            let magnitude = delta_deg(before_mean, after_mean);
            if magnitude.abs() < min_angle {
                continue;
            }
            // The shift must have settled: a window still mid-rotation
            // (samples straddling old and new direction) is not an onset
            let tolerance = min_angle.max(5.0);
            if after
                .iter()
                .any(|d| delta_deg(after_mean, *d).abs() > tolerance)
            {
                continue;
            }

            // Duration: how long the wind holds the new direction
            let hold_until = series[i..]
                .iter()
                .take_while(|(_, d)| delta_deg(after_mean, *d).abs() <= tolerance)
                .last()
                .map(|(ts, _)| *ts)
                .unwrap_or(t);
            let duration_s = (hold_until - t).max(window_s);

            let sample = nearest_sample(samples, t);
            shifts.push(Candidate {
                timestamp_ms: (t * 1000.0) as i64,
                window: ((t * 1000.0) as i64, ((t + duration_s) * 1000.0) as i64),
                pos: sample.pos,
                detail: StrategyDetail::WindShift {
                    before_deg: before_mean,
                    after_deg: after_mean,
                    magnitude_deg: magnitude.abs(),
                    duration_s,
                },
                importance: (magnitude.abs() / 30.0).clamp(0.3, 1.0),
                evaluation: 1.0,
            });
            blocked_until = t + duration_s;
        }
        shifts
    }

    /// Closed-form layline calls: the opposite-tack course at the current
    /// TWA passes within tolerance of the next mark.
    fn detect_laylines(
        &self,
        samples: &[Sample],
        course: &Course,
        wind: &WindInput<'_>,
        roundings: &[Candidate],
    ) -> Vec<Candidate> {
        if course.marks.is_empty() {
            return Vec::new();
        }
        let frame = EnuFrame::new(samples[0].pos);
        let mut laylines: Vec<Candidate> = Vec::new();
        // One call per (mark, tack side)
        let mut called: Vec<(usize, bool)> = Vec::new();

        for s in samples {
            let ts_ms = (s.t_s * 1000.0) as i64;
            let Some((wind_dir, _)) = wind.wind_at(ts_ms, s.pos) else {
                continue;
            };
            let twa = twa_deg(s.heading_deg, wind_dir);
            if twa.abs() >= 90.0 || twa.abs() < 10.0 {
                continue; // not beating
            }
            let Some((mark_idx, mark)) = next_mark(course, roundings, ts_ms) else {
                continue;
            };
            let starboard = twa > 0.0;
            if called.contains(&(mark_idx, starboard)) {
                continue;
            }
            // Opposite tack at the same TWA: heading mirrors across the wind
            let opposite_heading = wrap_deg(wind_dir + twa);
            let (offset_m, along_m) = ray_offset(&frame, s.pos, opposite_heading, mark.pos);
            if along_m <= 0.0 || offset_m > self.config.layline_tolerance_m {
                continue;
            }
            called.push((mark_idx, starboard));
            laylines.push(Candidate {
                timestamp_ms: ts_ms,
                window: (ts_ms, ts_ms),
                pos: s.pos,
                detail: StrategyDetail::Layline {
                    mark_id: mark.id.clone(),
                    target_twa_deg: twa.abs(),
                    distance_to_mark_m: haversine_m(s.pos, mark.pos),
                },
                importance: 0.6,
                evaluation: 1.0,
            });
        }
        laylines
    }

    /// Proximity plus a sharp turn makes a rounding candidate.
    fn detect_mark_roundings(
        &self,
        samples: &[Sample],
        course: &Course,
        abort: &AbortFlag,
    ) -> Vec<Candidate> {
        let mut roundings = Vec::new();
        for mark in &course.marks {
            if abort.is_set() {
                break;
            }
            // Closest approach within the rounding radius
            let mut best: Option<(usize, f64)> = None;
            for (i, s) in samples.iter().enumerate() {
                let d = haversine_m(s.pos, mark.pos);
                if d <= self.config.mark_rounding_distance_m
                    && best.map_or(true, |(_, bd)| d < bd)
                {
                    best = Some((i, d));
                }
            }
            let Some((at, closest_m)) = best else {
                continue;
            };

            // Heading change across the rounding window
            let half_window = self.config.maneuver_window_s;
            let t_at = samples[at].t_s;
            let entry = samples[..at]
                .iter()
                .rev()
                .find(|s| s.t_s <= t_at - half_window)
                .or_else(|| samples.first());
            let exit = samples[at..]
                .iter()
                .find(|s| s.t_s >= t_at + half_window)
                .or_else(|| samples.last());
            let (Some(entry), Some(exit)) = (entry, exit) else {
                continue;
            };
            let turn = delta_deg(entry.heading_deg, exit.heading_deg);
            if turn.abs() < ROUNDING_TURN_DEG {
                continue;
            }

            let speed_in = entry.speed_kts.max(1e-6);
            let evaluation = (exit.speed_kts / speed_in).clamp(0.0, 1.0);
            roundings.push(Candidate {
                timestamp_ms: (t_at * 1000.0) as i64,
                window: ((entry.t_s * 1000.0) as i64, (exit.t_s * 1000.0) as i64),
                pos: samples[at].pos,
                detail: StrategyDetail::MarkRounding {
                    mark_id: mark.id.clone(),
                    closest_approach_m: closest_m,
                    heading_change_deg: turn.abs(),
                },
                importance: 0.9,
                evaluation,
            });
        }
        roundings
    }

    /// First start-line crossing and last finish-line crossing.
    fn detect_line_crossings(&self, samples: &[Sample], course: &Course) -> Vec<Candidate> {
        let frame = EnuFrame::new(samples[0].pos);
        let mut crossings = Vec::new();

        if let Some(line) = &course.start_line {
            let hit = samples.windows(2).find(|w| {
                segments_cross(&frame, w[0].pos, w[1].pos, line.p1, line.p2)
            });
            if let Some(w) = hit {
                crossings.push(Candidate {
                    timestamp_ms: (w[1].t_s * 1000.0) as i64,
                    window: ((w[0].t_s * 1000.0) as i64, (w[1].t_s * 1000.0) as i64),
                    pos: w[1].pos,
                    detail: StrategyDetail::Start,
                    importance: 1.0,
                    evaluation: 1.0,
                });
            }
        }
        if let Some(line) = &course.finish_line {
            let hit = samples
                .windows(2)
                .rev()
                .find(|w| segments_cross(&frame, w[0].pos, w[1].pos, line.p1, line.p2));
            if let Some(w) = hit {
                crossings.push(Candidate {
                    timestamp_ms: (w[1].t_s * 1000.0) as i64,
                    window: ((w[0].t_s * 1000.0) as i64, (w[1].t_s * 1000.0) as i64),
                    pos: w[1].pos,
                    detail: StrategyDetail::Finish,
                    importance: 1.0,
                    evaluation: 1.0,
                });
            }
        }
        crossings
    }
}

fn samples_t_ms(samples: &[Sample], track_idx: usize) -> Option<i64> {
    samples
        .iter()
        .find(|s| s.idx == track_idx)
        .map(|s| (s.t_s * 1000.0) as i64)
}

fn nearest_sample(samples: &[Sample], t_s: f64) -> &Sample {
    samples
        .iter()
        .min_by(|a, b| (a.t_s - t_s).abs().total_cmp(&(b.t_s - t_s).abs()))
        .expect("samples is non-empty")
}

/// The next mark still to be rounded at `ts_ms`, in course order.
fn next_mark<'c>(
    course: &'c Course,
    roundings: &[Candidate],
    ts_ms: i64,
) -> Option<(usize, &'c Mark)> {
    for (idx, mark) in course.marks.iter().enumerate() {
        let rounded_before = roundings.iter().any(|r| {
            matches!(&r.detail, StrategyDetail::MarkRounding { mark_id, .. } if *mark_id == mark.id)
                && r.timestamp_ms <= ts_ms
        });
        if !rounded_before {
            return Some((idx, mark));
        }
    }
    None
}

/// Overlap tie-breaking, spatio-temporal dedup, deterministic ids, final
/// ordering.
fn finalize(candidates: Vec<Candidate>, boat_id: &str) -> Vec<StrategyPoint> {
    let mut candidates = candidates;
    candidates.sort_by(|a, b| {
        a.timestamp_ms
            .cmp(&b.timestamp_ms)
            .then_with(|| a.evaluation.total_cmp(&b.evaluation))
    });

    let mut kept: Vec<Candidate> = Vec::new();
    'outer: for c in candidates {
        for existing in &mut kept {
            if existing.detail.kind() != c.detail.kind() {
                continue; // across kinds, everything is emitted
            }
            if overlap_fraction(existing.window, c.window) > 0.5
                || (c.timestamp_ms - existing.timestamp_ms).abs() <= DEDUP_WINDOW_MS
                    && haversine_m(existing.pos, c.pos) <= DEDUP_RADIUS_M
            {
                // Keep the higher-scoring peer
                if c.evaluation > existing.evaluation {
                    *existing = c;
                }
                continue 'outer;
            }
        }
        kept.push(c);
    }

    kept.sort_by_key(|c| c.timestamp_ms);
    kept.into_iter()
        .enumerate()
        .map(|(n, c)| {
            let kind_tag = match c.detail.kind() {
                StrategyKind::Tack => "tack",
                StrategyKind::Jibe => "jibe",
                StrategyKind::WindShift => "wind-shift",
                StrategyKind::Layline => "layline",
                StrategyKind::MarkRounding => "mark-rounding",
                StrategyKind::Start => "start",
                StrategyKind::Finish => "finish",
            };
            StrategyPoint {
                id: format!("{kind_tag}:{}:{n}", c.timestamp_ms),
                boat_id: boat_id.to_string(),
                timestamp_ms: c.timestamp_ms,
                lat: c.pos.lat,
                lon: c.pos.lon,
                detail: c.detail,
                importance: c.importance.clamp(0.0, 1.0),
                evaluation: c.evaluation.clamp(0.0, 1.0),
            }
        })
        .collect()
}

/// Fraction of the shorter interval covered by the intersection.
fn overlap_fraction(a: (i64, i64), b: (i64, i64)) -> f64 {
    let lo = a.0.max(b.0);
    let hi = a.1.min(b.1);
    if hi <= lo {
        return 0.0;
    }
    let shorter = (a.1 - a.0).min(b.1 - b.0).max(1);
    (hi - lo) as f64 / shorter as f64
}

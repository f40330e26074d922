//! anomaly.rs — GPS outlier detection
//!
//! Two independently selectable methods over a single column-pass pipeline:
//! implied speed against a mean + k·σ threshold, and displacement against a
//! median/MAD z-score. Both run in O(n) extra memory with one sort for the
//! time ordering; nothing here is quadratic.

use race_types::{LatLon, TrackPoint};
use tracing::debug;

use crate::error::{Analysis, Diagnostics};
use crate::geo::consecutive_distances_m;

/// Time deltas are clamped to this floor so a duplicate-ish timestamp does
/// not blow up the implied speed.
const MIN_DT_S: f64 = 0.1;

/// Floor for σ and the normalized MAD; keeps thresholds sane on
/// near-constant series.
const MIN_SIGMA: f64 = 0.1;

/// Consistency constant scaling MAD to a Gaussian σ estimate.
const MAD_TO_SIGMA: f64 = 1.4826;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyMethod {
    /// Implied point-to-point speed vs mean + k·σ
    Speed,
    /// Displacement vs median/MAD z-score with the same multiplier
    ZScore,
}

/// One flagged track point. `index` refers to the caller's original order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anomaly {
    pub index: usize,
    /// Ratio to the detection threshold; > 1 by construction
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    speed_multiplier: f64,
}

impl AnomalyDetector {
    pub fn new(speed_multiplier: f64) -> Self {
        Self { speed_multiplier }
    }

    /// Flag anomalous points in an arbitrarily ordered series. Pure: the
    /// same input and method always yield the same output.
    pub fn detect(&self, points: &[TrackPoint], method: AnomalyMethod) -> Analysis<Vec<Anomaly>> {
        let mut diagnostics = Diagnostics::default();

        // Usable rows: finite timestamp and coordinates. NaN timestamps are
        // the validator's business; they are never scored here.
        let mut rows: Vec<(usize, f64, LatLon)> = Vec::with_capacity(points.len());
        for (idx, p) in points.iter().enumerate() {
            let t = p.t_secs();
            if !t.is_finite() || !p.pos().is_finite() {
                diagnostics.skip_record();
                continue;
            }
            rows.push((idx, t, p.pos()));
        }
        if diagnostics.skipped_records > 0 {
            diagnostics.warn(format!(
                "{} record(s) with non-finite timestamp or position skipped",
                diagnostics.skipped_records
            ));
        }

        if rows.len() < 2 {
            let mut out = Analysis::with(Vec::new(), diagnostics);
            out.diagnostics.insufficient_data = true;
            out.diagnostics
                .warn("fewer than 2 usable points; nothing to score");
            return out;
        }

        rows.sort_by(|a, b| a.1.total_cmp(&b.1));

        // No temporal order to score against; the validator reports these
        // as duplicates
        if rows[0].1 == rows[rows.len() - 1].1 {
            let mut out = Analysis::with(Vec::new(), diagnostics);
            out.diagnostics.insufficient_data = true;
            out.diagnostics.warn("all timestamps identical; skipping scan");
            return out;
        }

        let positions: Vec<LatLon> = rows.iter().map(|r| r.2).collect();
        let distances = consecutive_distances_m(&positions);
        let dts: Vec<f64> = rows
            .windows(2)
            .map(|w| (w[1].1 - w[0].1).max(MIN_DT_S))
            .collect();

        let (scores, threshold) = match method {
            AnomalyMethod::Speed => {
                let speeds: Vec<f64> = distances
                    .iter()
                    .zip(&dts)
                    .map(|(d, dt)| d / dt)
                    .collect();
                let threshold = speed_threshold(&speeds, self.speed_multiplier);
                (speeds, threshold)
            }
            AnomalyMethod::ZScore => {
                let (median, mad_sigma) = median_mad(&distances);
                let scores: Vec<f64> = distances
                    .iter()
                    .map(|d| (d - median).abs() / mad_sigma)
                    .collect();
                // Scores are already normalized; flag past the multiplier.
                (scores, self.speed_multiplier.max(f64::MIN_POSITIVE))
            }
        };

        let anomalies = flag_points(&rows, &scores, threshold);
        debug!(
            n = rows.len(),
            flagged = anomalies.len(),
            ?method,
            "anomaly scan complete"
        );
        Analysis::with(anomalies, diagnostics)
    }
}

/// mean + k·σ over strictly positive samples, σ floored.
fn speed_threshold(speeds: &[f64], multiplier: f64) -> f64 {
    let positive: Vec<f64> = speeds.iter().copied().filter(|s| *s > 0.0).collect();
    if positive.is_empty() {
        // All-zero series: floor keeps the threshold above zero so nothing
        // is flagged.
        return multiplier.max(1.0) * MIN_SIGMA;
    }
    let n = positive.len() as f64;
    let mean = positive.iter().sum::<f64>() / n;
    let var = positive.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    let sigma = var.sqrt().max(MIN_SIGMA);
    mean + multiplier * sigma
}

/// (median, normalized MAD floored) in O(n) via selection.
fn median_mad(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, MIN_SIGMA);
    }
    let median = select_median(values.to_vec());
    let deviations: Vec<f64> = values.iter().map(|v| (v - median).abs()).collect();
    let mad = select_median(deviations);
    (median, (MAD_TO_SIGMA * mad).max(MIN_SIGMA))
}

fn select_median(mut v: Vec<f64>) -> f64 {
    let mid = v.len() / 2;
    let (_, m, _) = v.select_nth_unstable_by(mid, f64::total_cmp);
    *m
}

/// Map flagged segments onto points. A run of consecutive over-threshold
/// segments pins its interior points (each shared by two bad segments, the
/// displaced-fix case); a lone over-threshold segment pins its later
/// endpoint (the jump-and-stay case).
fn flag_points(rows: &[(usize, f64, LatLon)], scores: &[f64], threshold: f64) -> Vec<Anomaly> {
    let mut anomalies: Vec<Anomaly> = Vec::new();
    let mut seg = 0;
    while seg < scores.len() {
        if scores[seg] <= threshold {
            seg += 1;
            continue;
        }
        let run_start = seg;
        while seg < scores.len() && scores[seg] > threshold {
            seg += 1;
        }
        let run_end = seg - 1; // inclusive
        let (first_pt, last_pt) = if run_start == run_end {
            (run_start + 1, run_start + 1)
        } else {
            (run_start + 1, run_end)
        };
        for pt in first_pt..=last_pt {
            let adjacent = scores[pt - 1].max(if pt < scores.len() {
                scores[pt]
            } else {
                0.0
            });
            anomalies.push(Anomaly {
                index: rows[pt].0,
                score: adjacent / threshold,
            });
        }
    }
    anomalies.sort_by_key(|a| a.index);
    anomalies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::destination;
    use race_types::TrackPoint;

    fn track_along(bearing: f64, n: usize, step_m: f64, dt_ms: i64) -> Vec<TrackPoint> {
        let mut pos = LatLon::new(54.4, 10.2);
        (0..n)
            .map(|i| {
                let p = TrackPoint {
                    timestamp_ms: i as i64 * dt_ms,
                    lat: pos.lat,
                    lon: pos.lon,
                    speed: None,
                    heading_deg: Some(bearing),
                };
                pos = destination(pos, bearing, step_m);
                p
            })
            .collect()
    }

    #[test]
    fn clean_track_has_no_anomalies() {
        let points = track_along(90.0, 200, 2.0, 1000);
        let det = AnomalyDetector::new(3.0);
        let out = det.detect(&points, AnomalyMethod::Speed);
        assert!(out.value.is_empty());
        assert!(out.diagnostics.is_clean());
    }

    #[test]
    fn displaced_fix_is_flagged_alone() {
        let mut points = track_along(90.0, 1001, 2.0, 1000);
        // Push one fix 5 km off the line
        let p = &mut points[500];
        let moved = destination(LatLon::new(p.lat, p.lon), 0.0, 5_000.0);
        p.lat = moved.lat;
        p.lon = moved.lon;

        let det = AnomalyDetector::new(3.0);
        let out = det.detect(&points, AnomalyMethod::Speed);
        let flagged: Vec<usize> = out.value.iter().map(|a| a.index).collect();
        assert_eq!(flagged, vec![500]);
        assert!(out.value[0].score > 3.0);
    }

    #[test]
    fn jump_and_stay_flags_the_arrival_point() {
        let mut points = track_along(90.0, 60, 2.0, 1000);
        // Teleport everything after index 30 by 3 km north
        for p in points.iter_mut().skip(30) {
            let moved = destination(LatLon::new(p.lat, p.lon), 0.0, 3_000.0);
            p.lat = moved.lat;
            p.lon = moved.lon;
        }
        let det = AnomalyDetector::new(3.0);
        let out = det.detect(&points, AnomalyMethod::Speed);
        let flagged: Vec<usize> = out.value.iter().map(|a| a.index).collect();
        assert_eq!(flagged, vec![30]);
    }

    #[test]
    fn removal_then_rescan_is_empty() {
        let mut points = track_along(90.0, 101, 2.0, 1000);
        let p = &mut points[50];
        let moved = destination(LatLon::new(p.lat, p.lon), 0.0, 5_000.0);
        p.lat = moved.lat;
        p.lon = moved.lon;

        let det = AnomalyDetector::new(3.0);
        let first = det.detect(&points, AnomalyMethod::Speed);
        let mut cleaned = points.clone();
        for a in first.value.iter().rev() {
            cleaned.remove(a.index);
        }
        let second = det.detect(&cleaned, AnomalyMethod::Speed);
        assert!(second.value.is_empty());
    }

    #[test]
    fn zscore_method_agrees_on_the_outlier() {
        let mut points = track_along(90.0, 101, 2.0, 1000);
        let p = &mut points[50];
        let moved = destination(LatLon::new(p.lat, p.lon), 0.0, 5_000.0);
        p.lat = moved.lat;
        p.lon = moved.lon;

        let det = AnomalyDetector::new(3.0);
        let out = det.detect(&points, AnomalyMethod::ZScore);
        let flagged: Vec<usize> = out.value.iter().map(|a| a.index).collect();
        assert_eq!(flagged, vec![50]);
    }

    #[test]
    fn unsorted_input_maps_back_to_original_indices() {
        let mut points = track_along(90.0, 40, 2.0, 1000);
        let p = &mut points[20];
        let moved = destination(LatLon::new(p.lat, p.lon), 0.0, 5_000.0);
        p.lat = moved.lat;
        p.lon = moved.lon;
        points.swap(0, 39); // scramble the order

        let det = AnomalyDetector::new(3.0);
        let out = det.detect(&points, AnomalyMethod::Speed);
        let flagged: Vec<usize> = out.value.iter().map(|a| a.index).collect();
        assert_eq!(flagged, vec![20]);
    }

    #[test]
    fn short_and_degenerate_inputs_are_empty() {
        let det = AnomalyDetector::new(3.0);
        assert!(det.detect(&[], AnomalyMethod::Speed).value.is_empty());

        let one = track_along(90.0, 1, 2.0, 1000);
        let out = det.detect(&one, AnomalyMethod::Speed);
        assert!(out.value.is_empty());
        assert!(out.diagnostics.insufficient_data);
    }

    #[test]
    fn identical_timestamps_are_skipped() {
        let points: Vec<TrackPoint> = (0..20)
            .map(|i| TrackPoint {
                timestamp_ms: 5_000,
                lat: 54.4 + i as f64 * 1e-4,
                lon: 10.2,
                speed: None,
                heading_deg: None,
            })
            .collect();
        let det = AnomalyDetector::new(3.0);
        let out = det.detect(&points, AnomalyMethod::Speed);
        assert!(out.value.is_empty());
        assert!(out.diagnostics.insufficient_data);
    }

    #[test]
    fn stationary_track_yields_nothing() {
        let points: Vec<TrackPoint> = (0..50)
            .map(|i| TrackPoint {
                timestamp_ms: i * 1000,
                lat: 54.4,
                lon: 10.2,
                speed: Some(0.0),
                heading_deg: None,
            })
            .collect();
        let det = AnomalyDetector::new(3.0);
        let out = det.detect(&points, AnomalyMethod::Speed);
        assert!(out.value.is_empty());
    }

    #[test]
    fn non_finite_fixes_are_skipped_not_scored() {
        let mut points = track_along(90.0, 30, 2.0, 1000);
        points[5].lat = f64::NAN;
        let det = AnomalyDetector::new(3.0);
        let out = det.detect(&points, AnomalyMethod::Speed);
        assert_eq!(out.diagnostics.skipped_records, 1);
        assert!(!out.diagnostics.warnings.is_empty());
        assert!(out.value.iter().all(|a| a.index != 5));
    }
}

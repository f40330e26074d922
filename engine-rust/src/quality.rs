//! quality.rs — Track validation and data-quality scoring
//!
//! `TrackValidator` is the one producer of `ValidationFinding`s; the
//! spatial/temporal kinds delegate to the anomaly detector so there is a
//! single detector implementation behind a single call site.
//! `QualityMetricsCalculator` turns a track plus its findings into
//! completeness/accuracy/consistency scores, problem indices, and binned
//! views along time and space.

use std::cell::OnceCell;
use std::collections::{BTreeMap, BTreeSet};

use race_types::{
    BoatTrack, BoundingBox, FindingKind, LatLon, QualitySummary, Severity, TrackPoint,
    ValidationFinding,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::anomaly::{AnomalyDetector, AnomalyMethod};
use crate::config::AnalysisConfig;
use crate::error::{Analysis, Diagnostics};

// ── Validation ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TrackValidator {
    detector: AnomalyDetector,
    speed_multiplier: f64,
}

impl TrackValidator {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            detector: AnomalyDetector::new(config.speed_multiplier),
            speed_multiplier: config.speed_multiplier,
        }
    }

    /// Scan a raw track and report everything wrong with it. Findings refer
    /// to the track's current row order; re-validate after any mutation.
    pub fn validate(&self, track: &BoatTrack) -> Analysis<Vec<ValidationFinding>> {
        let mut findings = Vec::new();
        let mut diagnostics = Diagnostics::default();

        let mut missing = Vec::new();
        let mut bad_coord = Vec::new();
        let mut bad_speed = Vec::new();
        let mut bad_heading = Vec::new();
        let mut duplicates = Vec::new();
        let mut backwards = Vec::new();

        let mut seen_ts: BTreeSet<i64> = BTreeSet::new();
        let mut prev_ts: Option<i64> = None;

        for (idx, p) in track.points.iter().enumerate() {
            if !p.pos().is_finite() {
                missing.push(idx);
            } else if !p.pos().in_range() {
                bad_coord.push(idx);
            }
            if let Some(s) = p.speed {
                if !s.is_finite() || s < 0.0 {
                    bad_speed.push(idx);
                }
            }
            if let Some(h) = p.heading_deg {
                if !h.is_finite() || !(0.0..360.0).contains(&h) {
                    bad_heading.push(idx);
                }
            }
            if !seen_ts.insert(p.timestamp_ms) {
                duplicates.push(idx);
            }
            if let Some(prev) = prev_ts {
                if p.timestamp_ms < prev {
                    backwards.push(idx);
                }
            }
            prev_ts = Some(p.timestamp_ms);
        }

        if !missing.is_empty() {
            findings.push(ValidationFinding {
                kind: FindingKind::Missing,
                severity: Severity::Error,
                indices: missing,
                detail: "non-finite position".into(),
                params: None,
            });
        }
        if !bad_coord.is_empty() {
            findings.push(ValidationFinding {
                kind: FindingKind::OutOfRange,
                severity: Severity::Error,
                indices: bad_coord,
                detail: "coordinates outside WGS-84 domain".into(),
                params: Some(json!({ "field": "position" })),
            });
        }
        if !bad_speed.is_empty() {
            findings.push(ValidationFinding {
                kind: FindingKind::OutOfRange,
                severity: Severity::Warning,
                indices: bad_speed,
                detail: "negative or non-finite speed".into(),
                params: Some(json!({ "field": "speed" })),
            });
        }
        if !bad_heading.is_empty() {
            findings.push(ValidationFinding {
                kind: FindingKind::OutOfRange,
                severity: Severity::Warning,
                indices: bad_heading,
                detail: "heading outside [0, 360)".into(),
                params: Some(json!({ "field": "heading" })),
            });
        }
        if !duplicates.is_empty() {
            findings.push(ValidationFinding {
                kind: FindingKind::Duplicate,
                severity: Severity::Warning,
                indices: duplicates,
                detail: "repeated timestamp".into(),
                params: None,
            });
        }
        if !backwards.is_empty() {
            findings.push(ValidationFinding {
                kind: FindingKind::TemporalAnomaly,
                severity: Severity::Warning,
                indices: backwards,
                detail: "timestamp earlier than predecessor".into(),
                params: None,
            });
        }

        let spatial = self.detector.detect(&track.points, AnomalyMethod::Speed);
        diagnostics.merge(spatial.diagnostics);
        if !spatial.value.is_empty() {
            let scores: Vec<f64> = spatial.value.iter().map(|a| a.score).collect();
            findings.push(ValidationFinding {
                kind: FindingKind::SpatialAnomaly,
                severity: Severity::Error,
                indices: spatial.value.iter().map(|a| a.index).collect(),
                detail: "implausible displacement between consecutive fixes".into(),
                params: Some(json!({
                    "method": "speed",
                    "speedMultiplier": self.speed_multiplier,
                    "scores": scores,
                })),
            });
        }

        debug!(
            boat = %track.boat_id,
            findings = findings.len(),
            "track validated"
        );
        Analysis::with(findings, diagnostics)
    }
}

/// Strip error-severity problem rows, then sort and de-duplicate by
/// timestamp. The result satisfies the cleaned-track invariant: strictly
/// increasing timestamps, finite coordinates.
pub fn cleaned_track(track: &BoatTrack, findings: &[ValidationFinding]) -> BoatTrack {
    let drop: BTreeSet<usize> = findings
        .iter()
        .filter(|f| f.severity == Severity::Error)
        .flat_map(|f| f.indices.iter().copied())
        .collect();

    let mut points: Vec<TrackPoint> = track
        .points
        .iter()
        .enumerate()
        .filter(|(idx, p)| !drop.contains(idx) && p.pos().is_finite())
        .map(|(_, p)| p.clone())
        .collect();
    points.sort_by_key(|p| p.timestamp_ms);
    points.dedup_by_key(|p| p.timestamp_ms);

    BoatTrack {
        boat_id: track.boat_id.clone(),
        points,
        units: track.units,
        polar_class: track.polar_class.clone(),
    }
}

// ── Quality metrics ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityCategory {
    Completeness,
    Accuracy,
    Consistency,
}

#[derive(Debug)]
pub struct QualityMetricsCalculator {
    total_rows: usize,
    times_s: Vec<f64>,
    positions: Vec<LatLon>,
    problem_rows: BTreeMap<FindingKind, BTreeSet<usize>>,
    sampling_threshold: usize,
    // Memo: the instance is keyed by (track, findings) at construction, so
    // one cell per derived artifact is the whole cache.
    summary: OnceCell<QualitySummary>,
}

impl QualityMetricsCalculator {
    pub fn new(
        track: &BoatTrack,
        findings: &[ValidationFinding],
        config: &AnalysisConfig,
    ) -> Self {
        let mut problem_rows: BTreeMap<FindingKind, BTreeSet<usize>> = BTreeMap::new();
        for f in findings {
            problem_rows
                .entry(f.kind)
                .or_default()
                .extend(f.indices.iter().copied());
        }
        Self {
            total_rows: track.points.len(),
            times_s: track.points.iter().map(|p| p.t_secs()).collect(),
            positions: track.points.iter().map(|p| p.pos()).collect(),
            problem_rows,
            sampling_threshold: config.quality_sampling_threshold.max(1),
            summary: OnceCell::new(),
        }
    }

    fn kind_count(&self, kind: FindingKind) -> usize {
        self.problem_rows.get(&kind).map_or(0, |s| s.len())
    }

    fn category_score(&self, category: QualityCategory) -> f64 {
        if self.total_rows == 0 {
            return 100.0;
        }
        let problems = match category {
            QualityCategory::Completeness => self.kind_count(FindingKind::Missing),
            QualityCategory::Accuracy => self.kind_count(FindingKind::OutOfRange),
            QualityCategory::Consistency => {
                self.kind_count(FindingKind::SpatialAnomaly)
                    + self.kind_count(FindingKind::TemporalAnomaly)
                    + self.kind_count(FindingKind::Duplicate)
            }
        };
        (100.0 * (1.0 - problems as f64 / self.total_rows as f64)).clamp(0.0, 100.0)
    }

    /// Aggregate scores. `overall` is exactly
    /// 0.3·completeness + 0.3·accuracy + 0.4·consistency.
    pub fn overall(&self) -> QualitySummary {
        self.summary
            .get_or_init(|| {
                let completeness = self.category_score(QualityCategory::Completeness);
                let accuracy = self.category_score(QualityCategory::Accuracy);
                let consistency = self.category_score(QualityCategory::Consistency);
                let overall =
                    (0.3 * completeness + 0.3 * accuracy + 0.4 * consistency).clamp(0.0, 100.0);
                QualitySummary {
                    completeness,
                    accuracy,
                    consistency,
                    overall,
                    problem_counts: self
                        .problem_rows
                        .iter()
                        .map(|(k, rows)| (*k, rows.len()))
                        .collect(),
                    total_rows: self.total_rows,
                }
            })
            .clone()
    }

    pub fn category_scores(&self) -> BTreeMap<QualityCategory, f64> {
        [
            QualityCategory::Completeness,
            QualityCategory::Accuracy,
            QualityCategory::Consistency,
        ]
        .into_iter()
        .map(|c| (c, self.category_score(c)))
        .collect()
    }

    /// Rows implicated by one finding kind.
    pub fn problem_indices(&self, kind: FindingKind) -> BTreeSet<usize> {
        self.problem_rows.get(&kind).cloned().unwrap_or_default()
    }

    /// Union over all kinds.
    pub fn all_problem_indices(&self) -> BTreeSet<usize> {
        self.problem_rows.values().flatten().copied().collect()
    }

    /// Quality score per time bin of `bin_width_s`, keyed by bin index from
    /// the first row. Bins with no rows are absent.
    pub fn temporal_bins(&self, bin_width_s: f64) -> BTreeMap<i64, f64> {
        let mut rows_per_bin: BTreeMap<i64, (usize, usize)> = BTreeMap::new();
        if self.total_rows == 0 || bin_width_s <= 0.0 {
            return BTreeMap::new();
        }
        let t0 = self
            .times_s
            .iter()
            .copied()
            .filter(|t| t.is_finite())
            .fold(f64::INFINITY, f64::min);
        if !t0.is_finite() {
            return BTreeMap::new();
        }
        let problems = self.all_problem_indices();
        for idx in self.sampled_rows(&problems) {
            let t = self.times_s[idx];
            if !t.is_finite() {
                continue;
            }
            let bin = ((t - t0) / bin_width_s).floor() as i64;
            let entry = rows_per_bin.entry(bin).or_default();
            entry.0 += 1;
            if problems.contains(&idx) {
                entry.1 += 1;
            }
        }
        rows_per_bin
            .into_iter()
            .map(|(bin, (rows, bad))| (bin, bin_score(rows, bad)))
            .collect()
    }

    /// Quality score per cell of a `grid × grid` raster over the track's
    /// bounding box, keyed by (row, col). Cells with no rows are absent.
    pub fn spatial_bins(&self, grid_resolution: usize) -> BTreeMap<(usize, usize), f64> {
        if self.total_rows == 0 || grid_resolution == 0 {
            return BTreeMap::new();
        }
        let finite: Vec<LatLon> = self
            .positions
            .iter()
            .copied()
            .filter(|p| p.is_finite())
            .collect();
        let Some(bbox) = BoundingBox::enclosing(finite) else {
            return BTreeMap::new();
        };
        let dlat = ((bbox.lat_max - bbox.lat_min) / grid_resolution as f64).max(1e-9);
        let dlon = ((bbox.lon_max - bbox.lon_min) / grid_resolution as f64).max(1e-9);

        let problems = self.all_problem_indices();
        let mut cells: BTreeMap<(usize, usize), (usize, usize)> = BTreeMap::new();
        for idx in self.sampled_rows(&problems) {
            let p = self.positions[idx];
            if !p.is_finite() {
                continue;
            }
            let row = (((p.lat - bbox.lat_min) / dlat) as usize).min(grid_resolution - 1);
            let col = (((p.lon - bbox.lon_min) / dlon) as usize).min(grid_resolution - 1);
            let entry = cells.entry((row, col)).or_default();
            entry.0 += 1;
            if problems.contains(&idx) {
                entry.1 += 1;
            }
        }
        cells
            .into_iter()
            .map(|(cell, (rows, bad))| (cell, bin_score(rows, bad)))
            .collect()
    }

    /// Row indices to bin. Below the sampling threshold this is every row;
    /// above it, a stride sample that always keeps problem rows so hot spots
    /// cannot disappear, with the stride giving stratified coverage of the
    /// series.
    fn sampled_rows(&self, problems: &BTreeSet<usize>) -> Vec<usize> {
        if self.total_rows <= self.sampling_threshold {
            return (0..self.total_rows).collect();
        }
        let stride = self.total_rows.div_ceil(self.sampling_threshold);
        let mut rows: BTreeSet<usize> = (0..self.total_rows).step_by(stride).collect();
        rows.extend(problems.iter().copied().filter(|i| *i < self.total_rows));
        rows.into_iter().collect()
    }
}

fn bin_score(rows: usize, bad: usize) -> f64 {
    if rows == 0 {
        return 100.0;
    }
    (100.0 * (1.0 - bad as f64 / rows as f64)).clamp(0.0, 100.0)
}

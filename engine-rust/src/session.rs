//! session.rs — Session ownership and pipeline orchestration
//!
//! A session exclusively owns its boat tracks, course, external
//! observations, and the live component instances: the validator, the
//! fusion system, and one estimator/detector pair per boat (created on
//! first analysis). Their caches (angle-diff LRU, per-track VMG optimum,
//! field cache) survive across `analyze` calls, so re-analysis is cheap.
//! `analyze` runs the stages in dependency order (validate, quality,
//! estimate, fuse, detect) and returns plain value objects with no
//! back-references; re-deriving a report is always safe.

use std::collections::{BTreeMap, HashMap};

use race_types::{
    BoatTrack, BoundingBox, Course, PolarTable, QualitySummary, StrategyPoint, ValidationFinding,
    WindField, WindObservation,
};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::config::AnalysisConfig;
use crate::error::{AbortFlag, Analysis, Diagnostics, EngineError};
use crate::polar::OptimalVmgCalculator;
use crate::quality::{cleaned_track, QualityMetricsCalculator, TrackValidator};
use crate::strategy::{StrategyDetector, WindInput};
use crate::wind::WindEstimator;
use crate::wind_field::WindFieldFusionSystem;

/// Margin added around the union of track positions for the field bbox,
/// degrees.
const BBOX_MARGIN_DEG: f64 = 0.002;

/// Per-boat components, keyed by (boat_id, polar class). Registering a new
/// polar for a class simply keys a fresh pair; stale pairs are bounded by
/// boats × classes.
type ComponentKey = (String, String);

/// Per-boat artifacts of one analysis run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoatReport {
    pub boat_id: String,
    pub findings: Vec<ValidationFinding>,
    pub quality: QualitySummary,
    pub wind_observations: Vec<WindObservation>,
    pub strategy_points: Vec<StrategyPoint>,
}

/// Everything one analysis run derives. Holds no reference to the session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    pub session_id: String,
    pub boats: Vec<BoatReport>,
    /// Fused field snapshots on the shift-duration cadence, sorted by time
    pub wind_fields: Vec<WindField>,
}

/// One unit of analysis: tracks in, artifacts out. The session owns its
/// component instances outright; cloning a session clones them, caches
/// included, and the clones never share state afterwards.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    config: AnalysisConfig,
    course: Course,
    tracks: Vec<BoatTrack>,
    external: Vec<WindObservation>,
    polars: HashMap<String, PolarTable>,
    validator: TrackValidator,
    fusion: WindFieldFusionSystem,
    estimators: HashMap<ComponentKey, WindEstimator>,
    detectors: HashMap<ComponentKey, StrategyDetector>,
}

impl Session {
    pub fn new(config: AnalysisConfig) -> Result<Self, EngineError> {
        Self::with_id(Uuid::new_v4().to_string(), config)
    }

    pub fn with_id(id: impl Into<String>, config: AnalysisConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            id: id.into(),
            validator: TrackValidator::new(&config),
            fusion: WindFieldFusionSystem::new(config.clone()),
            config,
            course: Course::default(),
            tracks: Vec::new(),
            external: Vec::new(),
            polars: HashMap::new(),
            estimators: HashMap::new(),
            detectors: HashMap::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_course(&mut self, course: Course) {
        self.course = course;
    }

    pub fn add_track(&mut self, track: BoatTrack) -> Result<(), EngineError> {
        if track.boat_id.is_empty() {
            return Err(EngineError::invalid("boat_id", "must not be empty"));
        }
        self.tracks.push(track);
        Ok(())
    }

    pub fn add_external_observation(&mut self, obs: WindObservation) {
        self.external.push(obs);
    }

    /// Register a polar for the class named by `table.class`. Tracks whose
    /// `polar_class` has no registered table fall back to the built-in
    /// one-design polar.
    pub fn register_polar(&mut self, table: PolarTable) -> Result<(), EngineError> {
        OptimalVmgCalculator::new(table.clone())?;
        self.polars.insert(table.class.clone(), table);
        Ok(())
    }

    fn polar_for(polars: &HashMap<String, PolarTable>, track: &BoatTrack) -> OptimalVmgCalculator {
        track
            .polar_class
            .as_ref()
            .and_then(|class| polars.get(class))
            .and_then(|table| OptimalVmgCalculator::new(table.clone()).ok())
            .unwrap_or_else(OptimalVmgCalculator::one_design)
    }

    /// Run the full pipeline. Insufficient data and aborts come back as
    /// markers in the diagnostics, never as errors. Repeated calls are
    /// idempotent: the fusion buffer drops re-inserted duplicates and the
    /// per-boat caches make the re-run cheaper, not different.
    pub fn analyze(&mut self, abort: &AbortFlag) -> Result<Analysis<SessionReport>, EngineError> {
        let mut diagnostics = Diagnostics::default();

        // Validate, score, clean, estimate per boat
        struct BoatStage {
            track: BoatTrack,
            findings: Vec<ValidationFinding>,
            quality: QualitySummary,
            observations: Vec<WindObservation>,
            polar: OptimalVmgCalculator,
        }
        let mut stages: Vec<BoatStage> = Vec::new();
        for track in &self.tracks {
            if abort.is_set() {
                diagnostics.aborted = true;
                break;
            }
            let findings = self.validator.validate(track);
            diagnostics.merge(findings.diagnostics.clone());
            let quality =
                QualityMetricsCalculator::new(track, &findings.value, &self.config).overall();
            let clean = cleaned_track(track, &findings.value);

            let polar = Self::polar_for(&self.polars, track);
            let key = (track.boat_id.clone(), polar.class().to_string());
            let estimator = self
                .estimators
                .entry(key)
                .or_insert_with(|| WindEstimator::new(self.config.clone(), polar.clone()));
            let estimated = estimator.estimate_wind(&clean);
            diagnostics.merge(estimated.diagnostics.clone());

            let inserted = self.fusion.insert_many(estimated.value.iter().cloned());
            diagnostics.merge(inserted.diagnostics);

            stages.push(BoatStage {
                track: clean,
                findings: findings.value,
                quality,
                observations: estimated.value,
                polar,
            });
        }

        let inserted = self.fusion.insert_many(self.external.iter().cloned());
        diagnostics.merge(inserted.diagnostics);

        // Field snapshots over the session extent
        let mut fields: Vec<WindField> = Vec::new();
        if let (Some(bbox), Some((t_min, t_max))) = (self.session_bbox(), self.session_span()) {
            let step_ms = (self.config.min_shift_duration_s.max(30.0) * 1000.0) as i64;
            let mut ts = t_min;
            while ts <= t_max && !abort.is_set() {
                let field = self.fusion.field_at(ts, bbox, abort);
                diagnostics.merge(field.diagnostics);
                fields.push(field.value);
                ts += step_ms;
            }
            if abort.is_set() {
                diagnostics.aborted = true;
            }
        } else if !self.tracks.is_empty() || !self.external.is_empty() {
            diagnostics.warn("no finite positions; skipping field construction");
        }

        // Strategy per boat against the field series
        let field_series: BTreeMap<i64, WindField> =
            fields.iter().map(|f| (f.timestamp_ms, f.clone())).collect();
        let lookup = move |ts: i64| -> Option<WindField> {
            // Nearest snapshot in time
            let after = field_series.range(ts..).next();
            let before = field_series.range(..=ts).next_back();
            match (before, after) {
                (Some((tb, fb)), Some((ta, fa))) => {
                    Some(if ts - tb <= ta - ts { fb.clone() } else { fa.clone() })
                }
                (Some((_, f)), None) | (None, Some((_, f))) => Some(f.clone()),
                (None, None) => None,
            }
        };

        let mut boats = Vec::new();
        for stage in stages {
            if abort.is_set() {
                diagnostics.aborted = true;
            }
            let key = (stage.track.boat_id.clone(), stage.polar.class().to_string());
            let detector = self
                .detectors
                .entry(key)
                .or_insert_with(|| StrategyDetector::new(self.config.clone(), stage.polar.clone()));
            let wind_input = if field_series_is_empty(&lookup) {
                WindInput::None
            } else {
                WindInput::Lookup(&lookup)
            };
            let detected = detector.detect(&stage.track, &self.course, &wind_input, abort);
            diagnostics.merge(detected.diagnostics);
            boats.push(BoatReport {
                boat_id: stage.track.boat_id.clone(),
                findings: stage.findings,
                quality: stage.quality,
                wind_observations: stage.observations,
                strategy_points: detected.value,
            });
        }

        if self.tracks.is_empty() {
            diagnostics.insufficient_data = true;
            diagnostics.warn("session has no tracks");
        }

        debug!(
            session = %self.id,
            boats = boats.len(),
            fields = fields.len(),
            "session analysis complete"
        );
        Ok(Analysis::with(
            SessionReport {
                session_id: self.id.clone(),
                boats,
                wind_fields: fields,
            },
            diagnostics,
        ))
    }

    /// Union bbox over track points and external observations, padded.
    fn session_bbox(&self) -> Option<BoundingBox> {
        let track_positions = self
            .tracks
            .iter()
            .flat_map(|t| t.points.iter().map(|p| p.pos()))
            .filter(|p| p.is_finite());
        let external_positions = self
            .external
            .iter()
            .map(|o| race_types::LatLon::new(o.lat, o.lon))
            .filter(|p| p.is_finite());
        BoundingBox::enclosing(track_positions.chain(external_positions))
            .map(|b| b.padded(BBOX_MARGIN_DEG))
    }

    /// Temporal extent over tracks and external observations, milliseconds.
    fn session_span(&self) -> Option<(i64, i64)> {
        let times = self
            .tracks
            .iter()
            .flat_map(|t| t.points.iter().map(|p| p.timestamp_ms))
            .chain(self.external.iter().map(|o| o.timestamp_ms));
        let (mut min, mut max) = (i64::MAX, i64::MIN);
        let mut any = false;
        for t in times {
            min = min.min(t);
            max = max.max(t);
            any = true;
        }
        if any {
            Some((min, max))
        } else {
            None
        }
    }
}

fn field_series_is_empty(lookup: &impl Fn(i64) -> Option<WindField>) -> bool {
    lookup(0).is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use race_types::{LatLon, SpeedUnit, TrackPoint};

    fn reach_track(boat_id: &str) -> BoatTrack {
        let mut pos = LatLon::new(54.4, 10.2);
        let points = (0..300i64)
            .map(|i| {
                let p = TrackPoint {
                    timestamp_ms: i * 1000,
                    lat: pos.lat,
                    lon: pos.lon,
                    speed: Some(2.0),
                    heading_deg: Some(90.0),
                };
                pos = crate::geo::destination(pos, 90.0, 1.0);
                p
            })
            .collect();
        BoatTrack {
            boat_id: boat_id.into(),
            points,
            units: SpeedUnit::Knots,
            polar_class: None,
        }
    }

    fn anemometer(t_s: i64, direction: f64, speed: f64) -> WindObservation {
        WindObservation::external(
            Utc.timestamp_opt(t_s, 0).unwrap(),
            LatLon::new(54.4, 10.22),
            direction,
            speed,
            Some(0.9),
        )
    }

    #[test]
    fn empty_session_reports_insufficient_not_error() {
        let mut session = Session::new(AnalysisConfig::default()).unwrap();
        let out = session.analyze(&AbortFlag::new()).unwrap();
        assert!(out.value.boats.is_empty());
        assert!(out.diagnostics.insufficient_data);
    }

    #[test]
    fn reach_plus_external_observation_builds_a_field() {
        let mut session = Session::new(AnalysisConfig::default()).unwrap();
        session.add_track(reach_track("b1")).unwrap();
        session.add_external_observation(anemometer(150, 180.0, 12.0));
        let out = session.analyze(&AbortFlag::new()).unwrap();
        let report = out.value;
        assert_eq!(report.boats.len(), 1);
        assert_eq!(report.boats[0].quality.overall, 100.0);
        // Wind near the external observation is 180°/12 kt
        let field = report
            .wind_fields
            .iter()
            .find(|f| !f.is_empty())
            .expect("at least one populated field");
        let (dir, speed, _) = field.sample(LatLon::new(54.4, 10.22)).unwrap();
        assert!((dir - 180.0).abs() < 1e-6);
        assert!((speed - 12.0).abs() < 1e-6);
    }

    #[test]
    fn rejects_empty_boat_id() {
        let mut session = Session::new(AnalysisConfig::default()).unwrap();
        let mut track = reach_track("x");
        track.boat_id.clear();
        assert!(matches!(
            session.add_track(track),
            Err(EngineError::InvalidInput { .. })
        ));
    }

    #[test]
    fn cloned_session_keeps_its_own_components_and_caches() {
        let mut session = Session::with_id("orig", AnalysisConfig::default()).unwrap();
        session.add_track(reach_track("b1")).unwrap();
        session.add_external_observation(anemometer(150, 180.0, 12.0));
        // Warm the fusion buffer, field cache, and per-boat components
        let baseline = session.analyze(&AbortFlag::new()).unwrap().value;

        let mut clone = session.clone();

        // Diverge the original: a second anemometer swings its field
        session.add_external_observation(anemometer(160, 90.0, 20.0));
        let diverged = session.analyze(&AbortFlag::new()).unwrap().value;
        assert_ne!(
            serde_json::to_string(&baseline).unwrap(),
            serde_json::to_string(&diverged).unwrap()
        );

        // The clone's buffer and caches are unaffected by the original's
        // mutation: re-analyzing it reproduces the baseline byte for byte
        let clone_report = clone.analyze(&AbortFlag::new()).unwrap().value;
        assert_eq!(
            serde_json::to_string(&baseline).unwrap(),
            serde_json::to_string(&clone_report).unwrap()
        );
    }

    #[test]
    fn repeated_analysis_is_deterministic() {
        let mut session = Session::with_id("fixed", AnalysisConfig::default()).unwrap();
        session.add_track(reach_track("b1")).unwrap();
        session.add_external_observation(anemometer(150, 180.0, 12.0));
        // The second run re-hits the warm caches and duplicate-skipping
        // buffer; the output must not change
        let a = session.analyze(&AbortFlag::new()).unwrap().value;
        let b = session.analyze(&AbortFlag::new()).unwrap().value;
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}

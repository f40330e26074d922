//! # race-types
//!
//! Shared value types for the Regatta Suite track-analysis engine.
//!
//! These types are used by:
//! - `engine-rust`: the analysis core (anomaly detection, wind estimation,
//!   field fusion, strategy detection)
//! - `packages/track-simulator`: synthetic track generation for scenario tests
//! - Host services: everything here is plain `serde` data with no transport
//!   assumptions; callers may persist or ship it however they like
//!
//! ## Conventions
//!
//! - Positions are WGS-84 latitude/longitude in decimal degrees
//! - Headings and wind directions are true bearings in degrees, [0, 360)
//! - Timestamps are epoch milliseconds (UTC); ingest accepts `DateTime<Utc>`
//! - Wind speeds are knots; boat speeds carry the track's declared unit

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Geographic primitives ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_finite(&self) -> bool {
        self.lat.is_finite() && self.lon.is_finite()
    }

    /// Inside the WGS-84 coordinate domain.
    pub fn in_range(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }
}

/// Geographic bounding box, `[lat_min, lon_min, lat_max, lon_max]` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub lat_min: f64,
    pub lon_min: f64,
    pub lat_max: f64,
    pub lon_max: f64,
}

impl BoundingBox {
    pub fn new(lat_min: f64, lon_min: f64, lat_max: f64, lon_max: f64) -> Self {
        Self { lat_min, lon_min, lat_max, lon_max }
    }

    /// Smallest box containing every given position. None when the input is empty.
    pub fn enclosing(positions: impl IntoIterator<Item = LatLon>) -> Option<Self> {
        let mut it = positions.into_iter();
        let first = it.next()?;
        let mut bbox = Self::new(first.lat, first.lon, first.lat, first.lon);
        for p in it {
            bbox.lat_min = bbox.lat_min.min(p.lat);
            bbox.lon_min = bbox.lon_min.min(p.lon);
            bbox.lat_max = bbox.lat_max.max(p.lat);
            bbox.lon_max = bbox.lon_max.max(p.lon);
        }
        Some(bbox)
    }

    /// Grow the box by a margin in degrees on every side.
    pub fn padded(&self, margin_deg: f64) -> Self {
        Self::new(
            self.lat_min - margin_deg,
            self.lon_min - margin_deg,
            self.lat_max + margin_deg,
            self.lon_max + margin_deg,
        )
    }

    pub fn center(&self) -> LatLon {
        LatLon::new(
            (self.lat_min + self.lat_max) / 2.0,
            (self.lon_min + self.lon_max) / 2.0,
        )
    }
}

// ── Units ─────────────────────────────────────────────────────────────────────

/// Speed unit declared once per track container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpeedUnit {
    #[default]
    MetersPerSecond,
    Knots,
}

pub const MPS_PER_KNOT: f64 = 0.514_444_444_444_444_4;

impl SpeedUnit {
    /// Conversion factor from this unit to meters per second.
    pub fn to_mps_factor(&self) -> f64 {
        match self {
            SpeedUnit::MetersPerSecond => 1.0,
            SpeedUnit::Knots => MPS_PER_KNOT,
        }
    }
}

// ── Track data ────────────────────────────────────────────────────────────────

/// One decoded position record as handed to the engine by a file decoder.
/// The decoders themselves (GPX/CSV/TCX/FIT) live outside the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fix {
    pub ts: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading_deg: Option<f64>,
}

/// A single time-stamped track sample. Immutable after ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackPoint {
    /// Epoch milliseconds, UTC
    pub timestamp_ms: i64,
    pub lat: f64,
    pub lon: f64,
    /// Speed over ground in the track's declared unit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// True heading, degrees [0, 360)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading_deg: Option<f64>,
}

impl TrackPoint {
    pub fn t_secs(&self) -> f64 {
        self.timestamp_ms as f64 / 1000.0
    }

    pub fn pos(&self) -> LatLon {
        LatLon::new(self.lat, self.lon)
    }
}

/// One boat's ordered position series for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoatTrack {
    pub boat_id: String,
    pub points: Vec<TrackPoint>,
    #[serde(default)]
    pub units: SpeedUnit,
    /// Polar class to evaluate against, if known (e.g. "j70")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub polar_class: Option<String>,
}

impl BoatTrack {
    pub fn new(boat_id: impl Into<String>, units: SpeedUnit) -> Self {
        Self {
            boat_id: boat_id.into(),
            points: Vec::new(),
            units,
            polar_class: None,
        }
    }

    /// Build a track from decoded fixes. Points keep ingest order; cleaning
    /// and ordering are the engine's job.
    pub fn from_fixes(
        boat_id: impl Into<String>,
        units: SpeedUnit,
        fixes: impl IntoIterator<Item = Fix>,
    ) -> Self {
        let points = fixes
            .into_iter()
            .map(|f| TrackPoint {
                timestamp_ms: f.ts.timestamp_millis(),
                lat: f.lat,
                lon: f.lon,
                speed: f.speed,
                heading_deg: f.heading_deg,
            })
            .collect();
        Self {
            boat_id: boat_id.into(),
            points,
            units,
            polar_class: None,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Speed over ground of a point in meters per second, unit-converted.
    pub fn speed_mps(&self, idx: usize) -> Option<f64> {
        let s = self.points.get(idx)?.speed?;
        Some(s * self.units.to_mps_factor())
    }

    /// Temporal extent in seconds (0 for fewer than two points).
    pub fn duration_s(&self) -> f64 {
        match (self.points.first(), self.points.last()) {
            (Some(a), Some(b)) => (b.t_secs() - a.t_secs()).max(0.0),
            _ => 0.0,
        }
    }
}

// ── Validation findings ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingKind {
    /// Required value absent (position, timestamp)
    Missing,
    /// Value outside its physical domain (lat/lon range, negative speed)
    OutOfRange,
    /// Repeated timestamp within one track
    Duplicate,
    /// Implausible displacement between consecutive fixes
    SpatialAnomaly,
    /// Non-increasing or NaN timestamp
    TemporalAnomaly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// One detector verdict over a track. Indices refer to the associated track
/// at the time of creation; findings are regenerated on re-validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationFinding {
    pub kind: FindingKind,
    pub severity: Severity,
    /// Affected row indices into the source track
    pub indices: Vec<usize>,
    pub detail: String,
    /// Detector parameters in effect when the finding was produced
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

// ── Quality summary ───────────────────────────────────────────────────────────

/// Aggregate data-quality scores, each in [0, 100].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualitySummary {
    pub completeness: f64,
    pub accuracy: f64,
    pub consistency: f64,
    /// 0.3·completeness + 0.3·accuracy + 0.4·consistency
    pub overall: f64,
    /// Problem row counts per finding kind
    pub problem_counts: BTreeMap<FindingKind, usize>,
    pub total_rows: usize,
}

// ── Wind observations ─────────────────────────────────────────────────────────

/// Which estimator produced a wind observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WindSource {
    /// VMG-based direction search over a whole track segment
    Vmg,
    /// Bisector of a single detected maneuver
    Maneuver,
    /// Bayesian fusion of per-maneuver and VMG candidates
    Bayesian,
    /// Instrument or committee-boat report fed in from outside
    External,
}

/// A point estimate of the true wind at one place and time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindObservation {
    pub timestamp_ms: i64,
    pub lat: f64,
    pub lon: f64,
    /// Direction the wind blows FROM, true degrees [0, 360)
    pub direction_deg: f64,
    /// Knots
    pub speed_kts: f64,
    /// [0, 1]
    pub confidence: f64,
    pub source: WindSource,
}

impl WindObservation {
    /// External report with a caller-supplied confidence (defaults to 0.8,
    /// the trust given a committee-boat anemometer).
    pub fn external(
        ts: DateTime<Utc>,
        pos: LatLon,
        direction_deg: f64,
        speed_kts: f64,
        confidence: Option<f64>,
    ) -> Self {
        Self {
            timestamp_ms: ts.timestamp_millis(),
            lat: pos.lat,
            lon: pos.lon,
            direction_deg,
            speed_kts,
            confidence: confidence.unwrap_or(0.8).clamp(0.0, 1.0),
            source: WindSource::External,
        }
    }

    pub fn t_secs(&self) -> f64 {
        self.timestamp_ms as f64 / 1000.0
    }

    /// Structurally usable: finite position, direction and speed.
    pub fn is_well_formed(&self) -> bool {
        LatLon::new(self.lat, self.lon).is_finite()
            && self.direction_deg.is_finite()
            && self.speed_kts.is_finite()
            && self.speed_kts >= 0.0
    }
}

// ── Wind field ────────────────────────────────────────────────────────────────

/// Estimated field advection, meters per second in ENU components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvectionVector {
    pub east_mps: f64,
    pub north_mps: f64,
}

/// A rasterized true-wind snapshot over the race area.
///
/// Grids are row-major `[ny][nx]`, row 0 at `lat_min`. A cell with
/// confidence 0 carries no data; its direction and speed are 0 and must not
/// be interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindField {
    pub timestamp_ms: i64,
    pub bbox: BoundingBox,
    pub nx: usize,
    pub ny: usize,
    pub direction: Vec<Vec<f64>>,
    pub speed: Vec<Vec<f64>>,
    pub confidence: Vec<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advection: Option<AdvectionVector>,
}

impl WindField {
    /// All-no-data field over a box (every confidence 0).
    pub fn empty(timestamp_ms: i64, bbox: BoundingBox, nx: usize, ny: usize) -> Self {
        Self {
            timestamp_ms,
            bbox,
            nx,
            ny,
            direction: vec![vec![0.0; nx]; ny],
            speed: vec![vec![0.0; nx]; ny],
            confidence: vec![vec![0.0; nx]; ny],
            advection: None,
        }
    }

    /// Geographic centre of cell (row, col).
    pub fn cell_center(&self, row: usize, col: usize) -> LatLon {
        let dlat = (self.bbox.lat_max - self.bbox.lat_min) / self.ny as f64;
        let dlon = (self.bbox.lon_max - self.bbox.lon_min) / self.nx as f64;
        LatLon::new(
            self.bbox.lat_min + (row as f64 + 0.5) * dlat,
            self.bbox.lon_min + (col as f64 + 0.5) * dlon,
        )
    }

    /// Cell containing a position, if inside the box.
    pub fn cell_at(&self, pos: LatLon) -> Option<(usize, usize)> {
        let dlat = (self.bbox.lat_max - self.bbox.lat_min) / self.ny as f64;
        let dlon = (self.bbox.lon_max - self.bbox.lon_min) / self.nx as f64;
        if dlat <= 0.0 || dlon <= 0.0 {
            return None;
        }
        let row = ((pos.lat - self.bbox.lat_min) / dlat).floor();
        let col = ((pos.lon - self.bbox.lon_min) / dlon).floor();
        if row < 0.0 || col < 0.0 {
            return None;
        }
        let (row, col) = (row as usize, col as usize);
        if row >= self.ny || col >= self.nx {
            return None;
        }
        Some((row, col))
    }

    /// Wind at a position as (direction_deg, speed_kts, confidence), or None
    /// outside the box or over a no-data cell.
    pub fn sample(&self, pos: LatLon) -> Option<(f64, f64, f64)> {
        let (row, col) = self.cell_at(pos)?;
        let conf = self.confidence[row][col];
        if conf <= 0.0 {
            return None;
        }
        Some((self.direction[row][col], self.speed[row][col], conf))
    }

    /// True when no cell carries data.
    pub fn is_empty(&self) -> bool {
        self.confidence.iter().flatten().all(|&c| c <= 0.0)
    }
}

// ── Strategy points ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyKind {
    Tack,
    Jibe,
    WindShift,
    Layline,
    MarkRounding,
    Start,
    Finish,
}

/// Per-kind metadata. The variant fixes which fields a kind carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all_fields = "camelCase")]
pub enum StrategyDetail {
    Tack {
        entry_heading_deg: f64,
        exit_heading_deg: f64,
        swing_deg: f64,
        /// Measured VMG shortfall against the polar target through the turn, knots
        vmg_loss_kts: f64,
    },
    Jibe {
        entry_heading_deg: f64,
        exit_heading_deg: f64,
        swing_deg: f64,
        vmg_loss_kts: f64,
    },
    WindShift {
        before_deg: f64,
        after_deg: f64,
        magnitude_deg: f64,
        duration_s: f64,
    },
    Layline {
        mark_id: String,
        target_twa_deg: f64,
        distance_to_mark_m: f64,
    },
    MarkRounding {
        mark_id: String,
        closest_approach_m: f64,
        heading_change_deg: f64,
    },
    Start,
    Finish,
}

impl StrategyDetail {
    pub fn kind(&self) -> StrategyKind {
        match self {
            StrategyDetail::Tack { .. } => StrategyKind::Tack,
            StrategyDetail::Jibe { .. } => StrategyKind::Jibe,
            StrategyDetail::WindShift { .. } => StrategyKind::WindShift,
            StrategyDetail::Layline { .. } => StrategyKind::Layline,
            StrategyDetail::MarkRounding { .. } => StrategyKind::MarkRounding,
            StrategyDetail::Start => StrategyKind::Start,
            StrategyDetail::Finish => StrategyKind::Finish,
        }
    }
}

/// One strategically significant event on a boat's track.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyPoint {
    /// Deterministic id (`kind:timestamp:n`) so identical analyses yield
    /// identical output
    pub id: String,
    pub boat_id: String,
    pub timestamp_ms: i64,
    pub lat: f64,
    pub lon: f64,
    #[serde(flatten)]
    pub detail: StrategyDetail,
    /// Tactical weight of the event, [0, 1]
    pub importance: f64,
    /// How well the maneuver was executed, [0, 1]
    pub evaluation: f64,
}

impl StrategyPoint {
    pub fn kind(&self) -> StrategyKind {
        self.detail.kind()
    }

    pub fn t_secs(&self) -> f64 {
        self.timestamp_ms as f64 / 1000.0
    }
}

// ── Polar tables ──────────────────────────────────────────────────────────────

/// Target boat speed over a (TWA, TWS) grid for one boat class. Read-only
/// after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolarTable {
    pub class: String,
    /// Strictly increasing, degrees in [0, 180]
    pub twa_deg: Vec<f64>,
    /// Strictly increasing, knots
    pub tws_kts: Vec<f64>,
    /// `targets_kts[i][j]` = target speed at `twa_deg[i]`, `tws_kts[j]`
    pub targets_kts: Vec<Vec<f64>>,
}

// ── Course model ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarkKind {
    Mark,
    Start,
    Finish,
    Gate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Rounding {
    Port,
    Starboard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mark {
    pub id: String,
    pub name: String,
    pub pos: LatLon,
    #[serde(rename = "type")]
    pub kind: MarkKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rounding: Option<Rounding>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseLine {
    pub p1: LatLon,
    pub p2: LatLon,
}

/// The set course. `marks` are listed in rounding order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    #[serde(default)]
    pub marks: Vec<Mark>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_line: Option<CourseLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_line: Option<CourseLine>,
}

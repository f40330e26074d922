//! geo.rs — Geodesic helpers
//!
//! Great-circle math on the WGS-84 mean sphere plus a local ENU frame for
//! course geometry. Column-pass variants exist for the hot paths so the
//! detectors stay O(n).

use race_types::LatLon;

use crate::angles::wrap_deg;

/// Mean earth radius, meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine great-circle distance in meters.
///
/// The intermediate `a` is clamped to [0, 1]; floating-point overshoot near
/// antipodal points would otherwise feed `sqrt` a negative.
pub fn haversine_m(from: LatLon, to: LatLon) -> f64 {
    let phi1 = from.lat.to_radians();
    let phi2 = to.lat.to_radians();
    let dphi = (to.lat - from.lat).to_radians();
    let dlambda = (to.lon - from.lon).to_radians();

    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    let a = a.clamp(0.0, 1.0);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Consecutive great-circle distances over a position series: output length
/// is `positions.len() - 1` (empty for fewer than two points). One pass.
pub fn consecutive_distances_m(positions: &[LatLon]) -> Vec<f64> {
    if positions.len() < 2 {
        return Vec::new();
    }
    positions
        .windows(2)
        .map(|w| haversine_m(w[0], w[1]))
        .collect()
}

/// Initial great-circle bearing from `from` to `to`, true degrees [0, 360).
pub fn bearing_deg(from: LatLon, to: LatLon) -> f64 {
    let phi1 = from.lat.to_radians();
    let phi2 = to.lat.to_radians();
    let dlambda = (to.lon - from.lon).to_radians();
    let y = dlambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * dlambda.cos();
    wrap_deg(y.atan2(x).to_degrees())
}

/// Destination point after travelling `distance_m` on `bearing` from `from`.
pub fn destination(from: LatLon, bearing: f64, distance_m: f64) -> LatLon {
    let delta = distance_m / EARTH_RADIUS_M;
    let theta = bearing.to_radians();
    let phi1 = from.lat.to_radians();
    let lambda1 = from.lon.to_radians();

    let phi2 = (phi1.sin() * delta.cos() + phi1.cos() * delta.sin() * theta.cos()).asin();
    let lambda2 = lambda1
        + (theta.sin() * delta.sin() * phi1.cos()).atan2(delta.cos() - phi1.sin() * phi2.sin());

    LatLon::new(phi2.to_degrees(), wrap_deg(lambda2.to_degrees() + 180.0) - 180.0)
}

/// Flat East-North frame anchored at a reference position. Good to well
/// under a meter over a race area (a few km); course geometry (laylines,
/// line crossings) lives here.
#[derive(Debug, Clone, Copy)]
pub struct EnuFrame {
    origin: LatLon,
    cos_lat0: f64,
}

impl EnuFrame {
    pub fn new(origin: LatLon) -> Self {
        Self {
            origin,
            cos_lat0: origin.lat.to_radians().cos(),
        }
    }

    pub fn origin(&self) -> LatLon {
        self.origin
    }

    /// (east, north) in meters.
    pub fn to_enu(&self, p: LatLon) -> (f64, f64) {
        let east = (p.lon - self.origin.lon).to_radians() * self.cos_lat0 * EARTH_RADIUS_M;
        let north = (p.lat - self.origin.lat).to_radians() * EARTH_RADIUS_M;
        (east, north)
    }

    pub fn from_enu(&self, east: f64, north: f64) -> LatLon {
        LatLon::new(
            self.origin.lat + (north / EARTH_RADIUS_M).to_degrees(),
            self.origin.lon + (east / (EARTH_RADIUS_M * self.cos_lat0)).to_degrees(),
        )
    }
}

/// Perpendicular distance from `point` to the ray leaving `origin` on
/// `bearing`, together with the along-ray distance of the foot point.
/// Negative along-ray distance means the point lies behind the origin.
/// All in the given ENU frame, meters.
pub fn ray_offset(
    frame: &EnuFrame,
    origin: LatLon,
    bearing: f64,
    point: LatLon,
) -> (f64, f64) {
    let (ox, oy) = frame.to_enu(origin);
    let (px, py) = frame.to_enu(point);
    // Bearing is clockwise from north: direction = (sin b, cos b)
    let (dx, dy) = (bearing.to_radians().sin(), bearing.to_radians().cos());
    let (rx, ry) = (px - ox, py - oy);
    let along = rx * dx + ry * dy;
    let cross = rx * dy - ry * dx;
    (cross.abs(), along)
}

/// Whether segment a1→a2 crosses segment b1→b2 (2D, in the frame of `frame`).
pub fn segments_cross(frame: &EnuFrame, a1: LatLon, a2: LatLon, b1: LatLon, b2: LatLon) -> bool {
    let (ax1, ay1) = frame.to_enu(a1);
    let (ax2, ay2) = frame.to_enu(a2);
    let (bx1, by1) = frame.to_enu(b1);
    let (bx2, by2) = frame.to_enu(b2);

    let d = (ax2 - ax1) * (by2 - by1) - (ay2 - ay1) * (bx2 - bx1);
    if d.abs() < 1e-12 {
        return false; // parallel
    }
    let t = ((bx1 - ax1) * (by2 - by1) - (by1 - ay1) * (bx2 - bx1)) / d;
    let u = ((bx1 - ax1) * (ay2 - ay1) - (by1 - ay1) * (ax2 - ax1)) / d;
    (0.0..=1.0).contains(&t) && (0.0..=1.0).contains(&u)
}

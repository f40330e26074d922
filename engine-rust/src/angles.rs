//! angles.rs — Centralized angle arithmetic
//!
//! Everything in the engine that touches a bearing goes through this module
//! so the 0/360 wrap-around is handled in exactly one place. All angles are
//! true bearings in degrees unless a name says otherwise.

/// Normalize an angle into [0, 360).
pub fn wrap_deg(deg: f64) -> f64 {
    let w = deg.rem_euclid(360.0);
    // A tiny negative input can round to exactly 360.0 after the shift
    if w >= 360.0 {
        0.0
    } else {
        w
    }
}

/// Signed smallest rotation from `from` to `to`, in (-180, 180].
pub fn delta_deg(from: f64, to: f64) -> f64 {
    let d = wrap_deg(to - from);
    if d > 180.0 {
        d - 360.0
    } else {
        d
    }
}

/// Magnitude of the smallest rotation between two bearings, in [0, 180].
pub fn abs_delta_deg(a: f64, b: f64) -> f64 {
    delta_deg(a, b).abs()
}

/// Weighted circular mean: atan2(Σ w·sin, Σ w·cos), wrapped to [0, 360).
/// Returns None when the input is empty or the resultant vector vanishes
/// (e.g. two opposite bearings with equal weight).
pub fn circular_mean_weighted(angles: impl IntoIterator<Item = (f64, f64)>) -> Option<f64> {
    let (mut sum_sin, mut sum_cos, mut any) = (0.0_f64, 0.0_f64, false);
    for (deg, w) in angles {
        let rad = deg.to_radians();
        sum_sin += w * rad.sin();
        sum_cos += w * rad.cos();
        any = true;
    }
    if !any || (sum_sin.abs() < 1e-12 && sum_cos.abs() < 1e-12) {
        return None;
    }
    Some(wrap_deg(sum_sin.atan2(sum_cos).to_degrees()))
}

/// Unweighted circular mean.
pub fn circular_mean(angles: impl IntoIterator<Item = f64>) -> Option<f64> {
    circular_mean_weighted(angles.into_iter().map(|a| (a, 1.0)))
}

/// Bisector of two bearings on the minor arc between them.
/// `bisect_deg(315, 45) == 0`, `bisect_deg(135, 225) == 180`.
pub fn bisect_deg(a: f64, b: f64) -> f64 {
    wrap_deg(a + delta_deg(a, b) / 2.0)
}

/// Signed true wind angle of a heading against a wind FROM-direction:
/// 0 = head to wind, positive = wind over starboard bow, in (-180, 180].
pub fn twa_deg(heading_deg: f64, wind_from_deg: f64) -> f64 {
    delta_deg(heading_deg, wind_from_deg)
}

//! polar.rs — Polar-table lookup and VMG optima
//!
//! Bilinear interpolation over a (TWA, TWS) target-speed matrix. Angles in
//! degrees, speeds in knots. Lookups outside the table clamp to the nearest
//! valid pair and say so via the `extrapolated` flag.

use race_types::PolarTable;

use crate::error::EngineError;

/// A polar lookup result. `extrapolated` is set when the query fell outside
/// the table and the nearest valid pair was used instead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolarLookup {
    pub value: f64,
    pub extrapolated: bool,
}

/// Read-only target-speed oracle for one boat class.
#[derive(Debug, Clone)]
pub struct OptimalVmgCalculator {
    table: PolarTable,
}

/// Sweep step for the optimum-angle searches, degrees.
const ANGLE_STEP_DEG: f64 = 0.5;

impl OptimalVmgCalculator {
    pub fn new(table: PolarTable) -> Result<Self, EngineError> {
        if table.twa_deg.len() < 2 || table.tws_kts.len() < 2 {
            return Err(EngineError::invalid(
                "polar_table",
                "needs at least a 2×2 grid",
            ));
        }
        if !strictly_increasing(&table.twa_deg) || !strictly_increasing(&table.tws_kts) {
            return Err(EngineError::invalid(
                "polar_table",
                "twa and tws grids must be strictly increasing",
            ));
        }
        if table.targets_kts.len() != table.twa_deg.len()
            || table
                .targets_kts
                .iter()
                .any(|row| row.len() != table.tws_kts.len())
        {
            return Err(EngineError::invalid(
                "polar_table",
                format!(
                    "target matrix must be {}×{}",
                    table.twa_deg.len(),
                    table.tws_kts.len()
                ),
            ));
        }
        if table
            .targets_kts
            .iter()
            .flatten()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(EngineError::invalid(
                "polar_table",
                "target speeds must be finite and non-negative",
            ));
        }
        Ok(Self { table })
    }

    /// Generic one-design keelboat polar, used when a track declares no
    /// polar class. Numbers are in the J/70 ballpark.
    pub fn one_design() -> Self {
        let table = PolarTable {
            class: "one-design".into(),
            twa_deg: vec![35.0, 42.0, 52.0, 60.0, 75.0, 90.0, 110.0, 135.0, 150.0, 165.0],
            tws_kts: vec![4.0, 6.0, 8.0, 10.0, 12.0, 16.0, 20.0],
            targets_kts: vec![
                vec![2.1, 3.0, 3.8, 4.4, 4.8, 5.2, 5.4],
                vec![2.6, 3.6, 4.4, 5.0, 5.4, 5.8, 6.0],
                vec![3.0, 4.1, 4.9, 5.5, 5.9, 6.3, 6.5],
                vec![3.2, 4.4, 5.2, 5.8, 6.2, 6.6, 6.9],
                vec![3.4, 4.6, 5.5, 6.1, 6.5, 7.0, 7.4],
                vec![3.5, 4.8, 5.7, 6.3, 6.8, 7.4, 7.9],
                vec![3.4, 4.7, 5.7, 6.4, 7.0, 7.8, 8.4],
                vec![3.0, 4.2, 5.2, 6.0, 6.7, 7.7, 8.6],
                vec![2.5, 3.6, 4.6, 5.4, 6.1, 7.2, 8.2],
                vec![2.1, 3.1, 4.0, 4.8, 5.5, 6.5, 7.5],
            ],
        };
        Self::new(table).expect("built-in polar is well-formed")
    }

    pub fn class(&self) -> &str {
        &self.table.class
    }

    /// Target boat speed at (TWA, TWS). TWA is folded to [0, 180].
    pub fn target_speed(&self, twa_deg: f64, tws_kts: f64) -> PolarLookup {
        let twa = fold_twa(twa_deg);
        let (ti, tj, tf, t_ex) = bracket(&self.table.twa_deg, twa);
        let (si, sj, sf, s_ex) = bracket(&self.table.tws_kts, tws_kts);

        let m = &self.table.targets_kts;
        let lo = m[ti][si] * (1.0 - sf) + m[ti][sj] * sf;
        let hi = m[tj][si] * (1.0 - sf) + m[tj][sj] * sf;
        PolarLookup {
            value: lo * (1.0 - tf) + hi * tf,
            extrapolated: t_ex || s_ex,
        }
    }

    /// TWA maximizing upwind VMG (`speed · cos twa`) at the given TWS.
    /// Never ≤ 0 for positive TWS: the search stays inside the table's
    /// angle range, and a degenerate table falls back to 45° flagged as
    /// extrapolated.
    pub fn optimal_upwind_angle(&self, tws_kts: f64) -> PolarLookup {
        let lo = self.table.twa_deg[0].max(ANGLE_STEP_DEG);
        let hi = 90.0_f64.min(*self.table.twa_deg.last().unwrap());
        let best = self.sweep_vmg(lo, hi, tws_kts, |twa, speed| speed * twa.to_radians().cos());
        match best {
            Some((angle, vmg)) if angle > 0.0 && vmg > 0.0 => PolarLookup {
                value: angle,
                extrapolated: tws_kts < self.table.tws_kts[0]
                    || tws_kts > *self.table.tws_kts.last().unwrap(),
            },
            _ => PolarLookup {
                value: 45.0,
                extrapolated: true,
            },
        }
    }

    /// TWA maximizing downwind VMG (`speed · |cos twa|` past beam) at the
    /// given TWS.
    pub fn optimal_downwind_angle(&self, tws_kts: f64) -> PolarLookup {
        let lo = 90.0_f64.max(self.table.twa_deg[0]);
        let hi = 180.0_f64.min(*self.table.twa_deg.last().unwrap());
        let best = self.sweep_vmg(lo, hi, tws_kts, |twa, speed| -speed * twa.to_radians().cos());
        match best {
            Some((angle, vmg)) if vmg > 0.0 => PolarLookup {
                value: angle,
                extrapolated: tws_kts < self.table.tws_kts[0]
                    || tws_kts > *self.table.tws_kts.last().unwrap(),
            },
            _ => PolarLookup {
                value: 150.0,
                extrapolated: true,
            },
        }
    }

    /// Upwind target VMG in knots at the given TWS.
    pub fn target_vmg_upwind(&self, tws_kts: f64) -> f64 {
        let angle = self.optimal_upwind_angle(tws_kts).value;
        self.target_speed(angle, tws_kts).value * angle.to_radians().cos()
    }

    /// Downwind target VMG in knots (positive) at the given TWS.
    pub fn target_vmg_downwind(&self, tws_kts: f64) -> f64 {
        let angle = self.optimal_downwind_angle(tws_kts).value;
        -self.target_speed(angle, tws_kts).value * angle.to_radians().cos()
    }

    /// Wind speed at which the table predicts `boat_speed_kts` for this TWA.
    /// Relies on targets being monotone in TWS; clamps to the grid edges.
    pub fn invert_tws(&self, twa_deg: f64, boat_speed_kts: f64) -> PolarLookup {
        let grid = &self.table.tws_kts;
        let mut prev = self.target_speed(twa_deg, grid[0]).value;
        if boat_speed_kts <= prev {
            return PolarLookup {
                value: grid[0],
                extrapolated: true,
            };
        }
        for j in 1..grid.len() {
            let cur = self.target_speed(twa_deg, grid[j]).value;
            if boat_speed_kts <= cur {
                let f = if cur > prev {
                    (boat_speed_kts - prev) / (cur - prev)
                } else {
                    0.0
                };
                return PolarLookup {
                    value: grid[j - 1] + f * (grid[j] - grid[j - 1]),
                    extrapolated: false,
                };
            }
            prev = cur;
        }
        PolarLookup {
            value: *grid.last().unwrap(),
            extrapolated: true,
        }
    }

    fn sweep_vmg(
        &self,
        lo: f64,
        hi: f64,
        tws_kts: f64,
        objective: impl Fn(f64, f64) -> f64,
    ) -> Option<(f64, f64)> {
        if !(hi > lo) || tws_kts <= 0.0 {
            return None;
        }
        let steps = ((hi - lo) / ANGLE_STEP_DEG).ceil() as usize;
        let mut best: Option<(f64, f64)> = None;
        for k in 0..=steps {
            let twa = (lo + k as f64 * ANGLE_STEP_DEG).min(hi);
            let speed = self.target_speed(twa, tws_kts).value;
            let vmg = objective(twa, speed);
            if best.map_or(true, |(_, b)| vmg > b) {
                best = Some((twa, vmg));
            }
        }
        best
    }
}

/// Bracket `v` in a strictly increasing grid: (lower index, upper index,
/// interpolation fraction, clamped?).
fn bracket(grid: &[f64], v: f64) -> (usize, usize, f64, bool) {
    if v <= grid[0] {
        return (0, 0, 0.0, v < grid[0]);
    }
    let last = grid.len() - 1;
    if v >= grid[last] {
        return (last, last, 0.0, v > grid[last]);
    }
    let mut i = 0;
    while grid[i + 1] < v {
        i += 1;
    }
    let f = (v - grid[i]) / (grid[i + 1] - grid[i]);
    (i, i + 1, f, false)
}

/// Fold an arbitrary angle to the polar domain [0, 180].
fn fold_twa(twa_deg: f64) -> f64 {
    let mut t = crate::angles::wrap_deg(twa_deg);
    if t > 180.0 {
        t = 360.0 - t;
    }
    t
}

fn strictly_increasing(grid: &[f64]) -> bool {
    grid.windows(2).all(|w| w[1] > w[0])
}

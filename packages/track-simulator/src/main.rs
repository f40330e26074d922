//! main.rs — Track simulator entry point
//!
//! Generates one scenario track and writes it as JSON, for feeding the
//! analysis engine from fixtures or poking at it by hand:
//!
//! ```text
//! track-sim --scenario beating --points 400 --out beat.json
//! ```

use clap::{Parser, ValueEnum};
use tracing::info;

use race_types::LatLon;
use track_simulator::{
    beating_leg, outlier_jump, straight_reach, wind_shift_course, windward_rounding, SimConfig,
};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Straight-line reach, nothing to detect
    Reach,
    /// Upwind beat with regular tacks
    Beating,
    /// Smooth curve plus one displaced fix
    Outlier,
    /// Permanent wind shift mid-track
    Shift,
    /// Windward mark rounding
    Rounding,
}

#[derive(Parser, Debug)]
#[command(name = "track-sim", about = "Regatta Suite synthetic track generator")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Scenario to generate
    #[arg(long, value_enum, default_value = "beating")]
    scenario: Scenario,
    /// Number of track points
    #[arg(long, default_value = "400")]
    points: usize,
    /// Boat speed, knots
    #[arg(long, default_value = "5.0")]
    speed: f64,
    /// Wind FROM-direction for wind-relative scenarios, degrees
    #[arg(long, default_value = "0.0")]
    wind: f64,
    /// RNG seed override
    #[arg(long)]
    seed: Option<u64>,
    /// Output path; stdout when omitted
    #[arg(short, long)]
    out: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "track_simulator=info".into()),
        )
        .init();

    let args = Args::parse();

    let config_str = std::fs::read_to_string(&args.config)
        .unwrap_or_else(|_| include_str!("../config.toml").to_string());
    let mut cfg: SimConfig = toml::from_str(&config_str).unwrap_or_else(|e| {
        eprintln!("bad config ({e}); using defaults");
        SimConfig::default()
    });
    if let Some(seed) = args.seed {
        cfg.seed = seed;
    }

    let track = match args.scenario {
        Scenario::Reach => straight_reach(&cfg, args.points, 90.0, args.speed),
        Scenario::Beating => beating_leg(&cfg, args.points, 60.0, args.wind, 45.0, args.speed),
        Scenario::Outlier => outlier_jump(&cfg, args.points, args.points / 2, 5_000.0),
        Scenario::Shift => wind_shift_course(
            &cfg,
            args.points,
            (args.wind + 315.0).rem_euclid(360.0),
            args.points as f64 * cfg.sample_interval_s / 2.0,
            15.0,
            args.speed,
        ),
        Scenario::Rounding => {
            let (track, mark) = windward_rounding(&cfg, 500.0, args.speed);
            log_mark(mark);
            track
        }
    };
    info!(
        scenario = ?args.scenario,
        points = track.points.len(),
        "track generated"
    );

    let json = serde_json::to_string_pretty(&track).expect("track serializes");
    match &args.out {
        Some(path) => std::fs::write(path, json).expect("write output file"),
        None => println!("{json}"),
    }
}

fn log_mark(mark: LatLon) {
    info!(lat = mark.lat, lon = mark.lon, "windward mark position");
}

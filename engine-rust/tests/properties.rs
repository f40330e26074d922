//! Property tests for the algebraic invariants: angle wrapping domains,
//! fusion's insertion-order independence, and the confidence-scaling
//! homomorphism of the Bayesian combiner.

use proptest::prelude::*;

use regatta_analysis::angles::{delta_deg, wrap_deg};
use regatta_analysis::polar::OptimalVmgCalculator;
use regatta_analysis::types::{BoundingBox, WindObservation, WindSource};
use regatta_analysis::wind::WindEstimator;
use regatta_analysis::wind_field::WindFieldFusionSystem;
use regatta_analysis::{AbortFlag, AnalysisConfig};

fn arb_observation() -> impl Strategy<Value = WindObservation> {
    (
        0i64..600_000,
        54.39f64..54.41,
        10.19f64..10.21,
        0.0f64..360.0,
        0.0f64..30.0,
        0.0f64..1.0,
    )
        .prop_map(|(ts, lat, lon, dir, speed, conf)| WindObservation {
            timestamp_ms: ts,
            lat,
            lon,
            direction_deg: dir,
            speed_kts: speed,
            confidence: conf,
            source: WindSource::External,
        })
}

proptest! {
    #[test]
    fn wrap_deg_lands_in_domain(a in -10_000.0f64..10_000.0) {
        let w = wrap_deg(a);
        prop_assert!((0.0..360.0).contains(&w));
    }

    #[test]
    fn delta_deg_is_minimal_and_antisymmetric(a in 0.0f64..360.0, b in 0.0f64..360.0) {
        let d = delta_deg(a, b);
        prop_assert!((-180.0..=180.0).contains(&d));
        // Adding the delta to `a` reaches `b` modulo 360
        let reached = wrap_deg(a + d);
        prop_assert!((reached - wrap_deg(b)).abs() < 1e-9 || (reached - wrap_deg(b)).abs() > 359.999);
    }

    #[test]
    fn field_is_insertion_order_independent(
        (observations, shuffled) in proptest::collection::vec(arb_observation(), 2..12)
            .prop_flat_map(|v| {
                let original = v.clone();
                (Just(original), Just(v).prop_shuffle())
            })
    ) {
        let bbox = BoundingBox::new(54.39, 10.19, 54.41, 10.21);
        let config = AnalysisConfig::default();

        let mut forward = WindFieldFusionSystem::new(config.clone());
        for o in observations {
            forward.insert(o);
        }
        let mut permuted = WindFieldFusionSystem::new(config);
        for o in shuffled {
            permuted.insert(o);
        }

        let a = forward.field_at(300_000, bbox, &AbortFlag::new()).value;
        let b = permuted.field_at(300_000, bbox, &AbortFlag::new()).value;
        prop_assert_eq!(&a.direction, &b.direction);
        prop_assert_eq!(&a.speed, &b.speed);
        prop_assert_eq!(&a.confidence, &b.confidence);
    }

    #[test]
    fn field_cells_stay_in_domain(
        observations in proptest::collection::vec(arb_observation(), 1..12)
    ) {
        let bbox = BoundingBox::new(54.39, 10.19, 54.41, 10.21);
        let mut fusion = WindFieldFusionSystem::new(AnalysisConfig::default());
        for o in observations {
            fusion.insert(o);
        }
        let field = fusion.field_at(300_000, bbox, &AbortFlag::new()).value;
        for row in 0..field.ny {
            for col in 0..field.nx {
                prop_assert!((0.0..=1.0).contains(&field.confidence[row][col]));
                prop_assert!((0.0..360.0).contains(&field.direction[row][col]));
                prop_assert!(field.speed[row][col] >= 0.0);
            }
        }
    }

    #[test]
    fn bayesian_fuse_ignores_uniform_confidence_scaling(
        observations in proptest::collection::vec(arb_observation(), 2..10),
        scale in 0.05f64..1.0,
    ) {
        let est = WindEstimator::new(
            AnalysisConfig::default(),
            OptimalVmgCalculator::one_design(),
        );
        let mut scaled = observations.clone();
        for o in &mut scaled {
            o.confidence *= scale;
        }
        let a = est.bayesian_fuse(&observations);
        let b = est.bayesian_fuse(&scaled);
        match (a, b) {
            (Some(a), Some(b)) => {
                prop_assert!((a.direction_deg - b.direction_deg).abs() < 1e-6
                    || (a.direction_deg - b.direction_deg).abs() > 359.999_99);
                prop_assert!((a.speed_kts - b.speed_kts).abs() < 1e-6);
            }
            (a, b) => prop_assert_eq!(a.is_some(), b.is_some()),
        }
    }
}

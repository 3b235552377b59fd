//! End-to-end fusion scenarios with stub capabilities.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use epifuse::engine::combine::CombinationRule;
use epifuse::engine::convergence::Tolerance;
use epifuse::engine::seeding::SeedingPolicy;
use epifuse::engine::Anchoring;
use epifuse::types::{Capability, EpidemicUnit, ObservedCurve};
use epifuse::{fuse, Batch, FusionConfig, FusionEngine, FusionError};

use crate::mock_capabilities::*;

// ---- helpers ---------------------------------------------------------------

fn three_unit_batch() -> Batch {
    Batch::new(vec![
        EpidemicUnit::new("u1", ObservedCurve::cumulative(vec![5.0, 12.0, 20.0]), 1000.0),
        EpidemicUnit::new("u2", ObservedCurve::cumulative(vec![3.0, 3.0, 4.0]), 1000.0),
        EpidemicUnit::new("u3", ObservedCurve::cumulative(vec![50.0, 80.0, 110.0]), 5000.0),
    ])
    .unwrap()
}

fn config() -> FusionConfig {
    FusionConfig {
        threshold: 1.0,
        max_iterations: 20,
        workers: Some(2),
        ..FusionConfig::default()
    }
}

fn floors(batch: &Batch) -> Vec<f64> {
    batch.units().iter().map(|u| u.observation_floor()).collect()
}

// ---- scenarios -------------------------------------------------------------

#[tokio::test]
async fn test_doubling_stubs_converge_immediately() {
    let mut batch = three_unit_batch();
    let result = fuse(
        &mut batch,
        Arc::new(DoublingStatistical),
        Arc::new(DoublingMechanistic),
        1.0,
        20,
    )
    .await
    .unwrap();

    assert!(result.converged);
    assert_eq!(result.iterations, 1);
    assert_eq!(result.values(), vec![40.0, 8.0, 220.0]);
    assert_eq!(result.history[0].max_change, 0.0);
    assert_eq!(result.estimate_for("u3"), Some(220.0));
}

#[tokio::test]
async fn test_constant_curve_mean_converges_after_first_iteration() {
    let mut batch = three_unit_batch();
    let result = fuse(
        &mut batch,
        Arc::new(DoublingStatistical),
        Arc::new(ConstantMechanistic(1000.0)),
        1.0,
        20,
    )
    .await
    .unwrap();

    assert!(result.converged);
    assert_eq!(result.iterations, 2);
    assert_eq!(result.history[0].estimates, vec![520.0, 504.0, 610.0]);
    assert_eq!(result.history[1].estimates, vec![520.0, 504.0, 610.0]);
    assert_eq!(result.history[1].max_change, 0.0);
}

#[tokio::test]
async fn test_mutual_anchoring_converges_to_fixed_point() {
    let mut batch = three_unit_batch();
    let engine = FusionEngine::new(FusionConfig { max_iterations: 200, ..config() });
    let stat = Arc::new(AttackRateStatistical::new());
    let fits = Arc::clone(&stat.fits);

    let result = engine
        .fuse(&mut batch, stat, Arc::new(AnchoredMechanistic { multiplier: 3.0 }))
        .await
        .unwrap();

    assert!(result.converged, "{result}");
    assert!(result.iterations > 1);
    assert_eq!(fits.load(Ordering::SeqCst), result.iterations as usize);
    // Changes shrink once the loop settles
    let changes: Vec<f64> = result.history.iter().map(|h| h.max_change).collect();
    assert!(changes.last().unwrap() < &1.0);
}

#[tokio::test]
async fn test_independent_anchoring_differs_from_mutual() {
    let run = |anchoring| async move {
        let mut batch = three_unit_batch();
        FusionEngine::new(FusionConfig { anchoring, max_iterations: 200, ..config() })
            .fuse(
                &mut batch,
                Arc::new(AttackRateStatistical::new()),
                Arc::new(AnchoredMechanistic { multiplier: 3.0 }),
            )
            .await
            .unwrap()
    };

    let mutual = run(Anchoring::Mutual).await;
    let independent = run(Anchoring::Independent).await;
    assert!(mutual.converged && independent.converged);
    assert_ne!(mutual.values(), independent.values());
}

// ---- properties ------------------------------------------------------------

#[tokio::test]
async fn test_estimates_never_below_observed() {
    let mut batch = three_unit_batch();
    let observed = floors(&batch);

    // Curve model predicts far below what has been seen
    let result = FusionEngine::new(FusionConfig {
        combination: CombinationRule::Weighted { statistical_weight: 0.1 },
        ..config()
    })
    .fuse(&mut batch, Arc::new(AttackRateStatistical::new()), Arc::new(ConstantMechanistic(1.0)))
    .await
    .unwrap();

    for record in &result.history {
        for (k, floor) in record.estimates.iter().zip(&observed) {
            assert!(k >= floor, "iteration {}: {k} < {floor}", record.iteration);
        }
    }
    assert!(result.history[0].floor_clamps > 0);
}

#[tokio::test]
async fn test_fusion_is_deterministic() {
    let run = || async {
        let mut batch = three_unit_batch();
        FusionEngine::new(FusionConfig { max_iterations: 200, ..config() })
            .fuse(
                &mut batch,
                Arc::new(AttackRateStatistical::new()),
                Arc::new(AnchoredMechanistic { multiplier: 3.0 }),
            )
            .await
            .unwrap()
    };

    let first = run().await;
    let second = run().await;
    assert_eq!(first, second);
    assert_eq!(first.iterations, second.iterations);
}

#[tokio::test]
async fn test_one_more_iteration_after_convergence_is_stable() {
    let mut batch = three_unit_batch();
    let converged = FusionEngine::new(FusionConfig { max_iterations: 200, ..config() })
        .fuse(
            &mut batch,
            Arc::new(AttackRateStatistical::new()),
            Arc::new(AnchoredMechanistic { multiplier: 3.0 }),
        )
        .await
        .unwrap();
    assert!(converged.converged);

    // Resume from the converged estimates for exactly one more pass
    let extra = FusionEngine::new(FusionConfig {
        seeding: SeedingPolicy::Provided,
        max_iterations: 1,
        ..config()
    })
    .fuse(
        &mut batch,
        Arc::new(AttackRateStatistical::new()),
        Arc::new(AnchoredMechanistic { multiplier: 3.0 }),
    )
    .await
    .unwrap();

    assert_eq!(extra.iterations, 1);
    assert!(extra.converged);
    for (before, after) in converged.values().iter().zip(extra.values()) {
        assert!((before - after).abs() < 1.0, "{before} -> {after}");
    }
}

#[tokio::test]
async fn test_single_unit_batch_completes() {
    let mut batch = Batch::new(vec![EpidemicUnit::new(
        "solo",
        ObservedCurve::incremental(vec![1.0, 3.0, 6.0]),
        2000.0,
    )])
    .unwrap();
    let stat = Arc::new(AttackRateStatistical::new());
    let fits = Arc::clone(&stat.fits);

    let result = FusionEngine::new(config())
        .fuse(&mut batch, stat, Arc::new(DoublingMechanistic))
        .await
        .unwrap();

    // Trivial statistical fit: the learner is never called
    assert_eq!(fits.load(Ordering::SeqCst), 0);
    assert!(result.converged);
    assert_eq!(result.values(), vec![20.0]);
}

#[tokio::test]
async fn test_single_iteration_cap() {
    // Seed already satisfies the threshold
    let mut batch = three_unit_batch();
    let result = fuse(&mut batch, Arc::new(DoublingStatistical), Arc::new(DoublingMechanistic), 1.0, 1)
        .await
        .unwrap();
    assert_eq!(result.iterations, 1);
    assert!(result.converged);

    // Seed is far from the fused value
    let mut batch = three_unit_batch();
    let result = fuse(
        &mut batch,
        Arc::new(DoublingStatistical),
        Arc::new(ConstantMechanistic(1000.0)),
        1.0,
        1,
    )
    .await
    .unwrap();
    assert_eq!(result.iterations, 1);
    assert!(!result.converged);
    assert!(matches!(result.into_converged(), Err(FusionError::NonConvergence { iterations: 1, .. })));
}

#[tokio::test]
async fn test_relative_tolerance() {
    let mut batch = three_unit_batch();
    let result = FusionEngine::new(FusionConfig {
        tolerance: Tolerance::Relative,
        threshold: 0.001,
        max_iterations: 200,
        ..config()
    })
    .fuse(
        &mut batch,
        Arc::new(AttackRateStatistical::new()),
        Arc::new(AnchoredMechanistic { multiplier: 3.0 }),
    )
    .await
    .unwrap();
    assert!(result.converged);
    assert!(result.final_change < 0.001);
}

#[tokio::test]
async fn test_unreliable_fits_use_statistical_estimate() {
    let mut batch = Batch::new(vec![
        EpidemicUnit::new("short", ObservedCurve::cumulative(vec![7.0]), 1000.0),
        EpidemicUnit::new("long", ObservedCurve::cumulative(vec![5.0, 12.0, 20.0]), 1000.0),
    ])
    .unwrap();

    let result = fuse(
        &mut batch,
        Arc::new(DoublingStatistical),
        Arc::new(FlaggingMechanistic { value: 100.0, min_steps: 2 }),
        1.0,
        20,
    )
    .await
    .unwrap();

    // short: statistical only (14); long: mean(40, 100) = 70
    assert_eq!(result.values(), vec![14.0, 70.0]);
    assert_eq!(result.history[0].unreliable_fits, 1);
}

// ---- failures --------------------------------------------------------------

#[tokio::test]
async fn test_short_curves_fail_with_unit_ids() {
    let mut batch = Batch::new(vec![
        EpidemicUnit::new("a", ObservedCurve::cumulative(vec![1.0]), 1000.0),
        EpidemicUnit::new("b", ObservedCurve::cumulative(vec![1.0, 2.0, 4.0, 8.0]), 1000.0),
        EpidemicUnit::new("c", ObservedCurve::cumulative(vec![2.0, 3.0]), 1000.0),
    ])
    .unwrap();

    let err = fuse(
        &mut batch,
        Arc::new(DoublingStatistical),
        Arc::new(ShortCurveMechanistic { min_steps: 3 }),
        1.0,
        20,
    )
    .await
    .unwrap_err();

    match err {
        FusionError::ModelFitFailure { capability, iteration, unit_ids, reason } => {
            assert_eq!(capability, Capability::Mechanistic);
            assert_eq!(iteration, 1);
            assert_eq!(unit_ids, vec!["a", "c"]);
            assert!(reason.contains("curve has 1 steps, need 3"), "{reason}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_statistical_failure_is_reported() {
    let mut batch = Batch::new(vec![
        EpidemicUnit::new("a", ObservedCurve::cumulative(vec![1.0, 2.0]), 1000.0),
        EpidemicUnit::new("b", ObservedCurve::cumulative(vec![1.0, 2.0]), 0.0),
    ])
    .unwrap();

    let err = fuse(
        &mut batch,
        Arc::new(AttackRateStatistical::new()),
        Arc::new(DoublingMechanistic),
        1.0,
        20,
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        FusionError::ModelFitFailure { capability: Capability::Statistical, iteration: 1, .. }
    ));
    assert!(err.to_string().contains("unit b has non-positive population"), "{err}");
}

#[tokio::test]
async fn test_slow_fit_times_out() {
    let mut batch = three_unit_batch();
    let engine = FusionEngine::new(FusionConfig { fit_timeout_ms: 50, ..config() });

    let err = engine
        .fuse(
            &mut batch,
            Arc::new(DoublingStatistical),
            Arc::new(SlowMechanistic { slow_above: 100.0, delay: Duration::from_millis(500) }),
        )
        .await
        .unwrap_err();

    match err {
        FusionError::ModelFitFailure { capability, unit_ids, reason, .. } => {
            assert_eq!(capability, Capability::Mechanistic);
            assert_eq!(unit_ids, vec!["u3"]);
            assert!(reason.contains("timed out after 50 ms"), "{reason}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_panicking_fit_is_fit_failure() {
    let mut batch = three_unit_batch();
    let err = fuse(&mut batch, Arc::new(DoublingStatistical), Arc::new(PanickingMechanistic), 1.0, 20)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("optimizer state corrupted"), "{err}");
}

#[tokio::test]
async fn test_cold_start_seed_from_curve_model() {
    let mut batch = three_unit_batch();
    let result = FusionEngine::new(FusionConfig { seeding: SeedingPolicy::ColdStart, ..config() })
        .fuse(&mut batch, Arc::new(DoublingStatistical), Arc::new(ConstantMechanistic(1000.0)))
        .await
        .unwrap();
    // Seeds are 1000; first pass moves to the mean with the doubling estimate
    assert_eq!(result.history[0].max_change, 1000.0 - 504.0);
    assert_eq!(result.values(), vec![520.0, 504.0, 610.0]);
}

//! Fusion engine: the alternating statistical/mechanistic refinement loop.
//!
//! Each iteration fits the statistical model across the whole batch on the
//! current estimates, fits the curve model per unit (anchored on the
//! statistical prediction), combines the two, and stops once no unit moves
//! by more than the convergence threshold.

pub mod combine;
pub mod convergence;
pub mod pool;
pub mod seeding;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capability::{MechanisticPredictor, StatisticalPredictor, TrainingRow};
use crate::types::{
    Batch, Capability, Covariates, FusionError, FusionResult, IterationRecord, UnitEstimate,
};
use combine::CombinationRule;
use convergence::{is_converged, Tolerance};
use pool::FitPool;
use seeding::SeedingPolicy;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What the curve model is told about the statistical estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anchoring {
    /// Pass the statistical prediction as the anchor of every curve fit.
    #[default]
    Mutual,
    /// Fit curves on the observed data alone.
    Independent,
}

/// Fusion loop configuration. Defaults are overridden by config.toml.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Convergence threshold on the batch-wide maximum change. Must be > 0.
    pub threshold: f64,
    pub tolerance: Tolerance,
    /// Hard cap on iterations. Must be >= 1.
    pub max_iterations: u32,
    pub seeding: SeedingPolicy,
    pub combination: CombinationRule,
    pub anchoring: Anchoring,
    /// Per-fit timeout in milliseconds; 0 disables it.
    pub fit_timeout_ms: u64,
    /// Concurrent curve fits. Defaults to the number of available cores.
    pub workers: Option<usize>,
    /// Below this many units the statistical fit is skipped and its
    /// prediction is each unit's current estimate.
    pub min_statistical_rows: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            threshold: 1.0,
            tolerance: Tolerance::Absolute,
            max_iterations: 20,
            seeding: SeedingPolicy::default(),
            combination: CombinationRule::Mean,
            anchoring: Anchoring::Mutual,
            fit_timeout_ms: 30_000,
            workers: None,
            min_statistical_rows: 2,
        }
    }
}

impl FusionConfig {
    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            return Err(format!("threshold must be a positive number, got {}", self.threshold));
        }
        if self.max_iterations == 0 {
            return Err("max_iterations must be at least 1".into());
        }
        if self.workers == Some(0) {
            return Err("workers must be at least 1".into());
        }
        self.seeding.validate()?;
        self.combination.validate()?;
        Ok(())
    }

    fn fit_timeout(&self) -> Option<Duration> {
        (self.fit_timeout_ms > 0).then(|| Duration::from_millis(self.fit_timeout_ms))
    }

    fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs the fusion loop over a batch.
///
/// The engine owns no state between runs; one instance can serve any number
/// of independent batches, concurrently if wrapped in an `Arc` or cloned.
#[derive(Debug, Clone)]
pub struct FusionEngine {
    config: FusionConfig,
}

impl FusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    /// Access the fusion configuration.
    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Fuse the two predictors over `batch` until the estimates stabilize.
    ///
    /// Only `current_estimate` on each unit is mutated. Non-convergence is
    /// reported through `FusionResult::converged`; fit failures, timeouts
    /// and non-finite predictions abort with `ModelFitFailure`.
    #[tracing::instrument(name = "fuse", skip_all, fields(run_id = %Uuid::new_v4(), units = batch.len()))]
    pub async fn fuse<S, M>(
        &self,
        batch: &mut Batch,
        statistical: Arc<S>,
        mechanistic: Arc<M>,
    ) -> Result<FusionResult, FusionError>
    where
        S: StatisticalPredictor + 'static,
        M: MechanisticPredictor + 'static,
    {
        self.config.validate().map_err(FusionError::InvalidInput)?;
        if batch.is_empty() {
            return Err(FusionError::InvalidInput("batch has no units".into()));
        }

        let cfg = &self.config;
        let pool = FitPool::new(cfg.worker_count(), cfg.fit_timeout());
        let floors: Vec<f64> = batch.units().iter().map(|u| u.observation_floor()).collect();

        // -- Seed ----------------------------------------------------------

        let mut seeds = Vec::with_capacity(batch.len());
        for (unit, &floor) in batch.units().iter().zip(&floors) {
            let seed = cfg.seeding.seed(unit, mechanistic.as_ref())?;
            seeds.push(seed.max(floor));
        }
        batch.set_estimates(&seeds);

        info!(
            statistical = std::any::type_name::<S>(),
            mechanistic = std::any::type_name::<M>(),
            seeding = ?cfg.seeding,
            combination = ?cfg.combination,
            anchoring = ?cfg.anchoring,
            threshold = cfg.threshold,
            max_iterations = cfg.max_iterations,
            "Fusion started"
        );

        // -- Iterate -------------------------------------------------------

        let mut history = Vec::new();
        let mut converged = false;
        let mut final_change = f64::INFINITY;

        for iteration in 1..=cfg.max_iterations {
            let previous = batch.estimates();

            let statistical_preds = self.statistical_pass(&pool, batch, &statistical, iteration).await?;

            let mut floor_clamps = 0;
            let anchors: Vec<f64> = statistical_preds
                .iter()
                .zip(&floors)
                .map(|(&s, &floor)| raise_to_floor(s, floor, &mut floor_clamps))
                .collect();

            let (mechanistic_preds, reliable) = self
                .mechanistic_pass(&pool, batch, &mechanistic, &anchors, iteration)
                .await?;

            let mut next = Vec::with_capacity(batch.len());
            let mut non_finite = Vec::new();
            for (i, unit) in batch.units().iter().enumerate() {
                let m = raise_to_floor(mechanistic_preds[i], floors[i], &mut floor_clamps);
                let k = cfg.combination.combine(anchors[i], m, reliable[i]);
                if !k.is_finite() {
                    non_finite.push(unit.id.clone());
                }
                next.push(k.max(floors[i]));
            }
            if !non_finite.is_empty() {
                return Err(fit_failure(
                    Capability::Mechanistic,
                    iteration,
                    non_finite,
                    "combined estimate is not finite".into(),
                ));
            }
            let unreliable_fits = reliable.iter().filter(|r| !**r).count();

            let max_change = cfg.tolerance.max_change(&previous, &next);
            batch.set_estimates(&next);
            final_change = max_change;

            debug!(
                iteration,
                max_change,
                floor_clamps,
                unreliable_fits,
                "Fusion iteration complete"
            );
            if floor_clamps > 0 {
                warn!(iteration, floor_clamps, "Predictions below observed totals were raised to the floor");
            }
            if unreliable_fits > 0 {
                warn!(iteration, unreliable_fits, "Unreliable curve fits fell back to the statistical estimate");
            }

            history.push(IterationRecord {
                iteration,
                statistical: statistical_preds,
                mechanistic: mechanistic_preds,
                estimates: next,
                max_change,
                floor_clamps,
                unreliable_fits,
            });

            if is_converged(max_change, cfg.threshold) {
                converged = true;
                break;
            }
        }

        let iterations = history.len() as u32;
        if converged {
            info!(iterations, final_change, "Fusion converged");
        } else {
            warn!(
                iterations,
                final_change,
                threshold = cfg.threshold,
                "Fusion did not converge within max_iterations"
            );
        }

        Ok(FusionResult {
            estimates: batch
                .units()
                .iter()
                .map(|u| UnitEstimate {
                    unit_id: u.id.clone(),
                    estimate: u.current_estimate,
                })
                .collect(),
            iterations,
            converged,
            final_change,
            threshold: cfg.threshold,
            history,
        })
    }

    /// Steps 1–2: batch-wide statistical fit on the current estimates, then
    /// one prediction per unit.
    async fn statistical_pass<S>(
        &self,
        pool: &FitPool,
        batch: &Batch,
        statistical: &Arc<S>,
        iteration: u32,
    ) -> Result<Vec<f64>, FusionError>
    where
        S: StatisticalPredictor + 'static,
    {
        let n = batch.len();
        if n < self.config.min_statistical_rows {
            debug!(
                rows = n,
                min_rows = self.config.min_statistical_rows,
                "Too few rows for a statistical fit; using current estimates"
            );
            return Ok(batch.estimates());
        }

        let rows: Vec<TrainingRow> = batch
            .units()
            .iter()
            .map(|u| TrainingRow {
                unit_id: u.id.clone(),
                covariates: u.covariates.clone(),
                target: u.current_estimate,
            })
            .collect();
        let all_ids = || batch.units().iter().map(|u| u.id.clone()).collect::<Vec<_>>();

        let model = Arc::clone(statistical);
        let predictions = pool
            .run(move || {
                let fitted = model.fit(&rows).context("statistical fit")?;
                let covariates: Vec<Covariates> = rows.into_iter().map(|r| r.covariates).collect();
                model.predict(&fitted, &covariates).context("statistical prediction")
            })
            .await
            .map_err(|reason| fit_failure(Capability::Statistical, iteration, all_ids(), reason))?;

        if predictions.len() != n {
            return Err(fit_failure(
                Capability::Statistical,
                iteration,
                all_ids(),
                format!("returned {} predictions for {} units", predictions.len(), n),
            ));
        }

        let non_finite: Vec<String> = batch
            .units()
            .iter()
            .zip(&predictions)
            .filter(|(_, p)| !p.is_finite())
            .map(|(u, _)| u.id.clone())
            .collect();
        if !non_finite.is_empty() {
            return Err(fit_failure(
                Capability::Statistical,
                iteration,
                non_finite,
                "non-finite prediction".into(),
            ));
        }

        Ok(predictions)
    }

    /// Steps 3–4: per-unit curve fits on the worker pool. Every failing unit
    /// of the iteration is collected before reporting.
    async fn mechanistic_pass<M>(
        &self,
        pool: &FitPool,
        batch: &Batch,
        mechanistic: &Arc<M>,
        anchors: &[f64],
        iteration: u32,
    ) -> Result<(Vec<f64>, Vec<bool>), FusionError>
    where
        M: MechanisticPredictor + 'static,
    {
        let jobs: Vec<_> = batch
            .units()
            .iter()
            .zip(anchors)
            .map(|(unit, &anchor)| {
                let model = Arc::clone(mechanistic);
                let curve = unit.observed.clone();
                let anchor = match self.config.anchoring {
                    Anchoring::Mutual => Some(anchor),
                    Anchoring::Independent => None,
                };
                move || -> anyhow::Result<(f64, bool)> {
                    let fitted = model.fit(&curve, anchor).context("curve fit")?;
                    let k = model.predict(&fitted).context("curve prediction")?;
                    Ok((k, model.is_reliable(&fitted)))
                }
            })
            .collect();

        let outcomes = pool.run_all(jobs).await;

        let mut predictions = Vec::with_capacity(outcomes.len());
        let mut reliable = Vec::with_capacity(outcomes.len());
        let mut failed_ids = Vec::new();
        let mut reasons = Vec::new();

        for (unit, outcome) in batch.units().iter().zip(outcomes) {
            match outcome {
                Ok((k, ok)) if k.is_finite() => {
                    predictions.push(k);
                    reliable.push(ok);
                }
                Ok((k, _)) => {
                    failed_ids.push(unit.id.clone());
                    reasons.push(format!("{}: non-finite prediction ({k})", unit.id));
                }
                Err(reason) => {
                    failed_ids.push(unit.id.clone());
                    reasons.push(format!("{}: {reason}", unit.id));
                }
            }
        }

        if !failed_ids.is_empty() {
            return Err(fit_failure(
                Capability::Mechanistic,
                iteration,
                failed_ids,
                reasons.join("; "),
            ));
        }

        Ok((predictions, reliable))
    }
}

/// Fuse with default policies: doubling seed, mean combination, mutual
/// anchoring, absolute tolerance.
pub async fn fuse<S, M>(
    batch: &mut Batch,
    statistical: Arc<S>,
    mechanistic: Arc<M>,
    threshold: f64,
    max_iterations: u32,
) -> Result<FusionResult, FusionError>
where
    S: StatisticalPredictor + 'static,
    M: MechanisticPredictor + 'static,
{
    let engine = FusionEngine::new(FusionConfig {
        threshold,
        max_iterations,
        ..FusionConfig::default()
    });
    engine.fuse(batch, statistical, mechanistic).await
}

fn raise_to_floor(value: f64, floor: f64, clamps: &mut usize) -> f64 {
    if value < floor {
        *clamps += 1;
        floor
    } else {
        value
    }
}

fn fit_failure(capability: Capability, iteration: u32, unit_ids: Vec<String>, reason: String) -> FusionError {
    FusionError::ModelFitFailure {
        capability,
        iteration,
        unit_ids,
        reason,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

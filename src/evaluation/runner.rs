//! Monte-Carlo replicate runner.
//!
//! Runs the fusion engine over many independent batches in parallel. Each
//! replicate owns its batch and a fresh pair of capabilities, so nothing is
//! shared between runs; results come back as values, ordered by replicate.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

use super::accuracy::{AccuracyReport, AccuracyTracker};
use crate::capability::{MechanisticPredictor, StatisticalPredictor};
use crate::engine::FusionEngine;
use crate::types::{Batch, FusionError, FusionResult};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// One replicate: the batch after fusion, the cold-start baseline, and the
/// engine's outcome.
#[derive(Debug)]
pub struct ReplicateOutcome {
    pub replicate: usize,
    pub batch: Batch,
    /// Mechanistic cold-start estimate per unit, raised to the observed total.
    pub cold_start: Vec<f64>,
    pub result: Result<FusionResult, FusionError>,
}

/// Collected results of a replicate run.
#[derive(Debug)]
pub struct ReplicateSummary {
    pub outcomes: Vec<ReplicateOutcome>,
    pub converged: usize,
    pub not_converged: usize,
    pub failed: usize,
    /// Accuracy of fused estimates (successful replicates only).
    pub fused: AccuracyReport,
    /// Accuracy of the cold-start estimate alone, over every replicate.
    pub cold_start: AccuracyReport,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub struct ReplicateRunner {
    engine: FusionEngine,
    max_concurrent: usize,
    tolerance: f64,
}

impl ReplicateRunner {
    pub fn new(engine: FusionEngine, max_concurrent: usize) -> Self {
        Self {
            engine,
            max_concurrent: max_concurrent.max(1),
            tolerance: 0.10,
        }
    }

    /// Relative error counted as accurate in the summary reports.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Fuse every batch. `make_capabilities(replicate)` builds the
    /// capabilities owned by that replicate.
    pub async fn run<S, M, F>(&self, batches: Vec<Batch>, make_capabilities: F) -> ReplicateSummary
    where
        S: StatisticalPredictor + 'static,
        M: MechanisticPredictor + 'static,
        F: Fn(usize) -> (S, M),
    {
        let total = batches.len();
        let permits = Arc::new(Semaphore::new(self.max_concurrent));
        let mut set = JoinSet::new();

        for (replicate, mut batch) in batches.into_iter().enumerate() {
            let (statistical, mechanistic) = make_capabilities(replicate);
            let engine = self.engine.clone();
            let permits = Arc::clone(&permits);

            set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let mechanistic = Arc::new(mechanistic);
                let cold_start: Vec<f64> = batch
                    .units()
                    .iter()
                    .map(|u| mechanistic.initial_estimate(&u.observed).max(u.observation_floor()))
                    .collect();
                let result = engine.fuse(&mut batch, Arc::new(statistical), mechanistic).await;
                ReplicateOutcome {
                    replicate,
                    batch,
                    cold_start,
                    result,
                }
            });
        }

        let mut outcomes = Vec::with_capacity(total);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "Replicate task aborted"),
            }
        }
        outcomes.sort_by_key(|o| o.replicate);

        let mut fused = AccuracyTracker::new(self.tolerance);
        let mut cold_start = AccuracyTracker::new(self.tolerance);
        let (mut converged, mut not_converged, mut failed) = (0, 0, 0);

        for outcome in &outcomes {
            cold_start.add_estimates(&outcome.batch, &outcome.cold_start);
            match &outcome.result {
                Ok(result) => {
                    if result.converged {
                        converged += 1;
                    } else {
                        not_converged += 1;
                    }
                    fused.add_result(&outcome.batch, result);
                }
                Err(e) => {
                    failed += 1;
                    error!(replicate = outcome.replicate, error = %e, "Replicate failed");
                }
            }
        }

        let summary = ReplicateSummary {
            outcomes,
            converged,
            not_converged,
            failed,
            fused: fused.report(),
            cold_start: cold_start.report(),
        };

        info!(
            replicates = total,
            converged = summary.converged,
            not_converged = summary.not_converged,
            failed = summary.failed,
            fused_mape = format!("{:.1}%", summary.fused.mean_absolute_percentage_error * 100.0),
            cold_start_mape = format!("{:.1}%", summary.cold_start.mean_absolute_percentage_error * 100.0),
            "Replicate run complete"
        );

        summary
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

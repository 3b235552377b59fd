//! Capability contracts for the two predictor families.
//!
//! The fusion engine knows nothing about regression algorithms or growth
//! curve shapes. It drives any statistical learner and any curve model
//! through these two traits, so concrete models can be swapped without
//! touching the loop.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::types::{Covariates, ObservedCurve};

/// One training row for the batch-wide statistical fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRow {
    pub unit_id: String,
    pub covariates: Covariates,
    /// The unit's current final-size estimate, used as the regression target.
    pub target: f64,
}

/// Predicts final size from contextual covariates, fitted jointly over a batch.
///
/// Implementations hold no state between calls: every `fit` starts from
/// scratch on the latest targets.
#[cfg_attr(test, mockall::automock(type Model = f64;))]
pub trait StatisticalPredictor: Send + Sync {
    type Model: Send + 'static;

    /// Train on every row of the batch. Must tolerate small batches
    /// (tens of rows) and targets of any magnitude.
    fn fit(&self, rows: &[TrainingRow]) -> Result<Self::Model>;

    /// One estimate per covariate row, in the same order.
    fn predict(&self, model: &Self::Model, covariates: &[Covariates]) -> Result<Vec<f64>>;
}

/// Predicts final size by fitting a growth curve to one unit's partial
/// trajectory and extrapolating it to its asymptote.
#[cfg_attr(test, mockall::automock(type Model = f64;))]
pub trait MechanisticPredictor: Send + Sync {
    type Model: Send + 'static;

    /// Fit curve parameters to the observed prefix. `anchor`, when present,
    /// is the statistical estimate of the final size and may be used as a
    /// prior or as the target asymptote. Must stay bounded on curves only a
    /// handful of steps long.
    fn fit(&self, curve: &ObservedCurve, anchor: Option<f64>) -> Result<Self::Model>;

    /// Asymptotic final size of a fitted curve.
    fn predict(&self, model: &Self::Model) -> Result<f64>;

    /// Estimate usable before any fitting. Defined for a single observed point.
    fn initial_estimate(&self, curve: &ObservedCurve) -> f64;

    /// Whether the fit is trustworthy enough to be combined. An unreliable
    /// fit makes the engine fall back to the statistical prediction.
    fn is_reliable(&self, _model: &Self::Model) -> bool {
        true
    }
}

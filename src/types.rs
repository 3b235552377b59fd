//! Shared types for the EPIFUSE fusion engine.
//!
//! These types form the data model used across all modules: the observed
//! curve of a single outbreak, the batch the engine iterates over, the
//! result it returns, and the error taxonomy.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Covariate holding the population size of the affected region.
pub const POPULATION_COVARIATE: &str = "population";

/// Covariate holding twice the observed case volume (the doubling heuristic).
pub const VOLUME_COVARIATE: &str = "doubled_observed_volume";

/// Covariate name → value. Ordered so every unit iterates its schema the same way.
pub type Covariates = BTreeMap<String, f64>;

// ---------------------------------------------------------------------------
// Observed curve
// ---------------------------------------------------------------------------

/// How the values of an observed curve are accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CurveKind {
    /// Running totals; must be non-decreasing.
    Cumulative,
    /// New cases per time step.
    Incremental,
}

impl fmt::Display for CurveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CurveKind::Cumulative => write!(f, "cumulative"),
            CurveKind::Incremental => write!(f, "incremental"),
        }
    }
}

/// The prefix of a case-count trajectory observed so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedCurve {
    pub kind: CurveKind,
    pub counts: Vec<f64>,
}

impl ObservedCurve {
    pub fn cumulative(counts: Vec<f64>) -> Self {
        Self { kind: CurveKind::Cumulative, counts }
    }

    pub fn incremental(counts: Vec<f64>) -> Self {
        Self { kind: CurveKind::Incremental, counts }
    }

    /// Number of observed time steps.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Largest final size implied by what has already been observed.
    ///
    /// For a cumulative curve this is the last value; for an incremental
    /// curve, the sum of all steps. No estimate may fall below it.
    pub fn observed_total(&self) -> f64 {
        match self.kind {
            CurveKind::Cumulative => self.counts.last().copied().unwrap_or(0.0),
            CurveKind::Incremental => self.counts.iter().sum(),
        }
    }

    /// The curve as running totals, whatever its kind.
    pub fn to_cumulative(&self) -> Vec<f64> {
        match self.kind {
            CurveKind::Cumulative => self.counts.clone(),
            CurveKind::Incremental => self
                .counts
                .iter()
                .scan(0.0, |acc, c| {
                    *acc += c;
                    Some(*acc)
                })
                .collect(),
        }
    }

    /// Check the curve invariants, returning a description of the first violation.
    pub fn validate(&self) -> Result<(), String> {
        if self.counts.is_empty() {
            return Err("observed curve is empty".into());
        }
        for (step, &c) in self.counts.iter().enumerate() {
            if !c.is_finite() || c < 0.0 {
                return Err(format!("count {c} at step {step} is not a finite non-negative number"));
            }
        }
        if self.kind == CurveKind::Cumulative {
            if let Some(step) = self.counts.windows(2).position(|w| w[1] < w[0]) {
                return Err(format!(
                    "cumulative curve decreases at step {} ({} -> {})",
                    step + 1,
                    self.counts[step],
                    self.counts[step + 1]
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Epidemic unit
// ---------------------------------------------------------------------------

/// One outbreak: its partial curve, static covariates, and running estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpidemicUnit {
    pub id: String,
    pub observed: ObservedCurve,
    pub covariates: Covariates,
    /// Running final-size estimate `K`. Only the engine mutates this.
    pub current_estimate: f64,
    /// True eventual final size. Evaluation only; never read by the engine.
    #[serde(default)]
    pub ground_truth: Option<f64>,
}

impl EpidemicUnit {
    /// Create a unit with the two standard covariates populated:
    /// `population` and `doubled_observed_volume`.
    ///
    /// The running estimate starts at the observation floor; the engine
    /// reseeds it according to its seeding policy.
    pub fn new(id: impl Into<String>, observed: ObservedCurve, population: f64) -> Self {
        let floor = observed.observed_total();
        let mut covariates = Covariates::new();
        covariates.insert(POPULATION_COVARIATE.to_string(), population);
        covariates.insert(VOLUME_COVARIATE.to_string(), 2.0 * floor);
        Self {
            id: id.into(),
            observed,
            covariates,
            current_estimate: floor,
            ground_truth: None,
        }
    }

    /// Attach an extra covariate.
    pub fn with_covariate(mut self, name: impl Into<String>, value: f64) -> Self {
        self.covariates.insert(name.into(), value);
        self
    }

    /// Attach the evaluation-only true final size.
    pub fn with_ground_truth(mut self, total: f64) -> Self {
        self.ground_truth = Some(total);
        self
    }

    /// Set the running estimate directly (used with the `Provided` seeding policy).
    pub fn with_estimate(mut self, estimate: f64) -> Self {
        self.current_estimate = estimate;
        self
    }

    /// Lower bound every estimate for this unit must respect.
    pub fn observation_floor(&self) -> f64 {
        self.observed.observed_total()
    }
}

impl fmt::Display for EpidemicUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} steps ({}), observed {:.0}, estimate {:.1}",
            self.id,
            self.observed.len(),
            self.observed.kind,
            self.observation_floor(),
            self.current_estimate,
        )
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// A validated, fixed-size collection of units fused together.
///
/// The statistical model fits jointly across the batch; the mechanistic
/// model fits each unit on its own. The covariate schema is shared by all
/// units and cannot change once the batch is built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Batch {
    units: Vec<EpidemicUnit>,
}

impl Batch {
    /// Validate and wrap a set of units.
    pub fn new(units: Vec<EpidemicUnit>) -> Result<Self, FusionError> {
        let first = units
            .first()
            .ok_or_else(|| FusionError::InvalidInput("batch has no units".into()))?;
        let schema: Vec<&String> = first.covariates.keys().collect();

        for required in [POPULATION_COVARIATE, VOLUME_COVARIATE] {
            if !first.covariates.contains_key(required) {
                return Err(FusionError::InvalidInput(format!(
                    "unit {} is missing required covariate '{required}'",
                    first.id
                )));
            }
        }

        let mut seen = HashSet::new();
        for unit in &units {
            if !seen.insert(unit.id.as_str()) {
                return Err(FusionError::InvalidInput(format!("duplicate unit id {}", unit.id)));
            }
            unit.observed
                .validate()
                .map_err(|e| FusionError::InvalidInput(format!("unit {}: {e}", unit.id)))?;

            let keys: Vec<&String> = unit.covariates.keys().collect();
            if keys != schema {
                return Err(FusionError::InvalidInput(format!(
                    "unit {} covariates {:?} do not match batch schema {:?}",
                    unit.id, keys, schema
                )));
            }
            if let Some((name, value)) = unit.covariates.iter().find(|(_, v)| !v.is_finite()) {
                return Err(FusionError::InvalidInput(format!(
                    "unit {} covariate '{name}' is not finite ({value})",
                    unit.id
                )));
            }
        }

        Ok(Self { units })
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Always false for a constructed batch; kept for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn units(&self) -> &[EpidemicUnit] {
        &self.units
    }

    /// Covariate names shared by every unit, in iteration order.
    pub fn schema(&self) -> Vec<String> {
        self.units[0].covariates.keys().cloned().collect()
    }

    /// Current running estimates in unit order.
    pub fn estimates(&self) -> Vec<f64> {
        self.units.iter().map(|u| u.current_estimate).collect()
    }

    pub(crate) fn set_estimates(&mut self, estimates: &[f64]) {
        for (unit, &k) in self.units.iter_mut().zip(estimates) {
            unit.current_estimate = k;
        }
    }

    /// Consume the batch, returning its units.
    pub fn into_units(self) -> Vec<EpidemicUnit> {
        self.units
    }
}

// ---------------------------------------------------------------------------
// Fusion result
// ---------------------------------------------------------------------------

/// Final estimate for a single unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitEstimate {
    pub unit_id: String,
    pub estimate: f64,
}

/// Diagnostics recorded for one pass of the fusion loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based iteration number.
    pub iteration: u32,
    pub statistical: Vec<f64>,
    pub mechanistic: Vec<f64>,
    /// Combined estimates written back to the batch.
    pub estimates: Vec<f64>,
    /// Batch-wide maximum change under the configured tolerance.
    pub max_change: f64,
    /// Predictions raised to a unit's observation floor.
    pub floor_clamps: usize,
    /// Units whose mechanistic fit was flagged unreliable.
    pub unreliable_fits: usize,
}

/// Outcome of one `fuse` call.
///
/// Non-convergence is a flag here rather than an error: the caller decides
/// whether the last estimate is acceptable (see [`FusionResult::into_converged`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionResult {
    pub estimates: Vec<UnitEstimate>,
    pub iterations: u32,
    pub converged: bool,
    pub final_change: f64,
    pub threshold: f64,
    pub history: Vec<IterationRecord>,
}

impl FusionResult {
    /// Final estimates in unit order.
    pub fn values(&self) -> Vec<f64> {
        self.estimates.iter().map(|e| e.estimate).collect()
    }

    pub fn estimate_for(&self, unit_id: &str) -> Option<f64> {
        self.estimates
            .iter()
            .find(|e| e.unit_id == unit_id)
            .map(|e| e.estimate)
    }

    /// Turn a non-converged result into `FusionError::NonConvergence`.
    pub fn into_converged(self) -> Result<Self, FusionError> {
        if self.converged {
            Ok(self)
        } else {
            Err(FusionError::NonConvergence {
                iterations: self.iterations,
                max_change: self.final_change,
                threshold: self.threshold,
            })
        }
    }

    /// Pretty JSON for the harness to persist.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for FusionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} units, {} iterations, {} (max change {:.4} vs threshold {})",
            self.estimates.len(),
            self.iterations,
            if self.converged { "converged" } else { "NOT converged" },
            self.final_change,
            self.threshold,
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Which side of the fusion loop a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Capability {
    Statistical,
    Mechanistic,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Statistical => write!(f, "statistical"),
            Capability::Mechanistic => write!(f, "mechanistic"),
        }
    }
}

/// Domain-specific error types for EPIFUSE.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FusionError {
    #[error("{capability} model fit failed at iteration {iteration} for units {unit_ids:?}: {reason}")]
    ModelFitFailure {
        capability: Capability,
        iteration: u32,
        unit_ids: Vec<String>,
        reason: String,
    },

    #[error("No convergence after {iterations} iterations: max change {max_change:.4} >= threshold {threshold}")]
    NonConvergence {
        iterations: u32,
        max_change: f64,
        threshold: f64,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

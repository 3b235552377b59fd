//! Seeding policies for the first running estimate of every unit.
//!
//! The loop needs a starting `K` before the first statistical fit, since
//! the statistical model trains on the current estimates. Two starting
//! points are used in practice: the doubling heuristic over the observed
//! volume and the mechanistic model's cold-start estimate.

use serde::{Deserialize, Serialize};

use crate::capability::MechanisticPredictor;
use crate::types::{Capability, EpidemicUnit, FusionError};

/// How the engine seeds `current_estimate` before iteration 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SeedingPolicy {
    /// Observed total divided by the assumed fraction of the epidemic seen
    /// so far. With the default fraction of one half this is the doubling
    /// heuristic; it misleads when the true fraction is far from that.
    Doubling {
        #[serde(default = "default_observed_fraction")]
        observed_fraction: f64,
    },
    /// The mechanistic capability's parameter-free estimate.
    ColdStart,
    /// Keep whatever estimate the caller placed on the unit.
    Provided,
}

fn default_observed_fraction() -> f64 {
    0.5
}

impl Default for SeedingPolicy {
    fn default() -> Self {
        SeedingPolicy::Doubling {
            observed_fraction: default_observed_fraction(),
        }
    }
}

impl SeedingPolicy {
    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            SeedingPolicy::Doubling { observed_fraction }
                if !(observed_fraction.is_finite() && *observed_fraction > 0.0 && *observed_fraction <= 1.0) =>
            {
                Err(format!("observed_fraction must be in (0, 1], got {observed_fraction}"))
            }
            _ => Ok(()),
        }
    }

    /// Compute the unclamped seed for one unit.
    pub fn seed<M: MechanisticPredictor + ?Sized>(
        &self,
        unit: &EpidemicUnit,
        mechanistic: &M,
    ) -> Result<f64, FusionError> {
        let seed = match self {
            SeedingPolicy::Doubling { observed_fraction } => unit.observation_floor() / observed_fraction,
            SeedingPolicy::ColdStart => {
                let k = mechanistic.initial_estimate(&unit.observed);
                if !k.is_finite() {
                    return Err(FusionError::ModelFitFailure {
                        capability: Capability::Mechanistic,
                        iteration: 0,
                        unit_ids: vec![unit.id.clone()],
                        reason: format!("initial estimate is not finite ({k})"),
                    });
                }
                k
            }
            SeedingPolicy::Provided => {
                if !unit.current_estimate.is_finite() {
                    return Err(FusionError::InvalidInput(format!(
                        "unit {} has a non-finite provided estimate ({})",
                        unit.id, unit.current_estimate
                    )));
                }
                unit.current_estimate
            }
        };
        Ok(seed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

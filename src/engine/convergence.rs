//! Stopping policy.
//!
//! Convergence is judged batch-wide: the worst unit gates termination,
//! because the statistical fit is joint and cannot stop unit by unit.

use serde::{Deserialize, Serialize};

/// How the change in a unit's estimate between iterations is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tolerance {
    /// `|new − old|`
    #[default]
    Absolute,
    /// `|new − old| / max(|old|, 1)`. The floor of 1 keeps tiny outbreaks
    /// from producing huge relative swings.
    Relative,
}

impl Tolerance {
    pub fn change(&self, previous: f64, next: f64) -> f64 {
        let delta = (next - previous).abs();
        match self {
            Tolerance::Absolute => delta,
            Tolerance::Relative => delta / previous.abs().max(1.0),
        }
    }

    /// Largest per-unit change across the batch.
    pub fn max_change(&self, previous: &[f64], next: &[f64]) -> f64 {
        previous
            .iter()
            .zip(next)
            .map(|(&p, &n)| self.change(p, n))
            .fold(0.0, f64::max)
    }
}

/// Whether a batch-wide change satisfies the threshold.
pub fn is_converged(max_change: f64, threshold: f64) -> bool {
    max_change < threshold
}

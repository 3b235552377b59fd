//! Combination of the two predictions into the next running estimate.

use serde::{Deserialize, Serialize};

/// Deterministic rule turning a (statistical, mechanistic) pair into `K`.
///
/// Whatever the rule, a unit whose mechanistic fit is flagged unreliable
/// takes the statistical prediction.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum CombinationRule {
    /// Arithmetic mean of the two predictions.
    #[default]
    Mean,
    /// `w · statistical + (1 − w) · mechanistic`.
    Weighted {
        #[serde(default = "default_statistical_weight")]
        statistical_weight: f64,
    },
    /// Statistical prediction only; the curve model still fits every pass.
    Statistical,
    /// Mechanistic prediction only.
    Mechanistic,
}

fn default_statistical_weight() -> f64 {
    0.5
}

impl CombinationRule {
    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            CombinationRule::Weighted { statistical_weight }
                if !(0.0..=1.0).contains(statistical_weight) =>
            {
                Err(format!("statistical_weight must be in [0, 1], got {statistical_weight}"))
            }
            _ => Ok(()),
        }
    }

    pub fn combine(&self, statistical: f64, mechanistic: f64, mechanistic_reliable: bool) -> f64 {
        if !mechanistic_reliable {
            return statistical;
        }
        match self {
            CombinationRule::Mean => 0.5 * statistical + 0.5 * mechanistic,
            CombinationRule::Weighted { statistical_weight: w } => w * statistical + (1.0 - w) * mechanistic,
            CombinationRule::Statistical => statistical,
            CombinationRule::Mechanistic => mechanistic,
        }
    }
}

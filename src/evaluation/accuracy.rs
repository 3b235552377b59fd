//! Accuracy scoring against ground truth.
//!
//! Measures how close fused final-size estimates come to the true totals
//! of simulated outbreaks, and whether the estimator is biased.

use serde::Serialize;

use crate::types::{Batch, FusionResult};

// ---------------------------------------------------------------------------
// Accuracy data
// ---------------------------------------------------------------------------

/// A single estimate–truth pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccuracyPoint {
    pub unit_id: String,
    pub estimate: f64,
    pub ground_truth: f64,
    pub observed_total: f64,
}

impl AccuracyPoint {
    fn absolute_error(&self) -> f64 {
        (self.estimate - self.ground_truth).abs()
    }

    /// Relative error, or `None` for a zero-sized outbreak.
    fn relative_error(&self) -> Option<f64> {
        (self.ground_truth > 0.0).then(|| self.absolute_error() / self.ground_truth)
    }

    /// `ln(estimate / truth)`: positive when overestimating.
    fn log_ratio(&self) -> Option<f64> {
        (self.ground_truth > 0.0 && self.estimate > 0.0).then(|| (self.estimate / self.ground_truth).ln())
    }
}

/// Accuracy analysis results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccuracyReport {
    pub total_estimates: usize,
    pub mean_absolute_error: f64,
    /// Mean of |estimate − truth| / truth over outbreaks with a positive truth.
    pub mean_absolute_percentage_error: f64,
    /// Mean log ratio of estimate to truth. Zero is unbiased.
    pub mean_log_ratio: f64,
    /// Share of estimates within `tolerance` relative error of the truth.
    pub within_tolerance_rate: f64,
    pub tolerance: f64,
    pub diagnosis: BiasDiagnosis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BiasDiagnosis {
    Unbiased,
    Overestimating,
    Underestimating,
    InsufficientData, // Not enough estimates to diagnose
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Minimum estimates before a bias diagnosis is attempted.
const MIN_POINTS_FOR_DIAGNOSIS: usize = 10;

/// Log-ratio band treated as unbiased (about ±5%).
const UNBIASED_LOG_BAND: f64 = 0.05;

pub struct AccuracyTracker {
    points: Vec<AccuracyPoint>,
    /// Relative error counted as "close enough".
    tolerance: f64,
}

impl Default for AccuracyTracker {
    fn default() -> Self {
        Self::new(0.10)
    }
}

impl AccuracyTracker {
    pub fn new(tolerance: f64) -> Self {
        Self {
            points: Vec::new(),
            tolerance,
        }
    }

    pub fn add_point(&mut self, point: AccuracyPoint) {
        self.points.push(point);
    }

    /// Score a fused batch. Units without ground truth are skipped.
    pub fn add_result(&mut self, batch: &Batch, result: &FusionResult) {
        self.add_estimates(batch, &result.values());
    }

    /// Score any per-unit estimates (e.g. a cold-start baseline) against
    /// the batch's ground truth. `estimates` is in unit order.
    pub fn add_estimates(&mut self, batch: &Batch, estimates: &[f64]) {
        for (unit, &estimate) in batch.units().iter().zip(estimates) {
            if let Some(truth) = unit.ground_truth {
                self.points.push(AccuracyPoint {
                    unit_id: unit.id.clone(),
                    estimate,
                    ground_truth: truth,
                    observed_total: unit.observation_floor(),
                });
            }
        }
    }

    pub fn count(&self) -> usize {
        self.points.len()
    }

    pub fn points(&self) -> &[AccuracyPoint] {
        &self.points
    }

    /// Generate a full accuracy report.
    pub fn report(&self) -> AccuracyReport {
        if self.points.is_empty() {
            return AccuracyReport {
                total_estimates: 0,
                mean_absolute_error: 0.0,
                mean_absolute_percentage_error: 0.0,
                mean_log_ratio: 0.0,
                within_tolerance_rate: 0.0,
                tolerance: self.tolerance,
                diagnosis: BiasDiagnosis::InsufficientData,
            };
        }

        let n = self.points.len() as f64;
        let mean_absolute_error = self.points.iter().map(|p| p.absolute_error()).sum::<f64>() / n;

        let relative: Vec<f64> = self.points.iter().filter_map(|p| p.relative_error()).collect();
        let mean_absolute_percentage_error = mean(&relative);
        let within_tolerance_rate = if relative.is_empty() {
            0.0
        } else {
            relative.iter().filter(|&&r| r <= self.tolerance).count() as f64 / relative.len() as f64
        };

        let log_ratios: Vec<f64> = self.points.iter().filter_map(|p| p.log_ratio()).collect();
        let mean_log_ratio = mean(&log_ratios);

        AccuracyReport {
            total_estimates: self.points.len(),
            mean_absolute_error,
            mean_absolute_percentage_error,
            mean_log_ratio,
            within_tolerance_rate,
            tolerance: self.tolerance,
            diagnosis: self.diagnose(log_ratios.len(), mean_log_ratio),
        }
    }

    fn diagnose(&self, samples: usize, mean_log_ratio: f64) -> BiasDiagnosis {
        if samples < MIN_POINTS_FOR_DIAGNOSIS {
            BiasDiagnosis::InsufficientData
        } else if mean_log_ratio > UNBIASED_LOG_BAND {
            BiasDiagnosis::Overestimating
        } else if mean_log_ratio < -UNBIASED_LOG_BAND {
            BiasDiagnosis::Underestimating
        } else {
            BiasDiagnosis::Unbiased
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Evaluation against simulated ground truth.
//!
//! Scores fused estimates against the true final sizes carried by
//! evaluation batches, and runs independent replicates in parallel.

pub mod accuracy;
pub mod runner;

pub use accuracy::{AccuracyReport, AccuracyTracker, BiasDiagnosis};
pub use runner::{ReplicateOutcome, ReplicateRunner, ReplicateSummary};

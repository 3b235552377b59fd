//! EPIFUSE: outbreak final-size estimation by model fusion.
//!
//! Alternates a covariate-driven statistical model and a growth-curve
//! mechanistic model over a batch of partially observed outbreaks until
//! their combined estimates stabilize. Concrete models plug in through the
//! traits in [`capability`].

pub mod config;
pub mod types;
pub mod capability;
pub mod engine;
pub mod evaluation;
pub mod logging;

pub use engine::{fuse, FusionConfig, FusionEngine};
pub use types::{Batch, EpidemicUnit, FusionError, FusionResult, ObservedCurve};

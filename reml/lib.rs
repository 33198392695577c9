#![deny(unused_variables)]
//! REML estimation of variance components for genomic linear mixed models,
//! with BLUPs, marker-effect back-solving and genomic prediction.

pub mod constrain;
pub mod convergence;
pub mod effects;
pub mod estimator;
pub mod model;
pub mod observer;
pub mod policy;
pub mod report;
pub mod state;
pub mod statistics;
pub mod variance;

#[path = "../data/mod.rs"]
pub mod data;

#[path = "../predict/mod.rs"]
pub mod predict;

#[path = "../shared/mod.rs"]
pub mod shared;

pub use estimator::{Estimator, EstimatorConfig, FitResult, FitSummary};
pub use model::{FreqModel, FreqState};
pub use shared::error::{GremlError, Result};

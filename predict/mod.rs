//! Genomic prediction from stored marker and covariate effects.

pub mod effects;
pub mod engine;
pub mod matcher;
pub mod writer;

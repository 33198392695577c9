//! Everything that turns files on disk into aligned matrices for the REML core.

pub mod coding;
pub mod fixed;
pub mod grm;
pub mod grm_builder;
pub mod ids;
pub mod payload;
pub mod pipe;
pub mod plink;
pub mod simulate;
pub mod tables;
pub mod transform;

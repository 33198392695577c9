//! Streams a PLINK fileset in variant chunks and accumulates Z·Zᵀ.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayViewMut1, Axis, s};
use serde::{Deserialize, Serialize};

use crate::data::coding::{CodingPolicy, MONOMORPHIC_THRESHOLD, VariantStats};
use crate::data::grm::{GrmKind, trace_denominator, write_grm};
use crate::data::payload::write_payload;
use crate::data::plink::PlinkDataset;
use crate::shared::error::{Diagnostic, GremlError, Result};

pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

/// Per-variant coding family used when building a GRM.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GrmMethod {
    /// (g - 2p)/sqrt(2pq) and orthogonal dominance.
    #[default]
    Yang,
    /// g - 2p and the heterozygote indicator centred by 2pq.
    Su,
    /// g - 2p and {-2p², 2pq, -2q²}.
    Zeng,
    /// Sample standardization of dosages and of dominance-recoded dosages.
    Standardized,
}

impl GrmMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yang => "yang",
            Self::Su => "su",
            Self::Zeng => "zeng",
            Self::Standardized => "standardized",
        }
    }

    /// Codes one dosage column in place. Missing genotypes end at 0 and
    /// monomorphic columns are zeroed.
    pub fn code(self, kind: GrmKind, mut column: ArrayViewMut1<f64>) -> VariantStats {
        let dominance = kind == GrmKind::Dominance;
        let stats = match (self, dominance) {
            (Self::Yang, false) => CodingPolicy::HardyWeinberg.apply(column.view_mut()),
            (Self::Yang, true) => CodingPolicy::OrthogonalDominance.apply(column.view_mut()),
            (Self::Standardized, false) => CodingPolicy::Standardize.apply(column.view_mut()),
            (Self::Standardized, true) => {
                CodingPolicy::DominantStandardize.apply(column.view_mut())
            }
            (Self::Su | Self::Zeng, false) => {
                let stats = CodingPolicy::Raw.apply(column.view_mut());
                column.mapv_inplace(|g| g - stats.mean);
                allele_stats(stats.mean)
            }
            (Self::Su, true) => recode_by_frequency(column.view_mut(), |g, p| {
                let het = 2.0 * p * (1.0 - p);
                if g == 2.0 { -het } else { g - het }
            }),
            (Self::Zeng, true) => recode_by_frequency(column.view_mut(), |g, p| {
                let q = 1.0 - p;
                if g == 2.0 {
                    -2.0 * q * q
                } else if g == 1.0 {
                    2.0 * p * q
                } else {
                    -2.0 * p * p
                }
            }),
        };
        if stats.is_monomorphic {
            column.fill(0.0);
        }
        stats
    }
}

impl fmt::Display for GrmMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GrmMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yang" => Ok(Self::Yang),
            "su" => Ok(Self::Su),
            "zeng" => Ok(Self::Zeng),
            "standardized" => Ok(Self::Standardized),
            other => Err(format!(
                "unknown GRM method '{other}'; expected yang, su, zeng or standardized"
            )),
        }
    }
}

/// Monomorphic when 2p(1-p) vanishes for p = mean / 2.
fn allele_stats(mean: f64) -> VariantStats {
    let p = mean / 2.0;
    let spread = 2.0 * p * (1.0 - p);
    VariantStats {
        mean,
        stddev: spread.max(0.0).sqrt(),
        is_monomorphic: !(spread >= MONOMORPHIC_THRESHOLD),
    }
}

fn recode_by_frequency(
    mut column: ArrayViewMut1<f64>,
    code: impl Fn(f64, f64) -> f64,
) -> VariantStats {
    let (sum, count) = column
        .iter()
        .filter(|g| !g.is_nan())
        .fold((0.0, 0usize), |(sum, count), &g| (sum + g, count + 1));
    if count == 0 {
        column.fill(0.0);
        return allele_stats(0.0);
    }
    let mean = sum / count as f64;
    let p = mean / 2.0;
    column.mapv_inplace(|g| if g.is_nan() { 0.0 } else { code(g, p) });
    allele_stats(mean)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GrmBuildConfig {
    pub method: GrmMethod,
    pub chunk_size: usize,
    pub additive: bool,
    pub dominance: bool,
    /// Write Z·Zᵀ without dividing by trace/n.
    pub raw_output: bool,
    /// Restrict to variants on this chromosome.
    pub chromosome: Option<String>,
    /// Also write the coded genotypes as an f64 payload next to each GRM.
    pub save_encoded: bool,
}

impl Default for GrmBuildConfig {
    fn default() -> Self {
        Self {
            method: GrmMethod::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            additive: true,
            dominance: false,
            raw_output: false,
            chromosome: None,
            save_encoded: false,
        }
    }
}

/// Progress hooks for GRM accumulation.
pub trait GrmProgressObserver {
    fn on_start(&mut self, kind: GrmKind, total_variants: usize) {
        let _ = (kind, total_variants);
    }
    fn on_advance(&mut self, kind: GrmKind, processed_variants: usize) {
        let _ = (kind, processed_variants);
    }
    fn on_finish(&mut self, kind: GrmKind) {
        let _ = kind;
    }
    fn info(&mut self, message: &str) {
        let _ = message;
    }
}

#[derive(Default)]
pub struct NoopGrmProgress;

impl GrmProgressObserver for NoopGrmProgress {}

/// An accumulated relationship matrix before normalization.
#[derive(Clone, Debug)]
pub struct GrmAccumulation {
    pub kind: GrmKind,
    /// Z·Zᵀ over the polymorphic variants.
    pub matrix: Array2<f64>,
    /// trace(Z·Zᵀ) / n.
    pub denominator: f64,
    pub variants_used: usize,
    pub variants_monomorphic: usize,
    /// Coded genotypes (samples x variants), kept only when requested.
    pub encoded: Option<Array2<f64>>,
}

impl GrmAccumulation {
    /// Z·Zᵀ divided by its trace/n.
    pub fn normalized(&self) -> Array2<f64> {
        if self.denominator > 0.0 {
            &self.matrix / self.denominator
        } else {
            self.matrix.clone()
        }
    }
}

pub struct GrmBuilder<'a> {
    dataset: &'a PlinkDataset,
    config: GrmBuildConfig,
    variants: Vec<usize>,
}

impl<'a> GrmBuilder<'a> {
    pub fn new(dataset: &'a PlinkDataset, config: GrmBuildConfig) -> Result<Self> {
        if config.chunk_size == 0 {
            return Err(GremlError::programmer("GRM chunk size must be positive"));
        }
        let variants: Vec<usize> = dataset
            .variants()
            .iter()
            .enumerate()
            .filter(|(_, v)| {
                config
                    .chromosome
                    .as_deref()
                    .is_none_or(|chr| v.chromosome == chr)
            })
            .map(|(idx, _)| idx)
            .collect();
        if variants.is_empty() {
            return Err(GremlError::value(
                match &config.chromosome {
                    Some(chr) => format!("no variants on chromosome {chr}"),
                    None => "no variants in .bim".to_string(),
                },
                Diagnostic::file(dataset.prefix()),
            ));
        }
        Ok(Self {
            dataset,
            config,
            variants,
        })
    }

    pub fn n_variants(&self) -> usize {
        self.variants.len()
    }

    pub fn config(&self) -> &GrmBuildConfig {
        &self.config
    }

    pub fn accumulate(
        &self,
        kind: GrmKind,
        observer: &mut dyn GrmProgressObserver,
    ) -> Result<GrmAccumulation> {
        let n = self.dataset.n_samples();
        let mut matrix = Array2::<f64>::zeros((n, n));
        let mut encoded = self
            .config
            .save_encoded
            .then(|| Array2::<f64>::zeros((n, self.variants.len())));
        let mut variants_monomorphic = 0;
        let mut processed = 0;

        observer.on_start(kind, self.variants.len());
        for chunk in self.variants.chunks(self.config.chunk_size) {
            let mut block = self.dataset.decode_block(chunk, None)?;
            let method = self.config.method;
            let stats: Vec<VariantStats> = block
                .axis_iter_mut(Axis(1))
                .into_par_iter()
                .map(|column| method.code(kind, column))
                .collect();
            variants_monomorphic += stats.iter().filter(|s| s.is_monomorphic).count();

            let block = block.view();
            matrix
                .axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .for_each(|(i, mut row)| {
                    row.scaled_add(1.0, &block.dot(&block.row(i)));
                });

            if let Some(encoded) = encoded.as_mut() {
                encoded
                    .slice_mut(s![.., processed..processed + chunk.len()])
                    .assign(&block);
            }
            processed += chunk.len();
            observer.on_advance(kind, processed);
        }
        observer.on_finish(kind);

        let denominator = trace_denominator(matrix.view());
        Ok(GrmAccumulation {
            kind,
            matrix,
            denominator,
            variants_used: self.variants.len() - variants_monomorphic,
            variants_monomorphic,
            encoded,
        })
    }

    /// Builds every requested kind and writes `{out}.add` / `{out}.dom`, or
    /// `{out}` when a single kind is requested. Returns the written prefixes.
    pub fn write(
        &self,
        out: &Path,
        observer: &mut dyn GrmProgressObserver,
    ) -> Result<Vec<(GrmKind, PathBuf)>> {
        let mut kinds = Vec::new();
        if self.config.additive {
            kinds.push(GrmKind::Additive);
        }
        if self.config.dominance {
            kinds.push(GrmKind::Dominance);
        }
        if kinds.is_empty() {
            kinds.push(GrmKind::Additive);
        }

        let ids: Vec<(String, String)> = self
            .dataset
            .samples()
            .iter()
            .map(|s| (s.family_id.clone(), s.individual_id.clone()))
            .collect();

        let single = kinds.len() == 1;
        let mut written = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let prefix = if single {
                out.to_path_buf()
            } else {
                let tag = if kind == GrmKind::Dominance { "dom" } else { "add" };
                let mut raw = out.as_os_str().to_owned();
                raw.push(format!(".{tag}"));
                PathBuf::from(raw)
            };

            let accumulation = self.accumulate(kind, observer)?;
            observer.info(&format!(
                "{kind:?} GRM: {} variants used, {} monomorphic skipped, trace/n {:.6}",
                accumulation.variants_used,
                accumulation.variants_monomorphic,
                accumulation.denominator
            ));
            let matrix = if self.config.raw_output {
                accumulation.matrix.clone()
            } else {
                accumulation.normalized()
            };
            write_grm(&prefix, matrix.view(), &ids)?;
            if let Some(encoded) = &accumulation.encoded {
                let mut raw = prefix.as_os_str().to_owned();
                raw.push(".enc.bin");
                write_payload(Path::new(&raw), encoded.view())?;
            }
            written.push((kind, prefix));
        }
        Ok(written)
    }
}

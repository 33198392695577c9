//! Per-variant coding policies applied in place to a decoded dosage column.

use ndarray::{ArrayView1, ArrayViewMut1};
use serde::{Deserialize, Serialize};

/// Columns whose standard deviation falls below this are treated as monomorphic.
pub const MONOMORPHIC_THRESHOLD: f64 = 1e-10;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariantStats {
    pub mean: f64,
    pub stddev: f64,
    pub is_monomorphic: bool,
}

impl VariantStats {
    fn monomorphic(mean: f64) -> Self {
        Self {
            mean,
            stddev: 0.0,
            is_monomorphic: true,
        }
    }

    fn new(mean: f64, stddev: f64) -> Self {
        Self {
            mean,
            stddev,
            is_monomorphic: !(stddev >= MONOMORPHIC_THRESHOLD),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CodingPolicy {
    /// Sample mean and sample standard deviation.
    #[default]
    Standardize,
    /// Mean imputation only.
    Raw,
    /// Centre by 2p, scale by sqrt(2p(1-p)).
    HardyWeinberg,
    /// Homozygous-A1 recoded to 0, then standardized.
    DominantStandardize,
    /// 0 -> 0, 1 -> 2p, 2 -> 4p - 2, centred by 2p^2 and scaled by 2p(1-p).
    OrthogonalDominance,
}

impl CodingPolicy {
    /// Codes `column` in place. Missing entries (NaN) are mean-imputed first;
    /// monomorphic columns keep their imputed raw values.
    pub fn apply(self, mut column: ArrayViewMut1<f64>) -> VariantStats {
        match self {
            Self::Standardize => {
                let stats = impute_and_describe(column.view_mut());
                scale(column, stats);
                stats
            }
            Self::Raw => impute_and_describe(column.view_mut()),
            Self::HardyWeinberg => {
                let Some(mean) = observed_mean(column.view()) else {
                    column.fill(0.0);
                    return VariantStats::monomorphic(0.0);
                };
                fill_missing(column.view_mut(), mean);
                let stats = VariantStats::new(mean, (mean * (1.0 - mean / 2.0)).max(0.0).sqrt());
                scale(column, stats);
                stats
            }
            Self::DominantStandardize => {
                column.mapv_inplace(|g| if g == 2.0 { 0.0 } else { g });
                let stats = impute_and_describe(column.view_mut());
                scale(column, stats);
                stats
            }
            Self::OrthogonalDominance => {
                let Some(dosage_mean) = observed_mean(column.view()) else {
                    column.fill(0.0);
                    return VariantStats::monomorphic(0.0);
                };
                let p = dosage_mean / 2.0;
                let mean = 2.0 * p * p;
                column.mapv_inplace(|g| dominance_code(g, p).unwrap_or(mean));
                let stats = VariantStats::new(mean, 2.0 * p * (1.0 - p));
                scale(column, stats);
                stats
            }
        }
    }
}

/// Dominance coding of a dosage given the A1 frequency; `None` for missing.
pub fn dominance_code(dosage: f64, p: f64) -> Option<f64> {
    if dosage.is_nan() {
        None
    } else if dosage == 1.0 {
        Some(2.0 * p)
    } else if dosage == 2.0 {
        Some(4.0 * p - 2.0)
    } else {
        Some(0.0)
    }
}

fn observed_mean(column: ArrayView1<f64>) -> Option<f64> {
    let (sum, count) = column
        .iter()
        .filter(|v| !v.is_nan())
        .fold((0.0, 0usize), |(sum, count), &v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

fn fill_missing(mut column: ArrayViewMut1<f64>, value: f64) {
    column.mapv_inplace(|v| if v.is_nan() { value } else { v });
}

fn impute_and_describe(mut column: ArrayViewMut1<f64>) -> VariantStats {
    let Some(mean) = observed_mean(column.view()) else {
        column.fill(0.0);
        return VariantStats::monomorphic(0.0);
    };
    fill_missing(column.view_mut(), mean);
    let n = column.len();
    if n < 2 {
        return VariantStats::monomorphic(mean);
    }
    let ss: f64 = column.iter().map(|v| (v - mean).powi(2)).sum();
    VariantStats::new(mean, (ss / (n - 1) as f64).sqrt())
}

fn scale(mut column: ArrayViewMut1<f64>, stats: VariantStats) {
    if stats.is_monomorphic {
        return;
    }
    column.mapv_inplace(|v| (v - stats.mean) / stats.stddev);
}

//! Rank-based inverse-normal transforms of the phenotype.

use ndarray::{Array1, Array2, ArrayView2, ArrayViewMut1};
use ndarray_linalg::Solve;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::shared::error::{GremlError, Result};

pub const DEFAULT_BLOM_OFFSET: f64 = 0.5;

const QUANTILE_CLAMP: f64 = 1e-10;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransformKind {
    #[default]
    None,
    /// Direct inverse-normal transform of y.
    Dint,
    /// Inverse-normal transform of the residuals of y on X.
    Iint,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PhenotypeTransformer {
    offset: f64,
}

impl Default for PhenotypeTransformer {
    fn default() -> Self {
        Self::new(DEFAULT_BLOM_OFFSET)
    }
}

impl PhenotypeTransformer {
    pub fn new(offset: f64) -> Self {
        Self { offset }
    }

    /// Replaces `y` with Φ⁻¹((r - k) / (n - 2k + 1)) of its average ranks.
    pub fn apply_dint(&self, mut y: ArrayViewMut1<f64>) -> Result<()> {
        let normal = Normal::new(0.0, 1.0)
            .map_err(|e| GremlError::programmer(format!("standard normal: {e}")))?;
        let ranks = average_ranks(&y.to_vec());
        let n = y.len() as f64;
        let denominator = n - 2.0 * self.offset + 1.0;
        for (value, rank) in y.iter_mut().zip(ranks) {
            let quantile =
                ((rank - self.offset) / denominator).clamp(QUANTILE_CLAMP, 1.0 - QUANTILE_CLAMP);
            *value = normal.inverse_cdf(quantile);
        }
        Ok(())
    }

    /// Regresses `y` on `x` by ordinary least squares and replaces `y` with the
    /// transformed residuals. Callers reset X to an intercept afterwards.
    pub fn apply_iint(&self, mut y: ArrayViewMut1<f64>, x: ArrayView2<f64>) -> Result<()> {
        let mut residuals = ols_residuals(y.view().to_owned(), x)?;
        self.apply_dint(residuals.view_mut())?;
        y.assign(&residuals);
        Ok(())
    }
}

/// 1-based ranks with ties sharing their average rank.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let n = values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; n];
    let mut start = 0;
    while start < n {
        let mut end = start;
        while end < n && values[order[end]] == values[order[start]] {
            end += 1;
        }
        let rank = (start + 1 + end) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = rank;
        }
        start = end;
    }
    ranks
}

fn ols_residuals(y: Array1<f64>, x: ArrayView2<f64>) -> Result<Array1<f64>> {
    let xtx: Array2<f64> = x.t().dot(&x);
    let xty = x.t().dot(&y);
    let beta = xtx
        .solve(&xty)
        .map_err(|e| GremlError::linalg("covariate cross-product is singular", e))?;
    Ok(&y - &x.dot(&beta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn ties_receive_their_average_rank() {
        assert_eq!(
            average_ranks(&[3.0, 1.0, 3.0, 2.0, 3.0]),
            vec![4.0, 1.0, 4.0, 2.0, 4.0]
        );
    }

    #[test]
    fn dint_is_symmetric_and_rank_preserving() {
        let mut y = array![10.0, -3.0, 7.5, 0.0, 100.0];
        PhenotypeTransformer::default().apply_dint(y.view_mut()).unwrap();
        assert_abs_diff_eq!(y.sum(), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(y[3], -y[0], epsilon = 1e-9);
        assert!(y[1] < y[3] && y[3] < y[2] && y[2] < y[0] && y[0] < y[4]);
        // Rank 3 of 5 sits on the median.
        assert_abs_diff_eq!(y[2], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn dint_is_idempotent() {
        let mut once = array![2.3, -1.1, 0.4, 8.0, 8.0, -5.5, 3.3];
        let transformer = PhenotypeTransformer::default();
        transformer.apply_dint(once.view_mut()).unwrap();
        let mut twice = once.clone();
        transformer.apply_dint(twice.view_mut()).unwrap();
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn iint_removes_the_covariate_signal() {
        let z = array![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut x = Array2::ones((6, 2));
        x.column_mut(1).assign(&z);
        let noise = array![0.3, -0.2, 0.1, -0.4, 0.25, -0.05];
        let mut y = &z * 5.0 + &noise;

        PhenotypeTransformer::default()
            .apply_iint(y.view_mut(), x.view())
            .unwrap();

        let mut expected = ols_residuals(noise.clone(), x.view()).unwrap();
        PhenotypeTransformer::default()
            .apply_dint(expected.view_mut())
            .unwrap();
        for (a, b) in y.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
    }
}

//! Post-fit summaries: information criteria, variance standard errors and
//! heritabilities with delta-method standard errors.

use ndarray::Array1;

use crate::model::{FreqModel, FreqState};
use crate::shared::error::Result;
use crate::state::OptimizerState;

/// Number of estimated parameters: variance components plus fixed columns.
pub fn n_parameters(model: &FreqModel) -> usize {
    model.n_components() + model.n_fixed()
}

pub fn compute_aic(model: &FreqModel, loglike: f64) -> f64 {
    -2.0 * loglike + 2.0 * n_parameters(model) as f64
}

pub fn compute_bic(model: &FreqModel, loglike: f64) -> f64 {
    -2.0 * loglike + n_parameters(model) as f64 * (model.n() as f64).ln()
}

/// SE(σᵢ²) = √(−(H⁻¹)ᵢᵢ); NaN where that diagonal is positive.
pub fn compute_variance_se(state: &mut FreqState, opt: &OptimizerState) -> Result<()> {
    let se: Array1<f64> = opt
        .hess_inv
        .diag()
        .iter()
        .map(|&h| if -h >= 0.0 { (-h).sqrt() } else { f64::NAN })
        .collect();
    state.set_sigma_se(se.view())
}

/// h²_g = σ_g² / Σσ² with its delta-method standard error. Leaves NaN in
/// place when the variances do not sum to a positive total.
pub fn compute_heritability(model: &FreqModel, state: &mut FreqState, opt: &OptimizerState) {
    let sigma = state.sigma();
    let total = sigma.sum();
    let offset = model.genetic_offset();
    let neg_inv = opt.hess_inv.mapv(|h| -h);

    for (i, genetic) in state.genetic.iter_mut().enumerate() {
        genetic.heritability = f64::NAN;
        genetic.heritability_se = f64::NAN;
        if total <= 0.0 || !total.is_finite() {
            continue;
        }
        let g = offset + i;
        let sigma_g = sigma[g];
        let gradient = Array1::from_shape_fn(sigma.len(), |j| {
            if j == g {
                (total - sigma_g) / (total * total)
            } else {
                -sigma_g / (total * total)
            }
        });
        let quad = gradient.dot(&neg_inv.dot(&gradient));
        genetic.heritability = sigma_g / total;
        genetic.heritability_se = quad.max(0.0).sqrt();
    }
}

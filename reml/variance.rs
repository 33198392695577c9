//! V assembly, Cholesky inversion, the REML projection and the log-likelihood.

use ndarray::{Array2, Axis, Zip};
use ndarray_linalg::{FactorizeC, InverseC, UPLO};

use crate::model::{FreqModel, FreqState};
use crate::shared::error::{GremlError, Result};
use crate::state::OptimizerState;

/// `v = σ_e² I + Σ σ_r² K_r + Σ σ_g² K_g`, accumulated in that order.
pub fn compute_v(model: &FreqModel, state: &FreqState, v: &mut Array2<f64>) {
    v.fill(0.0);
    v.diag_mut().fill(state.residual.variance);
    for (effect, effect_state) in model.random.iter().zip(&state.random) {
        v.scaled_add(effect_state.variance, &effect.covariance);
    }
    for (effect, effect_state) in model.genetic.iter().zip(&state.genetic) {
        v.scaled_add(effect_state.variance, &effect.covariance);
    }
}

/// Replaces `v` with its inverse and returns log|V|.
pub fn v_inv_logdet(v: &mut Array2<f64>) -> Result<f64> {
    let factor = v
        .factorizec(UPLO::Lower)
        .map_err(|e| GremlError::linalg("V matrix is not positive definite", e))?;
    let logdet = 2.0 * factor.factor.diag().iter().map(|d| d.ln()).sum::<f64>();
    let inverse = factor
        .invc()
        .map_err(|e| GremlError::linalg("failed to invert V from its Cholesky factor", e))?;
    v.assign(&inverse);
    symmetrize_from_lower(v);
    Ok(logdet)
}

/// Copies the strict lower triangle onto the upper one.
pub fn symmetrize_from_lower(m: &mut Array2<f64>) {
    let n = m.nrows();
    for i in 0..n {
        for j in 0..i {
            m[[j, i]] = m[[i, j]];
        }
    }
}

/// With `opt.v` holding V⁻¹: `P = V⁻¹ - V⁻¹X (XᵀV⁻¹X)⁻¹ XᵀV⁻¹` and `Py`.
pub fn compute_proj(model: &FreqModel, opt: &mut OptimizerState) -> Result<()> {
    let x = model.x();
    let vinv_x = opt.v.dot(x);
    opt.tx_vinv_x = x.t().dot(&vinv_x);

    let factor = opt
        .tx_vinv_x
        .factorizec(UPLO::Lower)
        .map_err(|e| GremlError::linalg("X'V^-1X is not positive definite", e))?;
    opt.logdet_tx_vinv_x = 2.0 * factor.factor.diag().iter().map(|d| d.ln()).sum::<f64>();
    let xvx_inv = factor
        .invc()
        .map_err(|e| GremlError::linalg("failed to invert X'V^-1X", e))?;

    let w = xvx_inv.dot(&vinv_x.t());
    opt.proj.assign(&opt.v);
    opt.proj -= &vinv_x.dot(&w);
    opt.proj_y = opt.proj.dot(model.y());
    Ok(())
}

/// Column i of `opt.dvpy` becomes K_i P y.
pub fn compute_dvpy(model: &FreqModel, opt: &mut OptimizerState) {
    for (mut column, cov) in opt.dvpy.axis_iter_mut(Axis(1)).zip(model.covariances()) {
        column.assign(&cov.apply(opt.proj_y.view()));
    }
}

/// `logL = -½ (log|V| + log|XᵀV⁻¹X| + yᵀPy)`.
pub fn compute_loglike(model: &FreqModel, opt: &OptimizerState) -> f64 {
    let ypy = model.y().dot(&opt.proj_y);
    -0.5 * (opt.logdet_v + opt.logdet_tx_vinv_x + ypy)
}

/// Recomputes V, V⁻¹, P, Py and the log-likelihood from the current variances.
pub fn refresh(model: &FreqModel, state: &FreqState, opt: &mut OptimizerState) -> Result<f64> {
    compute_v(model, state, &mut opt.v);
    opt.logdet_v = v_inv_logdet(&mut opt.v)?;
    compute_proj(model, opt)?;
    Ok(compute_loglike(model, opt))
}

/// Largest absolute asymmetry of a square matrix.
pub fn asymmetry(m: &Array2<f64>) -> f64 {
    let mut worst = 0.0f64;
    Zip::from(m).and(&m.t()).for_each(|a, b| worst = worst.max((a - b).abs()));
    worst
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::grm::GrmKind;
    use crate::model::{FixedEffect, GeneticEffect};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array1, array};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn random_psd(n: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let z = Array2::from_shape_fn((n, 2 * n), |_| normal.sample(&mut rng));
        z.dot(&z.t()) / (2 * n) as f64
    }

    fn model_with(k: Array2<f64>, y: Array1<f64>) -> FreqModel {
        let n = y.len();
        let mut fixed = FixedEffect::intercept_only(n);
        let mut x = Array2::ones((n, 2));
        x.column_mut(1)
            .assign(&Array1::from_shape_fn(n, |i| i as f64 / n as f64));
        fixed.x = x;
        fixed.names.push("trend".into());
        fixed.levels.push(None);
        fixed.reference_levels.push(None);
        FreqModel::new(
            y,
            fixed,
            vec![],
            vec![GeneticEffect {
                name: "Additive".into(),
                kind: GrmKind::Additive,
                covariance: k,
            }],
        )
        .unwrap()
    }

    #[test]
    fn inverse_is_symmetric_and_exact() {
        let n = 30;
        let k = random_psd(n, 7);
        let mut v = &k * 0.7 + &(Array2::<f64>::eye(n) * 0.3);
        let original = v.clone();
        let logdet = v_inv_logdet(&mut v).unwrap();

        assert_eq!(asymmetry(&v), 0.0);
        let product = v.dot(&original);
        assert_abs_diff_eq!(product, Array2::<f64>::eye(n), epsilon = 1e-8);

        let factor = original.factorizec(UPLO::Lower).unwrap();
        let expected: f64 = factor.factor.diag().iter().map(|d| 2.0 * d.ln()).sum();
        assert_abs_diff_eq!(logdet, expected, epsilon = 1e-10);
    }

    #[test]
    fn indefinite_v_is_a_numerical_error() {
        let mut v = array![[1.0, 2.0], [2.0, 1.0]];
        let err = v_inv_logdet(&mut v).unwrap_err();
        assert!(matches!(err, GremlError::Numerical { .. }));
        assert!(err.to_string().contains("V matrix is not positive definite"));
    }

    #[test]
    fn projection_annihilates_fixed_effects() {
        let n = 20;
        let mut rng = StdRng::seed_from_u64(3);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let y = Array1::from_shape_fn(n, |_| normal.sample(&mut rng));
        let model = model_with(random_psd(n, 11), y);
        let mut state = FreqState::new(&model);
        state.set_sigma(array![0.5, 0.5].view()).unwrap();
        let mut opt = OptimizerState::new(&model);

        let loglike = refresh(&model, &state, &mut opt).unwrap();
        assert!(loglike.is_finite());

        // P X = 0 and P V P = P.
        let px = opt.proj.dot(model.x());
        assert_abs_diff_eq!(px, Array2::<f64>::zeros((n, 2)), epsilon = 1e-9);
        let mut v = Array2::zeros((n, n));
        compute_v(&model, &state, &mut v);
        let pvp = opt.proj.dot(&v).dot(&opt.proj);
        assert_abs_diff_eq!(pvp, opt.proj, epsilon = 1e-9);
        assert_abs_diff_eq!(opt.proj_y, opt.proj.dot(model.y()), epsilon = 1e-12);

        compute_dvpy(&model, &mut opt);
        assert_abs_diff_eq!(opt.dvpy.column(0), opt.proj_y.view(), epsilon = 1e-12);
        let kpy = model.genetic[0].covariance.dot(&opt.proj_y);
        assert_abs_diff_eq!(opt.dvpy.column(1), kpy.view(), epsilon = 1e-12);
    }

    #[test]
    fn residual_only_v_is_scaled_identity() {
        let model = FreqModel::new(
            array![1.0, 2.0, 4.0],
            FixedEffect::intercept_only(3),
            vec![],
            vec![],
        )
        .unwrap();
        let mut state = FreqState::new(&model);
        state.residual.variance = 2.0;
        let mut v = Array2::zeros((3, 3));
        compute_v(&model, &state, &mut v);
        assert_eq!(v, Array2::<f64>::eye(3) * 2.0);
    }
}

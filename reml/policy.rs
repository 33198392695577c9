//! Variance-component update policies.
//!
//! Every second-order variant shares one driver: score, information matrix,
//! pseudo-inverse and step. They differ only in how an information element
//! is formed.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, Array2, Axis};
use ndarray_linalg::SVD;
use serde::{Deserialize, Serialize};

use crate::model::{FreqModel, FreqState};
use crate::shared::error::{GremlError, Result};
use crate::state::OptimizerState;
use crate::variance::compute_dvpy;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdatePolicy {
    /// Expectation-maximization, used as a warm start.
    Em,
    /// Average information.
    #[default]
    Ai,
    /// Observed information.
    NewtonRaphson,
    /// Expected information.
    FisherScoring,
}

impl UpdatePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Em => "em",
            Self::Ai => "ai",
            Self::NewtonRaphson => "newton-raphson",
            Self::FisherScoring => "fisher-scoring",
        }
    }

    /// Proposes the next variance vector from the refreshed optimizer state.
    pub fn apply(
        self,
        model: &FreqModel,
        state: &FreqState,
        opt: &mut OptimizerState,
    ) -> Result<Array1<f64>> {
        match self {
            Self::Em => Ok(em_update(model, state, opt)),
            Self::Ai => second_order_step(model, state, opt, Information::Average),
            Self::NewtonRaphson => second_order_step(model, state, opt, Information::Observed),
            Self::FisherScoring => second_order_step(model, state, opt, Information::Expected),
        }
    }
}

impl fmt::Display for UpdatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdatePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "em" => Ok(Self::Em),
            "ai" => Ok(Self::Ai),
            "nr" | "newton-raphson" => Ok(Self::NewtonRaphson),
            "fisher" | "fisher-scoring" => Ok(Self::FisherScoring),
            other => Err(format!(
                "unknown update policy '{other}'; expected em, ai, newton-raphson or fisher-scoring"
            )),
        }
    }
}

/// σ_i ← (σ_i²·PyᵀK_iPy − σ_i²·tr(PK_i) + σ_i·n) / n, with σ_i the variance.
fn em_update(model: &FreqModel, state: &FreqState, opt: &mut OptimizerState) -> Array1<f64> {
    compute_dvpy(model, opt);
    let n = opt.n_individuals() as f64;
    let sigma = state.sigma();
    let mut proposed = Array1::zeros(sigma.len());
    for (i, cov) in model.covariances().enumerate() {
        let s = sigma[i];
        let py_k_py = opt.proj_y.dot(&opt.dvpy.column(i));
        let tr_pk = cov.trace_product(opt.proj.view());
        proposed[i] = (s * s * py_k_py - s * s * tr_pk + s * n) / n;
    }
    proposed
}

/// Quantities an information element may draw on.
struct InformationTerms<'a> {
    dvpy: &'a Array2<f64>,
    p_dvpy: Array2<f64>,
    /// K_i P for every component; empty unless the policy needs traces.
    kp: Vec<Array2<f64>>,
}

impl InformationTerms<'_> {
    /// (K_i P y)ᵀ P (K_j P y)
    fn quadratic(&self, i: usize, j: usize) -> f64 {
        self.dvpy.column(i).dot(&self.p_dvpy.column(j))
    }

    /// tr(P K_i P K_j) = tr(K_i P · K_j P)
    fn trace(&self, i: usize, j: usize) -> f64 {
        let (a, b) = (&self.kp[i], &self.kp[j]);
        a.iter().zip(b.t().iter()).map(|(x, y)| x * y).sum()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Information {
    Average,
    Observed,
    Expected,
}

impl Information {
    fn needs_traces(self) -> bool {
        !matches!(self, Self::Average)
    }

    fn element(self, terms: &InformationTerms<'_>, i: usize, j: usize) -> f64 {
        match self {
            Self::Average => -0.5 * terms.quadratic(i, j),
            Self::Observed => 0.5 * terms.trace(i, j) - terms.quadratic(i, j),
            Self::Expected => -0.5 * terms.trace(i, j),
        }
    }
}

fn second_order_step(
    model: &FreqModel,
    state: &FreqState,
    opt: &mut OptimizerState,
    information: Information,
) -> Result<Array1<f64>> {
    compute_dvpy(model, opt);
    let c = model.n_components();

    for (i, cov) in model.covariances().enumerate() {
        let tr_pk = cov.trace_product(opt.proj.view());
        let py_k_py = opt.proj_y.dot(&opt.dvpy.column(i));
        opt.first_grad[i] = -0.5 * (tr_pk - py_k_py);
    }

    let kp = if information.needs_traces() {
        model
            .covariances()
            .map(|cov| cov.left_multiply(opt.proj.view()))
            .collect()
    } else {
        Vec::new()
    };
    let terms = InformationTerms {
        dvpy: &opt.dvpy,
        p_dvpy: opt.proj.dot(&opt.dvpy),
        kp,
    };

    let mut hess = Array2::<f64>::zeros((c, c));
    for i in 0..c {
        for j in i..c {
            let value = information.element(&terms, i, j);
            hess[[i, j]] = value;
            hess[[j, i]] = value;
        }
    }

    opt.hess_inv = pseudo_inverse(&hess)?;
    let delta = -opt.hess_inv.dot(&opt.first_grad);
    Ok(state.sigma() + delta)
}

/// Moore-Penrose inverse through the SVD, discarding singular values below
/// `eps · c · s_max`.
pub fn pseudo_inverse(matrix: &Array2<f64>) -> Result<Array2<f64>> {
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(GremlError::numerical(
            "information matrix holds non-finite entries",
        ));
    }
    let (u, s, vt) = matrix
        .svd(true, true)
        .map_err(|e| GremlError::linalg("SVD of the information matrix failed", e))?;
    let (Some(u), Some(vt)) = (u, vt) else {
        return Err(GremlError::numerical(
            "SVD of the information matrix returned no singular vectors",
        ));
    };
    let s_max = s.iter().copied().fold(0.0f64, f64::max);
    if s_max <= 0.0 {
        return Err(GremlError::numerical("information matrix is zero"));
    }
    let cutoff = f64::EPSILON * matrix.nrows().max(matrix.ncols()) as f64 * s_max;
    let inv_s = s.mapv(|v| if v > cutoff { 1.0 / v } else { 0.0 });

    let k = s.len();
    let mut v_scaled = vt.t().slice(ndarray::s![.., ..k]).to_owned();
    for (mut column, &w) in v_scaled.axis_iter_mut(Axis(1)).zip(inv_s.iter()) {
        column *= w;
    }
    Ok(v_scaled.dot(&u.slice(ndarray::s![.., ..k]).t()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::grm::GrmKind;
    use crate::model::{FixedEffect, GeneticEffect};
    use crate::variance::refresh;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn toy(seed: u64) -> (FreqModel, FreqState, OptimizerState) {
        let n = 25;
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let z = Array2::from_shape_fn((n, 40), |_| normal.sample(&mut rng));
        let k = z.dot(&z.t()) / 40.0;
        let y = Array1::from_shape_fn(n, |_| normal.sample(&mut rng));
        let model = FreqModel::new(
            y,
            FixedEffect::intercept_only(n),
            vec![],
            vec![GeneticEffect {
                name: "Additive".into(),
                kind: GrmKind::Additive,
                covariance: k,
            }],
        )
        .unwrap();
        let mut state = FreqState::new(&model);
        state.set_sigma(array![0.6, 0.4].view()).unwrap();
        let mut opt = OptimizerState::new(&model);
        refresh(&model, &state, &mut opt).unwrap();
        (model, state, opt)
    }

    #[test]
    fn pseudo_inverse_inverts_regular_and_singular_matrices() {
        let a = array![[4.0, 1.0], [1.0, 3.0]];
        let inv = pseudo_inverse(&a).unwrap();
        assert_abs_diff_eq!(a.dot(&inv), Array2::<f64>::eye(2), epsilon = 1e-12);

        let singular = array![[1.0, 1.0], [1.0, 1.0]];
        let pinv = pseudo_inverse(&singular).unwrap();
        assert_abs_diff_eq!(pinv, array![[0.25, 0.25], [0.25, 0.25]], epsilon = 1e-12);

        assert!(pseudo_inverse(&array![[f64::NAN]]).is_err());
    }

    #[test]
    fn ai_step_matches_closed_form() {
        let (model, state, mut opt) = toy(5);
        let proposed = UpdatePolicy::Ai.apply(&model, &state, &mut opt).unwrap();

        let p = opt.proj.clone();
        let py = opt.proj_y.clone();
        let k = &model.genetic[0].covariance;
        let kpy = k.dot(&py);
        let score = array![
            -0.5 * (p.diag().sum() - py.dot(&py)),
            -0.5 * (k.dot(&p).diag().sum() - py.dot(&kpy)),
        ];
        assert_abs_diff_eq!(opt.first_grad, score, epsilon = 1e-10);

        let d = ndarray::stack![Axis(1), py, kpy];
        let ai = d.t().dot(&p).dot(&d) * 0.5;
        let step = pseudo_inverse(&ai).unwrap().dot(&score);
        assert_abs_diff_eq!(proposed, state.sigma() + step, epsilon = 1e-8);
        // Stored inverse carries the negative sign.
        assert_abs_diff_eq!(opt.hess_inv, -pseudo_inverse(&ai).unwrap(), epsilon = 1e-8);
    }

    #[test]
    fn em_update_matches_formula() {
        let (model, state, mut opt) = toy(9);
        let proposed = UpdatePolicy::Em.apply(&model, &state, &mut opt).unwrap();
        let n = model.n() as f64;
        let p = &opt.proj;
        let py = &opt.proj_y;
        let s = 0.6;
        let expected_e = (s * s * py.dot(py) - s * s * p.diag().sum() + s * n) / n;
        assert_abs_diff_eq!(proposed[0], expected_e, epsilon = 1e-12);
    }

    #[test]
    fn fisher_and_newton_use_trace_terms() {
        let (model, state, mut opt) = toy(13);
        UpdatePolicy::FisherScoring
            .apply(&model, &state, &mut opt)
            .unwrap();
        let p = opt.proj.clone();
        let expected = -0.5 * p.dot(&p).diag().sum();
        let fisher = pseudo_inverse(&opt.hess_inv).unwrap();
        assert_abs_diff_eq!(fisher[[0, 0]], expected, epsilon = 1e-8);

        let proposed = UpdatePolicy::NewtonRaphson
            .apply(&model, &state, &mut opt)
            .unwrap();
        assert!(proposed.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn policies_parse_from_cli_names() {
        assert_eq!("AI".parse::<UpdatePolicy>().unwrap(), UpdatePolicy::Ai);
        assert_eq!("nr".parse::<UpdatePolicy>().unwrap(), UpdatePolicy::NewtonRaphson);
        assert!("bfgs".parse::<UpdatePolicy>().is_err());
    }
}

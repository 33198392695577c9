use ndarray::{Array1, Array2};

use crate::model::FreqModel;

/// Per-fit scratch, allocated once at final sizes.
#[derive(Clone, Debug)]
pub struct OptimizerState {
    /// V before [`crate::variance::v_inv_logdet`], V⁻¹ after it.
    pub v: Array2<f64>,
    pub logdet_v: f64,
    pub proj: Array2<f64>,
    pub proj_y: Array1<f64>,
    pub tx_vinv_x: Array2<f64>,
    pub logdet_tx_vinv_x: f64,
    /// Column i holds K_i P y, with K_0 = I.
    pub dvpy: Array2<f64>,
    pub first_grad: Array1<f64>,
    /// Pseudo-inverse of the information matrix, in the sign convention where
    /// `-diag(hess_inv)` are sampling variances.
    pub hess_inv: Array2<f64>,
}

impl OptimizerState {
    pub fn new(model: &FreqModel) -> Self {
        let n = model.n();
        let p = model.n_fixed();
        let c = model.n_components();
        Self {
            v: Array2::zeros((n, n)),
            logdet_v: 0.0,
            proj: Array2::zeros((n, n)),
            proj_y: Array1::zeros(n),
            tx_vinv_x: Array2::zeros((p, p)),
            logdet_tx_vinv_x: 0.0,
            dvpy: Array2::zeros((n, c)),
            first_grad: Array1::zeros(c),
            hess_inv: Array2::zeros((c, c)),
        }
    }

    pub fn n_individuals(&self) -> usize {
        self.proj_y.len()
    }
}

//! The frozen inputs of a fit ([`FreqModel`]) and its mutable outputs ([`FreqState`]).
//!
//! Variance components are always ordered `[residual, random..., genetic...]`.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::data::grm::GrmKind;
use crate::shared::error::{GremlError, Result};

/// Fixed-effect design: X plus per-column metadata.
#[derive(Clone, Debug)]
pub struct FixedEffect {
    pub names: Vec<String>,
    /// Level label of categorical indicator columns, `None` elsewhere.
    pub levels: Vec<Option<String>>,
    /// Dropped reference level of the variable behind each indicator column.
    pub reference_levels: Vec<Option<String>>,
    pub x: Array2<f64>,
}

impl FixedEffect {
    pub fn intercept_only(n: usize) -> Self {
        Self {
            names: vec![INTERCEPT.to_string()],
            levels: vec![None],
            reference_levels: vec![None],
            x: Array2::ones((n, 1)),
        }
    }

    pub fn n_columns(&self) -> usize {
        self.x.ncols()
    }

    /// `{variable}_{reference}` for each categorical variable, in column order.
    pub fn reference_terms(&self) -> Vec<String> {
        let mut terms: Vec<String> = Vec::new();
        for ((name, level), reference) in self
            .names
            .iter()
            .zip(&self.levels)
            .zip(&self.reference_levels)
        {
            let (Some(level), Some(reference)) = (level, reference) else {
                continue;
            };
            let Some(variable) = name.strip_suffix(level.as_str()).and_then(|s| s.strip_suffix('_'))
            else {
                continue;
            };
            let term = format!("{variable}_{reference}");
            if !terms.contains(&term) {
                terms.push(term);
            }
        }
        terms
    }
}

pub const INTERCEPT: &str = "Intercept";

/// A non-genetic random effect with its own covariance structure.
#[derive(Clone, Debug)]
pub struct RandomEffect {
    pub name: String,
    pub levels: Vec<String>,
    pub covariance: Array2<f64>,
}

/// A GRM-backed genetic effect.
#[derive(Clone, Debug)]
pub struct GeneticEffect {
    pub name: String,
    pub kind: GrmKind,
    pub covariance: Array2<f64>,
}

/// The covariance matrix behind one variance component.
#[derive(Clone, Copy, Debug)]
pub enum Covariance<'a> {
    Identity,
    Matrix(ArrayView2<'a, f64>),
}

impl Covariance<'_> {
    /// K v.
    pub fn apply(&self, v: ArrayView1<f64>) -> Array1<f64> {
        match self {
            Self::Identity => v.to_owned(),
            Self::Matrix(k) => k.dot(&v),
        }
    }

    /// tr(K P) for symmetric K and P, computed as the sum of K ∘ P.
    pub fn trace_product(&self, p: ArrayView2<f64>) -> f64 {
        match self {
            Self::Identity => p.diag().sum(),
            Self::Matrix(k) => k.iter().zip(p.iter()).map(|(a, b)| a * b).sum(),
        }
    }

    /// K P as a dense matrix.
    pub fn left_multiply(&self, p: ArrayView2<f64>) -> Array2<f64> {
        match self {
            Self::Identity => p.to_owned(),
            Self::Matrix(k) => k.dot(&p),
        }
    }
}

/// Everything the optimizer reads; immutable once built.
#[derive(Clone, Debug)]
pub struct FreqModel {
    y: Array1<f64>,
    var_y: f64,
    pub fixed: FixedEffect,
    pub random: Vec<RandomEffect>,
    pub genetic: Vec<GeneticEffect>,
}

impl FreqModel {
    pub fn new(
        y: Array1<f64>,
        fixed: FixedEffect,
        random: Vec<RandomEffect>,
        genetic: Vec<GeneticEffect>,
    ) -> Result<Self> {
        let n = y.len();
        if n < 2 {
            return Err(GremlError::programmer(format!(
                "a model needs at least two samples, got {n}"
            )));
        }
        if let Some(idx) = y.iter().position(|v| !v.is_finite()) {
            return Err(GremlError::programmer(format!(
                "phenotype entry {idx} is not finite"
            )));
        }
        if fixed.x.nrows() != n || fixed.names.len() != fixed.x.ncols() {
            return Err(GremlError::programmer(format!(
                "design matrix is {:?} with {} names for {n} samples",
                fixed.x.dim(),
                fixed.names.len()
            )));
        }
        if n < fixed.x.ncols() + 1 {
            return Err(GremlError::programmer(format!(
                "{n} samples cannot identify {} fixed effects",
                fixed.x.ncols()
            )));
        }
        let shapes = random
            .iter()
            .map(|r| (&r.name, r.covariance.dim()))
            .chain(genetic.iter().map(|g| (&g.name, g.covariance.dim())));
        for (name, dim) in shapes {
            if dim != (n, n) {
                return Err(GremlError::programmer(format!(
                    "covariance '{name}' is {dim:?}, expected ({n}, {n})"
                )));
            }
        }

        let mean = y.sum() / n as f64;
        let var_y = y.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        Ok(Self {
            y,
            var_y,
            fixed,
            random,
            genetic,
        })
    }

    pub fn y(&self) -> &Array1<f64> {
        &self.y
    }

    pub fn var_y(&self) -> f64 {
        self.var_y
    }

    pub fn x(&self) -> &Array2<f64> {
        &self.fixed.x
    }

    pub fn n(&self) -> usize {
        self.y.len()
    }

    pub fn n_fixed(&self) -> usize {
        self.fixed.x.ncols()
    }

    pub fn n_components(&self) -> usize {
        1 + self.random.len() + self.genetic.len()
    }

    /// Index of the first genetic component in the layered order.
    pub fn genetic_offset(&self) -> usize {
        1 + self.random.len()
    }

    pub fn covariance(&self, component: usize) -> Option<Covariance<'_>> {
        if component == 0 {
            return Some(Covariance::Identity);
        }
        let r = component - 1;
        if let Some(effect) = self.random.get(r) {
            return Some(Covariance::Matrix(effect.covariance.view()));
        }
        self.genetic
            .get(r - self.random.len())
            .map(|effect| Covariance::Matrix(effect.covariance.view()))
    }

    pub fn covariances(&self) -> impl Iterator<Item = Covariance<'_>> + '_ {
        std::iter::once(Covariance::Identity)
            .chain(
                self.random
                    .iter()
                    .map(|r| Covariance::Matrix(r.covariance.view())),
            )
            .chain(
                self.genetic
                    .iter()
                    .map(|g| Covariance::Matrix(g.covariance.view())),
            )
    }

    /// Component labels in layered order.
    pub fn component_names(&self) -> Vec<String> {
        std::iter::once("e".to_string())
            .chain(self.random.iter().map(|r| r.name.clone()))
            .chain(self.genetic.iter().map(|g| g.name.clone()))
            .collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FixedState {
    pub coeff: Array1<f64>,
    pub se: Array1<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResidualState {
    pub variance: f64,
    pub variance_se: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RandomState {
    pub variance: f64,
    pub variance_se: f64,
    pub blup: Array1<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneticState {
    pub variance: f64,
    pub variance_se: f64,
    pub heritability: f64,
    pub heritability_se: f64,
    pub ebv: Array1<f64>,
}

/// Outputs mutated by the estimator and post-processors.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FreqState {
    pub fixed: FixedState,
    pub residual: ResidualState,
    pub random: Vec<RandomState>,
    pub genetic: Vec<GeneticState>,
    pub loglike: f64,
    pub converged: bool,
    pub iterations: usize,
}

impl FreqState {
    pub fn new(model: &FreqModel) -> Self {
        let n = model.n();
        let p = model.n_fixed();
        Self {
            fixed: FixedState {
                coeff: Array1::zeros(p),
                se: Array1::zeros(p),
            },
            residual: ResidualState::default(),
            random: (0..model.random.len())
                .map(|_| RandomState {
                    blup: Array1::zeros(n),
                    ..RandomState::default()
                })
                .collect(),
            genetic: (0..model.genetic.len())
                .map(|_| GeneticState {
                    ebv: Array1::zeros(n),
                    ..GeneticState::default()
                })
                .collect(),
            loglike: f64::NAN,
            converged: false,
            iterations: 0,
        }
    }

    pub fn n_components(&self) -> usize {
        1 + self.random.len() + self.genetic.len()
    }

    /// Current variance vector in layered order.
    pub fn sigma(&self) -> Array1<f64> {
        std::iter::once(self.residual.variance)
            .chain(self.random.iter().map(|r| r.variance))
            .chain(self.genetic.iter().map(|g| g.variance))
            .collect()
    }

    pub fn set_sigma(&mut self, sigma: ArrayView1<f64>) -> Result<()> {
        if sigma.len() != self.n_components() {
            return Err(GremlError::programmer(format!(
                "{} variances for {} components",
                sigma.len(),
                self.n_components()
            )));
        }
        let mut values = sigma.iter().copied();
        let mut next = || values.next().unwrap_or(f64::NAN);
        self.residual.variance = next();
        for r in &mut self.random {
            r.variance = next();
        }
        for g in &mut self.genetic {
            g.variance = next();
        }
        Ok(())
    }

    /// Writes standard errors in layered order.
    pub fn set_sigma_se(&mut self, se: ArrayView1<f64>) -> Result<()> {
        if se.len() != self.n_components() {
            return Err(GremlError::programmer(format!(
                "{} standard errors for {} components",
                se.len(),
                self.n_components()
            )));
        }
        self.residual.variance_se = se[0];
        for (i, r) in self.random.iter_mut().enumerate() {
            r.variance_se = se[1 + i];
        }
        let offset = 1 + self.random.len();
        for (i, g) in self.genetic.iter_mut().enumerate() {
            g.variance_se = se[offset + i];
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn toy_model() -> FreqModel {
        let k = Array2::eye(4) * 2.0;
        FreqModel::new(
            array![1.0, 2.0, 3.0, 4.0],
            FixedEffect::intercept_only(4),
            vec![RandomEffect {
                name: "pen".into(),
                levels: vec![],
                covariance: Array2::ones((4, 4)),
            }],
            vec![GeneticEffect {
                name: "Additive".into(),
                kind: GrmKind::Additive,
                covariance: k,
            }],
        )
        .unwrap()
    }

    #[test]
    fn model_caches_sample_variance() {
        let model = toy_model();
        assert!((model.var_y() - 5.0 / 3.0).abs() < 1e-12);
        assert_eq!(model.n_components(), 3);
        assert_eq!(model.genetic_offset(), 2);
        assert_eq!(model.component_names(), vec!["e", "pen", "Additive"]);
        assert!(matches!(model.covariance(0), Some(Covariance::Identity)));
        assert!(model.covariance(3).is_none());
    }

    #[test]
    fn model_rejects_mismatched_shapes() {
        let err = FreqModel::new(
            array![1.0, 2.0, 3.0],
            FixedEffect::intercept_only(3),
            vec![],
            vec![GeneticEffect {
                name: "g".into(),
                kind: GrmKind::Unknown,
                covariance: Array2::eye(2),
            }],
        );
        assert!(matches!(err, Err(GremlError::Programmer(_))));

        let err = FreqModel::new(
            array![1.0, f64::NAN],
            FixedEffect::intercept_only(2),
            vec![],
            vec![],
        );
        assert!(err.is_err());
    }

    #[test]
    fn sigma_round_trips_through_state() {
        let model = toy_model();
        let mut state = FreqState::new(&model);
        state.set_sigma(array![0.5, 0.1, 0.4].view()).unwrap();
        assert_eq!(state.sigma(), array![0.5, 0.1, 0.4]);
        assert_eq!(state.genetic[0].variance, 0.4);
        assert!(state.set_sigma(array![1.0].view()).is_err());
    }

    #[test]
    fn covariance_helpers_match_dense_algebra() {
        let p = array![[2.0, 1.0], [1.0, 3.0]];
        let k = array![[1.0, 0.5], [0.5, 1.0]];
        let cov = Covariance::Matrix(k.view());
        assert!((cov.trace_product(p.view()) - k.dot(&p).diag().sum()).abs() < 1e-12);
        assert_eq!(Covariance::Identity.trace_product(p.view()), 5.0);
        assert_eq!(cov.apply(array![1.0, 2.0].view()), array![2.0, 2.5]);
    }

    #[test]
    fn reference_terms_name_dropped_levels() {
        let fixed = FixedEffect {
            names: vec!["Intercept".into(), "sex_M".into(), "herd_h2".into(), "herd_h3".into()],
            levels: vec![None, Some("M".into()), Some("h2".into()), Some("h3".into())],
            reference_levels: vec![None, Some("F".into()), Some("h1".into()), Some("h1".into())],
            x: Array2::zeros((5, 4)),
        };
        assert_eq!(fixed.reference_terms(), vec!["sex_F", "herd_h1"]);
    }
}

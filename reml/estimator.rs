//! The REML driver: optional EM warm start, then second-order updates until
//! the convergence checker is satisfied or the iteration cap is hit.

use std::time::{Duration, Instant};

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::constrain::constrain;
use crate::convergence::ConvergenceChecker;
use crate::effects::{compute_fixed_effects, compute_random_effects, residual_weighted};
use crate::model::{FreqModel, FreqState};
use crate::observer::{IterationReport, RemlObserver};
use crate::policy::UpdatePolicy;
use crate::shared::error::{GremlError, Result};
use crate::state::OptimizerState;
use crate::statistics::{compute_aic, compute_bic, compute_heritability, compute_variance_se};
use crate::variance::refresh;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub max_iter: usize,
    pub tol: f64,
    pub em_init: bool,
    pub policy: UpdatePolicy,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            max_iter: 100,
            tol: 1e-8,
            em_init: true,
            policy: UpdatePolicy::Ai,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitSummary {
    pub converged: bool,
    pub iterations: usize,
    pub loglike: f64,
    pub aic: f64,
    pub bic: f64,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
}

/// What a fit leaves behind besides the mutated [`FreqState`].
#[derive(Debug)]
pub struct FitResult {
    pub summary: FitSummary,
    /// Holds V⁻¹ at the final variances in `v`.
    pub opt_state: OptimizerState,
    /// V⁻¹(y − Xβ̂).
    pub vinv_residual: Array1<f64>,
}

impl FitResult {
    pub fn vinv(&self) -> &Array2<f64> {
        &self.opt_state.v
    }

    /// Turns a non-converged fit into an error.
    pub fn require_converged(self) -> Result<Self> {
        if self.summary.converged {
            Ok(self)
        } else {
            Err(GremlError::NonConvergence {
                iterations: self.summary.iterations,
            })
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Estimator {
    config: EstimatorConfig,
}

impl Estimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn fit(
        &self,
        model: &FreqModel,
        state: &mut FreqState,
        observer: &mut dyn RemlObserver,
    ) -> Result<FitResult> {
        let start = Instant::now();
        let mut checker = ConvergenceChecker::new(self.config.tol);
        let c = model.n_components();

        let sigma = state.sigma();
        if sigma.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
            let initial = Array1::from_elem(c, model.var_y() / c as f64);
            state.set_sigma(initial.view())?;
        }

        observer.on_fit_start(&model.component_names(), &self.config);
        let mut opt = OptimizerState::new(model);
        state.loglike = refresh(model, state, &mut opt).map_err(|e| e.at_iteration(0))?;
        checker.check(&state.sigma(), state.loglike);

        if self.config.em_init {
            let mut proposed = UpdatePolicy::Em
                .apply(model, state, &mut opt)
                .map_err(|e| e.at_iteration(0))?;
            self.constrain_step(model, &mut proposed, observer);
            state.set_sigma(proposed.view())?;
            state.loglike = refresh(model, state, &mut opt).map_err(|e| e.at_iteration(0))?;
            observer.on_em_init(&IterationReport {
                iteration: 0,
                loglike: state.loglike,
                sigma: proposed,
                elapsed: start.elapsed(),
            });
            checker.check(&state.sigma(), state.loglike);
        }

        state.converged = false;
        state.iterations = 0;
        for iteration in 1..=self.config.max_iter {
            let iteration_start = Instant::now();
            let mut proposed = self
                .config
                .policy
                .apply(model, state, &mut opt)
                .map_err(|e| e.at_iteration(iteration))?;
            self.constrain_step(model, &mut proposed, observer);
            state.set_sigma(proposed.view())?;
            state.loglike =
                refresh(model, state, &mut opt).map_err(|e| e.at_iteration(iteration))?;
            state.iterations = iteration;

            observer.on_iteration(&IterationReport {
                iteration,
                loglike: state.loglike,
                sigma: proposed,
                elapsed: iteration_start.elapsed(),
            });

            if checker.check(&state.sigma(), state.loglike) {
                state.converged = true;
                break;
            }
        }

        // The second-order step leaves the information inverse at the last
        // iterate; EM-only fits fall back to AI for standard errors.
        if self.config.policy == UpdatePolicy::Em || self.config.max_iter == 0 {
            UpdatePolicy::Ai.apply(model, state, &mut opt)?;
        }

        compute_fixed_effects(model, state, &opt)?;
        compute_random_effects(model, state, &opt);
        compute_variance_se(state, &opt)?;
        compute_heritability(model, state, &opt);
        let vinv_residual = residual_weighted(model, state, &opt);

        if !state.converged {
            observer.warn(
                &GremlError::NonConvergence {
                    iterations: state.iterations,
                }
                .to_string(),
            );
        }

        let summary = FitSummary {
            converged: state.converged,
            iterations: state.iterations,
            loglike: state.loglike,
            aic: compute_aic(model, state.loglike),
            bic: compute_bic(model, state.loglike),
            elapsed: start.elapsed(),
        };
        observer.on_results(model, state, &summary);

        Ok(FitResult {
            summary,
            opt_state: opt,
            vinv_residual,
        })
    }

    fn constrain_step(
        &self,
        model: &FreqModel,
        proposed: &mut Array1<f64>,
        observer: &mut dyn RemlObserver,
    ) {
        let outcome = constrain(proposed, model.var_y());
        if outcome.should_warn(proposed.len()) {
            let message = format!(
                "{} of {} variance components constrained to the floor",
                outcome.constrained,
                proposed.len()
            );
            observer.warn(&GremlError::Constraint(message).to_string());
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

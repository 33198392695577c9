use std::time::Duration;

use ndarray::Array1;

use crate::estimator::{EstimatorConfig, FitSummary};
use crate::model::{FreqModel, FreqState};

/// One row of the iteration log.
#[derive(Clone, Debug, PartialEq)]
pub struct IterationReport {
    pub iteration: usize,
    pub loglike: f64,
    pub sigma: Array1<f64>,
    pub elapsed: Duration,
}

/// Sink for messages and progress emitted while preparing data and fitting.
pub trait RemlObserver {
    fn info(&mut self, message: &str) {
        let _ = message;
    }
    fn warn(&mut self, message: &str) {
        let _ = message;
    }
    fn on_fit_start(&mut self, components: &[String], config: &EstimatorConfig) {
        let _ = (components, config);
    }
    fn on_em_init(&mut self, report: &IterationReport) {
        let _ = report;
    }
    fn on_iteration(&mut self, report: &IterationReport) {
        let _ = report;
    }
    fn on_results(&mut self, model: &FreqModel, state: &FreqState, summary: &FitSummary) {
        let _ = (model, state, summary);
    }
}

#[derive(Default)]
pub struct NoopObserver;

impl RemlObserver for NoopObserver {}

/// Forwards everything to the `log` facade.
#[derive(Default)]
pub struct LogObserver;

impl LogObserver {
    fn row(label: &str, report: &IterationReport) -> String {
        let mut line = format!("{label:>5}  {:>14.4}", report.loglike);
        for value in &report.sigma {
            line.push_str(&format!("  {value:>12.6}"));
        }
        line.push_str(&format!("  {:>9.3}s", report.elapsed.as_secs_f64()));
        line
    }
}

impl RemlObserver for LogObserver {
    fn info(&mut self, message: &str) {
        log::info!("{message}");
    }

    fn warn(&mut self, message: &str) {
        log::warn!("{message}");
    }

    fn on_fit_start(&mut self, components: &[String], config: &EstimatorConfig) {
        log::info!(
            "REML with {} update, tol {:e}, at most {} iterations{}",
            config.policy,
            config.tol,
            config.max_iter,
            if config.em_init { ", EM warm start" } else { "" }
        );
        let mut header = format!("{:>5}  {:>14}", "Iter", "logL");
        for name in components {
            header.push_str(&format!("  {:>12}", format!("V({name})")));
        }
        header.push_str(&format!("  {:>10}", "duration"));
        log::info!("{header}");
    }

    fn on_em_init(&mut self, report: &IterationReport) {
        log::info!("{}", Self::row("EM", report));
    }

    fn on_iteration(&mut self, report: &IterationReport) {
        log::info!("{}", Self::row(&report.iteration.to_string(), report));
    }

    fn on_results(&mut self, model: &FreqModel, state: &FreqState, summary: &FitSummary) {
        log::info!(
            "{} after {} iterations in {:.3}s",
            if summary.converged {
                "Converged"
            } else {
                "Stopped without convergence"
            },
            summary.iterations,
            summary.elapsed.as_secs_f64()
        );
        log::info!(
            "logL {:.4}  AIC {:.4}  BIC {:.4}",
            summary.loglike,
            summary.aic,
            summary.bic
        );

        log::info!("{:<24}  {:>12}  {:>12}", "Fixed effect", "Estimate", "SE");
        for ((name, coeff), se) in model
            .fixed
            .names
            .iter()
            .zip(&state.fixed.coeff)
            .zip(&state.fixed.se)
        {
            log::info!("{name:<24}  {coeff:>12.6}  {se:>12.6}");
        }

        log::info!(
            "{:<24}  {:>12}  {:>12}  {:>10}  {:>10}",
            "Component",
            "Variance",
            "SE",
            "h2",
            "h2 SE"
        );
        log::info!(
            "{:<24}  {:>12.6}  {:>12.6}",
            "e",
            state.residual.variance,
            state.residual.variance_se
        );
        for (effect, s) in model.random.iter().zip(&state.random) {
            log::info!(
                "{:<24}  {:>12.6}  {:>12.6}",
                effect.name,
                s.variance,
                s.variance_se
            );
        }
        for (effect, s) in model.genetic.iter().zip(&state.genetic) {
            log::info!(
                "{:<24}  {:>12.6}  {:>12.6}  {:>10.4}  {:>10.4}",
                effect.name,
                s.variance,
                s.variance_se,
                s.heritability,
                s.heritability_se
            );
        }
    }
}

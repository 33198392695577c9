use ndarray::Array1;

/// Largest log-likelihood change accepted when it is not a decrease.
pub const LOGLIKE_TOL: f64 = 1e-4;
/// Largest log-likelihood decrease still accepted.
pub const LOGLIKE_DECREASE_TOL: f64 = 1e-2;

/// Tracks successive (σ, logL) pairs and decides when the fit has settled.
#[derive(Clone, Debug)]
pub struct ConvergenceChecker {
    tol: f64,
    previous: Option<(Array1<f64>, f64)>,
    converged: bool,
    sigma_diff: f64,
    loglike_diff: f64,
}

impl ConvergenceChecker {
    pub fn new(tol: f64) -> Self {
        Self {
            tol,
            previous: None,
            converged: false,
            sigma_diff: f64::INFINITY,
            loglike_diff: f64::INFINITY,
        }
    }

    pub fn tol(&self) -> f64 {
        self.tol
    }

    /// Records a new iterate. The first call after construction or
    /// [`clear`](Self::clear) only stores it. Once converged the checker stays
    /// converged until cleared.
    pub fn check(&mut self, sigma: &Array1<f64>, loglike: f64) -> bool {
        if self.converged {
            return true;
        }
        if let Some((old_sigma, old_loglike)) = &self.previous {
            self.sigma_diff = relative_change(old_sigma, sigma);
            self.loglike_diff = loglike - old_loglike;
            let d = self.loglike_diff;
            let loglike_ok =
                d.abs() < LOGLIKE_TOL || (d < 0.0 && d.abs() < LOGLIKE_DECREASE_TOL);
            self.converged = self.sigma_diff < self.tol && loglike_ok;
        }
        self.previous = Some((sigma.clone(), loglike));
        self.converged
    }

    pub fn clear(&mut self) {
        self.previous = None;
        self.converged = false;
        self.sigma_diff = f64::INFINITY;
        self.loglike_diff = f64::INFINITY;
    }

    pub fn is_converged(&self) -> bool {
        self.converged
    }

    pub fn sigma_diff(&self) -> f64 {
        self.sigma_diff
    }

    pub fn loglike_diff(&self) -> f64 {
        self.loglike_diff
    }
}

/// ‖new − old‖ / ‖new‖; infinite when the lengths disagree.
fn relative_change(old: &Array1<f64>, new: &Array1<f64>) -> f64 {
    if old.len() != new.len() {
        return f64::INFINITY;
    }
    let diff: f64 = old
        .iter()
        .zip(new)
        .map(|(a, b)| (b - a) * (b - a))
        .sum::<f64>()
        .sqrt();
    let norm = new.dot(new).sqrt();
    if norm == 0.0 {
        if diff == 0.0 { 0.0 } else { f64::INFINITY }
    } else {
        diff / norm
    }
}

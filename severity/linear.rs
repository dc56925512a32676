//! # L2-Penalized Logistic Regression
//!
//! The linear severity model: mean imputation, standardization, then a
//! ridge-penalized logistic regression. Coefficients are found by Newton's method
//! (equivalently, iteratively reweighted least squares) on the penalized negative
//! log-likelihood
//!
//! ```text
//! f(beta) = sum_i [ log(1 + exp(eta_i)) - y_i * eta_i ] + ||w||^2 / (2C)
//! ```
//!
//! where `eta = b0 + X w` and the intercept `b0` is not penalized. `C` is the
//! inverse regularization strength, so larger values mean weaker shrinkage.

use crate::preprocess::{MeanImputer, StandardScaler};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip, concatenate, s};
use ndarray_linalg::Solve;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while fitting any of the severity models.
#[derive(Error, Debug)]
pub enum FitError {
    #[error("Cannot fit a model on an empty training set.")]
    EmptyTrainingSet,
    #[error("The training outcome contains a single class; both survivors and deaths are required.")]
    SingleClass,
    #[error("Training data has {x_rows} feature rows but {y_len} outcomes.")]
    LengthMismatch { x_rows: usize, y_len: usize },
    #[error("The Newton system is singular and could not be solved: {0}")]
    LinearSystemSolveFailed(ndarray_linalg::error::LinalgError),
    #[error("The penalized objective is non-finite at iteration {0}; check the features for extreme values.")]
    NonFiniteObjective(usize),
    #[error("Invalid hyperparameter: {0}")]
    InvalidParameter(String),
}

/// Logistic function, clamped to avoid overflow in `exp`.
pub fn sigmoid(eta: f64) -> f64 {
    let e = eta.clamp(-700.0, 700.0);
    1.0 / (1.0 + (-e).exp())
}

/// `log(1 + exp(eta))` without overflow.
fn softplus(eta: f64) -> f64 {
    if eta > 0.0 {
        eta + (-eta).exp().ln_1p()
    } else {
        eta.exp().ln_1p()
    }
}

/// Checks shapes and class balance shared by every trainer.
pub fn validate_training_set(x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), FitError> {
    if x.nrows() != y.len() {
        return Err(FitError::LengthMismatch {
            x_rows: x.nrows(),
            y_len: y.len(),
        });
    }
    if y.is_empty() {
        return Err(FitError::EmptyTrainingSet);
    }
    let events = y.iter().filter(|&&v| v > 0.5).count();
    if events == 0 || events == y.len() {
        return Err(FitError::SingleClass);
    }
    Ok(())
}

/// Newton solver controls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverSettings {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-8,
        }
    }
}

/// The raw result of a penalized logistic fit.
#[derive(Debug, Clone)]
pub struct LogisticFit {
    pub intercept: f64,
    pub coefficients: Array1<f64>,
    pub iterations: usize,
    pub converged: bool,
    /// Penalized negative log-likelihood at the solution.
    pub objective: f64,
}

/// Fits an L2-penalized logistic regression with an unpenalized intercept.
///
/// `x` must contain no missing values. Each iteration solves
/// `(X'WX + P) delta = X'(mu - y) + P beta` and halves the step until the
/// objective decreases.
pub fn fit_logistic(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    c: f64,
    settings: &SolverSettings,
) -> Result<LogisticFit, FitError> {
    validate_training_set(x, y)?;
    if !(c.is_finite() && c > 0.0) {
        return Err(FitError::InvalidParameter(format!(
            "C must be positive and finite, got {c}"
        )));
    }

    let n = x.nrows();
    let design = concatenate![Axis(1), Array2::ones((n, 1)), x];
    let p = design.ncols();

    let mut penalty = Array1::from_elem(p, 1.0 / c);
    penalty[0] = 0.0;

    let objective = |beta: &Array1<f64>| -> f64 {
        let eta = design.dot(beta);
        let nll = Zip::from(&eta)
            .and(y)
            .fold(0.0, |acc, &e, &yi| acc + softplus(e) - yi * e);
        nll + 0.5 * (&penalty * beta * beta).sum()
    };

    // Starting from the log-odds of the prevalence puts the first step close.
    let prevalence = y.mean().unwrap_or(0.5).clamp(1e-6, 1.0 - 1e-6);
    let mut beta = Array1::zeros(p);
    beta[0] = (prevalence / (1.0 - prevalence)).ln();
    let mut current = objective(&beta);
    if !current.is_finite() {
        return Err(FitError::NonFiniteObjective(0));
    }

    let mut converged = false;
    let mut iterations = 0;
    for iter in 1..=settings.max_iterations {
        iterations = iter;
        let eta = design.dot(&beta);
        let mu = eta.mapv(sigmoid);
        let weights = mu.mapv(|m| (m * (1.0 - m)).max(1e-10));

        let gradient = design.t().dot(&(&mu - &y)) + &penalty * &beta;
        let gradient_max = gradient.iter().fold(0.0_f64, |m, g| m.max(g.abs()));
        let weighted = &design * &weights.view().insert_axis(Axis(1));
        let mut hessian = design.t().dot(&weighted);
        for (j, &pen) in penalty.iter().enumerate() {
            hessian[[j, j]] += pen;
        }

        let delta = hessian
            .solve_into(gradient)
            .map_err(FitError::LinearSystemSolveFailed)?;

        let mut step = 1.0;
        let mut accepted = None;
        for _ in 0..30 {
            let trial = &beta - &(&delta * step);
            let value = objective(&trial);
            if value.is_finite() && value <= current {
                accepted = Some((trial, value));
                break;
            }
            step *= 0.5;
        }

        let Some((trial, value)) = accepted else {
            log::debug!(
                "Step halving exhausted at iteration {iter} (max gradient {gradient_max:.3e}); keeping current estimate"
            );
            converged = gradient_is_negligible(gradient_max, current, settings.tolerance);
            break;
        };

        let max_step = delta.iter().fold(0.0_f64, |m, d| m.max((d * step).abs()));
        let change = (current - value).abs() / current.abs().max(1.0);
        log::trace!("Newton iteration {iter}: objective {value:.8e}, max step {max_step:.3e}");
        beta = trial;
        current = value;

        if max_step < settings.tolerance || change < settings.tolerance {
            converged = true;
            break;
        }
    }

    if !converged {
        log::warn!("Logistic fit (C={c:.3e}) stopped after {iterations} iterations without converging");
    }

    Ok(LogisticFit {
        intercept: beta[0],
        coefficients: beta.slice(s![1..]).to_owned(),
        iterations,
        converged,
        objective: current,
    })
}

/// A stalled line search only counts as convergence when the gradient is
/// small relative to the objective.
fn gradient_is_negligible(gradient_max: f64, objective: f64, tolerance: f64) -> bool {
    gradient_max <= tolerance.sqrt() * objective.abs().max(1.0)
}

/// The fitted linear severity model: imputer, scaler and logistic coefficients
/// (on the standardized scale).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticPipeline {
    pub c: f64,
    pub intercept: f64,
    pub imputer: MeanImputer,
    pub scaler: StandardScaler,
    pub coefficients: Array1<f64>,
}

impl LogisticPipeline {
    /// Learns imputation, scaling and coefficients from the supplied rows only.
    pub fn fit(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        c: f64,
        settings: &SolverSettings,
    ) -> Result<Self, FitError> {
        validate_training_set(x, y)?;
        let imputer = MeanImputer::fit(x);
        let imputed = imputer.transform(x);
        let scaler = StandardScaler::fit(imputed.view());
        let z = scaler.transform(imputed.view());

        let fit = fit_logistic(z.view(), y, c, settings)?;
        log::debug!(
            "Logistic pipeline fit: C={c:.3e}, {} iterations, objective {:.6}",
            fit.iterations,
            fit.objective
        );
        Ok(Self {
            c,
            intercept: fit.intercept,
            imputer,
            scaler,
            coefficients: fit.coefficients,
        })
    }

    pub fn n_features(&self) -> usize {
        self.coefficients.len()
    }

    /// The linear predictor (log-odds) for each row.
    pub fn decision_function(&self, x: ArrayView2<f64>) -> Array1<f64> {
        let z = self.scaler.transform(self.imputer.transform(x).view());
        z.dot(&self.coefficients) + self.intercept
    }

    /// Predicted mortality probability for each row.
    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Array1<f64> {
        self.decision_function(x).mapv(sigmoid)
    }
}

/// The `n` features with the largest absolute log-odds, largest first.
pub fn rank_log_odds(
    feature_names: &[String],
    coefficients: ArrayView1<f64>,
    n: usize,
) -> Vec<(String, f64)> {
    let mut ranked: Vec<(String, f64)> = feature_names
        .iter()
        .cloned()
        .zip(coefficients.iter().copied())
        .collect();
    ranked.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()));
    ranked.truncate(n);
    ranked
}

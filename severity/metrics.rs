//! Discrimination and calibration metrics for predicted mortality.
//!
//! All functions take the observed outcome (0/1) and the predicted probability
//! as aligned one-dimensional views.

use ndarray::{Array1, ArrayView1, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Probabilities are clipped to `[EPS, 1 - EPS]` before taking logarithms.
const LOG_LOSS_EPS: f64 = 1e-15;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    #[error("Outcome has {y_len} entries but there are {p_len} predictions.")]
    LengthMismatch { y_len: usize, p_len: usize },
    #[error("Cannot compute a metric on zero rows.")]
    Empty,
    #[error("Only one class is present in the outcome; AUC is undefined.")]
    SingleClass,
    #[error("Mean predicted mortality is zero; the observed:predicted ratio is undefined.")]
    ZeroPrediction,
    #[error("No bootstrap resample produced a defined statistic.")]
    BootstrapFailed,
}

fn check_lengths(y: ArrayView1<f64>, p: ArrayView1<f64>) -> Result<(), MetricError> {
    if y.len() != p.len() {
        return Err(MetricError::LengthMismatch {
            y_len: y.len(),
            p_len: p.len(),
        });
    }
    if y.is_empty() {
        return Err(MetricError::Empty);
    }
    Ok(())
}

/// Area under the ROC curve via the Mann-Whitney statistic. Tied predictions
/// receive their average rank, so a tied positive/negative pair counts 1/2.
pub fn roc_auc(y: ArrayView1<f64>, p: ArrayView1<f64>) -> Result<f64, MetricError> {
    check_lengths(y, p)?;
    let n_pos = y.iter().filter(|&&v| v > 0.5).count();
    let n_neg = y.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return Err(MetricError::SingleClass);
    }

    let mut order: Vec<usize> = (0..p.len()).collect();
    order.sort_by(|&a, &b| p[a].total_cmp(&p[b]));

    let mut rank_sum_pos = 0.0;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && p[order[end]] == p[order[start]] {
            end += 1;
        }
        // Ranks are 1-based; the tie group spans ranks start+1 ..= end.
        let average_rank = (start + 1 + end) as f64 / 2.0;
        let positives = order[start..end].iter().filter(|&&i| y[i] > 0.5).count();
        rank_sum_pos += average_rank * positives as f64;
        start = end;
    }

    let n_pos = n_pos as f64;
    let n_neg = n_neg as f64;
    Ok((rank_sum_pos - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg))
}

/// Mean binary cross-entropy.
pub fn log_loss(y: ArrayView1<f64>, p: ArrayView1<f64>) -> Result<f64, MetricError> {
    check_lengths(y, p)?;
    let total: f64 = y
        .iter()
        .zip(p.iter())
        .map(|(&yi, &pi)| {
            let pc = pi.clamp(LOG_LOSS_EPS, 1.0 - LOG_LOSS_EPS);
            -(yi * pc.ln() + (1.0 - yi) * (1.0 - pc).ln())
        })
        .sum();
    Ok(total / y.len() as f64)
}

/// Observed mortality divided by mean predicted mortality. Values above 1 mean
/// the model under-predicts deaths.
pub fn observed_predicted_ratio(
    y: ArrayView1<f64>,
    p: ArrayView1<f64>,
) -> Result<f64, MetricError> {
    check_lengths(y, p)?;
    let observed = y.mean().unwrap_or(0.0);
    let predicted = p.mean().unwrap_or(0.0);
    if predicted <= 0.0 {
        return Err(MetricError::ZeroPrediction);
    }
    Ok(observed / predicted)
}

/// A point estimate with a percentile bootstrap confidence interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceEstimate {
    pub estimate: f64,
    pub lower: f64,
    pub upper: f64,
    pub level: f64,
}

/// Bootstrap resampling settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BootstrapSettings {
    pub n_bootstraps: usize,
    pub ci_level: f64,
    pub seed: u64,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            n_bootstraps: 2000,
            ci_level: 0.95,
            seed: 42,
        }
    }
}

/// Percentile bootstrap of `statistic` over rows resampled with replacement.
///
/// Resamples on which the statistic is undefined (e.g. a single class for AUC)
/// are skipped. The interval bounds are the order statistics at
/// `floor(alpha/2 * B)` and `floor((1 - alpha/2) * B)` of the `B` defined
/// resamples.
pub fn bootstrap_ci<F>(
    y: ArrayView1<f64>,
    p: ArrayView1<f64>,
    statistic: F,
    settings: &BootstrapSettings,
) -> Result<ConfidenceEstimate, MetricError>
where
    F: Fn(ArrayView1<f64>, ArrayView1<f64>) -> Result<f64, MetricError>,
{
    let estimate = statistic(y, p)?;
    let n = y.len();
    let mut rng = StdRng::seed_from_u64(settings.seed);

    let mut samples = Vec::with_capacity(settings.n_bootstraps);
    let mut skipped = 0usize;
    for _ in 0..settings.n_bootstraps {
        let indices: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
        let yb: Array1<f64> = y.select(Axis(0), &indices);
        let pb: Array1<f64> = p.select(Axis(0), &indices);
        match statistic(yb.view(), pb.view()) {
            Ok(value) => samples.push(value),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        log::debug!("Skipped {skipped} bootstrap resamples with an undefined statistic");
    }
    if samples.is_empty() {
        return Err(MetricError::BootstrapFailed);
    }

    samples.sort_by(f64::total_cmp);
    let tail = (1.0 - settings.ci_level) / 2.0;
    let last = samples.len() - 1;
    let at = |q: f64| samples[((q * samples.len() as f64) as usize).min(last)];
    Ok(ConfidenceEstimate {
        estimate,
        lower: at(tail),
        upper: at(1.0 - tail),
        level: settings.ci_level,
    })
}

/// One populated bin of a reliability diagram.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBin {
    pub mean_predicted: f64,
    pub fraction_positive: f64,
    pub count: usize,
}

/// Groups predictions into `n_bins` equal-width bins on [0, 1] and reports the
/// mean prediction and observed event rate of each non-empty bin.
pub fn calibration_curve(
    y: ArrayView1<f64>,
    p: ArrayView1<f64>,
    n_bins: usize,
) -> Result<Vec<CalibrationBin>, MetricError> {
    check_lengths(y, p)?;
    let n_bins = n_bins.max(1);
    let mut sums = vec![(0.0, 0.0, 0usize); n_bins];
    for (&yi, &pi) in y.iter().zip(p.iter()) {
        // Interior edges are k / n_bins; a prediction on an edge belongs to the lower bin.
        let bin = ((pi * n_bins as f64).ceil().max(0.0) as usize)
            .saturating_sub(1)
            .min(n_bins - 1);
        let entry = &mut sums[bin];
        entry.0 += pi;
        entry.1 += yi;
        entry.2 += 1;
    }
    Ok(sums
        .into_iter()
        .filter(|&(_, _, count)| count > 0)
        .map(|(sum_p, sum_y, count)| CalibrationBin {
            mean_predicted: sum_p / count as f64,
            fraction_positive: sum_y / count as f64,
            count,
        })
        .collect())
}

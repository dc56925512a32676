//! Held-out evaluation of a saved model on labelled stays: discrimination with a
//! bootstrap interval, calibration-in-the-large, a reliability curve, and the
//! features the model leans on most.

use crate::data::{CohortData, DataError};
use crate::metrics::{
    BootstrapSettings, CalibrationBin, ConfidenceEstimate, MetricError, bootstrap_ci,
    calibration_curve, observed_predicted_ratio, roc_auc,
};
use crate::model::{ModelError, ModelKind, TrainedModel};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("Evaluation metric failed: {0}")]
    Metric(#[from] MetricError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationSettings {
    pub bootstrap: BootstrapSettings,
    pub calibration_bins: usize,
    pub top_features: usize,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            bootstrap: BootstrapSettings::default(),
            calibration_bins: 10,
            top_features: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationReport {
    pub kind: ModelKind,
    pub n_rows: usize,
    pub n_events: usize,
    pub auc: ConfidenceEstimate,
    pub observed_predicted: ConfidenceEstimate,
    pub calibration: Vec<CalibrationBin>,
    /// Standardized log-odds for logistic models, split counts for boosted ones.
    pub top_features: Vec<(String, f64)>,
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pct = self.auc.level * 100.0;
        writeln!(
            f,
            "{} model on {} stays ({} deaths)",
            self.kind, self.n_rows, self.n_events
        )?;
        writeln!(
            f,
            "AUC: {:.3} ({pct:.0}% CI {:.3}-{:.3})",
            self.auc.estimate, self.auc.lower, self.auc.upper
        )?;
        writeln!(
            f,
            "Observed:predicted ratio: {:.3} ({pct:.0}% CI {:.3}-{:.3})",
            self.observed_predicted.estimate,
            self.observed_predicted.lower,
            self.observed_predicted.upper
        )?;
        writeln!(f, "Calibration (mean predicted / observed / stays):")?;
        for bin in &self.calibration {
            writeln!(
                f,
                "  {:.3}\t{:.3}\t{}",
                bin.mean_predicted, bin.fraction_positive, bin.count
            )?;
        }
        let measure = match self.kind {
            ModelKind::Logistic => "log-odds",
            ModelKind::Boosted => "splits",
        };
        writeln!(f, "Top features ({measure}):")?;
        for (name, value) in &self.top_features {
            writeln!(f, "  {name}\t{value:.4}")?;
        }
        Ok(())
    }
}

/// Scores `data` with `model` and computes the held-out metrics.
pub fn evaluate_model(
    model: &TrainedModel,
    data: &CohortData,
    settings: &EvaluationSettings,
) -> Result<EvaluationReport, EvaluationError> {
    let x = data.aligned_features(&model.feature_names)?;
    let probs = model.predict_proba(x.view())?;
    let y = data.y.view();
    let p = probs.view();

    let auc = bootstrap_ci(y, p, roc_auc, &settings.bootstrap)?;
    let observed_predicted = bootstrap_ci(y, p, observed_predicted_ratio, &settings.bootstrap)?;
    let calibration = calibration_curve(y, p, settings.calibration_bins)?;
    log::info!(
        "Evaluated {} model on {} stays: AUC {:.3} [{:.3}, {:.3}], O:P {:.3}",
        model.kind(),
        data.n_rows(),
        auc.estimate,
        auc.lower,
        auc.upper,
        observed_predicted.estimate
    );

    Ok(EvaluationReport {
        kind: model.kind(),
        n_rows: data.n_rows(),
        n_events: data.n_events(),
        auc,
        observed_predicted,
        calibration,
        top_features: model.feature_ranking(settings.top_features),
    })
}

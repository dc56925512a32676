//! # Training Workflow
//!
//! Runs the full severity-model procedure on a loaded dataset:
//!
//! 1. Partition stays into the configured cohorts (full, high-risk, control).
//! 2. For each cohort, tune the logistic penalty over the `C` grid and the
//!    boosted ensemble over randomized draws, both under the same stratified
//!    folds and scoring metric, and refit each winner on the whole cohort.
//! 3. Save every model as `<cohort>_<model>.toml` and write the best
//!    cross-validated scores to `cv_report.tsv` in the model directory.

use crate::cohort::{CohortError, CohortKind, cohort_data, select_cohorts};
use crate::config::{ConfigError, WorkflowConfig};
use crate::data::{CohortData, DataError};
use crate::model::{CvSummary, FittedModel, ModelError, ModelKind, TrainedModel};
use crate::progress::SearchProgressObserver;
use crate::search::{
    BoostTrainer, LogisticParams, LogisticTrainer, SearchError, stratified_k_fold, tune,
};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CV_REPORT_FILE: &str = "cv_report.tsv";

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Cohort(#[from] CohortError),
    #[error("Training on the {cohort} cohort failed: {source}")]
    Search {
        cohort: CohortKind,
        #[source]
        source: SearchError,
    },
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("Failed to write the cross-validation report: {0}")]
    Report(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Summary of one saved model.
#[derive(Debug, Clone)]
pub struct ModelReport {
    pub cohort: CohortKind,
    pub kind: ModelKind,
    pub n_rows: usize,
    pub n_events: usize,
    pub cv: CvSummary,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowReport {
    pub models: Vec<ModelReport>,
}

impl WorkflowReport {
    /// Writes one tab-separated row per model.
    pub fn write_tsv(&self, path: impl AsRef<Path>) -> Result<(), WorkflowError> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(path)?;
        writer.write_record([
            "cohort",
            "model",
            "n_stays",
            "n_deaths",
            "scoring",
            "folds",
            "candidates",
            "best_score",
            "best_std",
            "best_params",
            "model_path",
        ])?;
        for report in &self.models {
            writer.write_record([
                report.cohort.to_string(),
                report.kind.to_string(),
                report.n_rows.to_string(),
                report.n_events.to_string(),
                report.cv.scoring.to_string(),
                report.cv.folds.to_string(),
                report.cv.candidates_evaluated.to_string(),
                format!("{:.6}", report.cv.best_score),
                format!("{:.6}", report.cv.best_std),
                report.cv.best_params.clone(),
                report.path.display().to_string(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Tunes and refits both model families on one cohort.
pub fn train_cohort_models(
    data: &CohortData,
    cohort: CohortKind,
    config: &WorkflowConfig,
    progress: &dyn SearchProgressObserver,
) -> Result<Vec<TrainedModel>, WorkflowError> {
    let search_failed = |source: SearchError| WorkflowError::Search { cohort, source };
    let x = data.x.view();
    let y = data.y.view();
    let folds = stratified_k_fold(y, config.folds).map_err(search_failed)?;
    log::info!(
        "Training on the {cohort} cohort: {} stays, {} deaths, {} folds",
        data.n_rows(),
        data.n_events(),
        folds.len()
    );

    let wrap = |cv: CvSummary, model: FittedModel| TrainedModel {
        cohort,
        n_training_rows: data.n_rows(),
        n_events: data.n_events(),
        prevalence: data.n_events() as f64 / data.n_rows() as f64,
        feature_names: data.feature_names.clone(),
        cv,
        model,
    };

    let linear = LogisticTrainer {
        settings: config.linear.solver(),
    };
    let grid: Vec<LogisticParams> = config
        .linear
        .c_grid
        .iter()
        .map(|&c| LogisticParams { c })
        .collect();
    let label = format!("{cohort}/{}", ModelKind::Logistic);
    let (logistic, result) = tune(
        &linear,
        x,
        y,
        &grid,
        &folds,
        config.scoring,
        progress,
        &label,
    )
    .map_err(search_failed)?;
    let logistic = wrap(
        CvSummary::from_search(&result, folds.len()),
        FittedModel::Logistic(logistic),
    );

    let boosted = BoostTrainer {
        settings: config.boosted.settings(config.seed),
    };
    let draws = config.boosted.space.sample(config.boosted.n_iter, config.seed);
    let label = format!("{cohort}/{}", ModelKind::Boosted);
    let (ensemble, result) = tune(
        &boosted,
        x,
        y,
        &draws,
        &folds,
        config.scoring,
        progress,
        &label,
    )
    .map_err(search_failed)?;
    let ensemble = wrap(
        CvSummary::from_search(&result, folds.len()),
        FittedModel::Boosted(ensemble),
    );

    Ok(vec![logistic, ensemble])
}

/// Runs every configured cohort, saving models and the CV report to
/// `config.model_dir`.
pub fn run_workflow(
    data: &CohortData,
    config: &WorkflowConfig,
    progress: &dyn SearchProgressObserver,
) -> Result<WorkflowReport, WorkflowError> {
    config.validate()?;
    let split = select_cohorts(data.risk.view(), config.risk_threshold, config.seed)?;
    fs::create_dir_all(&config.model_dir)?;

    let mut report = WorkflowReport::default();
    for &cohort in &config.cohorts {
        let rows = cohort_data(data, &split, cohort)?;
        for model in train_cohort_models(&rows, cohort, config, progress)? {
            let path = config.model_dir.join(model.file_name());
            model.save(&path)?;
            log::info!(
                "Saved {} model for the {cohort} cohort to '{}' ({} {:.4})",
                model.kind(),
                path.display(),
                model.cv.scoring,
                model.cv.best_score
            );
            report.models.push(ModelReport {
                cohort,
                kind: model.kind(),
                n_rows: model.n_training_rows,
                n_events: model.n_events,
                cv: model.cv,
                path,
            });
        }
    }

    let report_path = config.model_dir.join(CV_REPORT_FILE);
    report.write_tsv(&report_path)?;
    log::info!("Cross-validation report written to '{}'", report_path.display());
    Ok(report)
}

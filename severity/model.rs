use crate::boost::BoostedEnsemble;
use crate::cohort::CohortKind;
use crate::linear::{LogisticPipeline, rank_log_odds};
use crate::search::{Scoring, SearchResult};
use ndarray::{Array1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

// The structs below define the human-readable TOML format of a saved model.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Mean imputation, standardization and L2 logistic regression.
    Logistic,
    /// Gradient-boosted trees.
    Boosted,
}

impl ModelKind {
    pub const ALL: [ModelKind; 2] = [ModelKind::Logistic, ModelKind::Boosted];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Logistic => "logistic",
            ModelKind::Boosted => "boosted",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fitted parameters of either model family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FittedModel {
    Logistic(LogisticPipeline),
    Boosted(BoostedEnsemble),
}

impl FittedModel {
    pub fn kind(&self) -> ModelKind {
        match self {
            FittedModel::Logistic(_) => ModelKind::Logistic,
            FittedModel::Boosted(_) => ModelKind::Boosted,
        }
    }

    fn n_features(&self) -> usize {
        match self {
            FittedModel::Logistic(m) => m.n_features(),
            FittedModel::Boosted(m) => m.n_features,
        }
    }
}

/// Cross-validation outcome of the hyperparameter search that produced a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvSummary {
    pub scoring: Scoring,
    pub folds: usize,
    pub candidates_evaluated: usize,
    /// Mean held-out score of the winning configuration.
    pub best_score: f64,
    pub best_std: f64,
    pub best_params: String,
    pub fold_scores: Vec<f64>,
}

impl CvSummary {
    pub fn from_search<P: fmt::Display>(result: &SearchResult<P>, folds: usize) -> Self {
        let best = result.best();
        Self {
            scoring: result.scoring,
            folds,
            candidates_evaluated: result.candidates.len(),
            best_score: best.mean_score,
            best_std: best.std_score,
            best_params: best.params.to_string(),
            fold_scores: best.fold_scores.clone(),
        }
    }
}

/// A model trained on one cohort, with everything needed to score new stays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    pub cohort: CohortKind,
    pub n_training_rows: usize,
    pub n_events: usize,
    /// Observed mortality of the training rows.
    pub prevalence: f64,
    /// Canonical column order expected at prediction time.
    pub feature_names: Vec<String>,
    pub cv: CvSummary,
    pub model: FittedModel,
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Prediction data has {found} feature columns, but the model was trained on {expected}.")]
    MismatchedFeatureCount { found: usize, expected: usize },
}

impl TrainedModel {
    pub fn kind(&self) -> ModelKind {
        self.model.kind()
    }

    /// `<cohort>_<model>.toml`, the name this model is saved under.
    pub fn file_name(&self) -> String {
        format!("{}_{}.toml", self.cohort, self.kind())
    }

    /// Predicted mortality for each row. Columns must follow `feature_names`.
    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        if x.ncols() != self.feature_names.len() || x.ncols() != self.model.n_features() {
            return Err(ModelError::MismatchedFeatureCount {
                found: x.ncols(),
                expected: self.feature_names.len(),
            });
        }
        Ok(match &self.model {
            FittedModel::Logistic(m) => m.predict_proba(x),
            FittedModel::Boosted(m) => m.predict_proba(x),
        })
    }

    /// The `n` most influential features, largest first. For the logistic model
    /// this is the standardized log-odds coefficient; for the boosted model the
    /// number of splits on the feature.
    pub fn feature_ranking(&self, n: usize) -> Vec<(String, f64)> {
        match &self.model {
            FittedModel::Logistic(m) => {
                rank_log_odds(&self.feature_names, m.coefficients.view(), n)
            }
            FittedModel::Boosted(m) => {
                let counts: Array1<f64> =
                    m.split_counts().into_iter().map(|c| c as f64).collect();
                rank_log_odds(&self.feature_names, counts.view(), n)
            }
        }
    }

    /// Saves the model to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads a trained model from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model = toml::from_str(&toml_string)?;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boost::{BoostParams, BoostSettings};
    use crate::linear::SolverSettings;
    use ndarray::{Array2, array};
    use tempfile::tempdir;

    fn toy_data() -> (Array2<f64>, Array1<f64>) {
        let x = array![
            [0.1, 5.0],
            [0.4, f64::NAN],
            [0.5, 3.0],
            [0.9, 2.0],
            [1.3, 1.0],
            [1.7, 4.0],
            [2.2, 0.5],
            [2.9, 1.5]
        ];
        let y = array![0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 1.0];
        (x, y)
    }

    fn summary() -> CvSummary {
        CvSummary {
            scoring: Scoring::RocAuc,
            folds: 5,
            candidates_evaluated: 10,
            best_score: 0.8,
            best_std: 0.05,
            best_params: "C=1.0000e0".to_string(),
            fold_scores: vec![0.75, 0.8, 0.85, 0.8, 0.8],
        }
    }

    fn wrap(model: FittedModel) -> TrainedModel {
        TrainedModel {
            cohort: CohortKind::HighRisk,
            n_training_rows: 8,
            n_events: 4,
            prevalence: 0.5,
            feature_names: vec!["age".to_string(), "lactate".to_string()],
            cv: summary(),
            model,
        }
    }

    #[test]
    fn saved_models_reload_to_identical_predictions() {
        let (x, y) = toy_data();
        let logistic =
            LogisticPipeline::fit(x.view(), y.view(), 1.0, &SolverSettings::default()).unwrap();
        let boosted = BoostedEnsemble::fit(
            x.view(),
            y.view(),
            &BoostParams {
                n_estimators: 5,
                max_depth: 2,
                min_child_weight: 0.0,
                ..BoostParams::default()
            },
            &BoostSettings::default(),
        )
        .unwrap();

        let dir = tempdir().unwrap();
        for fitted in [FittedModel::Logistic(logistic), FittedModel::Boosted(boosted)] {
            let model = wrap(fitted);
            let path = dir.path().join(model.file_name());
            model.save(&path).unwrap();
            let reloaded = TrainedModel::load(&path).unwrap();

            assert_eq!(reloaded.cohort, model.cohort);
            assert_eq!(reloaded.kind(), model.kind());
            assert_eq!(reloaded.cv, model.cv);
            assert_eq!(reloaded.feature_names, model.feature_names);
            let before = model.predict_proba(x.view()).unwrap();
            let after = reloaded.predict_proba(x.view()).unwrap();
            assert_eq!(before, after);
            assert!(after.iter().all(|&p| (0.0..=1.0).contains(&p)));
        }
    }

    #[test]
    fn file_name_combines_cohort_and_kind() {
        let (x, y) = toy_data();
        let logistic =
            LogisticPipeline::fit(x.view(), y.view(), 1.0, &SolverSettings::default()).unwrap();
        assert_eq!(
            wrap(FittedModel::Logistic(logistic)).file_name(),
            "high_risk_logistic.toml"
        );
    }

    #[test]
    fn prediction_checks_feature_count() {
        let (x, y) = toy_data();
        let logistic =
            LogisticPipeline::fit(x.view(), y.view(), 1.0, &SolverSettings::default()).unwrap();
        let model = wrap(FittedModel::Logistic(logistic));
        let narrow = array![[1.0], [2.0]];
        assert!(matches!(
            model.predict_proba(narrow.view()),
            Err(ModelError::MismatchedFeatureCount {
                found: 1,
                expected: 2
            })
        ));
    }

    #[test]
    fn ranking_orders_by_magnitude() {
        let (x, y) = toy_data();
        let logistic =
            LogisticPipeline::fit(x.view(), y.view(), 10.0, &SolverSettings::default()).unwrap();
        let model = wrap(FittedModel::Logistic(logistic));
        let ranking = model.feature_ranking(2);
        assert_eq!(ranking.len(), 2);
        assert!(ranking[0].1.abs() >= ranking[1].1.abs());
        assert_eq!(model.feature_ranking(1).len(), 1);
    }
}

//! Workflow configuration, read from an optional TOML file. Every field has a
//! default, so an empty file (or no file) runs the standard workflow: all three
//! cohorts, risk threshold 0.10, seed 42, 5-fold CV scored by AUC, ten
//! log-spaced penalty values and 100 randomized boosting draws.

use crate::boost::{BoostSearchSpace, BoostSettings};
use crate::cohort::{CohortKind, DEFAULT_RISK_THRESHOLD};
use crate::data::ColumnSpec;
use crate::linear::SolverSettings;
use crate::search::{Scoring, log_grid};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings of the logistic model and its penalty grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinearConfig {
    /// Candidate values of the inverse penalty strength `C`.
    pub c_grid: Vec<f64>,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for LinearConfig {
    fn default() -> Self {
        let solver = SolverSettings::default();
        Self {
            c_grid: log_grid(1e-4, 1e4, 10),
            max_iterations: solver.max_iterations,
            tolerance: solver.tolerance,
        }
    }
}

impl LinearConfig {
    pub fn solver(&self) -> SolverSettings {
        SolverSettings {
            max_iterations: self.max_iterations,
            tolerance: self.tolerance,
        }
    }
}

/// Settings of the boosted model and its randomized search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BoostedConfig {
    /// Number of configurations drawn from `space`.
    pub n_iter: usize,
    pub reg_lambda: f64,
    pub max_bins: usize,
    pub space: BoostSearchSpace,
}

impl Default for BoostedConfig {
    fn default() -> Self {
        let settings = BoostSettings::default();
        Self {
            n_iter: 100,
            reg_lambda: settings.reg_lambda,
            max_bins: settings.max_bins,
            space: BoostSearchSpace::default(),
        }
    }
}

impl BoostedConfig {
    pub fn settings(&self, seed: u64) -> BoostSettings {
        BoostSettings {
            reg_lambda: self.reg_lambda,
            max_bins: self.max_bins,
            seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkflowConfig {
    pub risk_threshold: f64,
    /// Seeds the control sample, the boosting draws and the tree subsampling.
    pub seed: u64,
    pub folds: usize,
    pub scoring: Scoring,
    pub cohorts: Vec<CohortKind>,
    pub model_dir: PathBuf,
    pub columns: ColumnSpec,
    pub linear: LinearConfig,
    pub boosted: BoostedConfig,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            risk_threshold: DEFAULT_RISK_THRESHOLD,
            seed: 42,
            folds: 5,
            scoring: Scoring::RocAuc,
            cohorts: CohortKind::ALL.to_vec(),
            model_dir: PathBuf::from("models"),
            columns: ColumnSpec::default(),
            linear: LinearConfig::default(),
            boosted: BoostedConfig::default(),
        }
    }
}

impl WorkflowConfig {
    /// Reads a configuration file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: WorkflowConfig = toml::from_str(&text)?;
        Ok(config)
    }

    /// Rejects settings the workflow cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        let fraction_range_ok = |(lo, hi): (f64, f64)| lo > 0.0 && lo <= hi && hi <= 1.0;

        if !(self.risk_threshold > 0.0 && self.risk_threshold < 1.0) {
            return invalid(format!(
                "risk_threshold must lie in (0, 1), got {}",
                self.risk_threshold
            ));
        }
        if self.folds < 2 {
            return invalid(format!("folds must be at least 2, got {}", self.folds));
        }
        if self.cohorts.is_empty() {
            return invalid("at least one cohort must be trained".to_string());
        }
        if self.linear.c_grid.is_empty() {
            return invalid("linear.c_grid must not be empty".to_string());
        }
        if let Some(c) = self.linear.c_grid.iter().find(|c| !(c.is_finite() && **c > 0.0)) {
            return invalid(format!("linear.c_grid values must be positive, got {c}"));
        }
        if self.linear.max_iterations == 0 || !(self.linear.tolerance > 0.0) {
            return invalid("linear.max_iterations and linear.tolerance must be positive".to_string());
        }
        if self.boosted.n_iter == 0 {
            return invalid("boosted.n_iter must be at least 1".to_string());
        }
        if self.boosted.max_bins < 2 || self.boosted.max_bins > usize::from(u16::MAX) {
            return invalid(format!(
                "boosted.max_bins must lie in [2, {}], got {}",
                u16::MAX,
                self.boosted.max_bins
            ));
        }
        if !(self.boosted.reg_lambda >= 0.0) {
            return invalid(format!(
                "boosted.reg_lambda must be non-negative, got {}",
                self.boosted.reg_lambda
            ));
        }

        let space = &self.boosted.space;
        let (lr_lo, lr_hi) = space.learning_rate;
        if !(lr_lo > 0.0 && lr_lo <= lr_hi && lr_hi.is_finite()) {
            return invalid(format!(
                "boosted.space.learning_rate must be an ordered positive range, got {:?}",
                space.learning_rate
            ));
        }
        if !fraction_range_ok(space.subsample) || !fraction_range_ok(space.colsample_bytree) {
            return invalid(
                "boosted.space.subsample and colsample_bytree must be ordered ranges within (0, 1]"
                    .to_string(),
            );
        }
        let (mcw_lo, mcw_hi) = space.min_child_weight;
        if !(mcw_lo >= 0.0 && mcw_lo <= mcw_hi) {
            return invalid(format!(
                "boosted.space.min_child_weight must be an ordered non-negative range, got {:?}",
                space.min_child_weight
            ));
        }
        if space.max_depth.0 < 1 || space.max_depth.0 > space.max_depth.1 {
            return invalid(format!(
                "boosted.space.max_depth must be an ordered range starting at 1 or more, got {:?}",
                space.max_depth
            ));
        }
        if space.n_estimators.0 < 1 || space.n_estimators.0 > space.n_estimators.1 {
            return invalid(format!(
                "boosted.space.n_estimators must be an ordered range starting at 1 or more, got {:?}",
                space.n_estimators
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_are_valid() {
        let config = WorkflowConfig::default();
        config.validate().unwrap();
        assert_eq!(config.cohorts.len(), 3);
        assert_eq!(config.linear.c_grid.len(), 10);
        assert_eq!(config.boosted.n_iter, 100);
        assert_abs_diff_eq!(config.risk_threshold, 0.10);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
seed = 7
scoring = "neg_log_loss"
cohorts = ["high_risk", "control"]

[columns]
outcome = "died"

[boosted]
n_iter = 12

[boosted.space]
max_depth = [2, 4]
"#
        )
        .unwrap();

        let config = WorkflowConfig::load(file.path()).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.scoring, Scoring::NegLogLoss);
        assert_eq!(config.cohorts, vec![CohortKind::HighRisk, CohortKind::Control]);
        assert_eq!(config.columns.outcome, "died");
        assert_eq!(config.columns.id, "icustay_id");
        assert_eq!(config.boosted.n_iter, 12);
        assert_eq!(config.boosted.space.max_depth, (2, 4));
        assert_eq!(config.boosted.space.n_estimators, (50, 500));
        assert_eq!(config.folds, 5);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "treshold = 0.2").unwrap();
        assert!(matches!(
            WorkflowConfig::load(file.path()),
            Err(ConfigError::TomlParseError(_))
        ));
    }

    #[test]
    fn validation_catches_bad_values() {
        let mut config = WorkflowConfig::default();
        config.folds = 1;
        assert!(config.validate().is_err());

        let mut config = WorkflowConfig::default();
        config.risk_threshold = 1.0;
        assert!(config.validate().is_err());

        let mut config = WorkflowConfig::default();
        config.linear.c_grid = vec![1.0, -2.0];
        assert!(config.validate().is_err());

        let mut config = WorkflowConfig::default();
        config.boosted.space.subsample = (0.9, 0.5);
        assert!(config.validate().is_err());

        let mut config = WorkflowConfig::default();
        config.boosted.space.max_depth = (0, 3);
        assert!(config.validate().is_err());
    }
}

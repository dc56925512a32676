//! # Data Loading and Validation Module
//!
//! This module is the only entry point for user-provided cohort data. It reads
//! delimited tables (tab-separated by default, comma-separated for `.csv`
//! files), validates the identifier, outcome and risk columns, and turns every
//! remaining column into a numeric feature column of an `ndarray` matrix.
//!
//! - Keyed rows: every ICU stay is identified by the identifier column, which
//!   must be present and unique. Outcome and risk may live in a second file,
//!   in which case rows are joined on the identifier.
//! - Missing features are allowed and are carried as `NaN`; imputation is the
//!   job of the model pipelines, not of the loader.
//! - Outcome and risk are strict: no missing values, the outcome must be 0/1.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Names of the structural columns of an input table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ColumnSpec {
    /// Unique ICU stay identifier.
    pub id: String,
    /// Binary in-hospital mortality label.
    pub outcome: String,
    /// Reference severity score, expressed as a predicted mortality probability.
    pub risk: String,
    /// Columns that are neither structural nor features (e.g. free-text fields).
    pub exclude: Vec<String>,
}

impl Default for ColumnSpec {
    fn default() -> Self {
        Self {
            id: "icustay_id".to_string(),
            outcome: "hospital_expire_flag".to_string(),
            risk: "risk".to_string(),
            exclude: Vec::new(),
        }
    }
}

impl ColumnSpec {
    fn is_structural(&self, name: &str) -> bool {
        name == self.id
            || name == self.outcome
            || name == self.risk
            || self.exclude.iter().any(|e| e == name)
    }
}

/// A validated cohort ready for model training: features, outcome and risk,
/// aligned row by row.
#[derive(Debug, Clone)]
pub struct CohortData {
    pub ids: Vec<String>,
    pub feature_names: Vec<String>,
    /// Shape: [n_stays, n_features]. Missing values are `NaN`.
    pub x: Array2<f64>,
    /// Mortality label, 0.0 or 1.0.
    pub y: Array1<f64>,
    /// Reference predicted mortality.
    pub risk: Array1<f64>,
}

impl CohortData {
    pub fn n_rows(&self) -> usize {
        self.y.len()
    }

    /// Number of deaths in the cohort.
    pub fn n_events(&self) -> usize {
        self.y.iter().filter(|&&v| v > 0.5).count()
    }

    /// Returns the rows at `indices`, in the given order.
    pub fn subset(&self, indices: &[usize]) -> CohortData {
        CohortData {
            ids: indices.iter().map(|&i| self.ids[i].clone()).collect(),
            feature_names: self.feature_names.clone(),
            x: self.x.select(Axis(0), indices),
            y: self.y.select(Axis(0), indices),
            risk: self.risk.select(Axis(0), indices),
        }
    }

    /// The feature matrix with columns reordered to match `wanted`.
    pub fn aligned_features(&self, wanted: &[String]) -> Result<Array2<f64>, DataError> {
        align_columns(&self.feature_names, self.x.view(), wanted)
    }
}

/// Unlabelled stays, used for prediction.
#[derive(Debug, Clone)]
pub struct FeatureData {
    pub ids: Vec<String>,
    pub feature_names: Vec<String>,
    pub x: Array2<f64>,
}

impl FeatureData {
    pub fn aligned_features(&self, wanted: &[String]) -> Result<Array2<f64>, DataError> {
        align_columns(&self.feature_names, self.x.view(), wanted)
    }
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing or null values were found in the required column '{0}'.")]
    MissingValuesFound(String),
    #[error("Infinite values were found in the column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("The outcome column '{column}' must be binary (0/1), found {value} at row {row}.")]
    NonBinaryOutcome {
        column: String,
        value: f64,
        row: usize,
    },
    #[error("The identifier '{0}' appears more than once.")]
    DuplicateId(String),
    #[error("The stay '{0}' has features but no matching row in the label file.")]
    UnmatchedId(String),
    #[error("Input file contains only {found} data rows, but at least {required} are required.")]
    InsufficientRows { found: usize, required: usize },
    #[error("The input file contains no feature columns.")]
    NoFeatures,
}

/// Loads a single table holding identifier, outcome, risk and feature columns.
pub fn load_cohort_data(path: &str, columns: &ColumnSpec) -> Result<CohortData, DataError> {
    let df = internal::read_frame(path)?;
    internal::require_columns(&df, &[&columns.id, &columns.outcome, &columns.risk])?;

    let ids = internal::extract_ids(&df, &columns.id)?;
    let y = internal::extract_outcome(&df, &columns.outcome)?;
    let risk = internal::extract_required_numeric(&df, &columns.risk)?;
    let (feature_names, x) = internal::extract_features(&df, columns)?;

    log::info!(
        "Loaded {} stays with {} features from '{}'",
        ids.len(),
        feature_names.len(),
        path
    );
    Ok(CohortData {
        ids,
        feature_names,
        x,
        y: Array1::from_vec(y),
        risk: Array1::from_vec(risk),
    })
}

/// Loads features from one table and outcome/risk from another, joining the two
/// on the identifier column. Row order follows the feature table.
pub fn load_cohort_data_with_labels(
    features_path: &str,
    labels_path: &str,
    columns: &ColumnSpec,
) -> Result<CohortData, DataError> {
    let features = internal::read_frame(features_path)?;
    let labels = internal::read_frame(labels_path)?;
    internal::require_columns(&features, &[&columns.id])?;
    internal::require_columns(&labels, &[&columns.id, &columns.outcome, &columns.risk])?;

    let ids = internal::extract_ids(&features, &columns.id)?;
    let label_ids = internal::extract_ids(&labels, &columns.id)?;
    let label_y = internal::extract_outcome(&labels, &columns.outcome)?;
    let label_risk = internal::extract_required_numeric(&labels, &columns.risk)?;

    let lookup: HashMap<&str, usize> = label_ids
        .iter()
        .enumerate()
        .map(|(row, id)| (id.as_str(), row))
        .collect();

    let mut y = Vec::with_capacity(ids.len());
    let mut risk = Vec::with_capacity(ids.len());
    for id in &ids {
        let row = *lookup
            .get(id.as_str())
            .ok_or_else(|| DataError::UnmatchedId(id.clone()))?;
        y.push(label_y[row]);
        risk.push(label_risk[row]);
    }

    let (feature_names, x) = internal::extract_features(&features, columns)?;
    log::info!(
        "Joined {} stays ({} features) from '{}' with labels from '{}'",
        ids.len(),
        feature_names.len(),
        features_path,
        labels_path
    );
    Ok(CohortData {
        ids,
        feature_names,
        x,
        y: Array1::from_vec(y),
        risk: Array1::from_vec(risk),
    })
}

/// Loads identifier and feature columns only. Outcome, risk and excluded
/// columns are dropped when present.
pub fn load_feature_data(path: &str, columns: &ColumnSpec) -> Result<FeatureData, DataError> {
    let df = internal::read_frame(path)?;
    internal::require_columns(&df, &[&columns.id])?;
    let ids = internal::extract_ids(&df, &columns.id)?;
    let (feature_names, x) = internal::extract_features(&df, columns)?;
    Ok(FeatureData {
        ids,
        feature_names,
        x,
    })
}

/// Selects the columns named in `wanted` from `x`, in that order.
fn align_columns(
    names: &[String],
    x: ArrayView2<f64>,
    wanted: &[String],
) -> Result<Array2<f64>, DataError> {
    let positions: HashMap<&str, usize> = names
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), i))
        .collect();
    let indices = wanted
        .iter()
        .map(|name| {
            positions
                .get(name.as_str())
                .copied()
                .ok_or_else(|| DataError::ColumnNotFound(name.clone()))
        })
        .collect::<Result<Vec<usize>, DataError>>()?;
    Ok(x.select(Axis(1), &indices))
}

/// Internal module for shared data loading logic.
mod internal {
    use super::*;

    pub(super) const MINIMUM_ROWS: usize = 10;

    fn separator_for(path: &str) -> u8 {
        let is_csv = Path::new(path)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        if is_csv { b',' } else { b'\t' }
    }

    pub(super) fn read_frame(path: &str) -> Result<DataFrame, DataError> {
        log::debug!("Reading table '{path}'");
        let df = CsvReader::new(File::open(Path::new(path))?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_infer_schema_length(Some(10_000))
                    .with_parse_options(
                        CsvParseOptions::default()
                            .with_separator(separator_for(path))
                            .with_null_values(Some(NullValues::AllColumns(vec![
                                "NA".into(),
                                "".into(),
                            ]))),
                    ),
            )
            .finish()?;

        if df.height() < MINIMUM_ROWS {
            return Err(DataError::InsufficientRows {
                found: df.height(),
                required: MINIMUM_ROWS,
            });
        }
        Ok(df)
    }

    pub(super) fn require_columns(df: &DataFrame, required: &[&String]) -> Result<(), DataError> {
        let present: HashSet<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        for name in required {
            if !present.contains(name.as_str()) {
                return Err(DataError::ColumnNotFound((*name).clone()));
            }
        }
        Ok(())
    }

    pub(super) fn extract_ids(df: &DataFrame, column_name: &str) -> Result<Vec<String>, DataError> {
        let column = df.column(column_name)?;
        if column.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }
        let casted = column.cast(&DataType::String)?;
        let ids: Vec<String> = casted
            .str()?
            .into_iter()
            .map(|v| v.unwrap_or_default().to_string())
            .collect();

        let mut seen = HashSet::with_capacity(ids.len());
        for id in &ids {
            if !seen.insert(id.as_str()) {
                return Err(DataError::DuplicateId(id.clone()));
            }
        }
        Ok(ids)
    }

    /// Casts a column to f64, keeping nulls as `None`.
    fn cast_numeric(df: &DataFrame, column_name: &str) -> Result<Vec<Option<f64>>, DataError> {
        let column = df.column(column_name)?;
        let casted = column
            .cast(&DataType::Float64)
            .map_err(|_| DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", column.dtype()),
            })?;

        // A non-strict cast turns unparsable text into nulls.
        if casted.null_count() > column.null_count() {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", column.dtype()),
            });
        }

        let values: Vec<Option<f64>> = casted.f64()?.into_iter().collect();
        if values.iter().flatten().any(|v| v.is_infinite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(values)
    }

    pub(super) fn extract_required_numeric(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<f64>, DataError> {
        cast_numeric(df, column_name)?
            .into_iter()
            .map(|v| match v {
                Some(value) if !value.is_nan() => Ok(value),
                _ => Err(DataError::MissingValuesFound(column_name.to_string())),
            })
            .collect()
    }

    pub(super) fn extract_outcome(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
        let values = extract_required_numeric(df, column_name)?;
        for (row, &value) in values.iter().enumerate() {
            if value != 0.0 && value != 1.0 {
                return Err(DataError::NonBinaryOutcome {
                    column: column_name.to_string(),
                    value,
                    row: row + 1,
                });
            }
        }
        Ok(values)
    }

    pub(super) fn extract_features(
        df: &DataFrame,
        columns: &ColumnSpec,
    ) -> Result<(Vec<String>, Array2<f64>), DataError> {
        let feature_names: Vec<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .filter(|name| !columns.is_structural(name))
            .collect();
        if feature_names.is_empty() {
            return Err(DataError::NoFeatures);
        }

        let feature_columns = feature_names
            .iter()
            .map(|name| {
                cast_numeric(df, name)
                    .map(|values| values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
            })
            .collect::<Result<Vec<Vec<f64>>, DataError>>()?;

        let missing: usize = feature_columns
            .iter()
            .map(|col| col.iter().filter(|v| v.is_nan()).count())
            .sum();
        if missing > 0 {
            log::info!("{missing} missing feature values will be imputed by the model pipelines");
        }

        let x = Array2::from_shape_fn((df.height(), feature_names.len()), |(i, j)| {
            feature_columns[j][i]
        });
        Ok((feature_names, x))
    }
}

//! Partitioning of ICU stays into the cohorts models are trained on.
//!
//! The high-risk cohort holds every stay whose reference risk is at or above a
//! threshold. The control cohort is a uniform sample without replacement of the
//! same size, drawn from the whole population so its case mix is unconstrained.

use crate::data::CohortData;
use ndarray::ArrayView1;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_RISK_THRESHOLD: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CohortKind {
    Full,
    HighRisk,
    Control,
}

impl CohortKind {
    pub const ALL: [CohortKind; 3] = [CohortKind::Full, CohortKind::HighRisk, CohortKind::Control];

    pub fn as_str(&self) -> &'static str {
        match self {
            CohortKind::Full => "full",
            CohortKind::HighRisk => "high_risk",
            CohortKind::Control => "control",
        }
    }
}

impl fmt::Display for CohortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CohortError {
    #[error("The {0} cohort is empty; no stay has a risk at or above the threshold.")]
    EmptyCohort(CohortKind),
    #[error("Risk threshold must lie strictly between 0 and 1, got {0}.")]
    InvalidThreshold(f64),
}

/// Row indices of the derived cohorts, both sorted ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CohortSplit {
    pub high_risk: Vec<usize>,
    pub control: Vec<usize>,
}

impl CohortSplit {
    /// Row indices of `kind` in a population of `n_rows` stays.
    pub fn indices(&self, kind: CohortKind, n_rows: usize) -> Vec<usize> {
        match kind {
            CohortKind::Full => (0..n_rows).collect(),
            CohortKind::HighRisk => self.high_risk.clone(),
            CohortKind::Control => self.control.clone(),
        }
    }
}

/// Selects the high-risk rows (`risk >= threshold`) and a seeded control sample
/// of equal size from all rows.
pub fn select_cohorts(
    risk: ArrayView1<f64>,
    threshold: f64,
    seed: u64,
) -> Result<CohortSplit, CohortError> {
    if !(threshold > 0.0 && threshold < 1.0) {
        return Err(CohortError::InvalidThreshold(threshold));
    }
    let high_risk: Vec<usize> = risk
        .iter()
        .enumerate()
        .filter(|&(_, &r)| r >= threshold)
        .map(|(i, _)| i)
        .collect();

    if high_risk.is_empty() {
        log::warn!("No stay has risk >= {threshold}; the high-risk and control cohorts are empty");
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut control = index::sample(&mut rng, risk.len(), high_risk.len()).into_vec();
    control.sort_unstable();

    log::info!(
        "Selected {} high-risk stays (risk >= {threshold}) and {} control stays out of {}",
        high_risk.len(),
        control.len(),
        risk.len()
    );
    Ok(CohortSplit { high_risk, control })
}

/// Materializes the rows of one cohort. Empty cohorts are an error since no model
/// can be trained on them.
pub fn cohort_data(
    data: &CohortData,
    split: &CohortSplit,
    kind: CohortKind,
) -> Result<CohortData, CohortError> {
    let indices = split.indices(kind, data.n_rows());
    if indices.is_empty() {
        return Err(CohortError::EmptyCohort(kind));
    }
    Ok(match kind {
        CohortKind::Full => data.clone(),
        _ => data.subset(&indices),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2, array};
    use rand::Rng;

    fn random_risk(n: usize, seed: u64) -> Array1<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array1::from_shape_fn(n, |_| rng.r#gen::<f64>().powi(3))
    }

    #[test]
    fn high_risk_is_every_row_at_or_above_threshold() {
        let risk = array![0.05, 0.10, 0.5, 0.099, 0.2];
        let split = select_cohorts(risk.view(), 0.10, 42).unwrap();
        assert_eq!(split.high_risk, vec![1, 2, 4]);
        assert_eq!(split.control.len(), 3);
    }

    #[test]
    fn control_matches_high_risk_size_and_is_distinct() {
        let risk = random_risk(500, 7);
        let expected = risk.iter().filter(|&&r| r >= 0.10).count();
        let split = select_cohorts(risk.view(), 0.10, 42).unwrap();

        assert_eq!(split.high_risk.len(), expected);
        assert_eq!(split.control.len(), expected);
        assert!(split.control.windows(2).all(|w| w[0] < w[1]));
        assert!(split.control.iter().all(|&i| i < 500));
    }

    #[test]
    fn selection_is_deterministic_for_a_seed() {
        let risk = random_risk(300, 3);
        let a = select_cohorts(risk.view(), 0.10, 42).unwrap();
        let b = select_cohorts(risk.view(), 0.10, 42).unwrap();
        assert_eq!(a, b);

        let c = select_cohorts(risk.view(), 0.10, 43).unwrap();
        assert_eq!(a.high_risk, c.high_risk);
        assert_ne!(a.control, c.control);
    }

    #[test]
    fn empty_selection_gives_empty_cohorts() {
        let risk = array![0.01, 0.02, 0.03];
        let split = select_cohorts(risk.view(), 0.10, 42).unwrap();
        assert!(split.high_risk.is_empty());
        assert!(split.control.is_empty());

        let data = CohortData {
            ids: vec!["a".into(), "b".into(), "c".into()],
            feature_names: vec!["f".into()],
            x: Array2::zeros((3, 1)),
            y: array![0.0, 1.0, 0.0],
            risk,
        };
        assert_eq!(
            cohort_data(&data, &split, CohortKind::HighRisk).unwrap_err(),
            CohortError::EmptyCohort(CohortKind::HighRisk)
        );
        assert_eq!(cohort_data(&data, &split, CohortKind::Full).unwrap().n_rows(), 3);
    }

    #[test]
    fn cohort_data_selects_rows() {
        let risk = array![0.5, 0.01, 0.3, 0.02];
        let data = CohortData {
            ids: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            feature_names: vec!["f".into()],
            x: array![[1.0], [2.0], [3.0], [4.0]],
            y: array![1.0, 0.0, 1.0, 0.0],
            risk: risk.clone(),
        };
        let split = select_cohorts(risk.view(), 0.10, 42).unwrap();
        let high = cohort_data(&data, &split, CohortKind::HighRisk).unwrap();
        assert_eq!(high.ids, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(high.x, array![[1.0], [3.0]]);
    }

    #[test]
    fn rejects_threshold_outside_unit_interval() {
        let risk = array![0.5];
        assert_eq!(
            select_cohorts(risk.view(), 1.5, 42).unwrap_err(),
            CohortError::InvalidThreshold(1.5)
        );
    }

    #[test]
    fn kind_names_serialize_as_snake_case() {
        for kind in CohortKind::ALL {
            let text = toml::to_string(&std::collections::BTreeMap::from([("k", kind)])).unwrap();
            assert!(text.contains(kind.as_str()));
        }
    }
}

//! # Cross-Validated Hyperparameter Search
//!
//! Both severity models are tuned the same way: every candidate configuration is
//! fitted on the training part of each stratified fold, scored on the held-out
//! part, and ranked by its mean fold score. The winner is refit on all rows.
//!
//! Candidates and folds are independent, so the full (candidate x fold) grid is
//! evaluated on the rayon thread pool.

use crate::boost::{BoostParams, BoostSettings, BoostedEnsemble};
use crate::linear::{FitError, LogisticPipeline, SolverSettings};
use crate::metrics::{self, MetricError};
use crate::progress::SearchProgressObserver;
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Cross-validation needs at least 2 folds, got {0}.")]
    TooFewFolds(usize),
    #[error(
        "Only {found} stays belong to the {class} class, fewer than the {folds} folds requested."
    )]
    InsufficientClassMembers {
        class: &'static str,
        found: usize,
        folds: usize,
    },
    #[error("The search has no candidate configurations.")]
    NoCandidates,
    #[error("Fitting candidate ({candidate}) failed: {source}")]
    Fit {
        candidate: String,
        #[source]
        source: FitError,
    },
    #[error("Scoring a fold failed: {0}")]
    Metric(#[from] MetricError),
}

/// The metric candidates are ranked by. Higher is always better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scoring {
    RocAuc,
    NegLogLoss,
}

impl Scoring {
    pub fn name(&self) -> &'static str {
        match self {
            Scoring::RocAuc => "roc_auc",
            Scoring::NegLogLoss => "neg_log_loss",
        }
    }

    pub fn score(&self, y: ArrayView1<f64>, p: ArrayView1<f64>) -> Result<f64, MetricError> {
        match self {
            Scoring::RocAuc => metrics::roc_auc(y, p),
            Scoring::NegLogLoss => metrics::log_loss(y, p).map(|loss| -loss),
        }
    }
}

impl fmt::Display for Scoring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Row indices of one cross-validation split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Splits rows into `k` folds that preserve the class balance of `y`.
///
/// Rows are not shuffled. Test-fold sizes per class are allocated by dealing
/// the class-sorted labels round-robin over the folds, and each class then fills
/// its folds with consecutive members in row order. Every class must have at
/// least `k` members so each test fold contains both.
pub fn stratified_k_fold(y: ArrayView1<f64>, k: usize) -> Result<Vec<Fold>, SearchError> {
    if k < 2 {
        return Err(SearchError::TooFewFolds(k));
    }
    let members: [Vec<usize>; 2] = [
        (0..y.len()).filter(|&i| y[i] <= 0.5).collect(),
        (0..y.len()).filter(|&i| y[i] > 0.5).collect(),
    ];
    for (class, rows) in ["survivor", "death"].into_iter().zip(members.iter()) {
        if rows.len() < k {
            return Err(SearchError::InsufficientClassMembers {
                class,
                found: rows.len(),
                folds: k,
            });
        }
    }

    let mut allocation = vec![[0usize; 2]; k];
    let sorted_classes = std::iter::repeat_n(0, members[0].len())
        .chain(std::iter::repeat_n(1, members[1].len()));
    for (position, class) in sorted_classes.enumerate() {
        allocation[position % k][class] += 1;
    }

    let mut test_fold = vec![0usize; y.len()];
    for (class, rows) in members.iter().enumerate() {
        let fold_ids = (0..k).flat_map(|fold| std::iter::repeat_n(fold, allocation[fold][class]));
        for (&row, fold) in rows.iter().zip(fold_ids) {
            test_fold[row] = fold;
        }
    }

    Ok((0..k)
        .map(|fold| {
            let (test, train): (Vec<usize>, Vec<usize>) =
                (0..y.len()).partition(|&row| test_fold[row] == fold);
            Fold { train, test }
        })
        .collect())
}

/// `n` values evenly spaced on a log10 scale from `lo` to `hi` inclusive.
pub fn log_grid(lo: f64, hi: f64, n: usize) -> Vec<f64> {
    let (a, b) = (lo.log10(), hi.log10());
    match n {
        0 => Vec::new(),
        1 => vec![lo],
        _ => (0..n)
            .map(|i| 10f64.powf(a + (b - a) * i as f64 / (n - 1) as f64))
            .collect(),
    }
}

/// A fitted model that outputs mortality probabilities.
pub trait Classifier {
    fn predict_proba(&self, x: ArrayView2<f64>) -> Array1<f64>;
}

impl Classifier for LogisticPipeline {
    fn predict_proba(&self, x: ArrayView2<f64>) -> Array1<f64> {
        LogisticPipeline::predict_proba(self, x)
    }
}

impl Classifier for BoostedEnsemble {
    fn predict_proba(&self, x: ArrayView2<f64>) -> Array1<f64> {
        BoostedEnsemble::predict_proba(self, x)
    }
}

/// Fits one model family for a given hyperparameter configuration.
pub trait Trainer: Sync {
    type Params: Clone + Send + Sync + fmt::Display;
    type Model: Classifier + Send;

    fn fit(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        params: &Self::Params,
    ) -> Result<Self::Model, FitError>;
}

/// The tuned parameter of the logistic pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogisticParams {
    /// Inverse L2 penalty strength.
    pub c: f64,
}

impl fmt::Display for LogisticParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C={:.4e}", self.c)
    }
}

pub struct LogisticTrainer {
    pub settings: SolverSettings,
}

impl Trainer for LogisticTrainer {
    type Params = LogisticParams;
    type Model = LogisticPipeline;

    fn fit(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        params: &LogisticParams,
    ) -> Result<LogisticPipeline, FitError> {
        LogisticPipeline::fit(x, y, params.c, &self.settings)
    }
}

pub struct BoostTrainer {
    pub settings: BoostSettings,
}

impl Trainer for BoostTrainer {
    type Params = BoostParams;
    type Model = BoostedEnsemble;

    fn fit(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        params: &BoostParams,
    ) -> Result<BoostedEnsemble, FitError> {
        BoostedEnsemble::fit(x, y, params, &self.settings)
    }
}

/// Cross-validated performance of one candidate.
#[derive(Debug, Clone)]
pub struct CandidateScore<P> {
    pub params: P,
    pub fold_scores: Vec<f64>,
    pub mean_score: f64,
    /// Population standard deviation of the fold scores.
    pub std_score: f64,
}

#[derive(Debug, Clone)]
pub struct SearchResult<P> {
    pub scoring: Scoring,
    pub candidates: Vec<CandidateScore<P>>,
    pub best_index: usize,
}

impl<P> SearchResult<P> {
    pub fn best(&self) -> &CandidateScore<P> {
        &self.candidates[self.best_index]
    }
}

/// Index of the highest mean score. The earliest candidate wins ties.
fn best_candidate<P>(candidates: &[CandidateScore<P>]) -> usize {
    let mut best = 0;
    for (i, candidate) in candidates.iter().enumerate().skip(1) {
        if candidate.mean_score > candidates[best].mean_score {
            best = i;
        }
    }
    best
}

fn summarize(scores: &[f64]) -> (f64, f64) {
    let n = scores.len() as f64;
    let mean = scores.iter().sum::<f64>() / n;
    let var = scores.iter().map(|s| (s - mean) * (s - mean)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Scores every candidate on every fold.
#[allow(clippy::too_many_arguments)]
pub fn search<T: Trainer>(
    trainer: &T,
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    candidates: &[T::Params],
    folds: &[Fold],
    scoring: Scoring,
    progress: &dyn SearchProgressObserver,
    label: &str,
) -> Result<SearchResult<T::Params>, SearchError> {
    if candidates.is_empty() {
        return Err(SearchError::NoCandidates);
    }
    progress.on_search_start(label, candidates.len());

    let scored = candidates
        .par_iter()
        .map(|params| -> Result<CandidateScore<T::Params>, SearchError> {
            let fold_scores = folds
                .par_iter()
                .map(|fold| -> Result<f64, SearchError> {
                    let x_train = x.select(Axis(0), &fold.train);
                    let y_train = y.select(Axis(0), &fold.train);
                    let model = trainer
                        .fit(x_train.view(), y_train.view(), params)
                        .map_err(|source| SearchError::Fit {
                            candidate: params.to_string(),
                            source,
                        })?;
                    let x_test = x.select(Axis(0), &fold.test);
                    let y_test = y.select(Axis(0), &fold.test);
                    let probs = model.predict_proba(x_test.view());
                    Ok(scoring.score(y_test.view(), probs.view())?)
                })
                .collect::<Result<Vec<f64>, SearchError>>()?;
            progress.on_candidate_finished(label);

            let (mean_score, std_score) = summarize(&fold_scores);
            log::debug!("{label}: {params} -> {scoring} {mean_score:.4} (+/- {std_score:.4})");
            Ok(CandidateScore {
                params: params.clone(),
                fold_scores,
                mean_score,
                std_score,
            })
        })
        .collect::<Result<Vec<_>, SearchError>>();
    progress.on_search_finish(label);
    let candidates = scored?;

    let best_index = best_candidate(&candidates);
    let best = &candidates[best_index];
    log::info!(
        "{label}: best {scoring} {:.4} (+/- {:.4}) with {} over {} candidates",
        best.mean_score,
        best.std_score,
        best.params,
        candidates.len()
    );
    Ok(SearchResult {
        scoring,
        candidates,
        best_index,
    })
}

/// Searches the candidates, then refits the winning configuration on every row.
#[allow(clippy::too_many_arguments)]
pub fn tune<T: Trainer>(
    trainer: &T,
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    candidates: &[T::Params],
    folds: &[Fold],
    scoring: Scoring,
    progress: &dyn SearchProgressObserver,
    label: &str,
) -> Result<(T::Model, SearchResult<T::Params>), SearchError> {
    let result = search(trainer, x, y, candidates, folds, scoring, progress, label)?;
    let params = &result.best().params;
    let model = trainer
        .fit(x, y, params)
        .map_err(|source| SearchError::Fit {
            candidate: params.to_string(),
            source,
        })?;
    Ok((model, result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::sigmoid;
    use crate::progress::NoopSearchProgress;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, Normal};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn simulate(n: usize, seed: u64) -> (Array2<f64>, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let x = Array2::from_shape_fn((n, 3), |_| normal.sample(&mut rng));
        let y = x
            .rows()
            .into_iter()
            .map(|row| {
                let p = sigmoid(-0.5 + 1.2 * row[0] - 0.7 * row[1]);
                if rng.r#gen::<f64>() < p { 1.0 } else { 0.0 }
            })
            .collect::<Array1<f64>>();
        (x, y)
    }

    #[test]
    fn stratified_folds_partition_rows_and_keep_both_classes() {
        let y = Array1::from_shape_fn(53, |i| if i % 4 == 0 { 1.0 } else { 0.0 });
        let folds = stratified_k_fold(y.view(), 5).unwrap();
        assert_eq!(folds.len(), 5);

        let mut seen = vec![0usize; y.len()];
        for fold in &folds {
            assert_eq!(fold.train.len() + fold.test.len(), y.len());
            for &row in &fold.test {
                seen[row] += 1;
                assert!(!fold.train.contains(&row));
            }
            let deaths = fold.test.iter().filter(|&&r| y[r] > 0.5).count();
            assert!((2..=3).contains(&deaths), "fold has {deaths} deaths");
            assert!(deaths < fold.test.len());
        }
        assert!(seen.iter().all(|&count| count == 1));
    }

    #[test]
    fn stratified_folds_need_enough_members_per_class() {
        let y = array![1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        assert!(matches!(
            stratified_k_fold(y.view(), 3),
            Err(SearchError::InsufficientClassMembers {
                class: "death",
                found: 2,
                folds: 3
            })
        ));
        assert!(matches!(
            stratified_k_fold(y.view(), 1),
            Err(SearchError::TooFewFolds(1))
        ));
    }

    #[test]
    fn log_grid_spans_endpoints() {
        let grid = log_grid(1e-4, 1e4, 10);
        assert_eq!(grid.len(), 10);
        assert_abs_diff_eq!(grid[0], 1e-4, epsilon = 1e-12);
        assert_abs_diff_eq!(grid[9], 1e4, epsilon = 1e-6);
        assert!(grid.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(log_grid(0.5, 2.0, 1), vec![0.5]);
    }

    #[test]
    fn best_score_dominates_every_candidate() {
        let (x, y) = simulate(300, 11);
        let folds = stratified_k_fold(y.view(), 5).unwrap();
        let candidates: Vec<LogisticParams> = log_grid(1e-4, 1e4, 6)
            .into_iter()
            .map(|c| LogisticParams { c })
            .collect();
        let trainer = LogisticTrainer {
            settings: SolverSettings::default(),
        };

        for scoring in [Scoring::RocAuc, Scoring::NegLogLoss] {
            let result = search(
                &trainer,
                x.view(),
                y.view(),
                &candidates,
                &folds,
                scoring,
                &NoopSearchProgress,
                "logistic",
            )
            .unwrap();
            let best = result.best();
            assert_eq!(best.fold_scores.len(), 5);
            for candidate in &result.candidates {
                assert!(best.mean_score >= candidate.mean_score);
            }
        }
    }

    struct ConstantModel;

    impl Classifier for ConstantModel {
        fn predict_proba(&self, x: ArrayView2<f64>) -> Array1<f64> {
            Array1::from_elem(x.nrows(), 0.5)
        }
    }

    struct ConstantTrainer;

    impl Trainer for ConstantTrainer {
        type Params = usize;
        type Model = ConstantModel;

        fn fit(
            &self,
            x: ArrayView2<f64>,
            y: ArrayView1<f64>,
            params: &usize,
        ) -> Result<ConstantModel, FitError> {
            let _ = (x, y, params);
            Ok(ConstantModel)
        }
    }

    struct CountingProgress {
        started: AtomicUsize,
        finished: AtomicUsize,
    }

    impl SearchProgressObserver for CountingProgress {
        fn on_search_start(&self, label: &str, total_candidates: usize) {
            let _ = label;
            self.started.store(total_candidates, Ordering::SeqCst);
        }
        fn on_candidate_finished(&self, label: &str) {
            let _ = label;
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn ties_go_to_the_first_candidate_and_progress_is_reported() {
        let (x, y) = simulate(60, 5);
        let folds = stratified_k_fold(y.view(), 3).unwrap();
        let progress = CountingProgress {
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        };
        let result = search(
            &ConstantTrainer,
            x.view(),
            y.view(),
            &[7, 8, 9],
            &folds,
            Scoring::RocAuc,
            &progress,
            "constant",
        )
        .unwrap();
        assert_eq!(result.best_index, 0);
        assert_abs_diff_eq!(result.best().mean_score, 0.5);
        assert_abs_diff_eq!(result.best().std_score, 0.0);
        assert_eq!(progress.started.load(Ordering::SeqCst), 3);
        assert_eq!(progress.finished.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn tune_refits_the_winner_on_all_rows() {
        let (x, y) = simulate(200, 2);
        let folds = stratified_k_fold(y.view(), 4).unwrap();
        let candidates = [
            BoostParams {
                n_estimators: 10,
                max_depth: 2,
                ..BoostParams::default()
            },
            BoostParams {
                n_estimators: 20,
                max_depth: 3,
                learning_rate: 0.1,
                ..BoostParams::default()
            },
        ];
        let trainer = BoostTrainer {
            settings: BoostSettings::default(),
        };
        let (model, result) = tune(
            &trainer,
            x.view(),
            y.view(),
            &candidates,
            &folds,
            Scoring::RocAuc,
            &NoopSearchProgress,
            "boosted",
        )
        .unwrap();
        assert_eq!(model.params, result.best().params);
        let probs = model.predict_proba(x.view());
        assert_eq!(probs.len(), 200);
        assert!(probs.iter().all(|&p| (0.0..=1.0).contains(&p)));
    }

    #[test]
    fn empty_candidate_list_is_rejected() {
        let (x, y) = simulate(40, 1);
        let folds = stratified_k_fold(y.view(), 2).unwrap();
        let trainer = LogisticTrainer {
            settings: SolverSettings::default(),
        };
        assert!(matches!(
            search(
                &trainer,
                x.view(),
                y.view(),
                &[],
                &folds,
                Scoring::RocAuc,
                &NoopSearchProgress,
                "empty",
            ),
            Err(SearchError::NoCandidates)
        ));
    }
}

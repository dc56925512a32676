//! # Gradient-Boosted Trees
//!
//! A binary classifier built from an additive ensemble of regression trees fit
//! to the log-loss gradient. Each round computes per-row gradients
//! `g = p - y` and hessians `h = p (1 - p)`, grows one tree greedily, and adds
//! `learning_rate * (-G / (H + lambda))` at every leaf.
//!
//! Split finding is histogram based: every feature is quantized once per fit
//! into at most `max_bins` quantile bins, with a dedicated bin for missing
//! values. Each split also learns the direction (left or right) that missing
//! values take, so the model never needs imputation.
//!
//! Trees store raw thresholds (`value <= threshold` goes left), so prediction
//! works directly on unbinned feature rows.

use crate::linear::{FitError, sigmoid, validate_training_set};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;
use serde::{Deserialize, Serialize};
use std::fmt;

const MIN_HESSIAN: f64 = 1e-16;
const MIN_SPLIT_GAIN: f64 = 1e-12;

/// The tuned hyperparameters of a boosted ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoostParams {
    pub learning_rate: f64,
    pub max_depth: usize,
    /// Minimum hessian sum required in each child.
    pub min_child_weight: f64,
    /// Fraction of rows drawn (without replacement) for each tree.
    pub subsample: f64,
    /// Fraction of features drawn for each tree.
    pub colsample_bytree: f64,
    pub n_estimators: usize,
}

impl Default for BoostParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.3,
            max_depth: 6,
            min_child_weight: 1.0,
            subsample: 1.0,
            colsample_bytree: 1.0,
            n_estimators: 100,
        }
    }
}

impl BoostParams {
    pub fn validate(&self) -> Result<(), FitError> {
        let fraction_ok = |v: f64| v > 0.0 && v <= 1.0;
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(FitError::InvalidParameter(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !fraction_ok(self.subsample) || !fraction_ok(self.colsample_bytree) {
            return Err(FitError::InvalidParameter(format!(
                "subsample and colsample_bytree must lie in (0, 1], got {} and {}",
                self.subsample, self.colsample_bytree
            )));
        }
        if self.min_child_weight < 0.0 {
            return Err(FitError::InvalidParameter(format!(
                "min_child_weight must be non-negative, got {}",
                self.min_child_weight
            )));
        }
        Ok(())
    }
}

impl fmt::Display for BoostParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "learning_rate={:.4}, max_depth={}, min_child_weight={:.2}, subsample={:.2}, colsample_bytree={:.2}, n_estimators={}",
            self.learning_rate,
            self.max_depth,
            self.min_child_weight,
            self.subsample,
            self.colsample_bytree,
            self.n_estimators
        )
    }
}

/// Fixed (untuned) settings of the boosting procedure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoostSettings {
    /// L2 regularization on leaf weights.
    pub reg_lambda: f64,
    pub max_bins: usize,
    pub seed: u64,
}

impl Default for BoostSettings {
    fn default() -> Self {
        Self {
            reg_lambda: 1.0,
            max_bins: 256,
            seed: 42,
        }
    }
}

/// The distributions randomized search draws hyperparameters from. Ranges are
/// inclusive; the learning rate is drawn log-uniformly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BoostSearchSpace {
    pub learning_rate: (f64, f64),
    pub max_depth: (usize, usize),
    pub min_child_weight: (f64, f64),
    pub subsample: (f64, f64),
    pub colsample_bytree: (f64, f64),
    pub n_estimators: (usize, usize),
}

impl Default for BoostSearchSpace {
    fn default() -> Self {
        Self {
            learning_rate: (0.01, 0.3),
            max_depth: (2, 8),
            min_child_weight: (1.0, 10.0),
            subsample: (0.5, 1.0),
            colsample_bytree: (0.5, 1.0),
            n_estimators: (50, 500),
        }
    }
}

impl BoostSearchSpace {
    /// Draws `n_iter` configurations. The same seed always yields the same draws.
    pub fn sample(&self, n_iter: usize, seed: u64) -> Vec<BoostParams> {
        let mut rng = StdRng::seed_from_u64(seed);
        let (lr_lo, lr_hi) = self.learning_rate;
        (0..n_iter)
            .map(|_| BoostParams {
                learning_rate: rng.gen_range(lr_lo.ln()..=lr_hi.ln()).exp(),
                max_depth: rng.gen_range(self.max_depth.0..=self.max_depth.1),
                min_child_weight: rng
                    .gen_range(self.min_child_weight.0..=self.min_child_weight.1),
                subsample: rng.gen_range(self.subsample.0..=self.subsample.1),
                colsample_bytree: rng
                    .gen_range(self.colsample_bytree.0..=self.colsample_bytree.1),
                n_estimators: rng.gen_range(self.n_estimators.0..=self.n_estimators.1),
            })
            .collect()
    }
}

/// One node of a regression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Split {
        feature: usize,
        threshold: f64,
        /// Direction taken by missing values.
        default_left: bool,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
    },
}

/// A regression tree stored as a flat node arena; node 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

impl Tree {
    pub fn predict_row(&self, row: ArrayView1<f64>) -> f64 {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature,
                    threshold,
                    default_left,
                    left,
                    right,
                } => {
                    let v = row[*feature];
                    let go_left = if v.is_nan() { *default_left } else { v <= *threshold };
                    index = if go_left { *left } else { *right };
                }
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], index: usize) -> usize {
            match &nodes[index] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        walk(&self.nodes, 0)
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Node::Leaf { .. }))
            .count()
    }
}

/// The fitted tree-ensemble severity model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostedEnsemble {
    pub base_margin: f64,
    pub n_features: usize,
    pub params: BoostParams,
    pub settings: BoostSettings,
    pub trees: Vec<Tree>,
}

impl BoostedEnsemble {
    pub fn fit(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        params: &BoostParams,
        settings: &BoostSettings,
    ) -> Result<Self, FitError> {
        validate_training_set(x, y)?;
        params.validate()?;
        if settings.max_bins < 2 {
            return Err(FitError::InvalidParameter(format!(
                "max_bins must be at least 2, got {}",
                settings.max_bins
            )));
        }

        let (n, k) = x.dim();
        let mapper = BinMapper::fit(x, settings.max_bins);
        let binned = mapper.transform(x);
        let mut rng = StdRng::seed_from_u64(settings.seed);

        // The initial margin is the log-odds of the training prevalence.
        let prevalence = y.mean().unwrap_or(0.5).clamp(1e-6, 1.0 - 1e-6);
        let base_margin = (prevalence / (1.0 - prevalence)).ln();
        let mut margin = Array1::from_elem(n, base_margin);

        let rows_per_tree = ((n as f64 * params.subsample).round() as usize).clamp(1, n);
        let features_per_tree = ((k as f64 * params.colsample_bytree).round() as usize).clamp(1, k);

        let mut trees = Vec::with_capacity(params.n_estimators);
        let mut grad = Array1::zeros(n);
        let mut hess = Array1::zeros(n);
        for round in 0..params.n_estimators {
            for i in 0..n {
                let p = sigmoid(margin[i]);
                grad[i] = p - y[i];
                hess[i] = (p * (1.0 - p)).max(MIN_HESSIAN);
            }

            let rows = draw_sorted(&mut rng, n, rows_per_tree);
            let features = draw_sorted(&mut rng, k, features_per_tree);

            let mut builder = TreeBuilder {
                binned: &binned,
                mapper: &mapper,
                grad: &grad,
                hess: &hess,
                features: &features,
                params,
                reg_lambda: settings.reg_lambda,
                nodes: Vec::new(),
            };
            builder.grow(rows, 0);
            let tree = Tree {
                nodes: builder.nodes,
            };

            for (i, row) in x.axis_iter(Axis(0)).enumerate() {
                margin[i] += tree.predict_row(row);
            }
            log::trace!(
                "Boosting round {round}: depth {}, {} leaves",
                tree.depth(),
                tree.n_leaves()
            );
            trees.push(tree);
        }

        Ok(Self {
            base_margin,
            n_features: k,
            params: *params,
            settings: *settings,
            trees,
        })
    }

    /// Raw log-odds for each row.
    pub fn margin(&self, x: ArrayView2<f64>) -> Array1<f64> {
        x.axis_iter(Axis(0))
            .map(|row| {
                self.base_margin + self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>()
            })
            .collect()
    }

    /// Predicted mortality probability for each row.
    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Array1<f64> {
        self.margin(x).mapv(sigmoid)
    }

    /// Number of splits using each feature, across all trees.
    pub fn split_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.n_features];
        for tree in &self.trees {
            for node in &tree.nodes {
                if let Node::Split { feature, .. } = node {
                    counts[*feature] += 1;
                }
            }
        }
        counts
    }
}

/// `amount` distinct indices from `0..length`, ascending. Draws nothing when the
/// whole range is requested.
fn draw_sorted(rng: &mut StdRng, length: usize, amount: usize) -> Vec<usize> {
    if amount >= length {
        return (0..length).collect();
    }
    let mut drawn = index::sample(rng, length, amount).into_vec();
    drawn.sort_unstable();
    drawn
}

/// Per-feature quantile cut points. Bin 0 holds missing values; bin `b >= 1`
/// holds values in `(cuts[b - 2], cuts[b - 1]]`.
struct BinMapper {
    cuts: Vec<Vec<f64>>,
}

impl BinMapper {
    fn fit(x: ArrayView2<f64>, max_bins: usize) -> Self {
        let cuts = x
            .columns()
            .into_iter()
            .map(|column| {
                let mut values: Vec<f64> = column.iter().copied().filter(|v| !v.is_nan()).collect();
                values.sort_by(f64::total_cmp);
                values.dedup();
                if values.len() <= max_bins {
                    values
                } else {
                    let len = values.len();
                    let mut cuts: Vec<f64> = (1..=max_bins)
                        .map(|b| values[(b * len).div_ceil(max_bins) - 1])
                        .collect();
                    cuts.dedup();
                    cuts
                }
            })
            .collect();
        Self { cuts }
    }

    fn n_bins(&self, feature: usize) -> usize {
        self.cuts[feature].len() + 1
    }

    fn bin(&self, feature: usize, value: f64) -> u16 {
        if value.is_nan() {
            return 0;
        }
        let cuts = &self.cuts[feature];
        let position = cuts.partition_point(|&c| c < value).min(cuts.len().saturating_sub(1));
        (position + 1) as u16
    }

    /// Upper bound of bin `b` (`b >= 1`). The last bin is unbounded, so a split
    /// there separates observed from missing values and anything above the
    /// training range still counts as observed.
    fn threshold(&self, feature: usize, b: usize) -> f64 {
        let cuts = &self.cuts[feature];
        if b >= cuts.len() {
            f64::INFINITY
        } else {
            cuts[b - 1]
        }
    }

    fn transform(&self, x: ArrayView2<f64>) -> Array2<u16> {
        Array2::from_shape_fn(x.dim(), |(i, j)| self.bin(j, x[[i, j]]))
    }
}

#[derive(Clone, Copy, Default)]
struct GradStats {
    grad: f64,
    hess: f64,
    count: usize,
}

impl GradStats {
    fn add(&mut self, g: f64, h: f64) {
        self.grad += g;
        self.hess += h;
        self.count += 1;
    }

    fn plus(self, other: GradStats) -> GradStats {
        GradStats {
            grad: self.grad + other.grad,
            hess: self.hess + other.hess,
            count: self.count + other.count,
        }
    }

    fn minus(self, other: GradStats) -> GradStats {
        GradStats {
            grad: self.grad - other.grad,
            hess: self.hess - other.hess,
            count: self.count - other.count,
        }
    }

    fn score(&self, lambda: f64) -> f64 {
        self.grad * self.grad / (self.hess + lambda)
    }
}

struct SplitCandidate {
    feature: usize,
    bin: usize,
    default_left: bool,
    gain: f64,
}

struct TreeBuilder<'a> {
    binned: &'a Array2<u16>,
    mapper: &'a BinMapper,
    grad: &'a Array1<f64>,
    hess: &'a Array1<f64>,
    features: &'a [usize],
    params: &'a BoostParams,
    reg_lambda: f64,
    nodes: Vec<Node>,
}

impl TreeBuilder<'_> {
    /// Grows the subtree for `rows` and returns its node index.
    fn grow(&mut self, rows: Vec<usize>, depth: usize) -> usize {
        let index = self.nodes.len();
        let mut total = GradStats::default();
        for &r in &rows {
            total.add(self.grad[r], self.hess[r]);
        }
        let leaf_value =
            -self.params.learning_rate * total.grad / (total.hess + self.reg_lambda);
        self.nodes.push(Node::Leaf { value: leaf_value });

        if depth >= self.params.max_depth || rows.len() < 2 {
            return index;
        }
        let Some(split) = self.best_split(&rows, total) else {
            return index;
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows.into_iter().partition(|&r| {
            let b = self.binned[[r, split.feature]] as usize;
            if b == 0 { split.default_left } else { b <= split.bin }
        });

        let left = self.grow(left_rows, depth + 1);
        let right = self.grow(right_rows, depth + 1);
        self.nodes[index] = Node::Split {
            feature: split.feature,
            threshold: self.mapper.threshold(split.feature, split.bin),
            default_left: split.default_left,
            left,
            right,
        };
        index
    }

    fn best_split(&self, rows: &[usize], total: GradStats) -> Option<SplitCandidate> {
        let lambda = self.reg_lambda;
        let parent_score = total.score(lambda);
        let min_child = self.params.min_child_weight;
        let mut best: Option<SplitCandidate> = None;

        for &feature in self.features {
            let n_bins = self.mapper.n_bins(feature);
            if n_bins < 2 {
                continue;
            }
            let mut histogram = vec![GradStats::default(); n_bins];
            for &r in rows {
                histogram[self.binned[[r, feature]] as usize].add(self.grad[r], self.hess[r]);
            }
            let missing = histogram[0];

            let mut left = GradStats::default();
            // The last bin is a candidate too: it sends every observed value left
            // and the missing ones right.
            for b in 1..n_bins {
                left = left.plus(histogram[b]);
                for default_left in [false, true] {
                    let l = if default_left { left.plus(missing) } else { left };
                    let r = total.minus(l);
                    if l.count == 0 || r.count == 0 || l.hess < min_child || r.hess < min_child {
                        continue;
                    }
                    let gain = 0.5 * (l.score(lambda) + r.score(lambda) - parent_score);
                    if gain > MIN_SPLIT_GAIN && best.as_ref().is_none_or(|s| gain > s.gain) {
                        best = Some(SplitCandidate {
                            feature,
                            bin: b,
                            default_left,
                            gain,
                        });
                    }
                }
            }
        }
        best
    }
}

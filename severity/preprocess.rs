//! Column-wise preprocessing for the linear pipeline: mean imputation followed by
//! standardization. Both transforms are learned on training rows only and stored
//! with the fitted model so prediction reproduces them exactly.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Replaces missing (`NaN`) entries with the training-column mean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeanImputer {
    pub means: Array1<f64>,
}

impl MeanImputer {
    /// Learns column means over the observed entries. A column with no observed
    /// entries imputes 0.
    pub fn fit(x: ArrayView2<f64>) -> Self {
        let means = x.map_axis(Axis(0), |column| {
            let (sum, count) = column
                .iter()
                .filter(|v| !v.is_nan())
                .fold((0.0, 0usize), |(s, c), &v| (s + v, c + 1));
            if count == 0 { 0.0 } else { sum / count as f64 }
        });
        let empty = x
            .columns()
            .into_iter()
            .filter(|column| column.iter().all(|v| v.is_nan()))
            .count();
        if empty > 0 {
            log::warn!("{empty} feature column(s) have no observed values; imputing 0");
        }
        Self { means }
    }

    pub fn transform(&self, x: ArrayView2<f64>) -> Array2<f64> {
        let mut out = x.to_owned();
        for (mut column, &mean) in out.axis_iter_mut(Axis(1)).zip(self.means.iter()) {
            column.mapv_inplace(|v| if v.is_nan() { mean } else { v });
        }
        out
    }
}

/// Centers each column and divides by its population standard deviation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Array1<f64>,
    pub scale: Array1<f64>,
}

impl StandardScaler {
    /// Expects complete (imputed) data. Constant columns keep a scale of 1.
    pub fn fit(x: ArrayView2<f64>) -> Self {
        let n = x.nrows().max(1) as f64;
        let mean = x.sum_axis(Axis(0)) / n;
        let scale = x
            .columns()
            .into_iter()
            .zip(mean.iter())
            .map(|(column, &m)| {
                let var = column.iter().map(|&v| (v - m) * (v - m)).sum::<f64>() / n;
                let sd = var.sqrt();
                if sd > f64::EPSILON * m.abs().max(1.0) { sd } else { 1.0 }
            })
            .collect::<Array1<f64>>();
        Self { mean, scale }
    }

    pub fn transform(&self, x: ArrayView2<f64>) -> Array2<f64> {
        (&x - &self.mean) / &self.scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn imputer_uses_observed_means() {
        let x = array![[1.0, f64::NAN], [3.0, 4.0], [f64::NAN, 8.0]];
        let imputer = MeanImputer::fit(x.view());
        assert_abs_diff_eq!(imputer.means[0], 2.0);
        assert_abs_diff_eq!(imputer.means[1], 6.0);

        let filled = imputer.transform(x.view());
        assert_abs_diff_eq!(filled[[2, 0]], 2.0);
        assert_abs_diff_eq!(filled[[0, 1]], 6.0);
        assert_abs_diff_eq!(filled[[1, 1]], 4.0);
    }

    #[test]
    fn imputer_handles_all_missing_column() {
        let x = array![[f64::NAN, 1.0], [f64::NAN, 2.0]];
        let imputer = MeanImputer::fit(x.view());
        let filled = imputer.transform(x.view());
        assert_abs_diff_eq!(filled[[0, 0]], 0.0);
        assert_abs_diff_eq!(filled[[1, 0]], 0.0);
    }

    #[test]
    fn scaler_standardizes_columns() {
        let x = array![[1.0, 5.0], [2.0, 5.0], [3.0, 5.0], [4.0, 5.0]];
        let scaler = StandardScaler::fit(x.view());
        let z = scaler.transform(x.view());

        let col0 = z.column(0);
        assert_abs_diff_eq!(col0.sum(), 0.0, epsilon = 1e-12);
        let var = col0.iter().map(|v| v * v).sum::<f64>() / 4.0;
        assert_abs_diff_eq!(var, 1.0, epsilon = 1e-12);

        // Constant column is centered but not rescaled.
        assert_abs_diff_eq!(scaler.scale[1], 1.0);
        assert!(z.column(1).iter().all(|&v| v.abs() < 1e-12));
    }
}

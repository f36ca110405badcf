// Numeric helpers shared by forecasting, anomaly detection and trend reporting

use serde::{Deserialize, Serialize};

/// Arithmetic mean, `None` for an empty slice
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Population standard deviation, `None` for an empty slice
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let mu = mean(values)?;
    let variance = values.iter().map(|v| (v - mu).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}

/// Fold the `count`-th observation into a mean of the previous `count - 1`
pub fn running_mean(current: f64, value: f64, count: u64) -> f64 {
    if count <= 1 {
        return value;
    }
    current + (value - current) / count as f64
}

/// Mean and standard deviation of a training window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub mean: f64,
    pub std_dev: f64,
}

impl Baseline {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        Some(Self {
            mean: mean(values)?,
            std_dev: std_dev(values)?,
        })
    }

    /// Z-score of `value`; `None` when the spread is zero and no score can be formed
    pub fn z_score(&self, value: f64) -> Option<f64> {
        if self.std_dev <= f64::EPSILON {
            return None;
        }
        Some((value - self.mean) / self.std_dev)
    }

    /// Strictly above the threshold counts as anomalous; zero spread never does
    pub fn is_anomalous(&self, value: f64, z_threshold: f64) -> bool {
        self.z_score(value)
            .map(|z| z.abs() > z_threshold)
            .unwrap_or(false)
    }
}

/// Solve `(XᵀX + λI) β = Xᵀy` by Gaussian elimination with partial pivoting.
/// The ridge term keeps the system solvable when there are fewer samples than features.
pub fn ridge_regression(rows: &[Vec<f64>], targets: &[f64], lambda: f64) -> Option<Vec<f64>> {
    let n_features = rows.first()?.len();
    if n_features == 0 || rows.len() != targets.len() {
        return None;
    }

    let mut matrix = vec![vec![0.0; n_features + 1]; n_features];
    for (row, &y) in rows.iter().zip(targets) {
        for i in 0..n_features {
            for j in 0..n_features {
                matrix[i][j] += row[i] * row[j];
            }
            matrix[i][n_features] += row[i] * y;
        }
    }
    // Intercept (column 0) is not penalised
    for (i, row) in matrix.iter_mut().enumerate().skip(1) {
        row[i] += lambda;
    }

    for col in 0..n_features {
        let pivot = (col..n_features).max_by(|&a, &b| {
            matrix[a][col]
                .abs()
                .partial_cmp(&matrix[b][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if matrix[pivot][col].abs() < 1e-12 {
            return None;
        }
        matrix.swap(col, pivot);

        for row in (col + 1)..n_features {
            let factor = matrix[row][col] / matrix[col][col];
            for k in col..=n_features {
                matrix[row][k] -= factor * matrix[col][k];
            }
        }
    }

    let mut coefficients = vec![0.0; n_features];
    for i in (0..n_features).rev() {
        let tail: f64 = ((i + 1)..n_features)
            .map(|j| matrix[i][j] * coefficients[j])
            .sum();
        coefficients[i] = (matrix[i][n_features] - tail) / matrix[i][i];
    }

    coefficients.iter().all(|c| c.is_finite()).then_some(coefficients)
}

/// Ordinary least-squares slope of `values` against their index
pub fn linear_slope(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let x_mean = (n - 1.0) / 2.0;
    let y_mean = mean(values)?;
    let (mut num, mut den) = (0.0, 0.0);
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - x_mean;
        num += dx * (y - y_mean);
        den += dx * dx;
    }
    (den > 0.0).then(|| num / den)
}

/// Holt's linear exponential smoothing state after consuming a series
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HoltState {
    pub level: f64,
    /// Change per sample step
    pub trend: f64,
}

impl HoltState {
    pub fn fit(values: &[f64], alpha: f64, beta: f64) -> Option<Self> {
        let first = *values.first()?;
        let trend = match values.get(1) {
            Some(second) => second - first,
            None => 0.0,
        };
        let mut state = Self { level: first, trend };
        for &value in values.iter().skip(1) {
            let previous_level = state.level;
            state.level = alpha * value + (1.0 - alpha) * (state.level + state.trend);
            state.trend = beta * (state.level - previous_level) + (1.0 - beta) * state.trend;
        }
        Some(state)
    }

    /// Value `steps` sample steps past the end of the series
    pub fn forecast(&self, steps: f64) -> f64 {
        self.level + self.trend * steps
    }
}

/// Direction of a metric over a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
    Stable,
}

/// Compare the averages of the first and second half of `values`.
///
/// The change is measured relative to the first half; below `dead_zone`
/// (a fraction, e.g. 0.05) the trend is stable. When the first half averages
/// to zero the absolute change is compared instead.
pub fn classify_trend(values: &[f64], dead_zone: f64) -> TrendDirection {
    if values.len() < 2 {
        return TrendDirection::Stable;
    }
    let mid = values.len() / 2;
    let (first, second) = values.split_at(mid);
    let (Some(first_avg), Some(second_avg)) = (mean(first), mean(second)) else {
        return TrendDirection::Stable;
    };

    let change = second_avg - first_avg;
    let relative = if first_avg.abs() > f64::EPSILON {
        change / first_avg.abs()
    } else {
        change
    };

    if relative > dead_zone {
        TrendDirection::Up
    } else if relative < -dead_zone {
        TrendDirection::Down
    } else {
        TrendDirection::Stable
    }
}

/// Sample autocorrelation at `lag`, `None` when the series is too short or flat
pub fn autocorrelation(values: &[f64], lag: usize) -> Option<f64> {
    if lag == 0 || values.len() <= lag + 1 {
        return None;
    }
    let mu = mean(values)?;
    let denominator: f64 = values.iter().map(|v| (v - mu).powi(2)).sum();
    if denominator <= f64::EPSILON {
        return None;
    }
    let numerator: f64 = values
        .iter()
        .zip(values.iter().skip(lag))
        .map(|(a, b)| (a - mu) * (b - mu))
        .sum();
    Some(numerator / denominator)
}

// Forecast Engine
// Short-horizon prediction, z-score anomaly detection and trend/seasonality reporting

use super::alerts::{Alert, AlertRuleEngine, AlertType, Severity};
use super::metrics::{MetricWindow, TimeWindow};
use super::notifications::ChannelKind;
use super::stats::{self, Baseline, HoltState, TrendDirection};
use crate::config::ForecastSettings;
use crate::store::MetricStore;
use crate::utils::error::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeSet, VecDeque};
use std::f64::consts::PI;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const RIDGE_LAMBDA: f64 = 1e-3;
const DAILY_LAG_HOURS: usize = 24;
const WEEKLY_LAG_HOURS: usize = 168;
/// Autocorrelation at or above which a period counts as seasonal
const SEASONALITY_THRESHOLD: f64 = 0.3;

/// One emitted prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub metric: String,
    pub timestamp: DateTime<Utc>,
    pub predicted_value: f64,
    /// prediction + confidence_z × stddev
    pub upper_bound: f64,
    pub z_score: Option<f64>,
    pub is_anomaly: bool,
}

/// Point flagged by the z-score test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyPoint {
    pub metric: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub z_score: f64,
    pub baseline: Baseline,
    /// True when the point is a prediction rather than an observation
    pub predicted: bool,
    /// When the point was flagged; predicted points carry a future `timestamp`
    pub detected_at: DateTime<Utc>,
}

/// Result of a forecast request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ForecastOutcome {
    Forecast {
        metric: String,
        generated_at: DateTime<Utc>,
        baseline: Baseline,
        predictions: Vec<Prediction>,
        /// Latest observation, when it was itself anomalous
        observed_anomaly: Option<AnomalyPoint>,
    },
    InsufficientData {
        metric: String,
        available: usize,
        required: usize,
    },
}

impl ForecastOutcome {
    pub fn predictions(&self) -> &[Prediction] {
        match self {
            ForecastOutcome::Forecast { predictions, .. } => predictions,
            ForecastOutcome::InsufficientData { .. } => &[],
        }
    }

    pub fn is_insufficient(&self) -> bool {
        matches!(self, ForecastOutcome::InsufficientData { .. })
    }

    /// Every anomalous point, observed and predicted
    pub fn anomalies(&self) -> Vec<AnomalyPoint> {
        let ForecastOutcome::Forecast {
            metric,
            generated_at,
            baseline,
            predictions,
            observed_anomaly,
        } = self
        else {
            return Vec::new();
        };
        let mut points: Vec<AnomalyPoint> = observed_anomaly.iter().cloned().collect();
        points.extend(predictions.iter().filter(|p| p.is_anomaly).map(|p| AnomalyPoint {
            metric: metric.clone(),
            timestamp: p.timestamp,
            value: p.predicted_value,
            z_score: p.z_score.unwrap_or_default(),
            baseline: *baseline,
            predicted: true,
            detected_at: *generated_at,
        }));
        points
    }
}

/// Strength of one seasonal period
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeasonalityStrength {
    pub period_hours: u32,
    /// Autocorrelation at the period lag, 0 when not computable
    pub strength: f64,
    pub detected: bool,
}

impl SeasonalityStrength {
    fn from_series(hourly: &[f64], lag: usize) -> Self {
        let strength = stats::autocorrelation(hourly, lag).unwrap_or(0.0);
        Self {
            period_hours: lag as u32,
            strength,
            detected: strength >= SEASONALITY_THRESHOLD,
        }
    }
}

/// Trend report for one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendResult {
    pub metric: String,
    pub direction: TrendDirection,
    /// Least-squares change per sample
    pub slope: f64,
    pub first_half_avg: f64,
    pub second_half_avg: f64,
    pub samples: usize,
    pub daily: SeasonalityStrength,
    pub weekly: SeasonalityStrength,
}

/// Bounded log of recent anomaly events, read by forecast_anomaly rules
#[derive(Debug)]
pub struct AnomalyLog {
    capacity: usize,
    events: RwLock<VecDeque<AnomalyPoint>>,
}

impl AnomalyLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: RwLock::new(VecDeque::new()),
        }
    }

    pub async fn record(&self, point: AnomalyPoint) {
        let mut events = self.events.write().await;
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(point);
    }

    /// Events detected inside `window`, optionally for one metric
    pub async fn in_window(&self, metric: Option<&str>, window: TimeWindow) -> Vec<AnomalyPoint> {
        self.events
            .read()
            .await
            .iter()
            .filter(|p| window.contains(p.detected_at))
            .filter(|p| metric.map_or(true, |m| p.metric == m))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

/// Seasonal regression features for a timestamp
fn features(timestamp: DateTime<Utc>, origin: DateTime<Utc>) -> Vec<f64> {
    let elapsed_hours = (timestamp - origin).num_seconds() as f64 / 3600.0;
    let absolute_hours = timestamp.timestamp() as f64 / 3600.0;
    let daily = 2.0 * PI * absolute_hours / DAILY_LAG_HOURS as f64;
    let weekly = 2.0 * PI * absolute_hours / WEEKLY_LAG_HOURS as f64;
    vec![
        1.0,
        elapsed_hours,
        daily.sin(),
        daily.cos(),
        weekly.sin(),
        weekly.cos(),
    ]
}

/// Compute predictions from a training window without touching any store.
///
/// The regression and the exponential-smoothing estimates are averaged.
/// Each prediction and the latest observation are scored against the
/// training baseline; zero spread disables anomaly flagging.
pub fn forecast_window(
    settings: &ForecastSettings,
    training: &MetricWindow,
    now: DateTime<Utc>,
) -> ForecastOutcome {
    let required = settings.min_samples.max(2);
    let samples = training.samples();
    let values = training.values();
    let (Some(baseline), true) = (Baseline::from_values(&values), samples.len() >= required) else {
        return ForecastOutcome::InsufficientData {
            metric: training.metric.clone(),
            available: samples.len(),
            required,
        };
    };

    let (first, last) = match (samples.first(), samples.last()) {
        (Some(first), Some(last)) => (first.timestamp, last.timestamp),
        _ => {
            return ForecastOutcome::InsufficientData {
                metric: training.metric.clone(),
                available: 0,
                required,
            }
        }
    };

    let rows: Vec<Vec<f64>> = samples.iter().map(|s| features(s.timestamp, first)).collect();
    let coefficients = stats::ridge_regression(&rows, &values, RIDGE_LAMBDA);
    let holt = HoltState::fit(&values, settings.smoothing_alpha, settings.smoothing_beta);
    let spacing_secs = (last - first).num_seconds() as f64 / (samples.len() - 1) as f64;

    let step = Duration::minutes(i64::from(settings.step_minutes));
    let steps = (settings.horizon_minutes / settings.step_minutes.max(1)).max(1);

    let predictions = (1..=steps)
        .map(|i| {
            let timestamp = now + step * i as i32;
            let regression = coefficients.as_ref().map(|beta| {
                features(timestamp, first)
                    .iter()
                    .zip(beta)
                    .map(|(x, b)| x * b)
                    .sum::<f64>()
            });
            let smoothed = holt.map(|state| {
                let ahead = if spacing_secs > 0.0 {
                    (timestamp - last).num_seconds() as f64 / spacing_secs
                } else {
                    0.0
                };
                state.forecast(ahead)
            });
            let predicted_value = match (regression, smoothed) {
                (Some(r), Some(s)) => (r + s) / 2.0,
                (Some(v), None) | (None, Some(v)) => v,
                (None, None) => baseline.mean,
            };
            let z_score = baseline.z_score(predicted_value);
            Prediction {
                metric: training.metric.clone(),
                timestamp,
                predicted_value,
                upper_bound: predicted_value + settings.confidence_z * baseline.std_dev,
                z_score,
                is_anomaly: baseline.is_anomalous(predicted_value, settings.z_threshold),
            }
        })
        .collect();

    let observed_anomaly = training.latest().and_then(|latest| {
        baseline
            .is_anomalous(latest.value, settings.z_threshold)
            .then(|| AnomalyPoint {
                metric: training.metric.clone(),
                timestamp: latest.timestamp,
                value: latest.value,
                z_score: baseline.z_score(latest.value).unwrap_or_default(),
                baseline,
                predicted: false,
                detected_at: now,
            })
    });

    ForecastOutcome::Forecast {
        metric: training.metric.clone(),
        generated_at: now,
        baseline,
        predictions,
        observed_anomaly,
    }
}

/// Flag every observation in `window` whose z-score exceeds the threshold
pub fn anomalies_in(window: &MetricWindow, z_threshold: f64) -> Vec<AnomalyPoint> {
    let Some(baseline) = Baseline::from_values(&window.values()) else {
        return Vec::new();
    };
    window
        .samples()
        .iter()
        .filter_map(|s| {
            let z = baseline.z_score(s.value)?;
            (z.abs() > z_threshold).then(|| AnomalyPoint {
                metric: window.metric.clone(),
                timestamp: s.timestamp,
                value: s.value,
                z_score: z,
                baseline,
                predicted: false,
                detected_at: window.window.end,
            })
        })
        .collect()
}

/// Predicts configured metrics and raises anomaly alerts through the rule engine
pub struct ForecastEngine {
    settings: ForecastSettings,
    metrics: Arc<dyn MetricStore>,
    anomalies: Arc<AnomalyLog>,
    alerts: Arc<AlertRuleEngine>,
}

impl ForecastEngine {
    pub fn new(
        settings: ForecastSettings,
        metrics: Arc<dyn MetricStore>,
        anomalies: Arc<AnomalyLog>,
        alerts: Arc<AlertRuleEngine>,
    ) -> Self {
        Self {
            settings,
            metrics,
            anomalies,
            alerts,
        }
    }

    fn training_window(&self, now: DateTime<Utc>) -> TimeWindow {
        TimeWindow::trailing_hours(now, self.settings.training_hours)
    }

    /// Forecast `metric` from the trailing training window. Anomalous points
    /// are recorded and raised as ANOMALY_DETECTED alerts.
    pub async fn predict_metric(&self, metric: &str) -> Result<ForecastOutcome> {
        let now = Utc::now();
        let training = self.metrics.read_window(metric, self.training_window(now)).await?;
        let outcome = forecast_window(&self.settings, &training, now);

        match &outcome {
            ForecastOutcome::InsufficientData {
                available, required, ..
            } => {
                debug!(metric, available, required, "Not enough history to forecast");
            }
            ForecastOutcome::Forecast { .. } => {
                let points = outcome.anomalies();
                if !points.is_empty() {
                    self.report_anomalies(metric, &points).await;
                }
            }
        }
        Ok(outcome)
    }

    /// Observations in the training window that deviate from its baseline
    pub async fn detect_anomalies(&self, metric: &str) -> Result<Vec<AnomalyPoint>> {
        let training = self
            .metrics
            .read_window(metric, self.training_window(Utc::now()))
            .await?;
        Ok(anomalies_in(&training, self.settings.z_threshold))
    }

    /// Direction over the training window plus daily/weekly seasonality over
    /// the longer seasonality window
    pub async fn analyze_trends(&self, metric: &str) -> Result<TrendResult> {
        let now = Utc::now();
        let training = self.metrics.read_window(metric, self.training_window(now)).await?;
        let values = training.values();

        let mid = values.len() / 2;
        let (first, second) = values.split_at(mid);

        let hourly = self.hourly_series(metric, now).await?;

        Ok(TrendResult {
            metric: metric.to_string(),
            direction: stats::classify_trend(&values, self.settings.trend_dead_zone),
            slope: stats::linear_slope(&values).unwrap_or(0.0),
            first_half_avg: stats::mean(first).unwrap_or(0.0),
            second_half_avg: stats::mean(second).unwrap_or(0.0),
            samples: values.len(),
            daily: SeasonalityStrength::from_series(&hourly, DAILY_LAG_HOURS),
            weekly: SeasonalityStrength::from_series(&hourly, WEEKLY_LAG_HOURS),
        })
    }

    /// Dense hourly averages; empty hours are filled with the overall mean
    async fn hourly_series(&self, metric: &str, now: DateTime<Utc>) -> Result<Vec<f64>> {
        let window = TimeWindow::new(now - Duration::days(i64::from(self.settings.seasonality_days)), now);
        let buckets = self
            .metrics
            .read_aggregate(metric, window, Duration::hours(1))
            .await?;
        let (Some(first), Some(last)) = (buckets.first(), buckets.last()) else {
            return Ok(Vec::new());
        };

        let span = ((last.bucket_start - first.bucket_start).num_hours() + 1) as usize;
        let fill = stats::mean(&buckets.iter().map(|b| b.average).collect::<Vec<_>>()).unwrap_or(0.0);
        let mut series = vec![fill; span];
        for bucket in &buckets {
            let index = (bucket.bucket_start - first.bucket_start).num_hours() as usize;
            if let Some(slot) = series.get_mut(index) {
                *slot = bucket.average;
            }
        }
        Ok(series)
    }

    /// Record every point and raise one ANOMALY_DETECTED alert per point
    async fn report_anomalies(&self, metric: &str, points: &[AnomalyPoint]) {
        let channels: BTreeSet<ChannelKind> = self.settings.anomaly_channels.iter().copied().collect();
        for point in points {
            self.anomalies.record(point.clone()).await;

            let severity = if point.z_score.abs() >= 2.0 * self.settings.z_threshold {
                Severity::Critical
            } else {
                Severity::High
            };
            let kind = if point.predicted { "Predicted" } else { "Observed" };
            let alert = Alert::new(
                AlertType::AnomalyDetected,
                severity,
                format!(
                    "{} anomaly in {}: value {:.3} is {:.2} standard deviations from mean {:.3}",
                    kind, metric, point.value, point.z_score, point.baseline.mean
                ),
                json!({
                    "metric": metric,
                    "anomaly": point,
                }),
            );
            if let Err(e) = self.alerts.raise(alert, &channels).await {
                warn!(metric, error = %e, "Failed to raise anomaly alert");
            }
        }
    }

    /// Forecast every configured metric; one metric failing does not stop the rest
    pub async fn run_cycle(&self) -> Result<usize> {
        let mut forecast = 0;
        for metric in &self.settings.metrics {
            match self.predict_metric(metric).await {
                Ok(outcome) if !outcome.is_insufficient() => forecast += 1,
                Ok(_) => {}
                Err(e) => warn!(metric = %metric, error = %e, "Forecast failed"),
            }
        }
        info!(forecast, configured = self.settings.metrics.len(), "Forecast cycle complete");
        Ok(forecast)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::metrics::MetricSample;

    fn window_of(values: &[f64], now: DateTime<Utc>) -> MetricWindow {
        let window = TimeWindow::trailing_hours(now, 24);
        let samples = values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let ts = now - Duration::minutes(5 * (values.len() - i) as i64);
                MetricSample::new("system.cpu", *v, ts).unwrap()
            })
            .collect();
        MetricWindow::new("system.cpu", window, samples)
    }

    #[test]
    fn test_single_sample_is_insufficient() {
        let now = Utc::now();
        let outcome = forecast_window(&ForecastSettings::default(), &window_of(&[0.4], now), now);
        assert_eq!(
            outcome,
            ForecastOutcome::InsufficientData {
                metric: "system.cpu".to_string(),
                available: 1,
                required: 2,
            }
        );
        assert!(outcome.predictions().is_empty());
    }

    #[test]
    fn test_forecast_emits_twelve_steps_with_bounds() {
        let now = Utc::now();
        let values: Vec<f64> = (0..48).map(|i| 0.4 + 0.01 * (i % 5) as f64).collect();
        let outcome = forecast_window(&ForecastSettings::default(), &window_of(&values, now), now);

        let predictions = outcome.predictions();
        assert_eq!(predictions.len(), 12);
        assert_eq!(predictions[0].timestamp, now + Duration::minutes(5));
        assert_eq!(predictions[11].timestamp, now + Duration::minutes(60));
        for p in predictions {
            assert!(p.upper_bound >= p.predicted_value);
            assert!(p.predicted_value.is_finite());
        }
    }

    #[test]
    fn test_flat_history_never_flags() {
        let now = Utc::now();
        let outcome = forecast_window(&ForecastSettings::default(), &window_of(&[0.5; 20], now), now);
        assert!(outcome.anomalies().is_empty());
        for p in outcome.predictions() {
            assert_eq!(p.z_score, None);
            assert_eq!(p.upper_bound, p.predicted_value);
        }
    }

    #[test]
    fn test_outlier_observation_is_flagged() {
        let mut values = vec![10.0; 30];
        values.extend([11.0, 9.0, 10.5, 9.5]);
        values.push(40.0);
        let window = window_of(&values, Utc::now());

        let points = anomalies_in(&window, 2.5);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 40.0);
        assert!(points[0].z_score > 2.5);
    }

    #[tokio::test]
    async fn test_anomaly_log_is_bounded_and_windowed() {
        let log = AnomalyLog::new(2);
        let now = Utc::now();
        let baseline = Baseline { mean: 1.0, std_dev: 0.1 };
        for (i, metric) in ["a", "b", "c"].iter().enumerate() {
            log.record(AnomalyPoint {
                metric: metric.to_string(),
                timestamp: now - Duration::minutes(i as i64),
                value: 5.0,
                z_score: 40.0,
                baseline,
                predicted: false,
                detected_at: now - Duration::minutes(i as i64),
            })
            .await;
        }
        assert_eq!(log.len().await, 2);

        let window = TimeWindow::trailing_minutes(now, 10);
        assert!(log.in_window(Some("a"), window).await.is_empty());
        assert_eq!(log.in_window(Some("c"), window).await.len(), 1);
        assert_eq!(log.in_window(None, window).await.len(), 2);
    }

    #[tokio::test]
    async fn test_anomaly_log_windows_by_detection_time() {
        let log = AnomalyLog::new(10);
        let now = Utc::now();
        log.record(AnomalyPoint {
            metric: "system.cpu".to_string(),
            timestamp: now + Duration::minutes(45),
            value: 0.97,
            z_score: 3.1,
            baseline: Baseline { mean: 0.5, std_dev: 0.15 },
            predicted: true,
            detected_at: now,
        })
        .await;

        let window = TimeWindow::trailing_minutes(now, 15);
        assert_eq!(log.in_window(Some("system.cpu"), window).await.len(), 1);
        let earlier = TimeWindow::trailing_minutes(now - Duration::minutes(20), 15);
        assert!(log.in_window(None, earlier).await.is_empty());
    }

    #[test]
    fn test_predicted_anomalies_carry_generation_time() {
        let now = Utc::now();
        let values: Vec<f64> = (0..=40).map(f64::from).collect();
        let outcome = forecast_window(&ForecastSettings::default(), &window_of(&values, now), now);
        for point in outcome.anomalies().iter().filter(|p| p.predicted) {
            assert_eq!(point.detected_at, now);
            assert!(point.timestamp > now);
        }
    }
}

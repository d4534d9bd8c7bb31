//! Short-horizon climate forecasting.
//!
//! The predictive controller only needs "given recent history, what will the
//! climate look like `horizon` from now". [`TrendForecaster`] answers with a
//! least-squares line through the window; anything implementing
//! [`Forecaster`] can replace it.

use std::time::{Duration, Instant};
use time::OffsetDateTime;

use crate::sampler::{SensorSnapshot, SoilMoisture, HUMIDITY_RANGE, TEMPERATURE_RANGE};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryPoint {
    pub ts: OffsetDateTime,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

impl From<&SensorSnapshot> for HistoryPoint {
    fn from(s: &SensorSnapshot) -> Self {
        Self {
            ts: s.ts,
            temperature: s.temperature,
            humidity: s.humidity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PredictionError {
    #[error("insufficient history: have {have} points, need {need}")]
    InsufficientData { have: usize, need: usize },
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("history is stale: newest point is {age_secs}s old")]
    StaleModel { age_secs: u64 },
}

pub trait Forecaster: Send + Sync {
    /// Project the climate to `now + horizon`. `history` is ordered oldest
    /// first.
    fn forecast(
        &self,
        history: &[HistoryPoint],
        now: OffsetDateTime,
        horizon: Duration,
    ) -> Result<SensorSnapshot, PredictionError>;
}

// ---------------------------------------------------------------------------
// Linear trend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TrendForecaster {
    pub min_points: usize,
    pub max_age: Duration,
}

impl TrendForecaster {
    pub fn new(min_points: usize, max_age: Duration) -> Self {
        Self {
            min_points: min_points.max(2),
            max_age,
        }
    }
}

/// Ordinary least squares over `(x, y)`; returns `(slope, intercept)`, or
/// `None` when every x is identical.
fn fit_line(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;

    let (mut sxx, mut sxy) = (0.0, 0.0);
    for (x, y) in points {
        sxx += (x - mean_x) * (x - mean_x);
        sxy += (x - mean_x) * (y - mean_y);
    }
    if sxx <= f64::EPSILON {
        return None;
    }
    let slope = sxy / sxx;
    Some((slope, mean_y - slope * mean_x))
}

impl Forecaster for TrendForecaster {
    fn forecast(
        &self,
        history: &[HistoryPoint],
        now: OffsetDateTime,
        horizon: Duration,
    ) -> Result<SensorSnapshot, PredictionError> {
        if history.len() < self.min_points {
            return Err(PredictionError::InsufficientData {
                have: history.len(),
                need: self.min_points,
            });
        }

        let newest = history[history.len() - 1].ts;
        let age = (now - newest).max(time::Duration::ZERO);
        if age > self.max_age {
            return Err(PredictionError::StaleModel {
                age_secs: age.whole_seconds().unsigned_abs(),
            });
        }

        let target_x = (now - newest).as_seconds_f64() + horizon.as_secs_f64();
        let project = |pick: fn(&HistoryPoint) -> Option<f64>,
                       (lo, hi): (f64, f64)|
         -> Result<Option<f64>, PredictionError> {
            let samples: Vec<(f64, f64)> = history
                .iter()
                .filter_map(|p| pick(p).map(|v| ((p.ts - newest).as_seconds_f64(), v)))
                .collect();
            if samples.len() < self.min_points {
                return Ok(None);
            }
            let (slope, intercept) = fit_line(&samples).ok_or_else(|| {
                PredictionError::ModelUnavailable("all samples share one timestamp".into())
            })?;
            Ok(Some((intercept + slope * target_x).clamp(lo, hi)))
        };

        let temperature = project(|p| p.temperature, TEMPERATURE_RANGE)?;
        let humidity = project(|p| p.humidity, HUMIDITY_RANGE)?;
        if temperature.is_none() && humidity.is_none() {
            return Err(PredictionError::InsufficientData {
                have: 0,
                need: self.min_points,
            });
        }

        Ok(SensorSnapshot {
            temperature,
            humidity,
            soil_moisture: SoilMoisture::default(),
            ts: now + horizon,
            taken_at: Instant::now(),
            valid: true,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);

    fn series(n: usize, step_secs: i64, temp: impl Fn(usize) -> f64) -> Vec<HistoryPoint> {
        (0..n)
            .map(|i| HistoryPoint {
                ts: T0 + time::Duration::seconds(i as i64 * step_secs),
                temperature: Some(temp(i)),
                humidity: Some(50.0),
            })
            .collect()
    }

    fn forecaster() -> TrendForecaster {
        TrendForecaster::new(5, Duration::from_secs(120))
    }

    #[test]
    fn rising_trend_is_extrapolated() {
        // +0.1 °C every 5 s => +1.2 °C per minute.
        let h = series(12, 5, |i| 20.0 + 0.1 * i as f64);
        let now = h.last().unwrap().ts;
        let f = forecaster()
            .forecast(&h, now, Duration::from_secs(60))
            .unwrap();
        let t = f.temperature.unwrap();
        assert!((t - (21.1 + 1.2)).abs() < 1e-6, "got {t}");
        assert_eq!(f.humidity, Some(50.0));
        assert_eq!(f.ts, now + Duration::from_secs(60));
    }

    #[test]
    fn projection_is_clamped_to_plausible_range() {
        let h = series(12, 5, |i| 70.0 + 2.0 * i as f64);
        let now = h.last().unwrap().ts;
        let f = forecaster()
            .forecast(&h, now, Duration::from_secs(600))
            .unwrap();
        assert_eq!(f.temperature, Some(TEMPERATURE_RANGE.1));
    }

    #[test]
    fn too_few_points_is_insufficient_data() {
        let h = series(3, 5, |_| 20.0);
        let err = forecaster()
            .forecast(&h, T0, Duration::from_secs(600))
            .unwrap_err();
        assert_eq!(err, PredictionError::InsufficientData { have: 3, need: 5 });
    }

    #[test]
    fn old_history_is_stale() {
        let h = series(6, 5, |_| 20.0);
        let now = h.last().unwrap().ts + time::Duration::minutes(10);
        let err = forecaster()
            .forecast(&h, now, Duration::from_secs(600))
            .unwrap_err();
        assert_eq!(err, PredictionError::StaleModel { age_secs: 600 });
    }

    #[test]
    fn identical_timestamps_make_the_model_unavailable() {
        let h: Vec<HistoryPoint> = (0..6)
            .map(|i| HistoryPoint {
                ts: T0,
                temperature: Some(20.0 + i as f64),
                humidity: None,
            })
            .collect();
        let err = forecaster()
            .forecast(&h, T0, Duration::from_secs(600))
            .unwrap_err();
        assert!(matches!(err, PredictionError::ModelUnavailable(_)));
    }

    #[test]
    fn axis_with_missing_readings_is_left_absent() {
        let mut h = series(8, 5, |_| 20.0);
        for p in &mut h {
            p.humidity = None;
        }
        let now = h.last().unwrap().ts;
        let f = forecaster()
            .forecast(&h, now, Duration::from_secs(600))
            .unwrap();
        assert_eq!(f.humidity, None);
        assert!((f.temperature.unwrap() - 20.0).abs() < 1e-9);
    }
}

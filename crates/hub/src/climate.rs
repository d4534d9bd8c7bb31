//! Climate policies. Threshold and predictive control share a single
//! hysteresis evaluation; the predictive one only swaps the input snapshot.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::actuator::Cause;
use crate::forecast::{Forecaster, HistoryPoint};
use crate::protocol::Relay;
use crate::sampler::SensorSnapshot;

pub type RelaySet = BTreeMap<Relay, bool>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClimateSettings {
    pub target_temp: f64,
    pub temp_tolerance: f64,
    pub target_humidity: f64,
    pub humidity_tolerance: f64,
}

// ---------------------------------------------------------------------------
// Intents
// ---------------------------------------------------------------------------

/// Desired state per climate relay. `None` means hold whatever it is now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Intents {
    pub heater: Option<bool>,
    pub humidifier: Option<bool>,
    pub dehumidifier: Option<bool>,
}

impl Intents {
    pub fn get(&self, relay: Relay) -> Option<bool> {
        match relay {
            Relay::Heater => self.heater,
            Relay::Humidifier => self.humidifier,
            Relay::Dehumidifier => self.dehumidifier,
            Relay::Light => None,
        }
    }

    /// Concrete intents, OFF before ON, so a relay being released is switched
    /// before its exclusive partner is energized.
    pub fn ordered(&self) -> Vec<(Relay, bool)> {
        let mut out: Vec<(Relay, bool)> = Relay::CLIMATE
            .iter()
            .filter_map(|&r| self.get(r).map(|on| (r, on)))
            .collect();
        out.sort_by_key(|&(_, on)| on);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub intents: Intents,
    pub cause: Cause,
}

// ---------------------------------------------------------------------------
// Shared hysteresis policy
// ---------------------------------------------------------------------------

/// `Some(true)` strictly below the band, `Some(false)` strictly above,
/// `None` inside it, on its edges, or when the value is unknown.
fn band(value: Option<f64>, target: f64, tolerance: f64) -> Option<bool> {
    let v = value?;
    if v < target - tolerance {
        Some(true)
    } else if v > target + tolerance {
        Some(false)
    } else {
        None
    }
}

/// The one hysteresis evaluation used by every climate policy.
pub fn evaluate_hysteresis(
    snapshot: &SensorSnapshot,
    settings: &ClimateSettings,
    current: &RelaySet,
) -> Intents {
    let heater = band(snapshot.temperature, settings.target_temp, settings.temp_tolerance);

    let (mut humidifier, mut dehumidifier) = match band(
        snapshot.humidity,
        settings.target_humidity,
        settings.humidity_tolerance,
    ) {
        Some(true) => (Some(true), Some(false)),
        Some(false) => (Some(false), Some(true)),
        None => (None, None),
    };

    // Holding both while both are somehow on would keep the pair energized.
    let held_on = |r: Relay| current.get(&r).copied().unwrap_or(false);
    if humidifier.is_none() && held_on(Relay::Humidifier) && held_on(Relay::Dehumidifier) {
        humidifier = Some(false);
        dehumidifier = Some(false);
    }

    Intents {
        heater,
        humidifier,
        dehumidifier,
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// A climate policy turns the latest snapshot into relay intents. `now` is
/// the wall-clock time of the evaluation.
pub trait ClimatePolicy: Send {
    fn name(&self) -> &'static str;

    fn evaluate(
        &mut self,
        snapshot: &SensorSnapshot,
        settings: &ClimateSettings,
        current: &RelaySet,
        now: OffsetDateTime,
    ) -> Decision;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThresholdController;

impl ClimatePolicy for ThresholdController {
    fn name(&self) -> &'static str {
        "threshold"
    }

    fn evaluate(
        &mut self,
        snapshot: &SensorSnapshot,
        settings: &ClimateSettings,
        current: &RelaySet,
        _now: OffsetDateTime,
    ) -> Decision {
        threshold_decision(snapshot, settings, current)
    }
}

fn threshold_decision(
    snapshot: &SensorSnapshot,
    settings: &ClimateSettings,
    current: &RelaySet,
) -> Decision {
    Decision {
        intents: evaluate_hysteresis(snapshot, settings, current),
        cause: Cause::Threshold,
    }
}

/// Evaluates the hysteresis policy against a forecast of the climate
/// `horizon` ahead. Any forecast failure falls back to threshold control on
/// the current snapshot.
pub struct PredictiveController {
    forecaster: Box<dyn Forecaster>,
    horizon: Duration,
    capacity: usize,
    history: VecDeque<HistoryPoint>,
}

impl PredictiveController {
    pub fn new(forecaster: Box<dyn Forecaster>, horizon: Duration, capacity: usize) -> Self {
        Self {
            forecaster,
            horizon,
            capacity: capacity.max(1),
            history: VecDeque::with_capacity(capacity),
        }
    }

    /// Feed a fresh valid snapshot into the history window.
    pub fn observe(&mut self, snapshot: &SensorSnapshot) {
        if !snapshot.valid {
            return;
        }
        self.push(HistoryPoint::from(snapshot));
    }

    /// Warm the window from persisted history, oldest first.
    pub fn seed(&mut self, points: impl IntoIterator<Item = HistoryPoint>) {
        for p in points {
            self.push(p);
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    fn push(&mut self, point: HistoryPoint) {
        if self.history.back().is_some_and(|last| last.ts >= point.ts) {
            return;
        }
        if self.history.len() >= self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(point);
    }
}

impl ClimatePolicy for PredictiveController {
    fn name(&self) -> &'static str {
        "predictive"
    }

    fn evaluate(
        &mut self,
        snapshot: &SensorSnapshot,
        settings: &ClimateSettings,
        current: &RelaySet,
        now: OffsetDateTime,
    ) -> Decision {
        let window = self.history.make_contiguous();

        match self.forecaster.forecast(window, now, self.horizon) {
            Ok(forecast) => {
                debug!(
                    temperature = ?forecast.temperature,
                    humidity = ?forecast.humidity,
                    horizon_secs = self.horizon.as_secs(),
                    "predictive: forecast ready"
                );
                Decision {
                    intents: evaluate_hysteresis(&forecast, settings, current),
                    cause: Cause::Predictive,
                }
            }
            Err(e) => {
                warn!(error = %e, "predictive: forecast failed, falling back to threshold");
                threshold_decision(snapshot, settings, current)
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

//! Sensor sampling: polls the board through the link, validates the reply and
//! produces immutable [`SensorSnapshot`]s.
//!
//! A failed or implausible poll yields `valid = false` with the last good
//! values carried along for display. Controllers must not act on it.
//!
//! The relay states a `read_all` reply carries are kept aside for the
//! actuator to reconcile against.

use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::link::LinkHandle;
use crate::protocol::{Command, Relay, Response};

pub const TEMPERATURE_RANGE: (f64, f64) = (-40.0, 80.0);
pub const HUMIDITY_RANGE: (f64, f64) = (0.0, 100.0);
pub const SOIL_RANGE: (f64, f64) = (0.0, 100.0);

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SoilMoisture {
    pub soil1: Option<f64>,
    pub soil2: Option<f64>,
    pub soil3: Option<f64>,
    pub soil4: Option<f64>,
}

impl SoilMoisture {
    pub const CHANNELS: [&'static str; 4] = ["soil1", "soil2", "soil3", "soil4"];

    pub fn values(&self) -> [Option<f64>; 4] {
        [self.soil1, self.soil2, self.soil3, self.soil4]
    }

    pub fn from_values(v: [Option<f64>; 4]) -> Self {
        Self {
            soil1: v[0],
            soil2: v[1],
            soil3: v[2],
            soil4: v[3],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorSnapshot {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub soil_moisture: SoilMoisture,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    /// Monotonic capture time; staleness is measured against this.
    #[serde(skip)]
    pub taken_at: Instant,
    pub valid: bool,
}

impl SensorSnapshot {
    /// Invalid snapshot with nothing known.
    pub fn unknown(taken_at: Instant, ts: OffsetDateTime) -> Self {
        Self {
            temperature: None,
            humidity: None,
            soil_moisture: SoilMoisture::default(),
            ts,
            taken_at,
            valid: false,
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.taken_at)
    }

    /// Valid and no older than `staleness_bound`.
    pub fn is_actionable(&self, now: Instant, staleness_bound: Duration) -> bool {
        self.valid && self.age(now) <= staleness_bound
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn check(field: &str, value: Option<f64>, (lo, hi): (f64, f64)) -> Result<Option<f64>, String> {
    match value {
        None => Ok(None),
        Some(v) if v.is_finite() && (lo..=hi).contains(&v) => Ok(Some(v)),
        Some(v) => Err(format!("{field}={v} outside [{lo}, {hi}]")),
    }
}

/// Turn a `read_all` reply into a valid snapshot, or explain why it is not
/// plausible. Absent fields stay absent.
pub fn snapshot_from_reply(
    reply: &Response,
    taken_at: Instant,
    ts: OffsetDateTime,
) -> Result<SensorSnapshot, String> {
    let temperature = check("temperature", reply.temperature, TEMPERATURE_RANGE)?;
    let humidity = check("humidity", reply.humidity, HUMIDITY_RANGE)?;

    let mut soil = [None; 4];
    if let Some(map) = &reply.soil_moisture {
        for (slot, channel) in soil.iter_mut().zip(SoilMoisture::CHANNELS) {
            let raw = map.get(channel).copied().flatten();
            *slot = check(channel, raw, SOIL_RANGE)?;
        }
    }

    Ok(SensorSnapshot {
        temperature,
        humidity,
        soil_moisture: SoilMoisture::from_values(soil),
        ts,
        taken_at,
        valid: true,
    })
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

pub struct Sampler {
    link: LinkHandle,
    last_good: Option<SensorSnapshot>,
    reported_relays: Option<HashMap<Relay, bool>>,
}

impl Sampler {
    pub fn new(link: LinkHandle) -> Self {
        Self {
            link,
            last_good: None,
            reported_relays: None,
        }
    }

    pub async fn poll_at(&mut self, now: Instant, wall: OffsetDateTime) -> SensorSnapshot {
        let reply = match self.link.send(Command::ReadAll).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "sampler: read_all failed");
                self.reported_relays = None;
                return self.invalid(now, wall);
            }
        };

        let relays = reply.relay_states();
        self.reported_relays = (!relays.is_empty()).then_some(relays);

        match snapshot_from_reply(&reply, now, wall) {
            Ok(snapshot) => {
                debug!(
                    temperature = ?snapshot.temperature,
                    humidity = ?snapshot.humidity,
                    "sampler: fresh snapshot"
                );
                self.last_good = Some(snapshot.clone());
                snapshot
            }
            Err(reason) => {
                warn!(%reason, "sampler: implausible reading rejected");
                self.invalid(now, wall)
            }
        }
    }

    /// Relay states from the most recent poll, if the board sent any. Taken
    /// once.
    pub fn take_reported_relays(&mut self) -> Option<HashMap<Relay, bool>> {
        self.reported_relays.take()
    }

    /// Last good values (with their original timestamps) marked invalid.
    fn invalid(&self, now: Instant, wall: OffsetDateTime) -> SensorSnapshot {
        match &self.last_good {
            Some(good) => SensorSnapshot {
                valid: false,
                ..good.clone()
            },
            None => SensorSnapshot::unknown(now, wall),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

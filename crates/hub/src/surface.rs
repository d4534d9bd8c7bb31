//! Control surface: the validated boundary between operators (HTTP or
//! otherwise) and the control core.
//!
//! Every setter validates before anything is persisted or published. Changes
//! are written to the database and to shared state under the state write
//! lock, so concurrent updates apply in order and the control loop picks them
//! up on its next tick.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::info;

use crate::actuator::{ActuatorError, Cause, RelayHistoryEntry, RelayState, SharedActuator};
use crate::climate::ClimateSettings;
use crate::db::{Db, StoredSnapshot};
use crate::light::{LightSchedule, TimeOfDay};
use crate::link::LinkHandle;
use crate::protocol::Relay;
use crate::sampler::{HUMIDITY_RANGE, TEMPERATURE_RANGE};
use crate::state::{ControlMode, Controls, SharedState, SnapshotView, StatusResponse};

pub const MAX_HISTORY_HOURS: u32 = 24 * 31;
pub const MAX_HISTORY_LIMIT: u32 = 1000;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SurfaceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0} is in auto mode; switch to manual first")]
    ModeConflict(&'static str),
    #[error(transparent)]
    Actuator(#[from] ActuatorError),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Request / response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SettingsView {
    #[serde(flatten)]
    pub settings: ClimateSettings,
    pub predictive: bool,
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub target_temp: Option<f64>,
    pub temp_tolerance: Option<f64>,
    pub target_humidity: Option<f64>,
    pub humidity_tolerance: Option<f64>,
    pub predictive: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleUpdate {
    pub on_time: Option<String>,
    pub off_time: Option<String>,
    pub enabled: Option<bool>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

pub fn validate_settings(s: &ClimateSettings) -> Result<(), ValidationError> {
    let in_range = |field, v: f64, (lo, hi): (f64, f64)| {
        if v.is_finite() && (lo..=hi).contains(&v) {
            Ok(())
        } else {
            Err(ValidationError::new(field, format!("{v} is outside [{lo}, {hi}]")))
        }
    };
    let tolerance = |field, v: f64| {
        if v.is_finite() && v >= 0.0 {
            Ok(())
        } else {
            Err(ValidationError::new(field, format!("{v} must be a number >= 0")))
        }
    };

    in_range("target_temp", s.target_temp, TEMPERATURE_RANGE)?;
    tolerance("temp_tolerance", s.temp_tolerance)?;
    in_range("target_humidity", s.target_humidity, HUMIDITY_RANGE)?;
    tolerance("humidity_tolerance", s.humidity_tolerance)?;
    Ok(())
}

fn parse_mode(raw: &str) -> Result<ControlMode, ValidationError> {
    raw.parse::<ControlMode>()
        .map_err(|e| ValidationError::new("mode", e))
}

fn parse_time(field: &'static str, raw: &str) -> Result<TimeOfDay, ValidationError> {
    TimeOfDay::parse(raw).map_err(|e| ValidationError::new(field, e))
}

// ---------------------------------------------------------------------------
// Surface
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ControlSurface {
    shared: SharedState,
    actuator: SharedActuator,
    db: Db,
    link: LinkHandle,
    staleness_bound: Duration,
}

impl ControlSurface {
    pub fn new(
        shared: SharedState,
        actuator: SharedActuator,
        db: Db,
        link: LinkHandle,
        staleness_bound: Duration,
    ) -> Self {
        Self {
            shared,
            actuator,
            db,
            link,
            staleness_bound,
        }
    }

    /// Apply `change` to the current controls, persist, then publish.
    async fn update_controls<F>(&self, change: F) -> Result<Controls, SurfaceError>
    where
        F: FnOnce(&mut Controls) -> Result<(), ValidationError>,
    {
        let mut st = self.shared.write().await;
        let mut next = st.controls.clone();
        change(&mut next)?;
        self.db.save_controls(&next).await?;
        st.controls = next.clone();
        Ok(next)
    }

    // -- Climate ------------------------------------------------------------

    pub async fn climate_mode(&self) -> ControlMode {
        self.shared.read().await.controls.climate_mode
    }

    pub async fn set_climate_mode(&self, raw: &str) -> Result<ControlMode, SurfaceError> {
        let mode = parse_mode(raw)?;
        self.update_controls(|c| {
            c.climate_mode = mode;
            Ok(())
        })
        .await?;
        self.shared.write().await.record_mode("climate", mode);
        info!(%mode, "climate mode changed");
        Ok(mode)
    }

    pub async fn climate_settings(&self) -> SettingsView {
        let st = self.shared.read().await;
        SettingsView {
            settings: st.controls.settings,
            predictive: st.controls.predictive,
        }
    }

    pub async fn update_climate_settings(
        &self,
        update: SettingsUpdate,
    ) -> Result<SettingsView, SurfaceError> {
        let controls = self
            .update_controls(|c| {
                let mut s = c.settings;
                if let Some(v) = update.target_temp {
                    s.target_temp = v;
                }
                if let Some(v) = update.temp_tolerance {
                    s.temp_tolerance = v;
                }
                if let Some(v) = update.target_humidity {
                    s.target_humidity = v;
                }
                if let Some(v) = update.humidity_tolerance {
                    s.humidity_tolerance = v;
                }
                validate_settings(&s)?;
                c.settings = s;
                if let Some(p) = update.predictive {
                    c.predictive = p;
                }
                Ok(())
            })
            .await?;

        info!(settings = ?controls.settings, predictive = controls.predictive, "climate settings updated");
        Ok(SettingsView {
            settings: controls.settings,
            predictive: controls.predictive,
        })
    }

    // -- Light --------------------------------------------------------------

    pub async fn light_mode(&self) -> ControlMode {
        self.shared.read().await.controls.light_mode
    }

    pub async fn set_light_mode(&self, raw: &str) -> Result<ControlMode, SurfaceError> {
        let mode = parse_mode(raw)?;
        self.update_controls(|c| {
            c.light_mode = mode;
            Ok(())
        })
        .await?;
        self.shared.write().await.record_mode("light", mode);
        info!(%mode, "light mode changed");
        Ok(mode)
    }

    pub async fn light_schedule(&self) -> LightSchedule {
        self.shared.read().await.controls.schedule
    }

    pub async fn set_light_schedule(
        &self,
        update: ScheduleUpdate,
    ) -> Result<LightSchedule, SurfaceError> {
        let on_time = update
            .on_time
            .as_deref()
            .map(|t| parse_time("on_time", t))
            .transpose()?;
        let off_time = update
            .off_time
            .as_deref()
            .map(|t| parse_time("off_time", t))
            .transpose()?;

        let controls = self
            .update_controls(|c| {
                if let Some(t) = on_time {
                    c.schedule.on_time = t;
                }
                if let Some(t) = off_time {
                    c.schedule.off_time = t;
                }
                if let Some(e) = update.enabled {
                    c.schedule.enabled = e;
                }
                Ok(())
            })
            .await?;

        let s = controls.schedule;
        info!(on = %s.on_time, off = %s.off_time, enabled = s.enabled, "light schedule updated");
        Ok(s)
    }

    // -- Relays -------------------------------------------------------------

    pub async fn relay_states(&self) -> Vec<RelayState> {
        self.shared.read().await.relays.values().cloned().collect()
    }

    /// Manual relay command. Rejected while the relay's subsystem is in auto.
    pub async fn manual_relay(&self, name: &str, state: bool) -> Result<RelayState, SurfaceError> {
        let relay = name
            .parse::<Relay>()
            .map_err(|_| ActuatorError::UnknownRelay(name.to_string()))?;

        {
            let st = self.shared.read().await;
            if relay.is_climate() && st.controls.climate_mode == ControlMode::Auto {
                return Err(SurfaceError::ModeConflict("climate"));
            }
            if relay == Relay::Light && st.controls.light_mode == ControlMode::Auto {
                return Err(SurfaceError::ModeConflict("light"));
            }
        }

        let result = self
            .actuator
            .lock()
            .await
            .apply(relay, state, Cause::Manual)
            .await;
        match result {
            Ok(s) => Ok(s),
            Err(e) => {
                self.shared
                    .write()
                    .await
                    .record_error(format!("manual {relay} command failed: {e}"));
                Err(e.into())
            }
        }
    }

    pub async fn relay_history(&self, limit: u32) -> Result<Vec<RelayHistoryEntry>, SurfaceError> {
        if limit == 0 || limit > MAX_HISTORY_LIMIT {
            return Err(ValidationError::new(
                "limit",
                format!("must be between 1 and {MAX_HISTORY_LIMIT}"),
            )
            .into());
        }
        Ok(self.db.relay_history(limit as i64).await?)
    }

    // -- Sensors ------------------------------------------------------------

    pub async fn current_snapshot(&self) -> Option<SnapshotView> {
        self.shared
            .read()
            .await
            .snapshot_view(Instant::now(), self.staleness_bound)
    }

    pub async fn sensor_history(&self, hours: u32) -> Result<Vec<StoredSnapshot>, SurfaceError> {
        if hours == 0 || hours > MAX_HISTORY_HOURS {
            return Err(ValidationError::new(
                "hours",
                format!("must be between 1 and {MAX_HISTORY_HOURS}"),
            )
            .into());
        }
        let since = OffsetDateTime::now_utc() - time::Duration::hours(hours as i64);
        Ok(self.db.snapshots_since(since).await?)
    }

    // -- Status -------------------------------------------------------------

    pub async fn status(&self) -> StatusResponse {
        self.shared
            .read()
            .await
            .to_status(self.link.status(), self.staleness_bound)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

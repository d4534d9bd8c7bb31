//! TOML config file loading, validation, and seeding of default controls.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;
use time::macros::format_description;
use time::UtcOffset;

use crate::climate::ClimateSettings;
use crate::db::Db;
use crate::light::{LightSchedule, TimeOfDay};
use crate::link::LinkSettings;
use crate::sampler::{HUMIDITY_RANGE, TEMPERATURE_RANGE};
use crate::state::{ControlMode, Controls};
use crate::transport::Endpoint;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub sampling: SamplingConfig,
    pub control: ControlConfig,
    pub light: LightConfig,
    pub defaults: DefaultsConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// `"auto"`, a serial path, or `tcp://host:port`.
    pub port: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub baud_rate: u32,
    pub response_timeout_ms: u64,
    pub resync_grace_ms: u64,
    pub reconnect_interval_sec: u64,
    pub max_reconnect_attempts: u32,
    pub queue_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            port: "auto".into(),
            vendor_id: 0x2E8A,
            product_id: 0x0005,
            baud_rate: 115_200,
            response_timeout_ms: 2000,
            resync_grace_ms: 250,
            reconnect_interval_sec: 10,
            max_reconnect_attempts: 30,
            queue_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub poll_interval_sec: u64,
    /// Snapshots older than this many poll periods are stale.
    pub staleness_factor: u32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            poll_interval_sec: 5,
            staleness_factor: 3,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub climate_interval_sec: u64,
    pub min_dwell_sec: u64,
    pub forecast_horizon_min: u64,
    pub history_window: usize,
    pub min_history: usize,
    pub max_history_age_sec: u64,
    /// Longest a climate relay may stay on in auto before it is forced off.
    /// `0` disables the limit.
    pub max_on_sec: u64,
    /// How long a relay forced off by `max_on_sec` stays off.
    pub cooldown_sec: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            climate_interval_sec: 30,
            min_dwell_sec: 30,
            forecast_horizon_min: 10,
            history_window: 120,
            min_history: 12,
            max_history_age_sec: 120,
            max_on_sec: 3600,
            cooldown_sec: 450,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LightConfig {
    /// Offset such as `"+02:00"` applied to wall-clock time.
    pub utc_offset: String,
}

impl Default for LightConfig {
    fn default() -> Self {
        Self {
            utc_offset: "+00:00".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub target_temp: f64,
    pub temp_tolerance: f64,
    pub target_humidity: f64,
    pub humidity_tolerance: f64,
    pub climate_mode: ControlMode,
    pub light_mode: ControlMode,
    pub predictive: bool,
    pub light_on: String,
    pub light_off: String,
    pub light_enabled: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            target_temp: 22.0,
            temp_tolerance: 1.0,
            target_humidity: 60.0,
            humidity_tolerance: 5.0,
            climate_mode: ControlMode::Manual,
            light_mode: ControlMode::Manual,
            predictive: false,
            light_on: "06:00".into(),
            light_off: "22:00".into(),
            light_enabled: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub days: u32,
    pub cleanup_interval_hours: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: 30,
            cleanup_interval_hours: 24,
        }
    }
}

fn parse_offset(s: &str) -> Result<UtcOffset, String> {
    UtcOffset::parse(
        s.trim(),
        format_description!("[offset_hour sign:mandatory]:[offset_minute]"),
    )
    .map_err(|_| format!("'{s}' is not a UTC offset like +02:00"))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate the whole file. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_device(&mut errors);
        self.validate_timing(&mut errors);
        self.validate_defaults(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_device(&self, errors: &mut Vec<String>) {
        let d = &self.device;
        if d.port.trim().is_empty() {
            errors.push("device: port is empty (use \"auto\" for discovery)".into());
        }
        if d.baud_rate == 0 {
            errors.push("device: baud_rate must be positive".into());
        }
        if d.response_timeout_ms == 0 {
            errors.push("device: response_timeout_ms must be positive".into());
        }
        if d.queue_timeout_ms < d.response_timeout_ms {
            errors.push(format!(
                "device: queue_timeout_ms ({}) must be at least response_timeout_ms ({})",
                d.queue_timeout_ms, d.response_timeout_ms
            ));
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let positive = [
            ("sampling.poll_interval_sec", self.sampling.poll_interval_sec),
            ("sampling.staleness_factor", self.sampling.staleness_factor as u64),
            ("control.climate_interval_sec", self.control.climate_interval_sec),
            ("control.history_window", self.control.history_window as u64),
            ("control.max_history_age_sec", self.control.max_history_age_sec),
            ("retention.days", self.retention.days as u64),
            ("retention.cleanup_interval_hours", self.retention.cleanup_interval_hours),
        ];
        for (name, value) in positive {
            if value == 0 {
                errors.push(format!("{name} must be positive"));
            }
        }

        if self.control.min_history < 2 {
            errors.push(format!(
                "control.min_history must be at least 2, got {}",
                self.control.min_history
            ));
        }
        if self.control.min_history > self.control.history_window {
            errors.push(format!(
                "control.min_history ({}) exceeds control.history_window ({})",
                self.control.min_history, self.control.history_window
            ));
        }

        let c = &self.control;
        if c.max_on_sec != 0 && c.max_on_sec <= c.min_dwell_sec {
            errors.push(format!(
                "control.max_on_sec ({}) must exceed control.min_dwell_sec ({}) or be 0",
                c.max_on_sec, c.min_dwell_sec
            ));
        }

        if let Err(e) = parse_offset(&self.light.utc_offset) {
            errors.push(format!("light.utc_offset: {e}"));
        }
    }

    fn validate_defaults(&self, errors: &mut Vec<String>) {
        let d = &self.defaults;
        let (t_lo, t_hi) = TEMPERATURE_RANGE;
        let (h_lo, h_hi) = HUMIDITY_RANGE;

        if !d.target_temp.is_finite() || !(t_lo..=t_hi).contains(&d.target_temp) {
            errors.push(format!(
                "defaults: target_temp {} out of range [{t_lo}, {t_hi}]",
                d.target_temp
            ));
        }
        if !d.target_humidity.is_finite() || !(h_lo..=h_hi).contains(&d.target_humidity) {
            errors.push(format!(
                "defaults: target_humidity {} out of range [{h_lo}, {h_hi}]",
                d.target_humidity
            ));
        }
        for (name, tol) in [
            ("temp_tolerance", d.temp_tolerance),
            ("humidity_tolerance", d.humidity_tolerance),
        ] {
            if !tol.is_finite() || tol < 0.0 {
                errors.push(format!("defaults: {name} must be >= 0, got {tol}"));
            }
        }
        for (name, value) in [("light_on", &d.light_on), ("light_off", &d.light_off)] {
            if let Err(e) = TimeOfDay::parse(value) {
                errors.push(format!("defaults: {name}: {e}"));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Derived settings
    // -----------------------------------------------------------------------

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::parse(&self.device.port, self.device.vendor_id, self.device.product_id)
    }

    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            response_timeout: Duration::from_millis(self.device.response_timeout_ms),
            resync_grace: Duration::from_millis(self.device.resync_grace_ms),
            reconnect_interval: Duration::from_secs(self.device.reconnect_interval_sec),
            max_reconnect_attempts: self.device.max_reconnect_attempts,
        }
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.device.queue_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.sampling.poll_interval_sec)
    }

    /// `None` when the runtime limit is disabled.
    pub fn max_on(&self) -> Option<Duration> {
        (self.control.max_on_sec > 0).then(|| Duration::from_secs(self.control.max_on_sec))
    }

    pub fn staleness_bound(&self) -> Duration {
        self.poll_interval() * self.sampling.staleness_factor
    }

    /// Only meaningful after [`validate`](Self::validate) has passed.
    pub fn utc_offset(&self) -> UtcOffset {
        parse_offset(&self.light.utc_offset).unwrap_or(UtcOffset::UTC)
    }

    /// Controls described by `[defaults]`. Unparseable times fall back to the
    /// built-in schedule; `validate` reports them first.
    pub fn default_controls(&self) -> Controls {
        let d = &self.defaults;
        let builtin = DefaultsConfig::default();
        let time_or = |value: &str, fallback: &str| {
            TimeOfDay::parse(value)
                .or_else(|_| TimeOfDay::parse(fallback))
                .unwrap_or_default()
        };
        Controls {
            climate_mode: d.climate_mode,
            light_mode: d.light_mode,
            settings: ClimateSettings {
                target_temp: d.target_temp,
                temp_tolerance: d.temp_tolerance,
                target_humidity: d.target_humidity,
                humidity_tolerance: d.humidity_tolerance,
            },
            schedule: LightSchedule {
                on_time: time_or(&d.light_on, &builtin.light_on),
                off_time: time_or(&d.light_off, &builtin.light_off),
                enabled: d.light_enabled,
            },
            predictive: d.predictive,
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// built-in defaults.
pub fn load(path: &str) -> Result<Config> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(%path, "config file not found; using defaults");
            String::new()
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read config: {path}")),
    };
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Seed the default controls into the database. Values already stored win.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    db.seed_controls(&config.default_controls())
        .await
        .context("failed to seed default controls")?;

    tracing::info!(
        port = %config.device.port,
        poll_sec = config.sampling.poll_interval_sec,
        climate_sec = config.control.climate_interval_sec,
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

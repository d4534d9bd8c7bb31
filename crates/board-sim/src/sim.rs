//! Physical models behind the simulated board.
//!
//! The air model is a first-order lag toward ambient, pushed by whichever of
//! heater, humidifier and dehumidifier are energized. Soil probes follow a
//! mean-reverting random walk with slow drying drift, per-probe calibration
//! offsets and occasional spikes, reported as raw 16-bit ADC counts.

use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Irwin-Hall: sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured greenhouse profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Spring day: ambient 18 °C / 55 %. Heater cycles, humidity mostly in band.
    Mild,
    /// Night frost: ambient 8 °C / 70 %. Heater works hard.
    Cold,
    /// Wet spell: ambient 24 °C / 85 %. Dehumidifier territory.
    Humid,
    /// Mild climate with a failing DHT22 (~25 % null reads) and probe dropouts.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "cold" => Self::Cold,
            "humid" => Self::Humid,
            "flaky" => Self::Flaky,
            _ => Self::Mild,
        }
    }

    fn ambient(self) -> (f64, f64) {
        match self {
            Self::Mild | Self::Flaky => (18.0, 55.0),
            Self::Cold => (8.0, 70.0),
            Self::Humid => (24.0, 85.0),
        }
    }

    fn dht_failure_prob(self) -> f64 {
        match self {
            Self::Flaky => 0.25,
            _ => 0.01,
        }
    }

    fn probe_dropout_prob(self) -> f64 {
        match self {
            Self::Flaky => 0.05,
            _ => 0.0,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mild => write!(f, "mild"),
            Self::Cold => write!(f, "cold"),
            Self::Humid => write!(f, "humid"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// Air (DHT22)
// ---------------------------------------------------------------------------

/// Actuators currently acting on the air.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AirDrive {
    pub heater: bool,
    pub humidifier: bool,
    pub dehumidifier: bool,
}

pub struct ClimateSim {
    temperature: f64,
    humidity: f64,
    ambient_temp: f64,
    ambient_humidity: f64,

    /// Fraction of the gap to ambient closed per second.
    temp_loss: f64,
    humidity_loss: f64,

    /// °C per second while the heater is on.
    heat_rate: f64,
    /// %RH per second while the humidifier (or dehumidifier) is on.
    moisture_rate: f64,

    sensor_sigma: f64,
    failure_prob: f64,
}

impl ClimateSim {
    pub fn new(scenario: Scenario) -> Self {
        let (ambient_temp, ambient_humidity) = scenario.ambient();
        Self {
            temperature: ambient_temp,
            humidity: ambient_humidity,
            ambient_temp,
            ambient_humidity,
            temp_loss: 0.002,
            humidity_loss: 0.001,
            heat_rate: 0.02,
            moisture_rate: 0.05,
            sensor_sigma: 0.1,
            failure_prob: scenario.dht_failure_prob(),
        }
    }

    pub fn with_failure_prob(mut self, p: f64) -> Self {
        self.failure_prob = p.clamp(0.0, 1.0);
        self
    }

    /// Advance the model by `dt_s` simulated seconds, integrating in 1 s steps.
    pub fn step(&mut self, dt_s: f64, drive: AirDrive) {
        let mut remaining = dt_s.max(0.0);
        while remaining > 0.0 {
            let dt = remaining.min(1.0);
            remaining -= dt;

            let mut d_temp = self.temp_loss * (self.ambient_temp - self.temperature);
            let mut d_hum = self.humidity_loss * (self.ambient_humidity - self.humidity);
            if drive.heater {
                d_temp += self.heat_rate;
                // Warmer air holds more water: relative humidity sags.
                d_hum -= self.moisture_rate * 0.1;
            }
            if drive.humidifier {
                d_hum += self.moisture_rate;
            }
            if drive.dehumidifier {
                d_hum -= self.moisture_rate;
            }

            self.temperature = (self.temperature + d_temp * dt).clamp(-20.0, 60.0);
            self.humidity = (self.humidity + d_hum * dt).clamp(0.0, 100.0);
        }
    }

    /// One DHT22 read: `None` models the sensor's checksum/timeout failures.
    pub fn read(&self) -> Option<(f64, f64)> {
        if fastrand::f64() < self.failure_prob {
            return None;
        }
        let t = gaussian(self.temperature, self.sensor_sigma);
        let h = gaussian(self.humidity, self.sensor_sigma * 2.0).clamp(0.0, 100.0);
        Some((round1(t), round1(h)))
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn humidity(&self) -> f64 {
        self.humidity
    }
}

// ---------------------------------------------------------------------------
// Soil probes
// ---------------------------------------------------------------------------

/// ADC endpoints for a capacitive probe: higher counts mean drier soil.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    pub raw_dry: u16,
    pub raw_wet: u16,
}

impl Default for Calibration {
    /// The board's stock mapping: full scale is bone dry, zero is saturated.
    fn default() -> Self {
        Self {
            raw_dry: u16::MAX,
            raw_wet: 0,
        }
    }
}

/// Map a raw reading onto 0..=100 %, rounded to one decimal. `None` when the
/// endpoints coincide.
pub fn compute_moisture(raw: u16, raw_dry: u16, raw_wet: u16) -> Option<f64> {
    if raw_dry == raw_wet {
        return None;
    }
    let span = f64::from(raw_dry) - f64::from(raw_wet);
    let pct = (f64::from(raw_dry) - f64::from(raw)) / span * 100.0;
    Some(round1(pct.clamp(0.0, 100.0)))
}

struct Probe {
    /// "True" moisture in ADC counts. Evolves each sample.
    base: f64,
    /// Permanent calibration offset, so co-located probes disagree.
    offset: f64,
    noise_sigma: f64,
}

pub struct SoilSim {
    probes: Vec<Probe>,
    lo: f64,
    hi: f64,
    center: f64,
    drift_per_sample: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    spike_prob: f64,
    spike_sigma: f64,
    dropout_prob: f64,
}

impl SoilSim {
    pub fn new(scenario: Scenario, probe_count: usize, cal: Calibration) -> Self {
        let lo = f64::from(cal.raw_dry.min(cal.raw_wet));
        let hi = f64::from(cal.raw_dry.max(cal.raw_wet));
        let range = (hi - lo).max(1.0);
        let center = (lo + hi) / 2.0;
        // Drying moves toward the dry endpoint, whichever end that is.
        let toward_dry = if cal.raw_dry >= cal.raw_wet { 1.0 } else { -1.0 };

        let probes = (0..probe_count)
            .map(|_| Probe {
                base: (center + gaussian(0.0, range * 0.05)).clamp(lo, hi),
                offset: gaussian(0.0, range * 0.02),
                noise_sigma: range * 0.004 * (1.0 + 0.2 * approx_std_normal()).max(0.3),
            })
            .collect();

        Self {
            probes,
            lo,
            hi,
            center,
            drift_per_sample: toward_dry * range * 0.0005,
            walk_sigma: range * 0.005,
            mean_reversion: 0.02,
            spike_prob: 0.02,
            spike_sigma: range * 0.1,
            dropout_prob: scenario.probe_dropout_prob(),
        }
    }

    /// Next raw reading for probe `index`, or `None` for a missing probe.
    pub fn sample(&mut self, index: usize) -> Option<u16> {
        let probe = self.probes.get_mut(index)?;

        let pull = self.mean_reversion * (self.center - probe.base);
        let walk = gaussian(0.0, self.walk_sigma);
        probe.base = (probe.base + self.drift_per_sample + pull + walk).clamp(self.lo, self.hi);

        if fastrand::f64() < self.dropout_prob {
            return None;
        }

        let spike = if fastrand::f64() < self.spike_prob {
            gaussian(0.0, self.spike_sigma)
        } else {
            0.0
        };
        let reading = probe.base + probe.offset + gaussian(0.0, probe.noise_sigma) + spike;
        Some(reading.round().clamp(0.0, f64::from(u16::MAX)) as u16)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.len()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Air model ----------------------------------------------------------

    #[test]
    fn idle_air_stays_at_ambient() {
        let mut sim = ClimateSim::new(Scenario::Mild);
        sim.step(3600.0, AirDrive::default());
        assert!((sim.temperature() - 18.0).abs() < 1e-9);
        assert!((sim.humidity() - 55.0).abs() < 1e-9);
    }

    #[test]
    fn heater_raises_temperature() {
        let mut sim = ClimateSim::new(Scenario::Cold);
        sim.step(
            600.0,
            AirDrive {
                heater: true,
                ..AirDrive::default()
            },
        );
        assert!(sim.temperature() > 8.0 + 3.0, "got {}", sim.temperature());
    }

    #[test]
    fn air_relaxes_back_toward_ambient() {
        let mut sim = ClimateSim::new(Scenario::Mild);
        let heat = AirDrive {
            heater: true,
            ..AirDrive::default()
        };
        sim.step(600.0, heat);
        let warm = sim.temperature();
        sim.step(600.0, AirDrive::default());
        assert!(sim.temperature() < warm);
        assert!(sim.temperature() > 18.0);
    }

    #[test]
    fn humidifier_and_dehumidifier_push_opposite_ways() {
        let mut wet = ClimateSim::new(Scenario::Mild);
        wet.step(
            300.0,
            AirDrive {
                humidifier: true,
                ..AirDrive::default()
            },
        );
        let mut dry = ClimateSim::new(Scenario::Mild);
        dry.step(
            300.0,
            AirDrive {
                dehumidifier: true,
                ..AirDrive::default()
            },
        );
        assert!(wet.humidity() > 55.0);
        assert!(dry.humidity() < 55.0);
    }

    #[test]
    fn humidity_is_clamped() {
        let mut sim = ClimateSim::new(Scenario::Humid);
        sim.step(
            100_000.0,
            AirDrive {
                humidifier: true,
                ..AirDrive::default()
            },
        );
        assert!(sim.humidity() <= 100.0);
    }

    #[test]
    fn reads_never_fail_with_zero_failure_prob() {
        let sim = ClimateSim::new(Scenario::Flaky).with_failure_prob(0.0);
        for _ in 0..200 {
            let (t, h) = sim.read().unwrap();
            assert!((t - 18.0).abs() < 2.0);
            assert!((0.0..=100.0).contains(&h));
        }
    }

    #[test]
    fn reads_always_fail_with_certain_failure() {
        let sim = ClimateSim::new(Scenario::Mild).with_failure_prob(1.0);
        assert!((0..50).all(|_| sim.read().is_none()));
    }

    // -- Soil moisture ------------------------------------------------------

    #[test]
    fn stock_calibration_matches_board_mapping() {
        let cal = Calibration::default();
        assert_eq!(compute_moisture(0, cal.raw_dry, cal.raw_wet), Some(100.0));
        assert_eq!(compute_moisture(u16::MAX, cal.raw_dry, cal.raw_wet), Some(0.0));
        assert_eq!(compute_moisture(32768, cal.raw_dry, cal.raw_wet), Some(50.0));
    }

    #[test]
    fn custom_calibration_clamps_outside_endpoints() {
        assert_eq!(compute_moisture(60_000, 52_000, 24_000), Some(0.0));
        assert_eq!(compute_moisture(10_000, 52_000, 24_000), Some(100.0));
        assert_eq!(compute_moisture(38_000, 52_000, 24_000), Some(50.0));
    }

    #[test]
    fn degenerate_calibration_yields_none() {
        assert_eq!(compute_moisture(1000, 30_000, 30_000), None);
    }

    #[test]
    fn probe_readings_map_into_percent_range() {
        let cal = Calibration {
            raw_dry: 52_000,
            raw_wet: 24_000,
        };
        let mut soil = SoilSim::new(Scenario::Mild, 4, cal);
        for _ in 0..200 {
            for i in 0..soil.probe_count() {
                let raw = soil.sample(i).unwrap();
                let pct = compute_moisture(raw, cal.raw_dry, cal.raw_wet).unwrap();
                assert!((0.0..=100.0).contains(&pct));
            }
        }
    }

    #[test]
    fn missing_probe_index_is_none() {
        let mut soil = SoilSim::new(Scenario::Mild, 2, Calibration::default());
        assert!(soil.sample(2).is_none());
    }

    #[test]
    fn consecutive_readings_are_coherent() {
        let mut soil = SoilSim::new(Scenario::Mild, 1, Calibration::default());
        let samples: Vec<i64> = (0..100)
            .map(|_| i64::from(soil.sample(0).unwrap()))
            .collect();
        let max_jump = samples.windows(2).map(|w| (w[1] - w[0]).abs()).max().unwrap();
        // Full scale is 65535; spikes can reach a few tenths of it.
        assert!(max_jump < 40_000, "max consecutive jump too large: {max_jump}");
    }

    // -- Scenario -----------------------------------------------------------

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("COLD"), Scenario::Cold);
        assert_eq!(Scenario::from_str_lossy("humid"), Scenario::Humid);
        assert_eq!(Scenario::from_str_lossy("Flaky"), Scenario::Flaky);
        assert_eq!(Scenario::from_str_lossy("mild"), Scenario::Mild);
        assert_eq!(Scenario::from_str_lossy("nope"), Scenario::Mild);
    }

    #[test]
    fn scenario_display_round_trips_through_lossy_parse() {
        for s in [Scenario::Mild, Scenario::Cold, Scenario::Humid, Scenario::Flaky] {
            assert_eq!(Scenario::from_str_lossy(&s.to_string()), s);
        }
    }
}

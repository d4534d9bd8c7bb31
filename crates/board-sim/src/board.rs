//! Command handling for the simulated board: one request line in, one reply
//! line out, with the same reply shapes the firmware produces.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Instant;

use crate::sim::{compute_moisture, AirDrive, Calibration, ClimateSim, SoilSim};

pub const BANNER: &str = "RP2040 Board 1 - Greenhouse Controller Started";
pub const BOARD_ID: &str = "rp2040_board1";

const RELAYS: [&str; 4] = ["humidifier", "dehumidifier", "heater", "light"];
const PROBES: usize = 4;

#[derive(Debug, Deserialize)]
struct Request {
    command: Option<String>,
    relay: Option<String>,
    state: Option<bool>,
}

pub struct Board {
    climate: ClimateSim,
    soil: SoilSim,
    calibration: Calibration,
    relays: [bool; 4],
    /// Simulated seconds per wall-clock second.
    speed: f64,
    last_step: Option<Instant>,
}

impl Board {
    pub fn new(climate: ClimateSim, soil: SoilSim, calibration: Calibration, speed: f64) -> Self {
        Self {
            climate,
            soil,
            calibration,
            relays: [false; 4],
            speed: speed.max(0.0),
            last_step: None,
        }
    }

    pub fn relay(&self, name: &str) -> Option<bool> {
        RELAYS
            .iter()
            .position(|r| *r == name)
            .map(|i| self.relays[i])
    }

    fn drive(&self) -> AirDrive {
        AirDrive {
            humidifier: self.relays[0],
            dehumidifier: self.relays[1],
            heater: self.relays[2],
        }
    }

    /// Integrate the air model up to `now` under the current relay states.
    fn advance(&mut self, now: Instant) {
        if let Some(prev) = self.last_step {
            let dt = now.saturating_duration_since(prev).as_secs_f64() * self.speed;
            let drive = self.drive();
            self.climate.step(dt, drive);
        }
        self.last_step = Some(now);
    }

    fn relay_states(&self) -> Map<String, Value> {
        RELAYS
            .iter()
            .zip(self.relays)
            .map(|(name, on)| (name.to_string(), Value::Bool(on)))
            .collect()
    }

    pub fn handle_line(&mut self, line: &str) -> String {
        self.handle_line_at(line, Instant::now())
    }

    /// Process one request line (without its newline) and return the reply.
    pub fn handle_line_at(&mut self, line: &str, now: Instant) -> String {
        self.advance(now);

        let req: Request = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => return json!({ "error": e.to_string() }).to_string(),
        };

        let reply = match req.command.as_deref() {
            Some("read_all") => self.read_all(),
            Some("set_relay") => self.set_relay(req.relay, req.state),
            Some("get_relays") => json!({ "relays": self.relay_states(), "status": "ok" }),
            Some("ping") => json!({ "status": "ok", "board": BOARD_ID }),
            _ => json!({ "error": "unknown_command" }),
        };
        reply.to_string()
    }

    fn read_all(&mut self) -> Value {
        let (temperature, humidity) = match self.climate.read() {
            Some((t, h)) => (Value::from(t), Value::from(h)),
            None => (Value::Null, Value::Null),
        };

        let cal = self.calibration;
        let soil: Map<String, Value> = (0..PROBES)
            .map(|i| {
                let pct = self
                    .soil
                    .sample(i)
                    .and_then(|raw| compute_moisture(raw, cal.raw_dry, cal.raw_wet));
                (format!("soil{}", i + 1), pct.map_or(Value::Null, Value::from))
            })
            .collect();

        json!({
            "temperature": temperature,
            "humidity": humidity,
            "soil_moisture": soil,
            "relays": self.relay_states(),
            "status": "ok",
        })
    }

    fn set_relay(&mut self, relay: Option<String>, state: Option<bool>) -> Value {
        // A missing state reads as off, the same as the firmware's pin write.
        let state = state.unwrap_or(false);
        let success = match relay.as_deref().and_then(|r| RELAYS.iter().position(|n| *n == r)) {
            Some(i) => {
                self.relays[i] = state;
                tracing::info!(relay = RELAYS[i], state, "relay set");
                true
            }
            None => {
                tracing::warn!(relay = ?relay, "set_relay for unknown relay");
                false
            }
        };
        json!({
            "command": "set_relay",
            "relay": relay,
            "state": state,
            "success": success,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Scenario;
    use std::time::Duration;

    fn board() -> Board {
        Board::new(
            ClimateSim::new(Scenario::Cold).with_failure_prob(0.0),
            SoilSim::new(Scenario::Mild, PROBES, Calibration::default()),
            Calibration::default(),
            1.0,
        )
    }

    fn reply(b: &mut Board, line: &str) -> Value {
        serde_json::from_str(&b.handle_line(line)).unwrap()
    }

    // -- Commands -----------------------------------------------------------

    #[test]
    fn ping_identifies_board() {
        let v = reply(&mut board(), r#"{"command":"ping"}"#);
        assert_eq!(v, json!({ "status": "ok", "board": "rp2040_board1" }));
    }

    #[test]
    fn read_all_reports_every_field() {
        let v = reply(&mut board(), r#"{"command":"read_all"}"#);
        assert_eq!(v["status"], "ok");
        assert!(v["temperature"].is_f64());
        assert!(v["humidity"].is_f64());
        let soil = v["soil_moisture"].as_object().unwrap();
        assert_eq!(soil.len(), 4);
        for key in ["soil1", "soil2", "soil3", "soil4"] {
            let pct = soil[key].as_f64().unwrap();
            assert!((0.0..=100.0).contains(&pct));
        }
        assert_eq!(v["relays"].as_object().unwrap().len(), 4);
    }

    #[test]
    fn failed_dht_read_is_null() {
        let mut b = Board::new(
            ClimateSim::new(Scenario::Mild).with_failure_prob(1.0),
            SoilSim::new(Scenario::Mild, PROBES, Calibration::default()),
            Calibration::default(),
            1.0,
        );
        let v = reply(&mut b, r#"{"command":"read_all"}"#);
        assert!(v["temperature"].is_null());
        assert!(v["humidity"].is_null());
        assert_eq!(v["status"], "ok");
    }

    #[test]
    fn set_relay_switches_and_echoes() {
        let mut b = board();
        let v = reply(&mut b, r#"{"command":"set_relay","relay":"heater","state":true}"#);
        assert_eq!(
            v,
            json!({ "command": "set_relay", "relay": "heater", "state": true, "success": true })
        );
        assert_eq!(b.relay("heater"), Some(true));

        let v = reply(&mut b, r#"{"command":"get_relays"}"#);
        assert_eq!(v["relays"]["heater"], true);
        assert_eq!(v["relays"]["light"], false);
        assert_eq!(v["status"], "ok");
    }

    #[test]
    fn set_relay_unknown_name_fails() {
        let mut b = board();
        let v = reply(&mut b, r#"{"command":"set_relay","relay":"sprinkler","state":true}"#);
        assert_eq!(v["success"], false);
        assert_eq!(v["relay"], "sprinkler");
        assert!(RELAYS.iter().all(|r| b.relay(r) == Some(false)));
    }

    #[test]
    fn set_relay_without_state_turns_off() {
        let mut b = board();
        reply(&mut b, r#"{"command":"set_relay","relay":"light","state":true}"#);
        let v = reply(&mut b, r#"{"command":"set_relay","relay":"light"}"#);
        assert_eq!(v["state"], false);
        assert_eq!(b.relay("light"), Some(false));
    }

    #[test]
    fn unknown_command_is_reported() {
        let v = reply(&mut board(), r#"{"command":"reboot"}"#);
        assert_eq!(v, json!({ "error": "unknown_command" }));
    }

    #[test]
    fn malformed_json_is_reported() {
        let v = reply(&mut board(), "{not json");
        assert!(v["error"].is_string());
    }

    // -- Physics coupling ---------------------------------------------------

    #[test]
    fn energized_heater_warms_the_air_over_time() {
        let mut b = board();
        let t0 = Instant::now();
        b.handle_line_at(
            r#"{"command":"set_relay","relay":"heater","state":true}"#,
            t0,
        );
        b.handle_line_at(r#"{"command":"ping"}"#, t0 + Duration::from_secs(900));
        assert!(b.climate.temperature() > 8.0 + 3.0);
    }

    #[test]
    fn speed_multiplier_scales_simulated_time() {
        let mut slow = board();
        let mut fast = Board::new(
            ClimateSim::new(Scenario::Cold).with_failure_prob(0.0),
            SoilSim::new(Scenario::Mild, PROBES, Calibration::default()),
            Calibration::default(),
            10.0,
        );
        let t0 = Instant::now();
        let on = r#"{"command":"set_relay","relay":"heater","state":true}"#;
        slow.handle_line_at(on, t0);
        fast.handle_line_at(on, t0);
        let later = t0 + Duration::from_secs(60);
        slow.handle_line_at(r#"{"command":"ping"}"#, later);
        fast.handle_line_at(r#"{"command":"ping"}"#, later);
        assert!(fast.climate.temperature() > slow.climate.temperature());
    }
}

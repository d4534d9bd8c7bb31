//! Line-delimited JSON protocol spoken by the greenhouse board.
//!
//! Requests are one JSON object per line, tagged by `command`. Replies carry a
//! loose bag of optional fields; which ones are present depends on the
//! command, and a missing or `null` numeric field means the sensor read
//! failed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Relays
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relay {
    Humidifier,
    Dehumidifier,
    Heater,
    Light,
}

impl Relay {
    pub const ALL: [Relay; 4] = [
        Relay::Humidifier,
        Relay::Dehumidifier,
        Relay::Heater,
        Relay::Light,
    ];

    /// Relays driven by the climate controllers.
    pub const CLIMATE: [Relay; 3] = [Relay::Humidifier, Relay::Dehumidifier, Relay::Heater];

    pub fn as_str(self) -> &'static str {
        match self {
            Relay::Humidifier => "humidifier",
            Relay::Dehumidifier => "dehumidifier",
            Relay::Heater => "heater",
            Relay::Light => "light",
        }
    }

    pub fn is_climate(self) -> bool {
        self != Relay::Light
    }

    /// The relay that must never be energized together with this one.
    pub fn exclusive_partner(self) -> Option<Relay> {
        match self {
            Relay::Humidifier => Some(Relay::Dehumidifier),
            Relay::Dehumidifier => Some(Relay::Humidifier),
            Relay::Heater | Relay::Light => None,
        }
    }
}

impl fmt::Display for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Relay {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "humidifier" => Ok(Relay::Humidifier),
            "dehumidifier" => Ok(Relay::Dehumidifier),
            "heater" => Ok(Relay::Heater),
            "light" => Ok(Relay::Light),
            other => Err(format!("unknown relay '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    ReadAll,
    SetRelay { relay: Relay, state: bool },
    GetRelays,
    Ping,
}

impl Command {
    /// Serialise to a single request line (without the trailing newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::ReadAll => "read_all",
            Command::SetRelay { .. } => "set_relay",
            Command::GetRelays => "get_relays",
            Command::Ping => "ping",
        }
    }
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub soil_moisture: Option<HashMap<String, Option<f64>>>,
    #[serde(default)]
    pub relays: Option<HashMap<String, bool>>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub relay: Option<String>,
    #[serde(default)]
    pub state: Option<bool>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub board: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Response {
    /// Whether this reply has the shape of an answer to `command`. Lines that
    /// do not are treated as stray output (e.g. a late reply to an earlier,
    /// abandoned request) and skipped by the link.
    pub fn answers(&self, command: &Command) -> bool {
        if self.error.is_some() {
            return true;
        }
        match command {
            Command::ReadAll => self.soil_moisture.is_some(),
            Command::GetRelays => self.relays.is_some() && self.soil_moisture.is_none(),
            Command::SetRelay { relay, .. } => self.relay.as_deref() == Some(relay.as_str()),
            Command::Ping => {
                self.status.is_some()
                    && self.relays.is_none()
                    && self.soil_moisture.is_none()
                    && self.relay.is_none()
            }
        }
    }

    /// Relay states reported by the board, keyed by known relay.
    pub fn relay_states(&self) -> HashMap<Relay, bool> {
        self.relays
            .iter()
            .flatten()
            .filter_map(|(name, on)| name.parse::<Relay>().ok().map(|r| (r, *on)))
            .collect()
    }

    pub fn status_ok(&self) -> bool {
        self.status.as_deref() == Some("ok")
    }
}

/// Strip any bytes preceding the first `{`. Returns `None` if the line holds
/// no JSON object at all.
pub fn json_payload(line: &str) -> Option<&str> {
    let start = line.find('{')?;
    let payload = line[start..].trim_end();
    if payload.is_empty() {
        None
    } else {
        Some(payload)
    }
}

pub fn parse_response(payload: &str) -> Result<Response, String> {
    serde_json::from_str::<Response>(payload).map_err(|e| format!("{e}: {payload}"))
}

// ===========================================================================
// Tests
// ===========================================================================

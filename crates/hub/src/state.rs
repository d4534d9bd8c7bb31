use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::actuator::{Cause, RelayState};
use crate::climate::ClimateSettings;
use crate::light::LightSchedule;
use crate::link::LinkStatus;
use crate::protocol::Relay;
use crate::sampler::SensorSnapshot;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Modes + controls
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    Manual,
    /// `schedule` is the light subsystem's historical name for auto.
    #[serde(alias = "schedule")]
    Auto,
}

impl ControlMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlMode::Manual => "manual",
            ControlMode::Auto => "auto",
        }
    }
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(ControlMode::Manual),
            "auto" | "schedule" => Ok(ControlMode::Auto),
            other => Err(format!("unknown mode '{other}' (use manual or auto)")),
        }
    }
}

/// Operator-owned configuration, read by the control loop at the start of
/// every tick and never mutated by the control core.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Controls {
    pub climate_mode: ControlMode,
    pub light_mode: ControlMode,
    pub settings: ClimateSettings,
    pub schedule: LightSchedule,
    pub predictive: bool,
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub controls: Controls,
    pub relays: BTreeMap<Relay, RelayState>,
    pub latest: Option<SensorSnapshot>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Relay,
    Mode,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct SnapshotView {
    #[serde(flatten)]
    pub snapshot: SensorSnapshot,
    pub age_secs: u64,
    pub stale: bool,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub link: LinkStatus,
    pub sensors: Option<SnapshotView>,
    pub relays: Vec<RelayState>,
    pub controls: Controls,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(controls: Controls) -> Self {
        let relays = Relay::ALL
            .iter()
            .map(|&r| (r, RelayState::off(r)))
            .collect();

        Self {
            started_at: Instant::now(),
            controls,
            relays,
            latest: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared(controls: Controls) -> SharedState {
        Arc::new(RwLock::new(Self::new(controls)))
    }

    /// Publish the newest sensor snapshot. An invalid snapshot is logged as an
    /// error event only when the previous one was valid, so a board that stays
    /// down does not flush the ring buffer.
    pub fn record_snapshot(&mut self, snapshot: SensorSnapshot) {
        let was_valid = self.latest.as_ref().map_or(true, |s| s.valid);
        if !snapshot.valid && was_valid {
            self.push_event(EventKind::Error, "sensor data unavailable".to_string());
        } else if snapshot.valid && !was_valid {
            self.push_event(EventKind::System, "sensor data restored".to_string());
        }
        self.latest = Some(snapshot);
    }

    /// Record a relay transition made by the actuator.
    pub fn record_relay(&mut self, state: &RelayState, cause: Cause) {
        self.relays.insert(state.name, state.clone());
        let state_str = if state.energized { "ON" } else { "OFF" };
        self.push_event(
            EventKind::Relay,
            format!("{} set {state_str} ({cause})", state.name),
        );
    }

    /// Adopt relay states without logging a transition (board sync).
    pub fn adopt_relays(&mut self, states: impl IntoIterator<Item = RelayState>) {
        for s in states {
            self.relays.insert(s.name, s);
        }
    }

    pub fn record_mode(&mut self, subsystem: &str, mode: ControlMode) {
        self.push_event(EventKind::Mode, format!("{subsystem} mode set to {mode}"));
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self, link: LinkStatus, staleness_bound: Duration) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            link,
            sensors: self.snapshot_view(Instant::now(), staleness_bound),
            relays: self.relays.values().cloned().collect(),
            controls: self.controls.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    pub fn snapshot_view(&self, now: Instant, staleness_bound: Duration) -> Option<SnapshotView> {
        self.latest.as_ref().map(|s| SnapshotView {
            snapshot: s.clone(),
            age_secs: s.age(now).as_secs(),
            stale: !s.is_actionable(now, staleness_bound),
        })
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::light::TimeOfDay;
    use crate::sampler::SoilMoisture;

    pub(crate) fn test_controls() -> Controls {
        Controls {
            climate_mode: ControlMode::Manual,
            light_mode: ControlMode::Manual,
            settings: ClimateSettings {
                target_temp: 22.0,
                temp_tolerance: 1.0,
                target_humidity: 60.0,
                humidity_tolerance: 5.0,
            },
            schedule: LightSchedule {
                on_time: TimeOfDay::from_hm(6, 0).unwrap(),
                off_time: TimeOfDay::from_hm(22, 0).unwrap(),
                enabled: true,
            },
            predictive: false,
        }
    }

    fn snapshot(valid: bool) -> SensorSnapshot {
        SensorSnapshot {
            temperature: Some(21.0),
            humidity: Some(55.0),
            soil_moisture: SoilMoisture::default(),
            ts: OffsetDateTime::now_utc(),
            taken_at: Instant::now(),
            valid,
        }
    }

    // -- Modes --------------------------------------------------------------

    #[test]
    fn control_mode_parses_schedule_as_auto() {
        assert_eq!("schedule".parse::<ControlMode>().unwrap(), ControlMode::Auto);
        assert_eq!("AUTO".parse::<ControlMode>().unwrap(), ControlMode::Auto);
        assert_eq!("manual".parse::<ControlMode>().unwrap(), ControlMode::Manual);
        assert!("off".parse::<ControlMode>().is_err());
    }

    #[test]
    fn control_mode_serializes_lowercase() {
        assert_eq!(serde_json::to_value(ControlMode::Auto).unwrap(), "auto");
    }

    // -- Ring buffer --------------------------------------------------------

    #[test]
    fn events_are_capped() {
        let mut st = SystemState::new(test_controls());
        for i in 0..(MAX_EVENTS + 25) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "event 25");
    }

    #[test]
    fn new_state_has_all_relays_off() {
        let st = SystemState::new(test_controls());
        assert_eq!(st.relays.len(), 4);
        assert!(st.relays.values().all(|r| !r.energized));
    }

    // -- Snapshot bookkeeping -----------------------------------------------

    #[test]
    fn repeated_invalid_snapshots_log_once() {
        let mut st = SystemState::new(test_controls());
        st.record_snapshot(snapshot(true));
        st.record_snapshot(snapshot(false));
        st.record_snapshot(snapshot(false));
        st.record_snapshot(snapshot(false));
        let errors = st
            .events
            .iter()
            .filter(|e| e.kind == EventKind::Error)
            .count();
        assert_eq!(errors, 1);

        st.record_snapshot(snapshot(true));
        assert_eq!(st.events.back().unwrap().detail, "sensor data restored");
    }

    #[test]
    fn status_lists_newest_event_first() {
        let mut st = SystemState::new(test_controls());
        st.record_system("first".into());
        st.record_system("second".into());
        let status = st.to_status(LinkStatus::default(), Duration::from_secs(15));
        assert_eq!(status.events[0].detail, "second");
        assert!(status.sensors.is_none());
    }

    #[test]
    fn snapshot_view_flags_stale_data() {
        let mut st = SystemState::new(test_controls());
        st.record_snapshot(snapshot(true));
        let later = Instant::now() + Duration::from_secs(20);
        let view = st.snapshot_view(later, Duration::from_secs(15)).unwrap();
        assert!(view.stale);
        assert!(view.age_secs >= 19);
    }
}

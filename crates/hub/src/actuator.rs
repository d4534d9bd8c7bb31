//! Relay actuator: the only code path that writes relay state to the board.
//!
//! Every write, manual or automatic, goes through [`Actuator::apply`]. Asking
//! for the state a relay is already in is a no-op; flipping a relay again
//! inside the dwell interval returns the unchanged state instead of failing.
//!
//! A write whose outcome is unknown (timeout, broken pipe) may still have run
//! on the board. Such a relay is held as unconfirmed until the board reports
//! its real state, either through [`Actuator::reconcile_at`] after a sample or
//! through a `get_relays` round trip before the next write to it.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::db::Db;
use crate::link::{LinkError, LinkHandle};
use crate::protocol::{Command, Relay};
use crate::state::SharedState;

pub type SharedActuator = Arc<Mutex<Actuator>>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Cause {
    Manual,
    Threshold,
    Predictive,
    Schedule,
}

impl Cause {
    pub fn as_str(self) -> &'static str {
        match self {
            Cause::Manual => "manual",
            Cause::Threshold => "threshold",
            Cause::Predictive => "predictive",
            Cause::Schedule => "schedule",
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cause {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Cause::Manual),
            "threshold" => Ok(Cause::Threshold),
            "predictive" => Ok(Cause::Predictive),
            "schedule" => Ok(Cause::Schedule),
            other => Err(format!("unknown cause '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayState {
    pub name: Relay,
    pub energized: bool,
    #[serde(skip)]
    pub last_change: Option<Instant>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub changed_at: Option<OffsetDateTime>,
}

impl RelayState {
    pub fn off(name: Relay) -> Self {
        Self {
            name,
            energized: false,
            last_change: None,
            changed_at: None,
        }
    }
}

/// Append-only audit record of one actual relay transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayHistoryEntry {
    pub relay: Relay,
    pub state: bool,
    pub cause: Cause,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
}

/// Transitions kept in memory while the history table cannot be written.
const MAX_UNRECORDED: usize = 256;

/// A write sent to the board whose reply never arrived.
#[derive(Debug, Clone, Copy)]
struct Unconfirmed {
    desired: bool,
    cause: Cause,
    sent_at: Instant,
    sent_wall: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActuatorError {
    #[error("link unavailable: {0}")]
    LinkUnavailable(#[from] LinkError),
    #[error("unknown relay '{0}'")]
    UnknownRelay(String),
}

// ---------------------------------------------------------------------------
// Actuator
// ---------------------------------------------------------------------------

pub struct Actuator {
    link: LinkHandle,
    db: Db,
    shared: SharedState,
    min_dwell: Duration,
    relays: BTreeMap<Relay, RelayState>,
    unconfirmed: BTreeMap<Relay, Unconfirmed>,
    unrecorded: VecDeque<RelayHistoryEntry>,
}

impl Actuator {
    pub fn new(link: LinkHandle, db: Db, shared: SharedState, min_dwell: Duration) -> Self {
        Self {
            link,
            db,
            shared,
            min_dwell,
            relays: Relay::ALL.iter().map(|&r| (r, RelayState::off(r))).collect(),
            unconfirmed: BTreeMap::new(),
            unrecorded: VecDeque::new(),
        }
    }

    pub fn into_shared(self) -> SharedActuator {
        Arc::new(Mutex::new(self))
    }

    pub fn relay_state(&self, relay: Relay) -> RelayState {
        self.relays
            .get(&relay)
            .cloned()
            .unwrap_or_else(|| RelayState::off(relay))
    }

    pub fn is_energized(&self, relay: Relay) -> bool {
        self.relays.get(&relay).is_some_and(|r| r.energized)
    }

    /// Energized, or an ON write to it is still unconfirmed.
    pub fn may_be_energized(&self, relay: Relay) -> bool {
        self.is_energized(relay) || self.unconfirmed.get(&relay).is_some_and(|u| u.desired)
    }

    /// Current on/off picture, for the controllers.
    pub fn relay_set(&self) -> BTreeMap<Relay, bool> {
        self.relays.iter().map(|(r, s)| (*r, s.energized)).collect()
    }

    pub fn states(&self) -> Vec<RelayState> {
        self.relays.values().cloned().collect()
    }

    /// Adopt whatever the board currently reports. Not a transition, so no
    /// history is written and dwell timers stay clear.
    pub async fn sync_from_device(&mut self) -> Result<(), ActuatorError> {
        let reply = self.link.send(Command::GetRelays).await?;
        for (relay, on) in reply.relay_states() {
            let state = self
                .relays
                .entry(relay)
                .or_insert_with(|| RelayState::off(relay));
            state.energized = on;
        }
        self.unconfirmed.clear();
        info!(relays = ?self.relay_set(), "actuator: adopted board relay states");
        self.shared.write().await.adopt_relays(self.states());
        Ok(())
    }

    /// Bring the local picture in line with relay states the board reported
    /// at `reported_at`. An unconfirmed write that the board shows as applied
    /// becomes a recorded transition; any other disagreement is adopted
    /// without history. Relays switched after `reported_at` are left alone.
    pub async fn reconcile_at(&mut self, reported: &HashMap<Relay, bool>, reported_at: Instant) {
        self.flush_history().await;

        let mut adopted = Vec::new();
        for (&relay, &on) in reported {
            let current = self.relay_state(relay);
            if current.last_change.is_some_and(|t| t > reported_at) {
                continue;
            }
            if self
                .unconfirmed
                .get(&relay)
                .is_some_and(|u| u.sent_at > reported_at)
            {
                continue;
            }
            let pending = self.unconfirmed.remove(&relay);
            if current.energized == on {
                continue;
            }

            match pending {
                Some(u) if u.desired == on => {
                    info!(relay = %relay, "actuator: unconfirmed write took effect");
                    self.commit(relay, on, u.cause, u.sent_at, u.sent_wall).await;
                }
                _ => {
                    warn!(
                        relay = %relay,
                        board = on,
                        local = current.energized,
                        "actuator: board disagrees with local relay state; adopting board"
                    );
                    let state = RelayState {
                        energized: on,
                        ..current
                    };
                    self.relays.insert(relay, state.clone());
                    adopted.push(state);
                }
            }
        }

        if !adopted.is_empty() {
            self.shared.write().await.adopt_relays(adopted);
        }
    }

    pub async fn apply(
        &mut self,
        relay: Relay,
        desired: bool,
        cause: Cause,
    ) -> Result<RelayState, ActuatorError> {
        self.apply_at(relay, desired, cause, Instant::now()).await
    }

    pub async fn apply_at(
        &mut self,
        relay: Relay,
        desired: bool,
        cause: Cause,
        now: Instant,
    ) -> Result<RelayState, ActuatorError> {
        if self.unconfirmed.contains_key(&relay) {
            self.confirm(now).await?;
        }

        let current = self.relay_state(relay);
        if current.energized == desired {
            return Ok(current);
        }

        if let Some(last) = current.last_change {
            let since = now.saturating_duration_since(last);
            if since < self.min_dwell {
                debug!(
                    relay = %relay,
                    desired,
                    %cause,
                    since_ms = since.as_millis() as u64,
                    "actuator: flip suppressed inside dwell interval"
                );
                return Ok(current);
            }
        }

        let wall = OffsetDateTime::now_utc();
        let command = Command::SetRelay {
            relay,
            state: desired,
        };
        let reply = match self.link.send(command).await {
            Ok(reply) => reply,
            Err(e) => {
                if e.outcome_unknown() {
                    warn!(relay = %relay, desired, error = %e, "actuator: write outcome unknown");
                    self.unconfirmed.insert(
                        relay,
                        Unconfirmed {
                            desired,
                            cause,
                            sent_at: now,
                            sent_wall: wall,
                        },
                    );
                }
                return Err(e.into());
            }
        };
        if reply.success == Some(false) {
            return Err(ActuatorError::UnknownRelay(relay.to_string()));
        }
        self.unconfirmed.remove(&relay);

        Ok(self.commit(relay, desired, cause, now, wall).await)
    }

    /// Ask the board for its relay states and reconcile against them.
    async fn confirm(&mut self, now: Instant) -> Result<(), ActuatorError> {
        let reply = self.link.send(Command::GetRelays).await?;
        self.reconcile_at(&reply.relay_states(), now).await;
        Ok(())
    }

    /// Record a transition the board has carried out.
    async fn commit(
        &mut self,
        relay: Relay,
        energized: bool,
        cause: Cause,
        at: Instant,
        wall: OffsetDateTime,
    ) -> RelayState {
        self.record_history(RelayHistoryEntry {
            relay,
            state: energized,
            cause,
            ts: wall,
        })
        .await;

        let next = RelayState {
            name: relay,
            energized,
            last_change: Some(at),
            changed_at: Some(wall),
        };
        self.relays.insert(relay, next.clone());
        self.shared.write().await.record_relay(&next, cause);

        info!(
            relay = %relay,
            state = if energized { "ON" } else { "OFF" },
            %cause,
            "relay switched"
        );
        next
    }

    /// Append to the history table behind anything still queued. On failure
    /// the entry waits in memory for the next attempt.
    async fn record_history(&mut self, entry: RelayHistoryEntry) {
        self.flush_history().await;
        if self.unrecorded.is_empty() {
            match self.db.insert_relay_event(&entry).await {
                Ok(()) => return,
                Err(e) => {
                    error!(relay = %entry.relay, "actuator: relay history write failed: {e:#}");
                    self.shared
                        .write()
                        .await
                        .record_error(format!("{} history not recorded yet: {e}", entry.relay));
                }
            }
        }
        if self.unrecorded.len() == MAX_UNRECORDED {
            if let Some(lost) = self.unrecorded.pop_front() {
                error!(relay = %lost.relay, ts = %lost.ts, "actuator: relay history entry dropped");
            }
        }
        self.unrecorded.push_back(entry);
    }

    /// Write queued history entries in order, stopping at the first failure.
    async fn flush_history(&mut self) {
        while let Some(entry) = self.unrecorded.front() {
            if let Err(e) = self.db.insert_relay_event(entry).await {
                debug!("actuator: history still unavailable: {e:#}");
                return;
            }
            self.unrecorded.pop_front();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_controls;
    use crate::state::SystemState;
    use crate::testing::{FakeBoard, Fault};

    const DWELL: Duration = Duration::from_secs(30);

    async fn setup(board: &FakeBoard) -> (Actuator, Db, SharedState) {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let shared = SystemState::shared(test_controls());
        let actuator = Actuator::new(board.link(), db.clone(), shared.clone(), DWELL);
        (actuator, db, shared)
    }

    // -- Transitions --------------------------------------------------------

    #[tokio::test]
    async fn transition_writes_board_history_and_state() {
        let board = FakeBoard::new();
        let (mut act, db, shared) = setup(&board).await;

        let s = act.apply(Relay::Heater, true, Cause::Threshold).await.unwrap();
        assert!(s.energized);
        assert!(s.last_change.is_some());
        assert!(board.relay(Relay::Heater));

        let history = db.relay_history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].relay, Relay::Heater);
        assert!(history[0].state);
        assert_eq!(history[0].cause, Cause::Threshold);

        assert!(shared.read().await.relays[&Relay::Heater].energized);
    }

    #[tokio::test]
    async fn same_state_is_a_silent_noop() {
        let board = FakeBoard::new();
        let (mut act, db, _) = setup(&board).await;

        let s = act.apply(Relay::Light, false, Cause::Manual).await.unwrap();
        assert!(!s.energized);
        assert!(board.relay_writes().is_empty());
        assert!(db.relay_history(10).await.unwrap().is_empty());
    }

    // -- Dwell --------------------------------------------------------------

    #[tokio::test]
    async fn flip_inside_dwell_returns_unchanged_state() {
        let board = FakeBoard::new();
        let (mut act, db, _) = setup(&board).await;
        let t0 = Instant::now();

        act.apply_at(Relay::Heater, true, Cause::Threshold, t0)
            .await
            .unwrap();
        for secs in [1, 10, 29] {
            let s = act
                .apply_at(Relay::Heater, false, Cause::Threshold, t0 + Duration::from_secs(secs))
                .await
                .unwrap();
            assert!(s.energized, "flip at +{secs}s must be suppressed");
        }
        assert_eq!(board.relay_writes().len(), 1);

        let s = act
            .apply_at(Relay::Heater, false, Cause::Threshold, t0 + DWELL)
            .await
            .unwrap();
        assert!(!s.energized);
        assert_eq!(board.relay_writes().len(), 2);
        assert_eq!(db.relay_history(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn dwell_is_per_relay() {
        let board = FakeBoard::new();
        let (mut act, _, _) = setup(&board).await;
        let t0 = Instant::now();

        act.apply_at(Relay::Heater, true, Cause::Threshold, t0)
            .await
            .unwrap();
        let s = act
            .apply_at(Relay::Light, true, Cause::Schedule, t0 + Duration::from_secs(1))
            .await
            .unwrap();
        assert!(s.energized);
    }

    // -- Failures -----------------------------------------------------------

    #[tokio::test]
    async fn link_timeout_is_link_unavailable_and_changes_nothing() {
        let board = FakeBoard::new();
        let (mut act, db, _) = setup(&board).await;

        board.inject_on("set_relay", Fault::Timeout);
        let err = act
            .apply(Relay::Humidifier, true, Cause::Threshold)
            .await
            .unwrap_err();
        assert_eq!(err, ActuatorError::LinkUnavailable(LinkError::Timeout));
        assert!(!act.is_energized(Relay::Humidifier));
        assert!(db.relay_history(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_write_can_be_retried_without_dwell() {
        let board = FakeBoard::new();
        let (mut act, _, _) = setup(&board).await;

        board.inject_on("set_relay", Fault::Timeout);
        assert!(act.apply(Relay::Heater, true, Cause::Threshold).await.is_err());
        let s = act.apply(Relay::Heater, true, Cause::Threshold).await.unwrap();
        assert!(s.energized);
    }

    #[tokio::test]
    async fn board_refusal_is_unknown_relay() {
        let board = FakeBoard::new();
        let (mut act, _, _) = setup(&board).await;

        board.inject_on(
            "set_relay",
            Fault::Replace(
                r#"{"command":"set_relay","relay":"light","state":true,"success":false}"#.into(),
            ),
        );
        let err = act.apply(Relay::Light, true, Cause::Manual).await.unwrap_err();
        assert_eq!(err, ActuatorError::UnknownRelay("light".into()));
        assert!(!act.is_energized(Relay::Light));
    }

    // -- Unconfirmed writes -------------------------------------------------

    #[tokio::test]
    async fn late_write_is_confirmed_before_next_write() {
        let board = FakeBoard::new();
        let (mut act, db, _) = setup(&board).await;
        let t0 = Instant::now();

        board.inject_on("set_relay", Fault::Late);
        let err = act
            .apply_at(Relay::Heater, true, Cause::Threshold, t0)
            .await
            .unwrap_err();
        assert_eq!(err, ActuatorError::LinkUnavailable(LinkError::Timeout));
        assert!(board.relay(Relay::Heater));
        assert!(!act.is_energized(Relay::Heater));
        assert!(act.may_be_energized(Relay::Heater));

        let s = act
            .apply_at(Relay::Heater, false, Cause::Threshold, t0 + DWELL)
            .await
            .unwrap();
        assert!(!s.energized);
        assert!(!board.relay(Relay::Heater));
        assert!(board.received().contains(&"get_relays".to_string()));

        let history = db.relay_history(10).await.unwrap();
        let states: Vec<bool> = history.iter().rev().map(|e| e.state).collect();
        assert_eq!(states, vec![true, false]);
    }

    #[tokio::test]
    async fn late_write_starts_dwell_when_it_was_sent() {
        let board = FakeBoard::new();
        let (mut act, _, _) = setup(&board).await;
        let t0 = Instant::now();

        board.inject_on("set_relay", Fault::Late);
        assert!(act
            .apply_at(Relay::Heater, true, Cause::Threshold, t0)
            .await
            .is_err());

        let s = act
            .apply_at(Relay::Heater, false, Cause::Threshold, t0 + Duration::from_secs(10))
            .await
            .unwrap();
        assert!(s.energized);
        assert_eq!(s.last_change, Some(t0));
        assert!(board.relay(Relay::Heater));
    }

    #[tokio::test]
    async fn reconcile_records_applied_write_and_adopts_strays() {
        let board = FakeBoard::new();
        let (mut act, db, shared) = setup(&board).await;
        let t0 = Instant::now();

        board.inject_on("set_relay", Fault::Late);
        assert!(act
            .apply_at(Relay::Humidifier, true, Cause::Predictive, t0)
            .await
            .is_err());

        let reported = HashMap::from([
            (Relay::Humidifier, true),
            (Relay::Light, true),
            (Relay::Heater, false),
        ]);
        act.reconcile_at(&reported, t0 + Duration::from_secs(5)).await;

        assert!(act.is_energized(Relay::Humidifier));
        assert!(act.is_energized(Relay::Light));
        assert!(shared.read().await.relays[&Relay::Light].energized);

        let history = db.relay_history(10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].relay, Relay::Humidifier);
        assert_eq!(history[0].cause, Cause::Predictive);

        // A second identical report changes nothing.
        act.reconcile_at(&reported, t0 + Duration::from_secs(10)).await;
        assert_eq!(db.relay_history(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reconcile_ignores_reports_older_than_the_last_switch() {
        let board = FakeBoard::new();
        let (mut act, _, _) = setup(&board).await;
        let t0 = Instant::now();

        act.apply_at(Relay::Light, true, Cause::Manual, t0 + Duration::from_secs(2))
            .await
            .unwrap();
        act.reconcile_at(&HashMap::from([(Relay::Light, false)]), t0)
            .await;
        assert!(act.is_energized(Relay::Light));
    }

    // -- History outage -----------------------------------------------------

    #[tokio::test]
    async fn history_outage_queues_entries_and_flushes_in_order() {
        let board = FakeBoard::new();
        let (mut act, db, shared) = setup(&board).await;
        let t0 = Instant::now();

        sqlx::query("ALTER TABLE relay_history RENAME TO relay_history_moved")
            .execute(db.pool())
            .await
            .unwrap();
        let s = act
            .apply_at(Relay::Heater, true, Cause::Threshold, t0)
            .await
            .unwrap();
        assert!(s.energized);
        assert!(board.relay(Relay::Heater));
        assert_eq!(act.unrecorded.len(), 1);
        assert!(shared
            .read()
            .await
            .events
            .iter()
            .any(|e| e.detail.contains("heater history not recorded yet")));

        sqlx::query("ALTER TABLE relay_history_moved RENAME TO relay_history")
            .execute(db.pool())
            .await
            .unwrap();
        act.apply_at(Relay::Light, true, Cause::Schedule, t0 + Duration::from_secs(1))
            .await
            .unwrap();
        assert!(act.unrecorded.is_empty());

        let history = db.relay_history(10).await.unwrap();
        let relays: Vec<Relay> = history.iter().rev().map(|e| e.relay).collect();
        assert_eq!(relays, vec![Relay::Heater, Relay::Light]);
    }

    // -- Sync ---------------------------------------------------------------

    #[tokio::test]
    async fn sync_adopts_board_state_without_history() {
        let board = FakeBoard::new();
        board.set_relay(Relay::Light, true);
        let (mut act, db, shared) = setup(&board).await;

        act.sync_from_device().await.unwrap();
        assert!(act.is_energized(Relay::Light));
        assert!(shared.read().await.relays[&Relay::Light].energized);
        assert!(db.relay_history(10).await.unwrap().is_empty());

        // Already on: no write needed.
        act.apply(Relay::Light, true, Cause::Schedule).await.unwrap();
        assert!(board.relay_writes().is_empty());
    }
}

//! Control loop: samples the board on a fixed period, runs the active climate
//! policy on a slower period, drives the light schedule, and prunes old
//! history.
//!
//! Operator controls (modes, settings, schedule) are read from shared state at
//! the start of every tick, so a mode switch takes effect on the next tick and
//! never retroactively. Switching a subsystem to manual stops automatic
//! intents and leaves its relays as they are.
//!
//! In auto, a climate relay that has been on for `max_on` is forced off and
//! kept off for `cooldown`, whatever the policy asks for.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use time::{OffsetDateTime, UtcOffset};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::actuator::{Cause, SharedActuator};
use crate::climate::{ClimatePolicy, PredictiveController, ThresholdController};
use crate::config::Config;
use crate::db::{Db, StoredSnapshot};
use crate::light::TimeOfDay;
use crate::protocol::Relay;
use crate::sampler::{Sampler, SensorSnapshot};
use crate::state::{ControlMode, SharedState};

#[derive(Debug, Clone, Copy)]
pub struct LoopTiming {
    pub poll_interval: Duration,
    pub climate_interval: Duration,
    pub staleness_bound: Duration,
    pub cleanup_interval: Duration,
    pub retention_days: u32,
    pub utc_offset: UtcOffset,
    pub max_on: Option<Duration>,
    pub cooldown: Duration,
}

impl From<&Config> for LoopTiming {
    fn from(cfg: &Config) -> Self {
        Self {
            poll_interval: cfg.poll_interval(),
            climate_interval: Duration::from_secs(cfg.control.climate_interval_sec),
            staleness_bound: cfg.staleness_bound(),
            cleanup_interval: Duration::from_secs(cfg.retention.cleanup_interval_hours * 3600),
            retention_days: cfg.retention.days,
            utc_offset: cfg.utc_offset(),
            max_on: cfg.max_on(),
            cooldown: Duration::from_secs(cfg.control.cooldown_sec),
        }
    }
}

/// What one climate tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClimateOutcome {
    Manual,
    /// No actionable data; nothing was commanded.
    Skipped(&'static str),
    Evaluated { cause: Cause, switched: usize },
}

pub struct ControlLoop {
    sampler: Sampler,
    actuator: SharedActuator,
    threshold: ThresholdController,
    predictive: PredictiveController,
    db: Db,
    shared: SharedState,
    timing: LoopTiming,
    latest: Option<SensorSnapshot>,
    cooldown_until: BTreeMap<Relay, Instant>,
}

impl ControlLoop {
    pub fn new(
        sampler: Sampler,
        actuator: SharedActuator,
        predictive: PredictiveController,
        db: Db,
        shared: SharedState,
        timing: LoopTiming,
    ) -> Self {
        Self {
            sampler,
            actuator,
            threshold: ThresholdController,
            predictive,
            db,
            shared,
            timing,
            latest: None,
            cooldown_until: BTreeMap::new(),
        }
    }

    /// Prime the predictive history window from persisted snapshots.
    pub fn warm_up(&mut self, history: &[StoredSnapshot]) {
        self.predictive
            .seed(history.iter().map(StoredSnapshot::history_point));
        info!(
            points = self.predictive.history_len(),
            "control: predictive history warmed up"
        );
    }

    /// Run forever. Intended to be the last thing `main` awaits.
    pub async fn run(mut self) {
        let start = tokio::time::Instant::now();
        let mut sample = tokio::time::interval(self.timing.poll_interval);
        let mut climate = tokio::time::interval_at(
            start + self.timing.climate_interval,
            self.timing.climate_interval,
        );
        let mut cleanup = tokio::time::interval_at(
            start + self.timing.cleanup_interval,
            self.timing.cleanup_interval,
        );
        for t in [&mut sample, &mut climate, &mut cleanup] {
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        info!(
            poll_sec = self.timing.poll_interval.as_secs(),
            climate_sec = self.timing.climate_interval.as_secs(),
            staleness_sec = self.timing.staleness_bound.as_secs(),
            "control loop started"
        );
        self.shared
            .write()
            .await
            .record_system("control loop started".into());

        loop {
            tokio::select! {
                biased;
                _ = sample.tick() => {
                    let now = Instant::now();
                    let wall = OffsetDateTime::now_utc();
                    self.sample_tick_at(now, wall).await;
                    self.light_tick_at(now, wall).await;
                }
                _ = climate.tick() => {
                    self.climate_tick_at(Instant::now(), OffsetDateTime::now_utc()).await;
                }
                _ = cleanup.tick() => {
                    self.cleanup_at(OffsetDateTime::now_utc()).await;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Ticks
    // -----------------------------------------------------------------------

    pub async fn sample_tick_at(&mut self, now: Instant, wall: OffsetDateTime) -> SensorSnapshot {
        let snapshot = self.sampler.poll_at(now, wall).await;

        if snapshot.valid {
            if let Err(e) = self.db.insert_snapshot(&snapshot).await {
                error!("control: failed to persist snapshot: {e:#}");
            }
            self.predictive.observe(&snapshot);
        }

        if let Some(reported) = self.sampler.take_reported_relays() {
            self.actuator
                .lock()
                .await
                .reconcile_at(&reported, now)
                .await;
        }

        self.shared.write().await.record_snapshot(snapshot.clone());
        self.latest = Some(snapshot.clone());
        snapshot
    }

    pub async fn climate_tick_at(&mut self, now: Instant, wall: OffsetDateTime) -> ClimateOutcome {
        let controls = self.shared.read().await.controls.clone();
        if controls.climate_mode == ControlMode::Manual {
            return ClimateOutcome::Manual;
        }

        let snapshot = match &self.latest {
            None => {
                warn!("control: no sensor data yet; climate action skipped");
                return ClimateOutcome::Skipped("no sensor data");
            }
            Some(s) if !s.valid => {
                warn!("control: latest snapshot invalid; climate action skipped");
                return ClimateOutcome::Skipped("invalid sensor data");
            }
            Some(s) if !s.is_actionable(now, self.timing.staleness_bound) => {
                warn!(
                    age_ms = s.age(now).as_millis() as u64,
                    bound_ms = self.timing.staleness_bound.as_millis() as u64,
                    "control: sensor data stale; climate action skipped"
                );
                return ClimateOutcome::Skipped("stale sensor data");
            }
            Some(s) => s.clone(),
        };

        let mut actuator = self.actuator.lock().await;
        let current = actuator.relay_set();
        let policy: &mut dyn ClimatePolicy = if controls.predictive {
            &mut self.predictive
        } else {
            &mut self.threshold
        };
        let decision = policy.evaluate(&snapshot, &controls.settings, &current, wall);
        debug!(
            policy = policy.name(),
            intents = ?decision.intents,
            cause = %decision.cause,
            "control: climate decision"
        );

        let mut plan: Vec<(Relay, bool, Cause)> = decision
            .intents
            .ordered()
            .into_iter()
            .map(|(relay, on)| (relay, on, decision.cause))
            .collect();
        if let Some(limit) = self.timing.max_on {
            for &relay in Relay::CLIMATE.iter() {
                let state = actuator.relay_state(relay);
                let on_for = state
                    .last_change
                    .filter(|_| state.energized)
                    .map(|t| now.saturating_duration_since(t));
                if on_for.is_some_and(|d| d >= limit) {
                    warn!(
                        relay = %relay,
                        limit_sec = limit.as_secs(),
                        "control: runtime limit reached; forcing off"
                    );
                    plan.retain(|&(r, _, _)| r != relay);
                    plan.push((relay, false, Cause::Threshold));
                    self.cooldown_until.insert(relay, now + self.timing.cooldown);
                }
            }
            plan.sort_by_key(|&(_, on, _)| on);
        }

        let mut switched = 0;
        for (relay, on, cause) in plan {
            if on {
                if self.cooldown_until.get(&relay).is_some_and(|&until| now < until) {
                    debug!(relay = %relay, "control: relay cooling down after runtime limit");
                    continue;
                }
                if let Some(partner) = relay.exclusive_partner() {
                    if actuator.may_be_energized(partner) {
                        warn!(
                            relay = %relay,
                            partner = %partner,
                            "control: refusing ON while exclusive partner may be energized"
                        );
                        continue;
                    }
                }
            }

            let before = actuator.is_energized(relay);
            match actuator.apply_at(relay, on, cause, now).await {
                Ok(state) if state.energized != before => switched += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!(relay = %relay, error = %e, "control: relay write failed; retrying next tick");
                    self.shared
                        .write()
                        .await
                        .record_error(format!("{relay} write failed: {e}"));
                }
            }
        }

        ClimateOutcome::Evaluated {
            cause: decision.cause,
            switched,
        }
    }

    /// Drive the light relay from the schedule. Returns the desired state when
    /// the light subsystem is in auto.
    pub async fn light_tick_at(&mut self, now: Instant, wall: OffsetDateTime) -> Option<bool> {
        let (mode, schedule) = {
            let st = self.shared.read().await;
            (st.controls.light_mode, st.controls.schedule)
        };
        if mode == ControlMode::Manual {
            return None;
        }

        let desired = schedule.should_be_on(TimeOfDay::at(wall, self.timing.utc_offset));
        let result = self
            .actuator
            .lock()
            .await
            .apply_at(Relay::Light, desired, Cause::Schedule, now)
            .await;
        if let Err(e) = result {
            warn!(error = %e, "control: light write failed; retrying next tick");
        }
        Some(desired)
    }

    pub async fn cleanup_at(&self, wall: OffsetDateTime) {
        match self
            .db
            .cleanup_older_than(self.timing.retention_days, wall)
            .await
        {
            Ok(removed) => info!(
                removed,
                days = self.timing.retention_days,
                "control: old history pruned"
            ),
            Err(e) => error!("control: history cleanup failed: {e:#}"),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

//! Time-of-day light schedule.
//!
//! The light is on during `[on_time, off_time)`, wrapping across midnight
//! when `off_time < on_time`. `on_time == off_time` means always off.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::{OffsetDateTime, UtcOffset};

const MINUTES_PER_DAY: u16 = 24 * 60;

// ---------------------------------------------------------------------------
// TimeOfDay
// ---------------------------------------------------------------------------

/// Minutes since local midnight, serialised as `"HH:MM"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub fn from_hm(hour: u8, minute: u8) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self(hour as u16 * 60 + minute as u16))
        } else {
            None
        }
    }

    /// Strict `HH:MM` (two digits each, 24-hour clock).
    pub fn parse(s: &str) -> Result<Self, String> {
        let bytes = s.as_bytes();
        let well_formed = bytes.len() == 5
            && bytes[2] == b':'
            && [0, 1, 3, 4].iter().all(|&i| bytes[i].is_ascii_digit());
        if !well_formed {
            return Err(format!("'{s}' is not in HH:MM format"));
        }
        let hour = (bytes[0] - b'0') * 10 + (bytes[1] - b'0');
        let minute = (bytes[3] - b'0') * 10 + (bytes[4] - b'0');
        Self::from_hm(hour, minute).ok_or_else(|| format!("'{s}' is not a valid time of day"))
    }

    /// Local time of day for a UTC instant.
    pub fn at(now: OffsetDateTime, offset: UtcOffset) -> Self {
        let local = now.to_offset(offset);
        Self(local.hour() as u16 * 60 + local.minute() as u16)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightSchedule {
    pub on_time: TimeOfDay,
    pub off_time: TimeOfDay,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LightPhase {
    Off,
    On,
}

impl LightSchedule {
    pub fn is_degenerate(&self) -> bool {
        self.on_time == self.off_time
    }

    pub fn phase_at(&self, now: TimeOfDay) -> LightPhase {
        if !self.enabled || self.is_degenerate() {
            return LightPhase::Off;
        }
        let on = if self.on_time < self.off_time {
            self.on_time <= now && now < self.off_time
        } else {
            // Wraps midnight, e.g. 20:00 -> 04:00.
            now >= self.on_time || now < self.off_time
        };
        if on {
            LightPhase::On
        } else {
            LightPhase::Off
        }
    }

    pub fn should_be_on(&self, now: TimeOfDay) -> bool {
        self.phase_at(now) == LightPhase::On
    }
}

// ===========================================================================
// Tests
// ===========================================================================

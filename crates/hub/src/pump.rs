//! Pump status decision engine.
//!
//! Merges the operator pause, the manual override and the daily schedule into
//! a single ON/OFF decision.  Rules are evaluated in strict priority order and
//! the first match wins:
//!
//! ```text
//! pause active ──▶ OFF
//! pause expired ─▶ clear pause, keep going with the current mode
//! MANUAL_ON ─────▶ ON
//! MANUAL_OFF ────▶ OFF
//! AUTO ──────────▶ ON iff now is inside the active schedule window
//! anything else ─▶ OFF
//! ```
//!
//! Nothing in this module touches the store; `engine` reads state, calls
//! [`resolve`] and writes back the pause-clearing side effect.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Duration, OffsetDateTime, Time};
use tracing::warn;

/// Longest pause an operator may request, in minutes.
pub const MAX_PAUSE_MINUTES: i64 = 24 * 60;

const HMS: &[FormatItem<'static>] = format_description!("[hour]:[minute]:[second]");
const HM: &[FormatItem<'static>] = format_description!("[hour]:[minute]");

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PumpStatus {
    On,
    Off,
}

impl PumpStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }
}

impl fmt::Display for PumpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator intent when no pause is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    Auto,
    ManualOn,
    ManualOff,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::ManualOn => "MANUAL_ON",
            Self::ManualOff => "MANUAL_OFF",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    /// Strict parse of the stored representation.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AUTO" => Ok(Self::Auto),
            "MANUAL_ON" => Ok(Self::ManualOn),
            "MANUAL_OFF" => Ok(Self::ManualOff),
            _ => Err(format!("unknown control mode '{s}'")),
        }
    }
}

/// The singleton operator control record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ControlState {
    pub mode: Mode,
    #[serde(with = "time::serde::rfc3339::option")]
    pub pause_end_time: Option<OffsetDateTime>,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            mode: Mode::Auto,
            pause_end_time: None,
        }
    }
}

impl ControlState {
    /// True while a pause is set and has not yet expired at `now`.
    pub fn is_paused_at(&self, now: OffsetDateTime) -> bool {
        matches!(self.pause_end_time, Some(end) if now < end)
    }
}

/// A daily on/off window as stored.  Times are kept as text so that a row
/// with a malformed value can still be loaded and then excluded at decision
/// time instead of failing the whole read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Schedule {
    pub id: i64,
    pub on_time: String,
    pub off_time: String,
    pub is_active: bool,
}

impl Schedule {
    /// Parsed `(on, off)` time-of-day pair.
    pub fn window(&self) -> Result<(Time, Time), TimeOfDayError> {
        Ok((
            parse_time_of_day(&self.on_time)?,
            parse_time_of_day(&self.off_time)?,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid time of day {0:?} (expected HH:MM:SS or HH:MM)")]
pub struct TimeOfDayError(pub String);

/// Outcome of one resolution.  `control` is the record as it must look after
/// the call; it differs from the input only when `cleared_pause` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub status: PumpStatus,
    pub cleared_pause: bool,
    pub control: ControlState,
}

// ---------------------------------------------------------------------------
// Time-of-day helpers
// ---------------------------------------------------------------------------

/// Parse `HH:MM:SS` or `HH:MM` (seconds default to zero).
pub fn parse_time_of_day(s: &str) -> Result<Time, TimeOfDayError> {
    let trimmed = s.trim();
    Time::parse(trimmed, HMS)
        .or_else(|_| Time::parse(trimmed, HM))
        .map_err(|_| TimeOfDayError(s.to_string()))
}

/// Canonical `HH:MM:SS` text for a time of day.
pub fn format_time_of_day(t: Time) -> String {
    format!("{:02}:{:02}:{:02}", t.hour(), t.minute(), t.second())
}

/// Time of day of `now` in its own offset, truncated to whole seconds.
pub fn time_of_day(now: OffsetDateTime) -> Time {
    let t = now.time();
    t.replace_nanosecond(0).unwrap_or(t)
}

/// Is `now` inside the daily window `on..=off`?
///
/// A window with `on > off` wraps past midnight.  `on == off` is a window of
/// exactly one second: it matches only that instant.
pub fn in_window(now: Time, on: Time, off: Time) -> bool {
    if on <= off {
        on <= now && now <= off
    } else {
        now >= on || now <= off
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Decide the pump status at `now`.
///
/// `now` must already be expressed in the controller's local offset; the
/// schedule is matched against its time-of-day component.
pub fn resolve(
    now: OffsetDateTime,
    control: &ControlState,
    schedule: Option<&Schedule>,
) -> Resolution {
    let mut control = *control;
    let mut cleared_pause = false;

    if let Some(end) = control.pause_end_time {
        if now < end {
            return Resolution {
                status: PumpStatus::Off,
                cleared_pause: false,
                control,
            };
        }
        // Expiry does not reset the mode; prior intent resumes.
        control.pause_end_time = None;
        cleared_pause = true;
    }

    let status = match control.mode {
        Mode::ManualOn => PumpStatus::On,
        Mode::ManualOff => PumpStatus::Off,
        Mode::Auto => schedule_status(now, schedule),
    };

    Resolution {
        status,
        cleared_pause,
        control,
    }
}

fn schedule_status(now: OffsetDateTime, schedule: Option<&Schedule>) -> PumpStatus {
    let Some(schedule) = schedule.filter(|s| s.is_active) else {
        return PumpStatus::Off;
    };

    match schedule.window() {
        Ok((on, off)) if in_window(time_of_day(now), on, off) => PumpStatus::On,
        Ok(_) => PumpStatus::Off,
        Err(e) => {
            warn!(schedule_id = schedule.id, "ignoring unusable schedule: {e}");
            PumpStatus::Off
        }
    }
}

// ---------------------------------------------------------------------------
// Control actions
// ---------------------------------------------------------------------------

/// One of the four operator updates to the control record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Pause { minutes: i64 },
    ManualOn,
    ManualOff,
    Auto,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    #[error("unknown control action '{0}' (use PAUSE, MANUAL_ON, MANUAL_OFF or AUTO)")]
    Unknown(String),
    #[error("PAUSE requires a 'minutes' value")]
    MissingMinutes,
    #[error("pause minutes must be between 1 and {max}, got {0}", max = MAX_PAUSE_MINUTES)]
    MinutesOutOfRange(i64),
}

impl ControlAction {
    /// Parse an action name (case-insensitive, surrounding whitespace
    /// ignored) plus the optional pause length.
    pub fn parse(action: &str, minutes: Option<i64>) -> Result<Self, ActionError> {
        match action.trim().to_ascii_uppercase().as_str() {
            "PAUSE" => {
                let minutes = minutes.ok_or(ActionError::MissingMinutes)?;
                if !(1..=MAX_PAUSE_MINUTES).contains(&minutes) {
                    return Err(ActionError::MinutesOutOfRange(minutes));
                }
                Ok(Self::Pause { minutes })
            }
            "MANUAL_ON" => Ok(Self::ManualOn),
            "MANUAL_OFF" => Ok(Self::ManualOff),
            "AUTO" => Ok(Self::Auto),
            _ => Err(ActionError::Unknown(action.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pause { .. } => "PAUSE",
            Self::ManualOn => "MANUAL_ON",
            Self::ManualOff => "MANUAL_OFF",
            Self::Auto => "AUTO",
        }
    }

    /// Mode written by this action.  `None` for PAUSE, which leaves the mode
    /// untouched.
    pub fn mode(&self) -> Option<Mode> {
        match self {
            Self::Pause { .. } => None,
            Self::ManualOn => Some(Mode::ManualOn),
            Self::ManualOff => Some(Mode::ManualOff),
            Self::Auto => Some(Mode::Auto),
        }
    }

    /// Pause expiry written by this action.  Mode actions clear the pause.
    pub fn pause_end(&self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        match self {
            Self::Pause { minutes } => Some(now + Duration::minutes(*minutes)),
            _ => None,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

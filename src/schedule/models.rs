//! Schedule descriptors, period markers and scheduling cursors

use chrono::{DateTime, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised when building or parsing schedule values
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid anchor {anchor} for a {unit} schedule")]
    InvalidAnchor { unit: ScheduleUnit, anchor: u32 },
    #[error("unknown schedule unit: {0}")]
    UnknownUnit(String),
    #[error("invalid period marker: {0}")]
    InvalidMarker(String),
}

/// The length of one scheduling period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleUnit {
    Day,
    Week,
    Month,
}

impl fmt::Display for ScheduleUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleUnit::Day => write!(f, "day"),
            ScheduleUnit::Week => write!(f, "week"),
            ScheduleUnit::Month => write!(f, "month"),
        }
    }
}

impl FromStr for ScheduleUnit {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "day" => Ok(ScheduleUnit::Day),
            "week" => Ok(ScheduleUnit::Week),
            "month" => Ok(ScheduleUnit::Month),
            other => Err(ScheduleError::UnknownUnit(other.to_string())),
        }
    }
}

/// When an allowance falls due.
///
/// The anchor aligns periods within the unit:
/// - `day`: must be 0, every calendar day is a period
/// - `week`: weekday index, 0 = Monday .. 6 = Sunday
/// - `month`: day of month 1..=31, clamped to the last day of shorter months
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ScheduleRepr")]
pub struct Schedule {
    unit: ScheduleUnit,
    anchor: u32,
}

#[derive(Deserialize)]
struct ScheduleRepr {
    unit: ScheduleUnit,
    #[serde(default)]
    anchor: u32,
}

impl TryFrom<ScheduleRepr> for Schedule {
    type Error = ScheduleError;

    fn try_from(repr: ScheduleRepr) -> Result<Self, Self::Error> {
        Schedule::new(repr.unit, repr.anchor)
    }
}

impl Schedule {
    /// Build a schedule, validating the anchor against the unit
    pub fn new(unit: ScheduleUnit, anchor: u32) -> Result<Self, ScheduleError> {
        let valid = match unit {
            ScheduleUnit::Day => anchor == 0,
            ScheduleUnit::Week => anchor <= 6,
            ScheduleUnit::Month => (1..=31).contains(&anchor),
        };
        if !valid {
            return Err(ScheduleError::InvalidAnchor { unit, anchor });
        }
        Ok(Self { unit, anchor })
    }

    pub fn daily() -> Self {
        Self {
            unit: ScheduleUnit::Day,
            anchor: 0,
        }
    }

    pub fn weekly(weekday: Weekday) -> Self {
        Self {
            unit: ScheduleUnit::Week,
            anchor: weekday.num_days_from_monday(),
        }
    }

    /// Monthly schedule on `day`; fails unless `day` is within 1..=31
    pub fn monthly(day: u32) -> Result<Self, ScheduleError> {
        Self::new(ScheduleUnit::Month, day)
    }

    pub fn unit(&self) -> ScheduleUnit {
        self.unit
    }

    pub fn anchor(&self) -> u32 {
        self.anchor
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.unit, self.anchor)
    }
}

/// First day of the period an allowance was (or is to be) credited for.
///
/// Markers are totally ordered, so "already credited" is a comparison
/// rather than a time delta between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeriodMarker(pub NaiveDate);

impl PeriodMarker {
    pub fn date(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for PeriodMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for PeriodMarker {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(PeriodMarker)
            .map_err(|_| ScheduleError::InvalidMarker(s.to_string()))
    }
}

/// Persisted record of the last period credited for a scheduled task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleCursor {
    pub task_id: String,
    pub last_run_marker: PeriodMarker,
    pub last_run_time: DateTime<Utc>,
}

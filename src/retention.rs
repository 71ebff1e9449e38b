//! The purge clock: how long mail is kept before it is purged.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::error::Error;

/// Unit of a [`Retention`] duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl FromStr for RetentionUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minute" | "minutes" | "m" => Ok(RetentionUnit::Minutes),
            "hour" | "hours" | "h" => Ok(RetentionUnit::Hours),
            "day" | "days" | "d" => Ok(RetentionUnit::Days),
            "week" | "weeks" | "w" => Ok(RetentionUnit::Weeks),
            other => Err(Error::Config(format!("unknown retention unit {:?}", other))),
        }
    }
}

impl fmt::Display for RetentionUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            RetentionUnit::Minutes => "minutes",
            RetentionUnit::Hours => "hours",
            RetentionUnit::Days => "days",
            RetentionUnit::Weeks => "weeks",
        })
    }
}

/// How long mail is retained on the remote mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Retention {
    pub amount: u32,
    pub unit: RetentionUnit,
}

impl Default for Retention {
    fn default() -> Self {
        Retention {
            amount: 48,
            unit: RetentionUnit::Hours,
        }
    }
}

impl Retention {
    pub fn new(amount: u32, unit: RetentionUnit) -> Self {
        Retention { amount, unit }
    }

    /// The retention period as a duration, or `None` if it does not fit in one.
    pub fn duration(&self) -> Option<Duration> {
        let amount = i64::from(self.amount);
        match self.unit {
            RetentionUnit::Minutes => Duration::try_minutes(amount),
            RetentionUnit::Hours => Duration::try_hours(amount),
            RetentionUnit::Days => Duration::try_days(amount),
            RetentionUnit::Weeks => Duration::try_weeks(amount),
        }
    }

    /// The purge cutoff relative to `now`: mail dated at or before it may be purged.
    ///
    /// Fails if the window reaches past the earliest representable date.
    pub fn cutoff_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, Error> {
        self.duration()
            .and_then(|d| now.checked_sub_signed(d))
            .ok_or_else(|| Error::Config(format!("retention of {} is out of range", self)))
    }

    /// The purge cutoff relative to the current time. Never stored; recompute per pass.
    pub fn cutoff(&self) -> Result<DateTime<Utc>, Error> {
        self.cutoff_at(Utc::now())
    }
}

impl fmt::Display for Retention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.unit)
    }
}

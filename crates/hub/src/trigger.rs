//! Turns a [`Recurrence`] into concrete fire times.
//!
//! Recurring schedules become six-field cron expressions (seconds first,
//! as the `cron` crate expects) evaluated in the scheduler's fixed UTC
//! offset.  One-shot schedules are a single absolute instant.

use std::str::FromStr;

use chrono::{DateTime, FixedOffset, TimeZone, Utc};

use crate::schedule::{format_weekdays, Recurrence};

#[derive(Debug, Clone)]
pub enum Trigger {
    At(DateTime<Utc>),
    Cron {
        pattern: String,
        schedule: cron::Schedule,
        tz: FixedOffset,
    },
}

/// Cron expression for a recurring schedule; `None` for one-shots.
pub fn cron_pattern(recurrence: &Recurrence) -> Option<String> {
    use chrono::Timelike;

    match recurrence {
        Recurrence::Once(_) => None,
        Recurrence::Daily(at) => Some(format!("0 {} {} * * *", at.minute(), at.hour())),
        Recurrence::Hourly { every_min } if *every_min >= 60 => Some("0 0 * * * *".to_string()),
        Recurrence::Hourly { every_min } => Some(format!("0 */{every_min} * * * *")),
        Recurrence::Weekly { at, days } => Some(format!(
            "0 {} {} * * {}",
            at.minute(),
            at.hour(),
            format_weekdays(days)
        )),
    }
}

impl Trigger {
    /// Fails when the cron expression is rejected or a one-shot time is ambiguous.
    pub fn new(recurrence: &Recurrence, tz: FixedOffset) -> Result<Self, String> {
        match recurrence {
            Recurrence::Once(local) => tz
                .from_local_datetime(local)
                .single()
                .map(|at| Self::At(at.with_timezone(&Utc)))
                .ok_or_else(|| format!("{local} has no single instant at offset {tz}")),
            other => {
                let pattern = cron_pattern(other).unwrap_or_default();
                let schedule = cron::Schedule::from_str(&pattern)
                    .map_err(|e| format!("bad cron pattern '{pattern}': {e}"))?;
                Ok(Self::Cron {
                    pattern,
                    schedule,
                    tz,
                })
            }
        }
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::At(at) => (*at > after).then_some(*at),
            Self::Cron { schedule, tz, .. } => schedule
                .after(&after.with_timezone(tz))
                .next()
                .map(|t| t.with_timezone(&Utc)),
        }
    }

    /// The cron expression, for recurring triggers.
    pub fn pattern(&self) -> Option<&str> {
        match self {
            Self::At(_) => None,
            Self::Cron { pattern, .. } => Some(pattern),
        }
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self, Self::Cron { .. })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

//! Schedule records, input validation, and the parsed recurrence plan.
//!
//! Storage formats:
//! - `once`: `datetime` = `YYYY-MM-DD HH:MM` in the scheduler's local offset
//! - `daily` / `weekly`: `datetime` = `HH:MM`
//! - `hourly`: `repeat_interval` = minutes between runs (1-60)
//! - `weekly`: `weekday` = `Mon,Wed,Fri`
//!
//! | type   | required                        |
//! |--------|---------------------------------|
//! | once   | duration, datetime              |
//! | daily  | duration, datetime              |
//! | hourly | duration, repeat_interval       |
//! | weekly | duration, datetime, weekday     |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{MalformedRecord, ValidationError};

const ONCE_FORMAT: &str = "%Y-%m-%d %H:%M";
const TIME_FORMAT: &str = "%H:%M";

/// Upper bound on a single watering run (one day).
const MAX_DURATION_MIN: i64 = 24 * 60;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Once,
    Daily,
    Hourly,
    Weekly,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Daily => "daily",
            Self::Hourly => "hourly",
            Self::Weekly => "weekly",
        }
    }
}

impl FromStr for ScheduleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "once" => Ok(Self::Once),
            "daily" => Ok(Self::Daily),
            "hourly" => Ok(Self::Hourly),
            "weekly" => Ok(Self::Weekly),
            other => Err(format!("unknown schedule type '{other}'")),
        }
    }
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Active,
    Inactive,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

// ---------------------------------------------------------------------------
// Stored record
// ---------------------------------------------------------------------------

/// A row of `irrigation_schedule`, exactly as stored.  Nothing here is
/// trusted until [`ScheduleRecord::plan`] has checked it, so the numeric
/// columns are read as text and a bad value only sidelines its own row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ScheduleRecord {
    pub id: i64,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    pub datetime: Option<String>,
    #[serde(serialize_with = "number_or_text")]
    pub duration: Option<String>,
    #[serde(serialize_with = "number_or_text")]
    pub repeat_interval: Option<String>,
    pub weekday: Option<String>,
    pub keep_after_run: bool,
    pub status: String,
}

/// When a schedule fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recurrence {
    /// Local wall-clock time of the single run.
    Once(NaiveDateTime),
    Daily(NaiveTime),
    /// Every `every_min` minutes, aligned to the top of the hour.
    Hourly { every_min: u32 },
    Weekly { at: NaiveTime, days: Vec<Weekday> },
}

/// A checked schedule, ready to become a live job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub id: i64,
    pub kind: ScheduleType,
    pub recurrence: Recurrence,
    pub duration: Duration,
    pub keep_after_run: bool,
}

impl ScheduleRecord {
    pub fn plan(&self) -> Result<Plan, MalformedRecord> {
        let bad = |e| MalformedRecord::from_validation(self.id, e);

        let kind: ScheduleType = self
            .kind
            .parse()
            .map_err(|e: String| bad(ValidationError::new("type", e)))?;
        let duration = parse_int("duration", self.duration.as_deref()).map_err(bad)?;
        let minutes = parse_duration(duration).map_err(bad)?;
        let repeat_interval =
            parse_int("repeat_interval", self.repeat_interval.as_deref()).map_err(bad)?;
        let recurrence = parse_recurrence(
            kind,
            self.datetime.as_deref(),
            repeat_interval,
            self.weekday.as_deref(),
        )
        .map_err(bad)?;

        Ok(Plan {
            id: self.id,
            kind,
            recurrence,
            duration: Duration::from_secs(minutes * 60),
            keep_after_run: self.keep_after_run,
        })
    }
}

/// Stored numbers go out as JSON numbers; anything unparseable as the raw
/// text.
fn number_or_text<S: Serializer>(value: &Option<String>, ser: S) -> Result<S::Ok, S::Error> {
    match value.as_deref().map(str::trim) {
        None => ser.serialize_none(),
        Some(s) => match s.parse::<i64>() {
            Ok(n) => ser.serialize_i64(n),
            Err(_) => ser.serialize_str(s),
        },
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// A scalar as browsers post it: `10`, `"10"`, `true` or `1`.  Checked per
/// field during validation so a bad value is reported by name.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FormValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FormValue {
    /// Whole number; an empty string counts as absent.
    fn int(&self, field: &'static str) -> Result<Option<i64>, ValidationError> {
        match self {
            Self::Int(n) => Ok(Some(*n)),
            Self::Float(f) if f.is_finite() && f.fract() == 0.0 => Ok(Some(*f as i64)),
            Self::Text(s) => parse_int(field, Some(s.as_str())),
            other => Err(ValidationError::new(
                field,
                format!("{other} is not a whole number"),
            )),
        }
    }

    fn flag(&self, field: &'static str) -> Result<bool, ValidationError> {
        match self {
            Self::Bool(b) => Ok(*b),
            Self::Int(0) => Ok(false),
            Self::Int(1) => Ok(true),
            Self::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "" | "0" | "false" => Ok(false),
                "1" | "true" => Ok(true),
                _ => Err(ValidationError::new(field, format!("'{s}' is not a flag"))),
            },
            other => Err(ValidationError::new(field, format!("{other} is not a flag"))),
        }
    }
}

impl fmt::Display for FormValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "'{s}'"),
        }
    }
}

impl From<i64> for FormValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<bool> for FormValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for FormValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// Weekdays as sent by clients: `"mon,wed"` or `["Monday", "Wednesday"]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum WeekdayList {
    Csv(String),
    List(Vec<String>),
}

impl WeekdayList {
    fn joined(&self) -> String {
        match self {
            Self::Csv(s) => s.clone(),
            Self::List(v) => v.join(","),
        }
    }
}

/// Schedule creation request.  Everything is optional so that a missing
/// field is reported by name instead of as a JSON error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewSchedule {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub datetime: Option<String>,
    pub duration: Option<FormValue>,
    pub repeat_interval: Option<FormValue>,
    pub weekday: Option<WeekdayList>,
    pub keep_after_run: Option<FormValue>,
}

/// Normalised, fully checked schedule.  The only thing the store inserts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidSchedule {
    pub kind: ScheduleType,
    pub datetime: Option<String>,
    pub duration: i64,
    pub repeat_interval: Option<i64>,
    pub weekday: Option<String>,
    pub keep_after_run: bool,
}

impl NewSchedule {
    /// Check the request against the per-type table.  `now_local` is the
    /// current wall-clock time in the scheduler's offset; a one-shot time
    /// that has already passed is rejected.
    pub fn validate(&self, now_local: NaiveDateTime) -> Result<ValidSchedule, ValidationError> {
        let kind: ScheduleType = self
            .kind
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ValidationError::new("type", "is required"))?
            .parse()
            .map_err(|e: String| ValidationError::new("type", e))?;

        let duration = match &self.duration {
            Some(v) => v.int("duration")?,
            None => None,
        };
        let minutes = parse_duration(duration)?;
        let repeat_interval = match &self.repeat_interval {
            Some(v) => v.int("repeat_interval")?,
            None => None,
        };
        let keep_after_run = match &self.keep_after_run {
            Some(v) => v.flag("keep_after_run")?,
            None => false,
        };

        let weekday = self.weekday.as_ref().map(WeekdayList::joined);
        let recurrence = parse_recurrence(
            kind,
            self.datetime.as_deref(),
            repeat_interval,
            weekday.as_deref(),
        )?;

        let mut valid = ValidSchedule {
            kind,
            datetime: None,
            duration: minutes as i64,
            repeat_interval: None,
            weekday: None,
            keep_after_run,
        };

        match &recurrence {
            Recurrence::Once(at) => {
                if *at <= now_local {
                    return Err(ValidationError::new("datetime", "is in the past"));
                }
                valid.datetime = Some(at.format(ONCE_FORMAT).to_string());
            }
            Recurrence::Daily(at) => {
                valid.datetime = Some(at.format(TIME_FORMAT).to_string());
            }
            Recurrence::Hourly { every_min } => {
                valid.repeat_interval = Some(i64::from(*every_min));
            }
            Recurrence::Weekly { at, days } => {
                valid.datetime = Some(at.format(TIME_FORMAT).to_string());
                valid.weekday = Some(format_weekdays(days));
            }
        }

        Ok(valid)
    }
}

// ---------------------------------------------------------------------------
// Field parsers (shared by input validation and stored-row checks)
// ---------------------------------------------------------------------------

/// Integer text; blank counts as absent.
fn parse_int(field: &'static str, s: Option<&str>) -> Result<Option<i64>, ValidationError> {
    match s.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|_| ValidationError::new(field, format!("'{s}' is not a whole number"))),
    }
}

fn parse_duration(duration: Option<i64>) -> Result<u64, ValidationError> {
    match duration {
        None => Err(ValidationError::new("duration", "is required")),
        Some(d) if (1..=MAX_DURATION_MIN).contains(&d) => Ok(d as u64),
        Some(d) => Err(ValidationError::new(
            "duration",
            format!("must be between 1 and {MAX_DURATION_MIN} minutes, got {d}"),
        )),
    }
}

fn parse_recurrence(
    kind: ScheduleType,
    datetime: Option<&str>,
    repeat_interval: Option<i64>,
    weekday: Option<&str>,
) -> Result<Recurrence, ValidationError> {
    let datetime = datetime.map(str::trim).filter(|s| !s.is_empty());

    match kind {
        ScheduleType::Once => {
            let s = datetime.ok_or_else(|| ValidationError::new("datetime", "is required"))?;
            parse_once(s).map(Recurrence::Once)
        }
        ScheduleType::Daily => {
            let s = datetime.ok_or_else(|| ValidationError::new("datetime", "is required"))?;
            parse_time(s).map(Recurrence::Daily)
        }
        ScheduleType::Hourly => {
            let n = repeat_interval
                .ok_or_else(|| ValidationError::new("repeat_interval", "is required"))?;
            if !(1..=60).contains(&n) {
                return Err(ValidationError::new(
                    "repeat_interval",
                    format!("must be between 1 and 60 minutes, got {n}"),
                ));
            }
            Ok(Recurrence::Hourly {
                every_min: n as u32,
            })
        }
        ScheduleType::Weekly => {
            let days = weekday
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| ValidationError::new("weekday", "is required"))?;
            let days = parse_weekdays(days)?;
            let s = datetime.ok_or_else(|| ValidationError::new("datetime", "is required"))?;
            let at = parse_time(s)?;
            Ok(Recurrence::Weekly { at, days })
        }
    }
}

/// Accepts `YYYY-MM-DD HH:MM` and the `YYYY-MM-DDTHH:MM` form browsers send.
pub(crate) fn parse_once(s: &str) -> Result<NaiveDateTime, ValidationError> {
    NaiveDateTime::parse_from_str(s, ONCE_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M"))
        .map_err(|_| ValidationError::new("datetime", format!("'{s}' is not YYYY-MM-DD HH:MM")))
}

fn parse_time(s: &str) -> Result<NaiveTime, ValidationError> {
    NaiveTime::parse_from_str(s, TIME_FORMAT)
        .map_err(|_| ValidationError::new("datetime", format!("'{s}' is not HH:MM")))
}

fn parse_weekdays(s: &str) -> Result<Vec<Weekday>, ValidationError> {
    let mut days = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let day = match part.to_ascii_lowercase().as_str() {
            "mon" | "monday" => Weekday::Mon,
            "tue" | "tuesday" => Weekday::Tue,
            "wed" | "wednesday" => Weekday::Wed,
            "thu" | "thursday" => Weekday::Thu,
            "fri" | "friday" => Weekday::Fri,
            "sat" | "saturday" => Weekday::Sat,
            "sun" | "sunday" => Weekday::Sun,
            _ => {
                return Err(ValidationError::new(
                    "weekday",
                    format!("'{part}' is not a weekday"),
                ))
            }
        };
        if !days.contains(&day) {
            days.push(day);
        }
    }
    if days.is_empty() {
        return Err(ValidationError::new("weekday", "is required"));
    }
    days.sort_by_key(|d| d.num_days_from_monday());
    Ok(days)
}

/// `Mon,Wed,Fri`, the form cron and the store both use.
pub(crate) fn format_weekdays(days: &[Weekday]) -> String {
    days.iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

// ===========================================================================
// Tests
// ===========================================================================

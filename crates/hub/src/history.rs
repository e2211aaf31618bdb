//! Pump-transition history.
//!
//! Every telemetry message passes through [`HistoryLogger::observe`]; a row
//! is written only when the pump state differs from the last one written.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use irrigation_proto::{Clock, Mode, Telemetry};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::db::Db;
use crate::error::StoreError;
use crate::weather::{WeatherProvider, WeatherSnapshot};

/// Rows returned by the history listing.
pub const HISTORY_LIMIT: i64 = 100;

/// A stored history row.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct HistoryEntry {
    pub id: i64,
    pub timestamp: String,
    pub status: String,
    pub mode: String,
    pub soil: Option<i64>,
    pub rain: Option<i64>,
    pub temperature: Option<f64>,
    pub humidity: Option<i64>,
    pub weather_condition: Option<String>,
    pub wind_speed: Option<f64>,
    pub location: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub pump_on: bool,
    pub mode: Mode,
    pub soil: u8,
    pub rain: u8,
    pub weather: WeatherSnapshot,
}

impl NewHistoryEntry {
    pub fn timestamp_string(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    pub fn status_str(&self) -> &'static str {
        if self.pump_on {
            "ON"
        } else {
            "OFF"
        }
    }

    pub fn mode_str(&self) -> &'static str {
        match self.mode {
            Mode::Auto => "Auto",
            Mode::Manual => "Manual",
        }
    }
}

pub struct HistoryLogger {
    db: Db,
    weather: Arc<dyn WeatherProvider>,
    clock: Arc<dyn Clock>,
    last_status: Mutex<Option<bool>>,
}

impl HistoryLogger {
    pub fn new(db: Db, weather: Arc<dyn WeatherProvider>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            weather,
            clock,
            last_status: Mutex::new(None),
        }
    }

    /// Record `t` if its pump state is a transition.  Returns whether a row
    /// was written.  The remembered state only advances after a successful
    /// insert, so a failed write is retried on the next message.
    pub async fn observe(&self, t: &Telemetry) -> Result<bool, StoreError> {
        let pump_on = t.pump_on();

        // Held across the weather call and insert: concurrent telemetry
        // must not both see the same transition.
        let mut last = self.last_status.lock().await;
        if *last == Some(pump_on) {
            return Ok(false);
        }

        let entry = NewHistoryEntry {
            timestamp: self.clock.now(),
            pump_on,
            mode: t.mode(),
            soil: t.soil,
            rain: t.rain,
            weather: self.weather.current().await,
        };

        match self.db.insert_history(&entry).await {
            Ok(id) => {
                info!(
                    id,
                    status = entry.status_str(),
                    mode = entry.mode_str(),
                    soil = t.soil,
                    rain = t.rain,
                    "history recorded"
                );
                *last = Some(pump_on);
                Ok(true)
            }
            Err(e) => {
                error!("history insert failed: {e}");
                Err(e)
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

//! Control thresholds shared by the device, its simulator and the hub.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Pump control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Auto,
    Manual,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }

    /// Lenient parse used on inbound telemetry: anything mentioning
    /// "manual" is manual, everything else is auto.
    pub fn from_str_lossy(s: &str) -> Self {
        if s.to_ascii_lowercase().contains("manual") {
            Self::Manual
        } else {
            Self::Auto
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds and periods of the device control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlConfig {
    /// Auto mode waters while soil moisture is strictly below this (percent).
    pub soil_threshold: u8,
    /// ...and the rain level is strictly below this (percent).
    pub rain_threshold: u8,
    /// A manual override older than this reverts to auto.
    pub manual_timeout: Duration,
    /// A device not heard from for this long is reported offline.
    pub online_staleness: Duration,
    pub telemetry_interval: Duration,
    pub heartbeat_interval: Duration,
    pub override_check_interval: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            soil_threshold: 30,
            rain_threshold: 70,
            manual_timeout: Duration::from_secs(60),
            online_staleness: Duration::from_secs(120),
            telemetry_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(5),
            override_check_interval: Duration::from_secs(1),
        }
    }
}

/// The auto rule: pump ON iff the soil is dry and it is not raining.
pub fn auto_pump(soil: u8, rain: u8, cfg: &ControlConfig) -> bool {
    soil < cfg.soil_threshold && rain < cfg.rain_threshold
}

// ===========================================================================
// Tests
// ===========================================================================

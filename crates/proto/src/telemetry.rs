use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::control::Mode;

/// Inbound payload could not be understood.  The message is dropped.
#[derive(Debug, Error)]
#[error("malformed telemetry: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// Sensor snapshot published by the device on `irrigation/data`.
///
/// `pump` keeps the device's human-readable form (`"ON (auto)"`), which
/// existing dashboards display verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Telemetry {
    pub soil: u8,
    pub rain: u8,
    pub pump: String,
    pub mode: String,
}

impl Telemetry {
    pub fn new(soil: u8, rain: u8, pump_on: bool, mode: Mode) -> Self {
        let state = if pump_on { "ON" } else { "OFF" };
        Self {
            soil,
            rain,
            pump: format!("{state} ({mode})"),
            mode: mode.as_str().to_string(),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn encode(&self) -> Vec<u8> {
        // Serialising a struct of plain strings and integers cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn pump_on(&self) -> bool {
        self.pump.contains("ON")
    }

    pub fn mode(&self) -> Mode {
        Mode::from_str_lossy(&self.mode)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

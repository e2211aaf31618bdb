//! Control commands carried on `irrigation/control` and `irrigation/commands`.
//!
//! The wire format is a bare upper-case string (`WATER_ON`, `SOIL_45`, ...)
//! that deployed devices already understand, so it is preserved exactly.
//! Payloads are decoded into [`Command`] at the boundary and never passed
//! around as strings internally.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Status strings (device -> server on `irrigation/status`)
// ---------------------------------------------------------------------------

pub const STATUS_WATER_ON_OK: &str = "WATER_ON_OK";
pub const STATUS_WATER_OFF_OK: &str = "WATER_OFF_OK";
pub const STATUS_AUTO_MODE_OK: &str = "AUTO_MODE_OK";
pub const STATUS_SOIL_SET_OK: &str = "SOIL_SET_OK";
pub const STATUS_RAIN_SET_OK: &str = "RAIN_SET_OK";
pub const STATUS_SIMULATE_RAIN_OK: &str = "SIMULATE_RAIN_OK";
pub const STATUS_DRY_SOIL_OK: &str = "DRY_SOIL_OK";
pub const STATUS_CONNECTED: &str = "ESP32_SIM_CONNECTED";
pub const STATUS_ALIVE: &str = "ESP32_SIM_ALIVE";

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    WaterOn,
    WaterOff,
    AutoMode,
    /// Force the simulated soil moisture (percent).
    SetSoil(u8),
    /// Force the simulated rain level (percent).
    SetRain(u8),
    SimulateRain,
    DrySoil,
    StatusRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("invalid value in '{0}' (expected 0-100)")]
    BadValue(String),
}

impl Command {
    /// Decode a raw payload.  Case-insensitive, surrounding whitespace ignored.
    pub fn decode(payload: &[u8]) -> Result<Self, CommandError> {
        String::from_utf8_lossy(payload).parse()
    }

    /// Canonical wire representation.
    pub fn as_wire(&self) -> String {
        match self {
            Self::WaterOn => "WATER_ON".to_string(),
            Self::WaterOff => "WATER_OFF".to_string(),
            Self::AutoMode => "AUTO_MODE".to_string(),
            Self::SetSoil(v) => format!("SOIL_{v}"),
            Self::SetRain(v) => format!("RAIN_{v}"),
            Self::SimulateRain => "SIMULATE_RAIN".to_string(),
            Self::DrySoil => "DRY_SOIL".to_string(),
            Self::StatusRequest => "STATUS_REQUEST".to_string(),
        }
    }

    /// Status string the device publishes after applying this command.
    /// `StatusRequest` answers with telemetry instead.
    pub fn ack(&self) -> Option<&'static str> {
        match self {
            Self::WaterOn => Some(STATUS_WATER_ON_OK),
            Self::WaterOff => Some(STATUS_WATER_OFF_OK),
            Self::AutoMode => Some(STATUS_AUTO_MODE_OK),
            Self::SetSoil(_) => Some(STATUS_SOIL_SET_OK),
            Self::SetRain(_) => Some(STATUS_RAIN_SET_OK),
            Self::SimulateRain => Some(STATUS_SIMULATE_RAIN_OK),
            Self::DrySoil => Some(STATUS_DRY_SOIL_OK),
            Self::StatusRequest => None,
        }
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_uppercase();
        match s.as_str() {
            "WATER_ON" => return Ok(Self::WaterOn),
            "WATER_OFF" => return Ok(Self::WaterOff),
            "AUTO_MODE" => return Ok(Self::AutoMode),
            "SIMULATE_RAIN" => return Ok(Self::SimulateRain),
            "DRY_SOIL" => return Ok(Self::DrySoil),
            "STATUS_REQUEST" => return Ok(Self::StatusRequest),
            _ => {}
        }

        if let Some(v) = s.strip_prefix("SOIL_") {
            return parse_percent(v).map(Self::SetSoil).ok_or_else(|| CommandError::BadValue(s.clone()));
        }
        if let Some(v) = s.strip_prefix("RAIN_") {
            return parse_percent(v).map(Self::SetRain).ok_or_else(|| CommandError::BadValue(s.clone()));
        }
        Err(CommandError::Unknown(s))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_wire())
    }
}

fn parse_percent(s: &str) -> Option<u8> {
    s.parse::<u8>().ok().filter(|v| *v <= 100)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_pump_commands() {
        assert_eq!(Command::decode(b"WATER_ON"), Ok(Command::WaterOn));
        assert_eq!(Command::decode(b"WATER_OFF"), Ok(Command::WaterOff));
        assert_eq!(Command::decode(b"AUTO_MODE"), Ok(Command::AutoMode));
    }

    #[test]
    fn decode_is_case_insensitive_and_trims() {
        assert_eq!(Command::decode(b"  water_on\n"), Ok(Command::WaterOn));
        assert_eq!(Command::decode(b"\tAuto_Mode "), Ok(Command::AutoMode));
    }

    #[test]
    fn decode_simulator_commands() {
        assert_eq!(Command::decode(b"SOIL_45"), Ok(Command::SetSoil(45)));
        assert_eq!(Command::decode(b"RAIN_0"), Ok(Command::SetRain(0)));
        assert_eq!(Command::decode(b"RAIN_100"), Ok(Command::SetRain(100)));
        assert_eq!(Command::decode(b"SIMULATE_RAIN"), Ok(Command::SimulateRain));
        assert_eq!(Command::decode(b"DRY_SOIL"), Ok(Command::DrySoil));
        assert_eq!(Command::decode(b"STATUS_REQUEST"), Ok(Command::StatusRequest));
    }

    #[test]
    fn decode_rejects_out_of_range_values() {
        assert!(matches!(
            Command::decode(b"SOIL_101"),
            Err(CommandError::BadValue(_))
        ));
        assert!(matches!(
            Command::decode(b"RAIN_-3"),
            Err(CommandError::BadValue(_))
        ));
        assert!(matches!(
            Command::decode(b"SOIL_"),
            Err(CommandError::BadValue(_))
        ));
    }

    #[test]
    fn decode_rejects_unknown() {
        assert_eq!(
            Command::decode(b"TOGGLE"),
            Err(CommandError::Unknown("TOGGLE".into()))
        );
        assert!(Command::decode(b"").is_err());
        assert!(Command::decode(b"WATER").is_err());
    }

    #[test]
    fn wire_form_round_trips_for_every_variant() {
        for cmd in [
            Command::WaterOn,
            Command::WaterOff,
            Command::AutoMode,
            Command::SetSoil(12),
            Command::SetRain(88),
            Command::SimulateRain,
            Command::DrySoil,
            Command::StatusRequest,
        ] {
            assert_eq!(cmd.as_wire().parse::<Command>(), Ok(cmd));
        }
    }

    #[test]
    fn acks_match_device_status_strings() {
        assert_eq!(Command::WaterOn.ack(), Some("WATER_ON_OK"));
        assert_eq!(Command::WaterOff.ack(), Some("WATER_OFF_OK"));
        assert_eq!(Command::AutoMode.ack(), Some("AUTO_MODE_OK"));
        assert_eq!(Command::StatusRequest.ack(), None);
    }
}

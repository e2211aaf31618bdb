// ---------------------------------------------------------------------------
// Topic names
// ---------------------------------------------------------------------------

/// Sensor telemetry, device -> server.
pub const TOPIC_TELEMETRY: &str = "irrigation/data";
/// Acknowledgements and heartbeats, device -> server.
pub const TOPIC_STATUS: &str = "irrigation/status";
/// Operator commands, operator -> server.
pub const TOPIC_COMMANDS: &str = "irrigation/commands";
/// Control commands, server/scheduler -> device.
pub const TOPIC_CONTROL: &str = "irrigation/control";
/// Fan-out feed, server -> downstream consumers.
pub const TOPIC_LOGS: &str = "irrigation/logs";

/// The closed set of topics the system speaks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Telemetry,
    Status,
    Commands,
    Control,
    Logs,
}

impl Topic {
    /// Classify a raw topic string.  Matching is exact: the devices in the
    /// field publish on these literal names.
    pub fn parse(topic: &str) -> Option<Self> {
        match topic {
            TOPIC_TELEMETRY => Some(Self::Telemetry),
            TOPIC_STATUS => Some(Self::Status),
            TOPIC_COMMANDS => Some(Self::Commands),
            TOPIC_CONTROL => Some(Self::Control),
            TOPIC_LOGS => Some(Self::Logs),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Telemetry => TOPIC_TELEMETRY,
            Self::Status => TOPIC_STATUS,
            Self::Commands => TOPIC_COMMANDS,
            Self::Control => TOPIC_CONTROL,
            Self::Logs => TOPIC_LOGS,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

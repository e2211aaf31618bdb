//! Wire contract shared by the irrigation hub and the field device.
//!
//! Everything that crosses the publish/subscribe transport lives here: topic
//! names, the fixed command strings, the telemetry JSON shape, and the
//! control thresholds both sides must agree on.

pub mod channel;
pub mod clock;
pub mod command;
pub mod control;
pub mod telemetry;
pub mod topics;

pub use channel::{Channel, ChannelError, MemoryChannel, Message, MessageHandler, MqttChannel, MqttEvents, MqttSettings};
pub use clock::{AnchoredClock, Clock, SystemClock};
pub use command::{Command, CommandError};
pub use control::{auto_pump, ControlConfig, Mode};
pub use telemetry::{DecodeError, Telemetry};
pub use topics::{Topic, TOPIC_COMMANDS, TOPIC_CONTROL, TOPIC_LOGS, TOPIC_STATUS, TOPIC_TELEMETRY};

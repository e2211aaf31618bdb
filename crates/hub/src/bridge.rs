//! Inbound MQTT handling for the hub.
//!
//! - `irrigation/data`: telemetry into the snapshot and history, then
//!   forwarded verbatim to `irrigation/logs`
//! - `irrigation/commands`: operator commands relayed to the device on
//!   `irrigation/control`
//! - `irrigation/status`: device status into the snapshot, wrapped and
//!   forwarded to `irrigation/logs`

use std::sync::Arc;

use async_trait::async_trait;
use chrono::SecondsFormat;
use irrigation_proto::{Channel, Clock, Command, Message, MessageHandler, Telemetry, Topic};
use irrigation_proto::{TOPIC_CONTROL, TOPIC_LOGS};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::history::HistoryLogger;
use crate::state::SharedState;

pub struct HubHandler {
    state: SharedState,
    channel: Arc<dyn Channel>,
    history: Arc<HistoryLogger>,
    clock: Arc<dyn Clock>,
}

impl HubHandler {
    pub fn new(
        state: SharedState,
        channel: Arc<dyn Channel>,
        history: Arc<HistoryLogger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state,
            channel,
            history,
            clock,
        }
    }

    async fn on_telemetry(&self, msg: &Message) {
        let telemetry = match Telemetry::decode(&msg.payload) {
            Ok(t) => t,
            Err(e) => {
                warn!(payload = %msg.payload_str(), "{e}");
                self.state.write().await.record_error(format!("{e}"));
                return;
            }
        };

        debug!(
            soil = telemetry.soil,
            rain = telemetry.rain,
            pump = %telemetry.pump,
            "telemetry"
        );
        self.state
            .write()
            .await
            .record_telemetry(telemetry.clone(), self.clock.now());

        if let Err(e) = self.history.observe(&telemetry).await {
            self.state
                .write()
                .await
                .record_error(format!("history not recorded: {e}"));
        }

        self.forward(TOPIC_LOGS, msg.payload.clone()).await;
    }

    async fn on_command(&self, msg: &Message) {
        let cmd = match Command::decode(&msg.payload) {
            Ok(c) => c,
            Err(e) => {
                warn!("dropping operator command: {e}");
                self.state
                    .write()
                    .await
                    .record_error(format!("rejected command: {e}"));
                return;
            }
        };

        info!(command = %cmd, "relaying command to device");
        self.state.write().await.record_command(cmd.as_wire());
        self.forward(TOPIC_CONTROL, cmd.as_wire().into_bytes()).await;
    }

    async fn on_status(&self, msg: &Message) {
        let status = msg.payload_str().trim().to_string();
        debug!(%status, "device status");

        let wrapped = json!({
            "esp32Status": status,
            "ts": self.clock.now().to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        self.state.write().await.record_status(status);
        self.forward(TOPIC_LOGS, wrapped.to_string().into_bytes())
            .await;
    }

    async fn forward(&self, topic: &str, payload: Vec<u8>) {
        if let Err(e) = self.channel.publish(topic, payload).await {
            error!(topic, "forward failed: {e}");
        }
    }
}

#[async_trait]
impl MessageHandler for HubHandler {
    async fn handle(&self, msg: Message) {
        match Topic::parse(&msg.topic) {
            Some(Topic::Telemetry) => self.on_telemetry(&msg).await,
            Some(Topic::Commands) => self.on_command(&msg).await,
            Some(Topic::Status) => self.on_status(&msg).await,
            _ => debug!(topic = %msg.topic, "unhandled topic"),
        }
    }

    async fn on_connection(&self, connected: bool) {
        self.state.write().await.set_mqtt_connected(connected);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

//! Device control loop: sensor readings, the auto/manual pump decision, and
//! manual-override expiry.
//!
//! ## Mode state machine
//!
//! ```text
//!          WATER_ON / WATER_OFF
//!  Auto ───────────────────────────▶ Manual
//!   ▲                                  │
//!   └──── AUTO_MODE | override timeout ┘
//! ```
//!
//! [`DeviceState`] holds the pure transitions with the clock passed in.
//! [`DeviceController`] owns the state behind one mutex, drives the relay
//! and publishes on the channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use irrigation_proto::command::{STATUS_ALIVE, STATUS_AUTO_MODE_OK, STATUS_CONNECTED};
use irrigation_proto::topics::{TOPIC_CONTROL, TOPIC_STATUS, TOPIC_TELEMETRY};
use irrigation_proto::{auto_pump, Channel, Command, ControlConfig, Message, MessageHandler, Mode, Telemetry};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pump::PumpRelay;
use crate::sim::Drift;

// ---------------------------------------------------------------------------
// Device state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DeviceState {
    pub(crate) soil_moisture: u8,
    pub(crate) rain_level: u8,
    pub(crate) pump_on: bool,
    pub(crate) mode: Mode,
    pub(crate) manual_override: bool,
    pub(crate) manual_start: Option<Instant>,
}

impl DeviceState {
    pub(crate) fn new(soil_moisture: u8, rain_level: u8) -> Self {
        Self {
            soil_moisture: soil_moisture.min(100),
            rain_level: rain_level.min(100),
            pump_on: false,
            mode: Mode::Auto,
            manual_override: false,
            manual_start: None,
        }
    }

    /// Apply an operator/scheduler command at time `now`.
    pub(crate) fn apply_command(&mut self, cmd: Command, now: Instant) {
        match cmd {
            Command::WaterOn | Command::WaterOff => {
                self.manual_override = true;
                self.mode = Mode::Manual;
                self.manual_start = Some(now);
                self.pump_on = cmd == Command::WaterOn;
            }
            Command::AutoMode => {
                self.clear_override();
            }
            Command::SetSoil(v) => self.soil_moisture = v.min(100),
            Command::SetRain(v) => self.rain_level = v.min(100),
            Command::SimulateRain => self.rain_level = 100,
            Command::DrySoil => self.soil_moisture = 10,
            Command::StatusRequest => {}
        }
    }

    /// Advance the sensors one step and, outside manual override, re-run the
    /// auto rule.  Returns the telemetry to publish.
    pub(crate) fn tick(&mut self, drift: &mut dyn Drift, cfg: &ControlConfig) -> Telemetry {
        let soil = i32::from(self.soil_moisture) + drift.soil_delta(self.pump_on);
        let rain = i32::from(self.rain_level) + drift.rain_delta();
        self.soil_moisture = clamp_percent(soil);
        self.rain_level = clamp_percent(rain);

        if !self.manual_override && self.mode == Mode::Auto {
            self.pump_on = auto_pump(self.soil_moisture, self.rain_level, cfg);
        }
        self.telemetry()
    }

    /// Revert to auto once the override is older than the timeout.
    /// Returns true if this call performed the transition.
    pub(crate) fn check_override_timeout(&mut self, now: Instant, cfg: &ControlConfig) -> bool {
        match self.manual_start {
            Some(start)
                if self.manual_override
                    && now.saturating_duration_since(start) > cfg.manual_timeout =>
            {
                self.clear_override();
                true
            }
            _ => false,
        }
    }

    pub(crate) fn telemetry(&self) -> Telemetry {
        Telemetry::new(self.soil_moisture, self.rain_level, self.pump_on, self.mode)
    }

    fn clear_override(&mut self) {
        self.manual_override = false;
        self.manual_start = None;
        self.mode = Mode::Auto;
    }
}

fn clamp_percent(v: i32) -> u8 {
    // Lossless after the clamp.
    v.clamp(0, 100) as u8
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct Inner {
    state: DeviceState,
    drift: Box<dyn Drift>,
    relay: PumpRelay,
}

impl Inner {
    /// Bring the relay in line with `state.pump_on`.
    fn sync_relay(&mut self, was_on: bool) {
        if self.state.pump_on != was_on {
            self.relay.set(self.state.pump_on);
        }
    }
}

pub(crate) struct DeviceController {
    inner: Mutex<Inner>,
    channel: Arc<dyn Channel>,
    cfg: ControlConfig,
    connected: AtomicBool,
}

impl DeviceController {
    pub(crate) fn new(
        state: DeviceState,
        drift: Box<dyn Drift>,
        relay: PumpRelay,
        channel: Arc<dyn Channel>,
        cfg: ControlConfig,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state,
                drift,
                relay,
            }),
            channel,
            cfg,
            connected: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub(crate) async fn snapshot(&self) -> DeviceState {
        self.inner.lock().await.state.clone()
    }

    /// Decode and apply a raw control payload.  Unknown commands are logged
    /// and dropped without touching state.
    pub(crate) async fn handle_payload(&self, payload: &[u8]) {
        match Command::decode(payload) {
            Ok(cmd) => self.apply_command(cmd).await,
            Err(e) => warn!("ignoring control message: {e}"),
        }
    }

    pub(crate) async fn apply_command(&self, cmd: Command) {
        let telemetry = {
            let mut inner = self.inner.lock().await;
            let was_on = inner.state.pump_on;
            inner.state.apply_command(cmd, Instant::now());
            inner.sync_relay(was_on);
            inner.state.telemetry()
        };

        info!(command = %cmd, mode = %telemetry.mode, pump = %telemetry.pump, "command applied");

        match cmd.ack() {
            Some(ack) => self.publish(TOPIC_STATUS, ack.as_bytes().to_vec()).await,
            None => self.publish(TOPIC_TELEMETRY, telemetry.encode()).await,
        }
    }

    pub(crate) async fn tick(&self) {
        let telemetry = {
            let mut inner = self.inner.lock().await;
            let was_on = inner.state.pump_on;
            let Inner { state, drift, .. } = &mut *inner;
            let t = state.tick(drift.as_mut(), &self.cfg);
            inner.sync_relay(was_on);
            t
        };

        debug!(
            soil = telemetry.soil,
            rain = telemetry.rain,
            pump = %telemetry.pump,
            "telemetry"
        );
        self.publish(TOPIC_TELEMETRY, telemetry.encode()).await;
    }

    pub(crate) async fn check_override_timeout(&self) {
        let expired = {
            let mut inner = self.inner.lock().await;
            inner.state.check_override_timeout(Instant::now(), &self.cfg)
        };
        if expired {
            info!("manual override timed out, returning to auto mode");
            self.publish(TOPIC_STATUS, STATUS_AUTO_MODE_OK.as_bytes().to_vec())
                .await;
        }
    }

    pub(crate) async fn heartbeat(&self) {
        self.publish(TOPIC_STATUS, STATUS_ALIVE.as_bytes().to_vec())
            .await;
    }

    /// Run the periodic tasks until `shutdown`, then switch the pump off.
    pub(crate) async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut telemetry = tokio::time::interval(self.cfg.telemetry_interval);
        let mut heartbeat = tokio::time::interval(self.cfg.heartbeat_interval);
        let mut overrides = tokio::time::interval(self.cfg.override_check_interval);

        info!(
            telemetry_ms = self.cfg.telemetry_interval.as_millis() as u64,
            manual_timeout_sec = self.cfg.manual_timeout.as_secs(),
            "device loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = telemetry.tick() => self.tick().await,
                _ = heartbeat.tick() => self.heartbeat().await,
                _ = overrides.tick() => self.check_override_timeout().await,
            }
        }

        let mut inner = self.inner.lock().await;
        inner.state.pump_on = false;
        inner.relay.set(false);
        info!("device loop stopped, pump off");
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.channel.publish(topic, payload).await {
            warn!(%topic, "publish failed: {e}");
        }
    }
}

#[async_trait]
impl MessageHandler for DeviceController {
    async fn handle(&self, msg: Message) {
        if msg.topic == TOPIC_CONTROL {
            info!(command = %msg.payload_str(), "command received");
            self.handle_payload(&msg.payload).await;
        }
    }

    async fn on_connection(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        if connected && !was {
            self.publish(TOPIC_STATUS, STATUS_CONNECTED.as_bytes().to_vec())
                .await;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

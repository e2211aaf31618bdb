use chrono::{DateTime, Utc};
use irrigation_proto::{ControlConfig, Telemetry};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub device: Option<DeviceSnapshot>,
    pub last_status: Option<String>,
    pub events: VecDeque<SystemEvent>,
    online_staleness: Duration,
}

#[derive(Clone, Serialize)]
pub struct DeviceSnapshot {
    pub last_seen: DateTime<Utc>,
    pub telemetry: Telemetry,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Telemetry,
    Command,
    Schedule,
    Status,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub device_online: bool,
    pub device: Option<DeviceSnapshot>,
    pub last_status: Option<String>,
    pub live_jobs: Vec<i64>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(cfg: &ControlConfig) -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            device: None,
            last_status: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
            online_staleness: cfg.online_staleness,
        }
    }

    pub fn shared(cfg: &ControlConfig) -> SharedState {
        Arc::new(RwLock::new(Self::new(cfg)))
    }

    /// Record a telemetry message from the device.
    pub fn record_telemetry(&mut self, telemetry: Telemetry, now: DateTime<Utc>) {
        let detail = format!(
            "soil={} rain={} pump={}",
            telemetry.soil, telemetry.rain, telemetry.pump
        );
        self.device = Some(DeviceSnapshot {
            last_seen: now,
            telemetry,
        });
        self.push_event(EventKind::Telemetry, detail);
    }

    /// Record a status string published by the device.
    pub fn record_status(&mut self, status: String) {
        self.push_event(EventKind::Status, status.clone());
        self.last_status = Some(status);
    }

    pub fn record_command(&mut self, detail: String) {
        self.push_event(EventKind::Command, detail);
    }

    pub fn record_schedule(&mut self, detail: String) {
        self.push_event(EventKind::Schedule, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn set_mqtt_connected(&mut self, connected: bool) {
        if self.mqtt_connected != connected {
            self.mqtt_connected = connected;
            let what = if connected { "connected" } else { "disconnected" };
            self.push_event(EventKind::System, format!("mqtt {what}"));
        }
    }

    /// The device counts as online while its last telemetry is fresher than
    /// the staleness window.
    pub fn device_online(&self, now: DateTime<Utc>) -> bool {
        self.device.as_ref().is_some_and(|d| {
            (now - d.last_seen)
                .to_std()
                .map_or(true, |age| age <= self.online_staleness)
        })
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self, now: DateTime<Utc>, live_jobs: Vec<i64>) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            device_online: self.device_online(now),
            device: self.device.clone(),
            last_status: self.last_status.clone(),
            live_jobs,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use irrigation_proto::Mode;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 3, 0, 0).unwrap()
    }

    #[test]
    fn online_within_staleness() {
        let mut st = SystemState::new(&ControlConfig::default());
        assert!(!st.device_online(t0()));

        st.record_telemetry(Telemetry::new(40, 10, false, Mode::Auto), t0());
        assert!(st.device_online(t0() + chrono::Duration::seconds(120)));
        assert!(!st.device_online(t0() + chrono::Duration::seconds(121)));
    }

    #[test]
    fn ring_buffer_caps_events() {
        let mut st = SystemState::new(&ControlConfig::default());
        for i in 0..(MAX_EVENTS + 25) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "event 25");
    }

    #[test]
    fn status_snapshot_newest_first() {
        let mut st = SystemState::new(&ControlConfig::default());
        st.record_status("ESP32_SIM_CONNECTED".into());
        st.record_command("WATER_ON".into());

        let resp = st.to_status(t0(), vec![3, 7]);
        assert_eq!(resp.last_status.as_deref(), Some("ESP32_SIM_CONNECTED"));
        assert_eq!(resp.live_jobs, vec![3, 7]);
        assert_eq!(resp.events[0].kind, EventKind::Command);
        assert_eq!(resp.events[1].kind, EventKind::Status);
        assert!(!resp.device_online);
    }

    #[test]
    fn mqtt_flag_logs_changes_only() {
        let mut st = SystemState::new(&ControlConfig::default());
        st.set_mqtt_connected(true);
        st.set_mqtt_connected(true);
        st.set_mqtt_connected(false);
        assert_eq!(st.events.len(), 2);
        assert!(!st.mqtt_connected);
    }
}

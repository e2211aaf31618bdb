//! Publish/subscribe transport abstraction.
//!
//! The hub and the device only ever see [`Channel`] (outbound) and
//! [`MessageHandler`] (inbound).  [`MqttChannel`] is the production
//! transport; [`MemoryChannel`] is an in-process bus that records every
//! publication.

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delay before polling again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Capacity of the rumqttc request queue.
const REQUEST_CAPACITY: usize = 20;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("mqtt client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
    #[error("channel is offline")]
    Offline,
}

#[async_trait]
pub trait Channel: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ChannelError>;

    /// Register interest in `topic`.  Matching messages are delivered to the
    /// handler driving this channel's event pump.
    async fn subscribe(&self, topic: &str) -> Result<(), ChannelError>;
}

/// Receives inbound messages.  Each message is dispatched on its own task,
/// so handlers must not assume ordering across messages.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, msg: Message);

    async fn on_connection(&self, _connected: bool) {}
}

fn dispatch(handler: &Arc<dyn MessageHandler>, msg: Message) {
    let handler = Arc::clone(handler);
    tokio::spawn(async move { handler.handle(msg).await });
}

// ---------------------------------------------------------------------------
// MQTT
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
}

impl MqttSettings {
    pub fn new(client_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// Outbound half of an MQTT connection.
#[derive(Clone)]
pub struct MqttChannel {
    client: AsyncClient,
    topics: Arc<Mutex<HashSet<String>>>,
}

/// Inbound half: owns the rumqttc event loop.  Must be driven with
/// [`MqttEvents::run`] for anything (including publishes) to reach the broker.
pub struct MqttEvents {
    eventloop: EventLoop,
    client: AsyncClient,
    topics: Arc<Mutex<HashSet<String>>>,
}

impl MqttChannel {
    pub fn connect(settings: &MqttSettings) -> (Self, MqttEvents) {
        let mut opts = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        opts.set_keep_alive(settings.keep_alive);
        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            opts.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(opts, REQUEST_CAPACITY);
        let topics = Arc::new(Mutex::new(HashSet::new()));

        let channel = Self {
            client: client.clone(),
            topics: Arc::clone(&topics),
        };
        let events = MqttEvents {
            eventloop,
            client,
            topics,
        };
        (channel, events)
    }
}

#[async_trait]
impl Channel for MqttChannel {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), ChannelError> {
        lock(&self.topics).insert(topic.to_string());
        self.client.subscribe(topic, QoS::AtLeastOnce).await?;
        Ok(())
    }
}

impl MqttEvents {
    /// Poll the connection until `shutdown` fires, handing every inbound
    /// publish to `handler`.  Connection errors are logged and retried.
    pub async fn run(mut self, handler: Arc<dyn MessageHandler>, shutdown: CancellationToken) {
        let mut connected_before = false;

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                ev = self.eventloop.poll() => ev,
            };

            match event {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    debug!(topic = %p.topic, bytes = p.payload.len(), "mqtt message");
                    dispatch(&handler, Message::new(p.topic.clone(), p.payload.to_vec()));
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected");
                    // A clean session forgets subscriptions across reconnects.
                    if connected_before {
                        self.resubscribe();
                    }
                    connected_before = true;
                    handler.on_connection(true).await;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    info!("mqtt disconnected");
                    handler.on_connection(false).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. reconnecting...");
                    handler.on_connection(false).await;
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }

        if let Err(e) = self.client.try_disconnect() {
            debug!("mqtt disconnect: {e}");
        }
    }

    fn resubscribe(&self) {
        let topics: Vec<String> = lock(&self.topics).iter().cloned().collect();
        for topic in topics {
            if let Err(e) = self.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                warn!(%topic, "mqtt resubscribe failed: {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-process bus
// ---------------------------------------------------------------------------

/// Broadcast bus living inside one process.  Every publication is kept in
/// an inspectable log.
pub struct MemoryChannel {
    tx: broadcast::Sender<Message>,
    log: Mutex<Vec<Message>>,
    topics: Mutex<HashSet<String>>,
    offline: AtomicBool,
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            log: Mutex::new(Vec::new()),
            topics: Mutex::new(HashSet::new()),
            offline: AtomicBool::new(false),
        }
    }

    /// Make every subsequent publish fail with [`ChannelError::Offline`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<Message> {
        lock(&self.log).clone()
    }

    /// Payloads published on `topic`, oldest first.
    pub fn published_on(&self, topic: &str) -> Vec<String> {
        lock(&self.log)
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload_str().into_owned())
            .collect()
    }

    pub fn clear(&self) {
        lock(&self.log).clear();
    }

    /// Deliver messages on subscribed topics to `handler` until `shutdown`.
    pub async fn run(&self, handler: Arc<dyn MessageHandler>, shutdown: CancellationToken) {
        let mut rx = self.tx.subscribe();
        handler.on_connection(true).await;

        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = rx.recv() => msg,
            };
            match msg {
                Ok(msg) => {
                    if lock(&self.topics).contains(&msg.topic) {
                        dispatch(&handler, msg);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "memory channel lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ChannelError::Offline);
        }
        let msg = Message::new(topic, payload);
        lock(&self.log).push(msg.clone());
        // No live receivers is fine: the log still has it.
        let _ = self.tx.send(msg);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), ChannelError> {
        lock(&self.topics).insert(topic.to_string());
        Ok(())
    }
}

/// Poisoning only happens if a holder panicked; the data is still usable.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ===========================================================================
// Tests
// ===========================================================================

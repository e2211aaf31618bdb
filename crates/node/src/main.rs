mod config;
mod device;
mod pump;
mod sim;

use std::sync::Arc;

use anyhow::{Context, Result};
use irrigation_proto::topics::TOPIC_CONTROL;
use irrigation_proto::{Channel, ControlConfig, MessageHandler, MqttChannel};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::NodeConfig;
use device::{DeviceController, DeviceState};
use pump::PumpRelay;
use sim::RandomWalk;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let cfg = NodeConfig::from_env();
    let (soil, rain) = cfg.scenario.initial_levels();
    info!(
        client_id = %cfg.mqtt.client_id,
        broker = %cfg.mqtt.host,
        port = cfg.mqtt.port,
        scenario = %cfg.scenario,
        "starting irrigation node"
    );

    // ── Pump relay ──────────────────────────────────────────────────
    let relay = PumpRelay::new(cfg.relay_gpio_pin, cfg.relay_active_low)
        .context("failed to initialise pump relay")?;

    // ── MQTT ────────────────────────────────────────────────────────
    let (channel, events) = MqttChannel::connect(&cfg.mqtt);
    channel
        .subscribe(TOPIC_CONTROL)
        .await
        .context("failed to subscribe to control topic")?;
    info!("subscribed to {TOPIC_CONTROL}");

    let controller = Arc::new(DeviceController::new(
        DeviceState::new(soil, rain),
        Box::new(RandomWalk::new()),
        relay,
        Arc::new(channel),
        ControlConfig::default(),
    ));

    let shutdown = CancellationToken::new();

    let handler: Arc<dyn MessageHandler> = controller.clone();
    let events_task = tokio::spawn(events.run(handler, shutdown.clone()));

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutting down");
                    shutdown.cancel();
                }
                Err(e) => error!("failed to listen for ctrl-c: {e}"),
            }
        });
    }

    controller.run(shutdown).await;
    if let Err(e) = events_task.await {
        error!("mqtt task ended abnormally: {e}");
    }
    Ok(())
}

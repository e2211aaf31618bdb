mod bridge;
mod config;
mod db;
mod error;
mod history;
mod schedule;
mod scheduler;
mod state;
mod trigger;
mod weather;
mod web;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use irrigation_proto::{
    Channel, Clock, ControlConfig, MessageHandler, MqttChannel, SystemClock, TOPIC_COMMANDS,
    TOPIC_STATUS, TOPIC_TELEMETRY,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bridge::HubHandler;
use db::Db;
use history::HistoryLogger;
use scheduler::JobScheduler;
use state::SystemState;
use weather::{NoWeather, WeatherApi, WeatherProvider};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "hub.toml".to_string());
    let cfg = config::load(&config_path)?;
    let tz = cfg
        .scheduler_offset()
        .context("scheduler.utc_offset_minutes is not a valid offset")?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.db_url).await?;
    db.migrate().await?;
    info!(db_url = %cfg.db_url, "db ready");

    // ── Shared state (ephemeral, for the API) ───────────────────────
    let shared = SystemState::shared(&ControlConfig::default());
    shared.write().await.record_system("hub started".to_string());

    let shutdown = CancellationToken::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // ── MQTT ────────────────────────────────────────────────────────
    let (mqtt, events) = MqttChannel::connect(&cfg.mqtt_settings());
    for topic in [TOPIC_TELEMETRY, TOPIC_STATUS, TOPIC_COMMANDS] {
        mqtt.subscribe(topic)
            .await
            .with_context(|| format!("failed to subscribe to {topic}"))?;
    }
    info!(host = %cfg.mqtt.host, port = cfg.mqtt.port, "hub subscribed to device topics");
    let channel: Arc<dyn Channel> = Arc::new(mqtt);

    // ── History + weather ───────────────────────────────────────────
    let weather: Arc<dyn WeatherProvider> = match cfg.weather_api_key() {
        Some(key) => Arc::new(
            WeatherApi::new(&cfg.weather.base_url, key, &cfg.weather.location)
                .context("failed to build weather client")?,
        ),
        None => {
            warn!("no weather api key configured, history rows will have no weather");
            Arc::new(NoWeather)
        }
    };
    let history = Arc::new(HistoryLogger::new(db.clone(), weather, Arc::clone(&clock)));

    // ── Scheduler ───────────────────────────────────────────────────
    let scheduler = JobScheduler::with_events(
        Arc::new(db.clone()),
        Arc::clone(&channel),
        Arc::clone(&clock),
        tz,
        Arc::clone(&shared),
    );
    // A failed first pass is retried by the resync loop.
    match scheduler.reconcile().await {
        Ok(live) => info!(live, %tz, "scheduler started"),
        Err(e) => error!("initial schedule load failed: {e}"),
    }
    let resync = {
        let scheduler = scheduler.clone();
        let interval = Duration::from_secs(cfg.scheduler.resync_interval_sec);
        tokio::spawn(async move { scheduler.run_resync(interval).await })
    };

    // ── Web server ──────────────────────────────────────────────────
    let app = web::AppState {
        state: Arc::clone(&shared),
        scheduler: scheduler.clone(),
        db: db.clone(),
        channel: Arc::clone(&channel),
        clock: Arc::clone(&clock),
    };
    let web_port = cfg.web.port;
    let web_shutdown = shutdown.clone();
    let web = tokio::spawn(async move {
        if let Err(e) = web::serve(app, web_port, web_shutdown).await {
            error!("{e:#}");
        }
    });

    // ── Inbound messages ────────────────────────────────────────────
    let handler: Arc<dyn MessageHandler> = Arc::new(HubHandler::new(
        Arc::clone(&shared),
        Arc::clone(&channel),
        history,
        Arc::clone(&clock),
    ));
    let pump = tokio::spawn(events.run(handler, shutdown.clone()));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(e) => error!("failed to listen for ctrl-c: {e}"),
    }

    // Scheduler first: in-flight executions publish WATER_OFF while the
    // MQTT event loop is still running.
    scheduler.shutdown().await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    shutdown.cancel();

    for (name, task) in [("resync", resync), ("web", web), ("mqtt", pump)] {
        if let Err(e) = task.await {
            warn!(task = name, "task ended abnormally: {e}");
        }
    }
    db.close().await;
    info!("hub stopped");
    Ok(())
}

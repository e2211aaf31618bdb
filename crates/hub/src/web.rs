use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;
use irrigation_proto::{Channel, Clock, Command, TOPIC_CONTROL};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::db::{Db, ScheduleStore};
use crate::error::{SchedulerError, StoreError, ValidationError};
use crate::history::HISTORY_LIMIT;
use crate::schedule::{NewSchedule, ScheduleStatus};
use crate::scheduler::JobScheduler;
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub state: SharedState,
    pub scheduler: JobScheduler,
    pub db: Db,
    pub channel: Arc<dyn Channel>,
    pub clock: Arc<dyn Clock>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ApiError {
    Validation(ValidationError),
    BadRequest(String),
    NotFound(String),
    Unavailable(String),
    Internal(String),
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::Validation(v) => Self::Validation(v),
            SchedulerError::NotFound(id) => Self::NotFound(format!("schedule {id} not found")),
            SchedulerError::Store(s) => s.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Validation(v) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": v.to_string(), "field": v.field }),
            ),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, json!({ "error": msg })),
            Self::Internal(msg) => {
                error!("api: {msg}");
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": msg }))
            }
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/schedules", get(list_schedules).post(create_schedule))
        .route("/api/schedules/{id}", delete(delete_schedule))
        .route("/api/schedules/{id}/status", put(set_schedule_status))
        .route("/api/control", post(control))
        .route("/api/history", get(list_history).delete(clear_history))
        .route("/api/history/{id}", delete(delete_history))
        .with_state(app)
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let live = app.scheduler.live_jobs().await;
    let st = app.state.read().await;
    Json(st.to_status(app.clock.now(), live))
}

// -- Schedules ---------------------------------------------------------------

async fn list_schedules(State(app): State<AppState>) -> ApiResult<impl IntoResponse> {
    let rows = app.scheduler.store().list_all().await?;
    Ok(Json(rows))
}

async fn create_schedule(
    State(app): State<AppState>,
    Json(req): Json<NewSchedule>,
) -> ApiResult<impl IntoResponse> {
    let id = app.scheduler.create(req).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn delete_schedule(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    app.scheduler.remove(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct StatusBody {
    status: ScheduleStatus,
}

async fn set_schedule_status(
    State(app): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<StatusBody>,
) -> ApiResult<impl IntoResponse> {
    app.scheduler.set_status(id, body.status).await?;
    Ok(Json(json!({ "id": id, "status": body.status })))
}

// -- Manual control ----------------------------------------------------------

#[derive(Deserialize)]
struct ControlBody {
    command: String,
}

async fn control(
    State(app): State<AppState>,
    Json(body): Json<ControlBody>,
) -> ApiResult<impl IntoResponse> {
    let cmd = Command::from_str(&body.command).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let wire = cmd.as_wire();

    app.channel
        .publish(TOPIC_CONTROL, wire.clone().into_bytes())
        .await
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;

    info!(command = %wire, "command sent from api");
    app.state.write().await.record_command(wire.clone());
    Ok(Json(json!({ "sent": wire })))
}

// -- History -----------------------------------------------------------------

async fn list_history(State(app): State<AppState>) -> ApiResult<impl IntoResponse> {
    let rows = app.db.list_history(HISTORY_LIMIT).await?;
    Ok(Json(rows))
}

async fn delete_history(
    State(app): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    if app.db.delete_history(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("history entry {id} not found")))
    }
}

async fn clear_history(State(app): State<AppState>) -> ApiResult<impl IntoResponse> {
    let deleted = app.db.clear_history().await?;
    info!(deleted, "history cleared");
    Ok(Json(json!({ "deleted": deleted })))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(app: AppState, port: u16, shutdown: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("api listening on http://{addr}");

    axum::serve(listener, router(app))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

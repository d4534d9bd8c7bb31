use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::actuator::ActuatorError;
use crate::surface::{ControlSurface, ScheduleUpdate, SettingsUpdate, SurfaceError};

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(surface: ControlSurface) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/sensors/current", get(sensors_current))
        .route("/api/sensors/history", get(sensors_history))
        .route("/api/relays", get(relays))
        .route("/api/relays/history", get(relays_history))
        .route("/api/relays/{name}", post(relay_command))
        .route("/api/climate/mode", get(climate_mode).post(set_climate_mode))
        .route(
            "/api/climate/settings",
            get(climate_settings).post(set_climate_settings),
        )
        .route("/api/light/mode", get(light_mode).post(set_light_mode))
        .route(
            "/api/light/schedule",
            get(light_schedule).post(set_light_schedule),
        )
        .with_state(surface)
}

// ---------------------------------------------------------------------------
// Bodies
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Deserialize, Serialize)]
struct ModeBody {
    mode: String,
}

#[derive(Deserialize)]
struct RelayBody {
    state: bool,
}

#[derive(Deserialize)]
struct HoursQuery {
    #[serde(default = "default_hours")]
    hours: u32,
}

#[derive(Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: u32,
}

fn default_hours() -> u32 {
    24
}

fn default_limit() -> u32 {
    50
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

impl IntoResponse for SurfaceError {
    fn into_response(self) -> Response {
        let status = match &self {
            SurfaceError::Validation(_) => StatusCode::BAD_REQUEST,
            SurfaceError::ModeConflict(_) => StatusCode::CONFLICT,
            SurfaceError::Actuator(ActuatorError::UnknownRelay(_)) => StatusCode::NOT_FOUND,
            SurfaceError::Actuator(ActuatorError::LinkUnavailable(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            SurfaceError::Storage(e) => {
                error!("web: storage failure: {e:#}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        error_response(status, &self.to_string())
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn api_status(State(s): State<ControlSurface>) -> impl IntoResponse {
    Json(s.status().await)
}

async fn sensors_current(State(s): State<ControlSurface>) -> Response {
    match s.current_snapshot().await {
        Some(view) => Json(view).into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "no sensor data yet"),
    }
}

async fn sensors_history(
    State(s): State<ControlSurface>,
    Query(q): Query<HoursQuery>,
) -> Result<impl IntoResponse, SurfaceError> {
    Ok(Json(s.sensor_history(q.hours).await?))
}

async fn relays(State(s): State<ControlSurface>) -> impl IntoResponse {
    Json(s.relay_states().await)
}

async fn relays_history(
    State(s): State<ControlSurface>,
    Query(q): Query<LimitQuery>,
) -> Result<impl IntoResponse, SurfaceError> {
    Ok(Json(s.relay_history(q.limit).await?))
}

async fn relay_command(
    State(s): State<ControlSurface>,
    Path(name): Path<String>,
    Json(body): Json<RelayBody>,
) -> Result<impl IntoResponse, SurfaceError> {
    Ok(Json(s.manual_relay(&name, body.state).await?))
}

async fn climate_mode(State(s): State<ControlSurface>) -> impl IntoResponse {
    Json(ModeBody {
        mode: s.climate_mode().await.to_string(),
    })
}

async fn set_climate_mode(
    State(s): State<ControlSurface>,
    Json(body): Json<ModeBody>,
) -> Result<impl IntoResponse, SurfaceError> {
    let mode = s.set_climate_mode(&body.mode).await?;
    Ok(Json(ModeBody {
        mode: mode.to_string(),
    }))
}

async fn climate_settings(State(s): State<ControlSurface>) -> impl IntoResponse {
    Json(s.climate_settings().await)
}

async fn set_climate_settings(
    State(s): State<ControlSurface>,
    Json(body): Json<SettingsUpdate>,
) -> Result<impl IntoResponse, SurfaceError> {
    Ok(Json(s.update_climate_settings(body).await?))
}

async fn light_mode(State(s): State<ControlSurface>) -> impl IntoResponse {
    Json(ModeBody {
        mode: s.light_mode().await.to_string(),
    })
}

async fn set_light_mode(
    State(s): State<ControlSurface>,
    Json(body): Json<ModeBody>,
) -> Result<impl IntoResponse, SurfaceError> {
    let mode = s.set_light_mode(&body.mode).await?;
    Ok(Json(ModeBody {
        mode: mode.to_string(),
    }))
}

async fn light_schedule(State(s): State<ControlSurface>) -> impl IntoResponse {
    Json(s.light_schedule().await)
}

async fn set_light_schedule(
    State(s): State<ControlSurface>,
    Json(body): Json<ScheduleUpdate>,
) -> Result<impl IntoResponse, SurfaceError> {
    Ok(Json(s.set_light_schedule(body).await?))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(surface: ControlSurface, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "http api listening");

    axum::serve(listener, router(surface))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

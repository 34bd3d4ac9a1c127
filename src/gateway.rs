//! ==============================================================================
//! gateway.rs - http api
//! ==============================================================================
//!
//! routes:
//!     GET  /sensors   latest snapshot; never fails, falls back to defaults
//!     POST /water     publish the watering command; 500 when it can't
//!     GET  /status    bus session state and last update / watering times
//!
//! handlers only touch the reading cache and the command publisher, both of
//! which return immediately, so a stalled broker never holds up a request.
//!
//! ==============================================================================

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::bus::SessionState;
use crate::cache::ReadingCache;
use crate::domain::{clock_time, SensorSnapshot, ValveState};
use crate::publisher::CommandPublisher;

// ==============================================================================
// shared state
// ==============================================================================

#[derive(Clone)]
pub struct AppState {
    pub cache: ReadingCache,
    pub commands: CommandPublisher,
    pub session: watch::Receiver<SessionState>,
    /// when the last watering command was handed to the transport
    pub last_watered: Arc<RwLock<Option<DateTime<Local>>>>,
}

impl AppState {
    pub fn new(
        cache: ReadingCache,
        commands: CommandPublisher,
        session: watch::Receiver<SessionState>,
    ) -> Self {
        Self { cache, commands, session, last_watered: Arc::new(RwLock::new(None)) }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sensors", get(sensors_handler))
        .route("/water", post(water_handler))
        .route("/status", get(status_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ==============================================================================
// responses
// ==============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorsResponse {
    pub humidity: f64,
    pub temperature: f64,
    pub light_level: f64,
    pub valve: ValveState,
    pub timestamp: String,
}

impl SensorsResponse {
    /// `now` stands in for the timestamp until a message has been seen
    pub fn from_snapshot(snapshot: &SensorSnapshot, now: DateTime<Local>) -> Self {
        Self {
            humidity: snapshot.humidity,
            temperature: snapshot.temperature,
            light_level: snapshot.light_level,
            valve: snapshot.valve,
            timestamp: clock_time(&snapshot.observed_at.unwrap_or(now)),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub connected: bool,
    pub session: SessionState,
    pub valve: ValveState,
    pub last_update: Option<String>,
    pub last_watered: Option<String>,
}

// ==============================================================================
// handlers
// ==============================================================================

async fn sensors_handler(State(state): State<AppState>) -> Json<SensorsResponse> {
    let snapshot = state.cache.get().await;
    Json(SensorsResponse::from_snapshot(&snapshot, Local::now()))
}

/// not idempotent: every call sends the command again
async fn water_handler(State(state): State<AppState>) -> Response {
    info!(topic = %state.commands.topic(), "watering requested");

    match state.commands.trigger() {
        Ok(()) => {
            let now = Local::now();
            *state.last_watered.write().await = Some(now);
            Json(serde_json::json!({
                "status": "success",
                "message": "Watering command transmitted",
                "timestamp": clock_time(&now),
            }))
            .into_response()
        }
        Err(e) => {
            error!(error = %e, "watering command not transmitted");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "status": "error",
                    "message": format!("Failed to publish to MQTT: {}", e),
                })),
            )
                .into_response()
        }
    }
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let session = *state.session.borrow();
    let snapshot = state.cache.get().await;
    let last_watered = *state.last_watered.read().await;

    Json(StatusResponse {
        connected: session == SessionState::Connected,
        session,
        valve: snapshot.valve,
        last_update: snapshot.observed_at.as_ref().map(clock_time),
        last_watered: last_watered.as_ref().map(clock_time),
    })
}

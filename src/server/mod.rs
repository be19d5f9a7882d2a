//! HTTP boundary.
//!
//! JSON in, JSON out (camelCase).  Domain errors become `{ "error": ... }`
//! bodies with a 400 / 404 / 500 status.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::departures::{DepartureRecord, DepartureRegistry};
use crate::error::AnnounceError;
use crate::voice::AnnouncementSequencer;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub sequencer: Arc<AnnouncementSequencer>,
    pub departures: Arc<DepartureRegistry>,
}

/// Build the router with every endpoint and its aliases.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/status", get(status))
        .route("/next-station", post(next_station))
        .route("/departures", get(list_departures).post(upsert_departure))
        .route("/api/departures", get(list_departures).post(upsert_departure))
        .route("/reset", post(reset_departures))
        .route("/api/reset", post(reset_departures))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

impl IntoResponse for AnnounceError {
    fn into_response(self) -> Response {
        let status = match &self {
            AnnounceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AnnounceError::UnknownRoute(_)
            | AnnounceError::ChannelNotFound(_)
            | AnnounceError::AudioNotFound(_) => StatusCode::NOT_FOUND,
            AnnounceError::Connect(_) | AnnounceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!(kind = self.kind(), error = %self, "Request failed");
        }

        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

fn bad_json(rejection: JsonRejection) -> AnnounceError {
    AnnounceError::InvalidRequest(format!("Invalid JSON body: {}", rejection.body_text()))
}

fn required(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NextStationRequest {
    #[serde(default, alias = "route")]
    route_name: Option<String>,
    #[serde(default, alias = "station")]
    station_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DepartureRequest {
    #[serde(default, alias = "route")]
    route_name: Option<String>,
    #[serde(default)]
    driver: Option<String>,
    #[serde(default, alias = "time")]
    depart_time: Option<String>,
}

async fn health() -> &'static str {
    "Station announcer is running"
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let mut snapshot = serde_json::to_value(state.sequencer.state())
        .unwrap_or_else(|_| json!({ "state": "unknown" }));
    if let Value::Object(map) = &mut snapshot {
        map.insert(
            "channelId".to_string(),
            json!(state.sequencer.connected_channel().map(|id| id.to_string())),
        );
        map.insert("departures".to_string(), json!(state.departures.len()));
    }
    Json(snapshot)
}

async fn next_station(
    State(state): State<AppState>,
    payload: Result<Json<NextStationRequest>, JsonRejection>,
) -> Result<Json<Value>, AnnounceError> {
    let Json(req) = payload.map_err(bad_json)?;
    let (Some(route), Some(station)) = (required(req.route_name), required(req.station_name))
    else {
        warn!("Next station request without routeName or stationName");
        return Err(AnnounceError::InvalidRequest(
            "Missing routeName or stationName".to_string(),
        ));
    };

    info!(route = %route, station = %station, "Next station request");
    let message = state.sequencer.announce(&route, &station).await?;
    Ok(Json(json!({ "success": true, "message": message })))
}

async fn list_departures(State(state): State<AppState>) -> Json<Vec<DepartureRecord>> {
    Json(state.departures.list())
}

async fn upsert_departure(
    State(state): State<AppState>,
    payload: Result<Json<DepartureRequest>, JsonRejection>,
) -> Result<Json<Value>, AnnounceError> {
    let Json(req) = payload.map_err(bad_json)?;
    let record = state.departures.upsert(
        req.route_name.as_deref().unwrap_or_default(),
        req.driver.as_deref().unwrap_or_default(),
        req.depart_time.as_deref().unwrap_or_default(),
    )?;
    info!(
        route = %record.route_name,
        driver = %record.driver,
        depart_time = %record.depart_time,
        "Departure reported"
    );
    Ok(Json(json!({ "success": true })))
}

async fn reset_departures(State(state): State<AppState>) -> Json<Value> {
    state.departures.reset();
    info!("Departures reset");
    Json(json!({ "success": true }))
}

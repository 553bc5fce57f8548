use crate::config::WriteSettings;
use crate::error::RelayError;
use crate::pipeline::{PipelineHandle, RelayStatus};
use crate::telemetry::{CapabilityEvent, Event};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct HttpState {
    pub pipeline: PipelineHandle,
}

#[derive(Debug, Deserialize)]
struct EventsRequest {
    events: Vec<Event>,
}

#[derive(Debug, Deserialize)]
struct CapabilitiesRequest {
    capabilities: Vec<CapabilityEvent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteIntervalRequest {
    write_interval_seconds: u64,
}

#[derive(Debug, Serialize)]
struct AcceptedResponse {
    accepted: usize,
    received: usize,
}

#[derive(Debug, Serialize)]
struct WrittenResponse {
    written: usize,
}

fn error_response(err: RelayError) -> (StatusCode, String) {
    let status = if err.is_validation() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, err.to_string())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_status(State(state): State<HttpState>) -> Json<RelayStatus> {
    Json(state.pipeline.status())
}

async fn post_events(
    State(state): State<HttpState>,
    Json(payload): Json<EventsRequest>,
) -> Json<AcceptedResponse> {
    let accepted = state.pipeline.ingest_events(&payload.events);
    Json(AcceptedResponse {
        accepted,
        received: payload.events.len(),
    })
}

async fn post_capabilities(
    State(state): State<HttpState>,
    Json(payload): Json<CapabilitiesRequest>,
) -> Json<AcceptedResponse> {
    let accepted = payload
        .capabilities
        .iter()
        .filter(|event| state.pipeline.ingest_capability(event))
        .count();
    Json(AcceptedResponse {
        accepted,
        received: payload.capabilities.len(),
    })
}

async fn post_history(
    State(state): State<HttpState>,
    Json(payload): Json<EventsRequest>,
) -> Result<Json<WrittenResponse>, (StatusCode, String)> {
    let batch = state.pipeline.formatter().from_events(&payload.events);
    let written = state
        .pipeline
        .write_batch(batch)
        .await
        .map_err(error_response)?;
    Ok(Json(WrittenResponse { written }))
}

async fn put_settings(
    State(state): State<HttpState>,
    Json(settings): Json<WriteSettings>,
) -> Json<RelayStatus> {
    state.pipeline.update_settings(settings).await;
    Json(state.pipeline.status())
}

async fn put_write_interval(
    State(state): State<HttpState>,
    Json(payload): Json<WriteIntervalRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .pipeline
        .set_write_interval(payload.write_interval_seconds)
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(get_status))
        .route("/v1/events", post(post_events))
        .route("/v1/capabilities", post(post_capabilities))
        .route("/v1/history", post(post_history))
        .route("/v1/settings", put(put_settings))
        .route("/v1/write-interval", put(put_write_interval))
        .with_state(state)
}

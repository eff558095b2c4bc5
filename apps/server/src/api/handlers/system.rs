use crate::api::response::ApiResponse;
use crate::pipeline::InFlightEntry;
use crate::state::AppState;
use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Json},
};
use serde_json::{json, Value as JsonValue};

pub async fn health_check(State(state): State<AppState>) -> Json<JsonValue> {
    let status = if state.intake.is_closed() {
        "draining"
    } else {
        "ok"
    };
    Json(json!({
        "status": status,
        "service": state.config.logging.service_name,
        "version": env!("CARGO_PKG_VERSION"),
        "routes": state.config.routes.len(),
        "in_flight": state.orchestrator.in_flight().len(),
    }))
}

/// Prometheus text format
pub async fn metrics_handler() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok(buffer) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(CONTENT_TYPE, "text/plain")],
                b"Failed to encode metrics".to_vec(),
            )
        }
    }
}

pub async fn in_flight(State(state): State<AppState>) -> Json<ApiResponse<Vec<InFlightEntry>>> {
    Json(ApiResponse::success(state.orchestrator.in_flight()))
}

//! HTTP ingestion
//!
//! Each configured path is a POST endpoint bound to one route. The request
//! waits up to the route's synchronous budget for the pipeline outcome and
//! answers from it; past the budget it answers 202 and processing continues.

use crate::api::middleware::RequestContext;
use crate::api::response::ApiResponse;
use crate::config::{RouteConfig, SourceConfig};
use crate::envelope::MessageStatus;
use crate::metrics;
use crate::pipeline::{InboundUnit, IntakeError, ProcessingOutcome};
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{MatchedPath, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct HttpBinding {
    pub route: String,
    pub sync_wait: Duration,
}

impl HttpBinding {
    pub fn from_routes(routes: &[RouteConfig]) -> HashMap<String, HttpBinding> {
        routes
            .iter()
            .filter_map(|route| match &route.source {
                SourceConfig::Http(http) => Some((
                    http.path.clone(),
                    HttpBinding {
                        route: route.name.clone(),
                        sync_wait: Duration::from_millis(http.sync_wait_ms),
                    },
                )),
                _ => None,
            })
            .collect()
    }
}

/// Body of a 202: enough to find the message later.
#[derive(Debug, Serialize)]
struct Accepted {
    request_id: String,
    correlation_id: Uuid,
    route: String,
}

pub async fn ingest(
    State(state): State<AppState>,
    matched: MatchedPath,
    context: Option<Extension<RequestContext>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(binding) = state.http_bindings.get(matched.as_str()) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<()>::failure("no route is bound to this path")),
        )
            .into_response();
    };

    let (request_id, correlation_id) = match context {
        Some(Extension(ctx)) => (ctx.request_id, ctx.correlation_id.unwrap_or_else(Uuid::new_v4)),
        None => (Uuid::new_v4().to_string(), Uuid::new_v4()),
    };
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let (unit, reply) = InboundUnit::new(
        binding.route.clone(),
        format!("http:{}", matched.as_str()),
        body,
    )
    .content_type(content_type)
    .correlation_id(Some(correlation_id))
    .annotate("request_id", request_id.clone())
    .with_reply();

    if let Err(e) = state.intake.submit(unit).await {
        let reason = match e {
            IntakeError::Busy => "busy",
            IntakeError::Closed => "closed",
        };
        metrics::MESSAGES_REFUSED
            .with_label_values(&[&binding.route, reason])
            .inc();
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::<()>::failure(e.to_string())),
        )
            .into_response();
    }
    metrics::MESSAGES_RECEIVED
        .with_label_values(&[&binding.route, "http"])
        .inc();

    match tokio::time::timeout(binding.sync_wait, reply).await {
        Ok(Ok(outcome)) => outcome_response(outcome),
        Ok(Err(_)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::<()>::failure("engine stopped before the message completed")),
        )
            .into_response(),
        Err(_) => (
            StatusCode::ACCEPTED,
            Json(
                ApiResponse::success(Accepted {
                    request_id,
                    correlation_id,
                    route: binding.route.clone(),
                })
                .with_message("accepted, processing continues"),
            ),
        )
            .into_response(),
    }
}

/// HTTP status for a terminal outcome.
pub fn outcome_status(outcome: &ProcessingOutcome) -> StatusCode {
    if outcome.abandoned {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    match outcome.status {
        MessageStatus::Acknowledged => StatusCode::OK,
        MessageStatus::Quarantined => StatusCode::BAD_REQUEST,
        MessageStatus::DeadLetter => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn outcome_response(outcome: ProcessingOutcome) -> Response {
    let status = outcome_status(&outcome);
    let body = if status == StatusCode::OK {
        ApiResponse::success(outcome)
    } else {
        let message = outcome
            .reason
            .clone()
            .unwrap_or_else(|| outcome.status.to_string());
        ApiResponse::failure_with(outcome, message)
    };
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status: MessageStatus, abandoned: bool) -> ProcessingOutcome {
        ProcessingOutcome {
            message_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            status,
            message_type: None,
            retry_count: 0,
            reason: None,
            deliveries: Vec::new(),
            abandoned,
        }
    }

    #[test]
    fn test_outcome_status_mapping() {
        assert_eq!(
            outcome_status(&outcome(MessageStatus::Acknowledged, false)),
            StatusCode::OK
        );
        assert_eq!(
            outcome_status(&outcome(MessageStatus::DeadLetter, false)),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            outcome_status(&outcome(MessageStatus::Quarantined, false)),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            outcome_status(&outcome(MessageStatus::SendFailed, true)),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}

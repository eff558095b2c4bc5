//! Request id and correlation id propagation

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use opentelemetry::trace::TraceContextExt;
use std::time::Instant;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Per-request identifiers, available to handlers as an extension.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    /// Client-supplied correlation id; seeds the envelope's correlation id
    pub correlation_id: Option<Uuid>,
}

/// Assigns `x-request-id`, picks up a client `x-correlation-id` (or a
/// UUID-shaped client request id) and echoes it on the response.
#[tracing::instrument(
    name = "http_request",
    skip_all,
    fields(
        http.method = %req.method(),
        http.route = %req.uri().path(),
        otel.kind = "server",
        http.response.status_code = tracing::field::Empty,
        request_id = tracing::field::Empty,
    )
)]
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let span = Span::current();
    let start = Instant::now();

    let client_correlation = {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        header(CORRELATION_ID_HEADER).or_else(|| header(REQUEST_ID_HEADER))
    };
    let correlation_id = client_correlation
        .as_deref()
        .and_then(|v| Uuid::parse_str(v.trim()).ok());

    let request_id = Uuid::new_v4().to_string();
    span.record("request_id", &request_id);
    req.extensions_mut().insert(RequestContext {
        request_id: request_id.clone(),
        correlation_id,
    });

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let mut response = next.run(req).await;

    let status = response.status();
    span.record("http.response.status_code", status.as_u16());
    tracing::info!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Request completed"
    );

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    let trace_id = span.context().span().span_context().trace_id().to_string();
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        headers.insert("x-trace-id", value);
    }
    if let Some(value) = client_correlation.and_then(|c| HeaderValue::from_str(&c).ok()) {
        headers.insert(CORRELATION_ID_HEADER, value);
    }

    response
}

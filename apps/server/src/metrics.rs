//! Prometheus metrics for the engine
//!
//! Registered once in the default registry and exposed at `GET /metrics`.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, HistogramVec,
    IntCounterVec, IntGauge,
};

lazy_static! {
    // Intake

    /// Payloads accepted by a listener, by route and transport
    pub static ref MESSAGES_RECEIVED: IntCounterVec = register_int_counter_vec!(
        "conduit_messages_received_total",
        "Payloads accepted by listeners",
        &["route", "transport"]
    )
    .expect("Failed to register MESSAGES_RECEIVED");

    /// Payloads refused at hand-off (busy or closed)
    pub static ref MESSAGES_REFUSED: IntCounterVec = register_int_counter_vec!(
        "conduit_messages_refused_total",
        "Payloads refused before processing",
        &["route", "reason"]
    )
    .expect("Failed to register MESSAGES_REFUSED");

    pub static ref INTAKE_DEPTH: IntGauge = register_int_gauge!(
        "conduit_intake_depth",
        "Inbound units waiting for a worker"
    )
    .expect("Failed to register INTAKE_DEPTH");

    // Pipeline

    pub static ref IN_FLIGHT: IntGauge = register_int_gauge!(
        "conduit_envelopes_in_flight",
        "Envelopes currently being processed"
    )
    .expect("Failed to register IN_FLIGHT");

    /// Terminal outcomes by route and status
    pub static ref MESSAGES_COMPLETED: IntCounterVec = register_int_counter_vec!(
        "conduit_messages_completed_total",
        "Envelopes that reached a terminal status",
        &["route", "status"]
    )
    .expect("Failed to register MESSAGES_COMPLETED");

    pub static ref STAGE_FAILURES: IntCounterVec = register_int_counter_vec!(
        "conduit_stage_failures_total",
        "Stage failures by stage and failure class",
        &["stage", "class"]
    )
    .expect("Failed to register STAGE_FAILURES");

    pub static ref RETRIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "conduit_retries_total",
        "Transient failures scheduled for retry",
        &["stage"]
    )
    .expect("Failed to register RETRIES_TOTAL");

    /// Receive to terminal status
    pub static ref PROCESSING_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "conduit_processing_duration_seconds",
        "End-to-end processing time per envelope",
        &["route"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
    )
    .expect("Failed to register PROCESSING_DURATION_SECONDS");

    // Connectors

    pub static ref SEND_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "conduit_send_duration_seconds",
        "Time per delivery attempt",
        &["destination"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("Failed to register SEND_DURATION_SECONDS");

    pub static ref POOL_EXHAUSTED: IntCounterVec = register_int_counter_vec!(
        "conduit_pool_exhausted_total",
        "Checkouts that timed out waiting for a connection slot",
        &["destination"]
    )
    .expect("Failed to register POOL_EXHAUSTED");

    // Listeners

    pub static ref MLLP_SESSIONS: IntGauge = register_int_gauge!(
        "conduit_mllp_sessions_open",
        "Open inbound MLLP connections"
    )
    .expect("Failed to register MLLP_SESSIONS");

    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "conduit_http_requests_total",
        "HTTP requests by method, path and status",
        &["method", "path", "status"]
    )
    .expect("Failed to register HTTP_REQUESTS_TOTAL");

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "conduit_http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("Failed to register HTTP_REQUEST_DURATION_SECONDS");
}

/// Collapse per-record paths so label cardinality stays bounded.
pub fn sanitize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        ["dead-letters", _id, rest @ ..] => {
            let mut label = "/dead-letters/{id}".to_string();
            for segment in rest {
                label.push('/');
                label.push_str(segment);
            }
            label
        }
        _ if path.is_empty() => "/".to_string(),
        _ => path.to_string(),
    }
}

/// Render every registered metric in the Prometheus text format.
pub fn render() -> Result<Vec<u8>, prometheus::Error> {
    use prometheus::{Encoder, TextEncoder};

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_path() {
        assert_eq!(sanitize_path("/ingest/adt"), "/ingest/adt");
        assert_eq!(
            sanitize_path("/dead-letters/5b7c9f1e-0000-0000-0000-000000000000"),
            "/dead-letters/{id}"
        );
        assert_eq!(
            sanitize_path("/dead-letters/5b7c9f1e-0000-0000-0000-000000000000/replay"),
            "/dead-letters/{id}/replay"
        );
        assert_eq!(sanitize_path("/dead-letters"), "/dead-letters");
        assert_eq!(sanitize_path(""), "/");
    }

    #[test]
    fn test_render_includes_engine_metrics() {
        MESSAGES_RECEIVED.with_label_values(&["adt", "mllp"]).inc();
        let text = String::from_utf8(render().unwrap()).unwrap();
        assert!(text.contains("conduit_messages_received_total"));
    }
}

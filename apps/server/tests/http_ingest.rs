//! HTTP ingestion to FHIR destinations, plus the operational endpoints

mod support;

use conduit::Engine;
use reqwest::StatusCode;
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use support::{FhirMock, FhirMockBehavior};
use uuid::Uuid;

const CONFIG: &str = r#"
[server]
host = "127.0.0.1"
port = 0
cors_origins = []

[retry]
max_retries = 2
base_delay_ms = 10
max_delay_ms = 20
jitter_ratio = 0.0

[[destinations]]
id = "fhir"
transport = "fhir"
base_url = "__FHIR__"
timeout_ms = 2000

[[destinations]]
id = "slow-fhir"
transport = "fhir"
base_url = "__SLOW_FHIR__"
timeout_ms = 2000

[[routes]]
name = "patients"
destinations = ["fhir"]

[routes.source]
transport = "http"
path = "/ingest/patients"
sync_wait_ms = 5000

[[routes]]
name = "slow"
destinations = ["slow-fhir"]

[routes.source]
transport = "http"
path = "/ingest/slow"
sync_wait_ms = 50
"#;

struct Harness {
    engine: Engine,
    fhir: FhirMock,
    _slow: FhirMock,
    client: reqwest::Client,
}

impl Harness {
    async fn start(behavior: FhirMockBehavior) -> anyhow::Result<Self> {
        support::init_logging();
        let fhir = FhirMock::start(behavior).await?;
        let slow = FhirMock::start(FhirMockBehavior {
            delay: Duration::from_millis(500),
            ..Default::default()
        })
        .await?;
        let toml = CONFIG
            .replace("__FHIR__", &fhir.base_url())
            .replace("__SLOW_FHIR__", &slow.base_url());
        let engine = Engine::start(support::config_from_toml(&toml)?).await?;
        Ok(Self {
            engine,
            fhir,
            _slow: slow,
            client: reqwest::Client::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.engine.http_addr(), path)
    }

    async fn post_json(&self, path: &str, body: &JsonValue) -> anyhow::Result<(StatusCode, JsonValue)> {
        let response = self
            .client
            .post(self.url(path))
            .header("content-type", "application/fhir+json")
            .json(body)
            .send()
            .await?;
        let status = response.status();
        Ok((status, response.json().await?))
    }

    async fn get_json(&self, path: &str) -> anyhow::Result<(StatusCode, JsonValue)> {
        let response = self.client.get(self.url(path)).send().await?;
        let status = response.status();
        Ok((status, response.json().await?))
    }
}

fn patient() -> JsonValue {
    json!({
        "resourceType": "Patient",
        "identifier": [{ "system": "urn:mrn", "value": "12345" }],
        "name": [{ "family": "Doe" }]
    })
}

#[tokio::test]
async fn delivered_resource_answers_200_with_outcome() -> anyhow::Result<()> {
    let harness = Harness::start(FhirMockBehavior::default()).await?;

    let (status, body) = harness.post_json("/ingest/patients", &patient()).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["data"]["status"], json!("ACKNOWLEDGED"));
    assert_eq!(body["data"]["message_type"], json!("Patient"));
    assert!(body["timestamp"].is_string());

    let posts = harness.fhir.requests_with(axum::http::Method::POST);
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].path, "/Patient");
    assert_eq!(posts[0].body.as_ref().map(|b| b["resourceType"].clone()), Some(json!("Patient")));

    harness.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn slow_delivery_answers_202_with_the_callers_correlation_id() -> anyhow::Result<()> {
    let harness = Harness::start(FhirMockBehavior::default()).await?;
    let correlation_id = Uuid::new_v4();

    let response = harness
        .client
        .post(harness.url("/ingest/slow"))
        .header("content-type", "application/fhir+json")
        .header("x-correlation-id", correlation_id.to_string())
        .json(&patient())
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        response
            .headers()
            .get("x-correlation-id")
            .and_then(|v| v.to_str().ok()),
        Some(correlation_id.to_string().as_str())
    );
    let body: JsonValue = response.json().await?;
    assert_eq!(body["data"]["correlation_id"], json!(correlation_id.to_string()));
    assert_eq!(body["data"]["route"], json!("slow"));
    assert_eq!(body["message"], json!("accepted, processing continues"));

    harness.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn malformed_body_is_quarantined_with_400() -> anyhow::Result<()> {
    let harness = Harness::start(FhirMockBehavior::default()).await?;

    let response = harness
        .client
        .post(harness.url("/ingest/patients"))
        .header("content-type", "application/json")
        .body("{ not json")
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: JsonValue = response.json().await?;
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["data"]["status"], json!("QUARANTINED"));

    let (status, listing) = harness.get_json("/dead-letters?kind=quarantine").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listing["data"].as_array().map(Vec::len), Some(1));
    assert!(harness.fhir.requests().is_empty());

    harness.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn rejected_batch_entries_become_dead_letters() -> anyhow::Result<()> {
    let harness = Harness::start(FhirMockBehavior::default()).await?;
    let bundle = json!({
        "resourceType": "Bundle",
        "type": "batch",
        "entry": [
            { "resource": { "resourceType": "Patient" }, "request": { "method": "POST", "url": "Patient" } },
            { "resource": { "resourceType": "Patient", "reject": true }, "request": { "method": "POST", "url": "Patient" } }
        ]
    });

    let (status, body) = harness.post_json("/ingest/patients", &bundle).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], json!("ACKNOWLEDGED"));

    let (_, listing) = harness.get_json("/dead-letters?kind=dead_letter").await?;
    let records = listing["data"].as_array().cloned().unwrap_or_default();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["correlation_id"], body["data"]["correlation_id"]);

    let id = records[0]["id"].as_str().unwrap_or_default().to_string();
    let (status, record) = harness.get_json(&format!("/dead-letters/{}", id)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["data"]["failure_class"], json!("permanent"));

    harness.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn rejected_resource_is_dead_lettered_and_can_be_replayed() -> anyhow::Result<()> {
    let harness = Harness::start(FhirMockBehavior {
        fail_status: Some(422),
        ..Default::default()
    })
    .await?;

    let (status, body) = harness.post_json("/ingest/patients", &patient()).await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["data"]["status"], json!("DEAD_LETTER"));
    // Permanent: no retries
    assert_eq!(body["data"]["retry_count"], json!(0));

    let (_, listing) = harness.get_json("/dead-letters").await?;
    let id = listing["data"][0]["id"].as_str().unwrap_or_default().to_string();

    let response = harness
        .client
        .post(harness.url(&format!("/dead-letters/{}/replay", id)))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let replayed: JsonValue = response.json().await?;
    assert_eq!(replayed["data"]["status"], json!("DEAD_LETTER"));
    assert_eq!(replayed["data"]["correlation_id"], body["data"]["correlation_id"]);
    assert_ne!(replayed["data"]["message_id"], json!(id));

    // The original record was consumed by the replay.
    let (status, _) = harness.get_json(&format!("/dead-letters/{}", id)).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(harness.fhir.requests().len(), 2);

    harness.engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn health_and_metrics_are_served() -> anyhow::Result<()> {
    let harness = Harness::start(FhirMockBehavior::default()).await?;
    harness.post_json("/ingest/patients", &patient()).await?;

    let (status, health) = harness.get_json("/health").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], json!("ok"));
    assert_eq!(health["routes"], json!(2));

    let metrics = harness
        .client
        .get(harness.url("/metrics"))
        .send()
        .await?
        .text()
        .await?;
    assert!(metrics.contains("conduit_messages_received_total"));
    assert!(metrics.contains("conduit_messages_completed_total"));

    let (status, _) = harness.get_json("/in-flight").await?;
    assert_eq!(status, StatusCode::OK);

    harness.engine.shutdown().await;
    Ok(())
}

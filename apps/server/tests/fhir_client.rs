//! FHIR destination client against an in-process server

mod support;

use axum::http::Method;
use conduit::config::FhirDestinationConfig;
use conduit::connectors::fhir::{ConditionalOutcome, FhirClient};
use conduit::connectors::ConnectorError;
use conduit::error::FailureClass;
use serde_json::json;
use std::time::Duration;
use support::{FhirMock, FhirMockBehavior};

fn client_for(mock: &FhirMock, configure: impl FnOnce(&mut FhirDestinationConfig)) -> FhirClient {
    let mut config = FhirDestinationConfig {
        base_url: mock.base_url(),
        timeout_ms: 2_000,
        max_concurrent: 4,
        acquire_timeout_ms: 1_000,
        bearer_token: None,
    };
    configure(&mut config);
    FhirClient::new("fhir", &config).expect("client")
}

fn patient() -> serde_json::Value {
    json!({
        "resourceType": "Patient",
        "identifier": [{ "system": "urn:mrn", "value": "12345" }],
        "name": [{ "family": "Doe", "given": ["John"] }]
    })
}

#[tokio::test]
async fn create_returns_location_and_sends_bearer_token() -> anyhow::Result<()> {
    let mock = FhirMock::start(FhirMockBehavior::default()).await?;
    let client = client_for(&mock, |c| c.bearer_token = Some("secret".into()));

    let response = client.create(&patient()).await?;
    assert_eq!(response.status, 201);
    assert!(response.is_success());
    assert!(response
        .location
        .as_deref()
        .is_some_and(|l| l.starts_with("Patient/")));

    let requests = mock.requests_with(Method::POST);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path, "/Patient");
    assert_eq!(requests[0].authorization.as_deref(), Some("Bearer secret"));
    Ok(())
}

#[tokio::test]
async fn conditional_create_follows_match_count() -> anyhow::Result<()> {
    let query = "identifier=urn:mrn|12345";

    let none = FhirMock::start(FhirMockBehavior::default()).await?;
    match client_for(&none, |_| {}).conditional_create(&patient(), query).await? {
        ConditionalOutcome::Created(response) => assert_eq!(response.status, 201),
        other => panic!("expected Created, got {:?}", other),
    }
    let posts = none.requests_with(Method::POST);
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].if_none_exist.as_deref(), Some(query));

    let one = FhirMock::start(FhirMockBehavior {
        search_matches: 1,
        ..Default::default()
    })
    .await?;
    match client_for(&one, |_| {}).conditional_create(&patient(), query).await? {
        ConditionalOutcome::Existing(resource) => assert_eq!(resource["id"], "existing-0"),
        other => panic!("expected Existing, got {:?}", other),
    }
    assert!(one.requests_with(Method::POST).is_empty());

    let many = FhirMock::start(FhirMockBehavior {
        search_matches: 2,
        ..Default::default()
    })
    .await?;
    assert_eq!(
        client_for(&many, |_| {}).conditional_create(&patient(), query).await?,
        ConditionalOutcome::Ambiguous(2)
    );
    Ok(())
}

#[tokio::test]
async fn server_errors_are_transient_and_client_errors_permanent() -> anyhow::Result<()> {
    let unavailable = FhirMock::start(FhirMockBehavior {
        fail_status: Some(503),
        ..Default::default()
    })
    .await?;
    let response = client_for(&unavailable, |_| {}).create(&patient()).await?;
    assert_eq!(response.failure_class(), FailureClass::Transient);
    assert_eq!(response.outcome_text().as_deref(), Some("scripted failure"));

    let invalid = FhirMock::start(FhirMockBehavior {
        fail_status: Some(422),
        ..Default::default()
    })
    .await?;
    let response = client_for(&invalid, |_| {}).create(&patient()).await?;
    assert_eq!(response.failure_class(), FailureClass::Permanent);
    Ok(())
}

#[tokio::test]
async fn concurrency_limit_reports_pool_exhaustion() -> anyhow::Result<()> {
    let mock = FhirMock::start(FhirMockBehavior {
        delay: Duration::from_millis(500),
        ..Default::default()
    })
    .await?;
    let client = client_for(&mock, |c| {
        c.max_concurrent = 1;
        c.acquire_timeout_ms = 50;
    });

    let resource = patient();
    let (first, second) = tokio::join!(client.create(&resource), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.create(&resource).await
    });
    assert!(first.is_ok());
    let err = second.expect_err("second request should not get a slot");
    assert!(matches!(err, ConnectorError::PoolExhausted { .. }));
    assert!(err.is_transient());
    Ok(())
}

#[tokio::test]
async fn bundle_is_posted_to_the_base_url() -> anyhow::Result<()> {
    let mock = FhirMock::start(FhirMockBehavior::default()).await?;
    let client = client_for(&mock, |_| {});

    let bundle = json!({
        "resourceType": "Bundle",
        "type": "transaction",
        "entry": [
            { "resource": { "resourceType": "Patient" }, "request": { "method": "POST", "url": "Patient" } }
        ]
    });
    let response = client.submit_bundle(&bundle).await?;
    assert!(response.is_success());
    assert_eq!(
        response.body.as_ref().and_then(|b| b["type"].as_str()),
        Some("transaction-response")
    );

    let posts = mock.requests_with(Method::POST);
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].path, "/");
    Ok(())
}

#[tokio::test]
async fn read_and_delete_address_the_instance() -> anyhow::Result<()> {
    let mock = FhirMock::start(FhirMockBehavior::default()).await?;
    let client = client_for(&mock, |_| {});

    let read = client.read("Patient", "p1").await?;
    assert_eq!(read.status, 200);
    assert_eq!(read.body.as_ref().map(|b| b["id"].clone()), Some(json!("p1")));

    let deleted = client.delete("Patient", "p1").await?;
    assert_eq!(deleted.status, 204);
    assert!(deleted.body.is_none());

    let paths: Vec<String> = mock.requests().into_iter().map(|r| r.path).collect();
    assert_eq!(paths, vec!["/Patient/p1", "/Patient/p1"]);
    Ok(())
}

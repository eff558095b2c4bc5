//! FHIR REST destination client

use super::{Connector, ConnectorError, Delivery, EntryFailure};
use crate::config::FhirDestinationConfig;
use crate::envelope::{MessageEnvelope, Namespace};
use crate::error::FailureClass;
use crate::plugins::transformers::FHIR_IF_NONE_EXIST;
use async_trait::async_trait;
use reqwest::header::{HeaderValue, ACCEPT, CONTENT_TYPE, LOCATION};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

const FHIR_JSON: &str = "application/fhir+json";

/// Status, body and `Location` of one FHIR interaction.
#[derive(Debug, Clone, PartialEq)]
pub struct FhirResponse {
    pub status: u16,
    pub body: Option<JsonValue>,
    pub location: Option<String>,
}

impl FhirResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Failure class for a non-2xx status.
    pub fn failure_class(&self) -> FailureClass {
        classify_status(self.status)
    }

    /// Diagnostics from an OperationOutcome body, if there is one.
    pub fn outcome_text(&self) -> Option<String> {
        let issues = self.body.as_ref()?.get("issue")?.as_array()?;
        let text: Vec<&str> = issues
            .iter()
            .filter_map(|i| {
                i.get("diagnostics")
                    .or_else(|| i.pointer("/details/text"))
                    .and_then(JsonValue::as_str)
            })
            .collect();
        (!text.is_empty()).then(|| text.join("; "))
    }
}

fn classify_status(status: u16) -> FailureClass {
    match status {
        408 | 429 => FailureClass::Transient,
        s if s >= 500 => FailureClass::Transient,
        _ => FailureClass::Permanent,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConditionalOutcome {
    Created(FhirResponse),
    /// Exactly one resource already matched; nothing was written
    Existing(JsonValue),
    /// The condition matched more than one resource
    Ambiguous(usize),
    /// The search itself failed
    SearchFailed(FhirResponse),
}

pub struct FhirClient {
    destination: String,
    client: Client,
    base_url: String,
    bearer_token: Option<String>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
    timeout: Duration,
}

impl FhirClient {
    pub fn new(destination: &str, config: &FhirDestinationConfig) -> Result<Self, ConnectorError> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            destination: destination.to_string(),
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bearer_token: config.bearer_token.clone(),
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
            timeout,
        })
    }

    async fn permit(&self) -> Result<OwnedSemaphorePermit, ConnectorError> {
        match tokio::time::timeout(self.acquire_timeout, self.permits.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(ConnectorError::Closed),
            Err(_) => {
                crate::metrics::POOL_EXHAUSTED
                    .with_label_values(&[&self.destination])
                    .inc();
                Err(ConnectorError::PoolExhausted {
                    destination: self.destination.clone(),
                    waited: self.acquire_timeout,
                })
            }
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        };
        let mut builder = self
            .client
            .request(method, url)
            .header(ACCEPT, HeaderValue::from_static(FHIR_JSON));
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn execute(&self, builder: RequestBuilder) -> Result<FhirResponse, ConnectorError> {
        let _permit = self.permit().await?;
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ConnectorError::Timeout {
                    operation: "FHIR request",
                    elapsed: self.timeout,
                }
            } else {
                ConnectorError::Http(e)
            }
        })?;

        let status = response.status();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?;
        let body = if bytes.is_empty() {
            None
        } else {
            serde_json::from_slice(&bytes).ok()
        };

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            tracing::warn!(destination = %self.destination, status = status.as_u16(), "FHIR server is unavailable");
        }
        Ok(FhirResponse {
            status: status.as_u16(),
            body,
            location,
        })
    }

    fn with_body(builder: RequestBuilder, resource: &JsonValue) -> Result<RequestBuilder, ConnectorError> {
        let body = serde_json::to_vec(resource)
            .map_err(|e| ConnectorError::InvalidPayload(e.to_string()))?;
        Ok(builder
            .header(CONTENT_TYPE, HeaderValue::from_static(FHIR_JSON))
            .body(body))
    }

    fn resource_type(resource: &JsonValue) -> Result<&str, ConnectorError> {
        resource
            .get("resourceType")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| ConnectorError::InvalidPayload("resource has no resourceType".into()))
    }

    pub async fn create(&self, resource: &JsonValue) -> Result<FhirResponse, ConnectorError> {
        let resource_type = Self::resource_type(resource)?;
        let builder = Self::with_body(self.request(Method::POST, resource_type), resource)?;
        self.execute(builder).await
    }

    pub async fn read(&self, resource_type: &str, id: &str) -> Result<FhirResponse, ConnectorError> {
        self.execute(self.request(Method::GET, &format!("{}/{}", resource_type, id)))
            .await
    }

    /// Update by the resource's own `id`.
    pub async fn update(&self, resource: &JsonValue) -> Result<FhirResponse, ConnectorError> {
        let resource_type = Self::resource_type(resource)?;
        let id = resource
            .get("id")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| ConnectorError::InvalidPayload("update needs a resource id".into()))?;
        let builder = Self::with_body(
            self.request(Method::PUT, &format!("{}/{}", resource_type, id)),
            resource,
        )?;
        self.execute(builder).await
    }

    pub async fn delete(&self, resource_type: &str, id: &str) -> Result<FhirResponse, ConnectorError> {
        self.execute(self.request(Method::DELETE, &format!("{}/{}", resource_type, id)))
            .await
    }

    /// Type-level search; `query` is an already encoded query string.
    pub async fn search(&self, resource_type: &str, query: &str) -> Result<FhirResponse, ConnectorError> {
        self.execute(self.request(Method::GET, &format!("{}?{}", resource_type, query)))
            .await
    }

    /// Create unless exactly one resource matches `query`: no match creates
    /// (with `If-None-Exist` for servers that enforce it), one match returns
    /// the existing resource, several matches are ambiguous.
    pub async fn conditional_create(
        &self,
        resource: &JsonValue,
        query: &str,
    ) -> Result<ConditionalOutcome, ConnectorError> {
        let resource_type = Self::resource_type(resource)?;
        let found = self.search(resource_type, query).await?;
        if !found.is_success() {
            return Ok(ConditionalOutcome::SearchFailed(found));
        }

        let matches: Vec<JsonValue> = found
            .body
            .as_ref()
            .and_then(|b| b.get("entry"))
            .and_then(JsonValue::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| {
                        e.pointer("/search/mode").and_then(JsonValue::as_str) != Some("include")
                    })
                    .filter_map(|e| e.get("resource").cloned())
                    .collect()
            })
            .unwrap_or_default();

        match matches.len() {
            0 => {
                let builder = self
                    .request(Method::POST, resource_type)
                    .header("If-None-Exist", query);
                let builder = Self::with_body(builder, resource)?;
                Ok(ConditionalOutcome::Created(self.execute(builder).await?))
            }
            1 => Ok(ConditionalOutcome::Existing(matches.into_iter().next().unwrap_or_default())),
            n => Ok(ConditionalOutcome::Ambiguous(n)),
        }
    }

    /// POST a batch or transaction bundle to the server base.
    pub async fn submit_bundle(&self, bundle: &JsonValue) -> Result<FhirResponse, ConnectorError> {
        let builder = Self::with_body(self.request(Method::POST, ""), bundle)?;
        self.execute(builder).await
    }
}

fn delivery_for(response: &FhirResponse) -> Delivery {
    if response.is_success() {
        return Delivery::Ack {
            detail: response.location.clone(),
        };
    }
    let reason = match response.outcome_text() {
        Some(text) => format!("HTTP {}: {}", response.status, text),
        None => format!("HTTP {}", response.status),
    };
    Delivery::Nak {
        reason,
        class: response.failure_class(),
    }
}

fn entry_status_code(entry: &JsonValue) -> Option<u16> {
    entry
        .pointer("/response/status")
        .and_then(JsonValue::as_str)?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

/// Read per-entry results out of a batch/transaction response.
fn bundle_delivery(request: &JsonValue, response: &FhirResponse) -> Delivery {
    if !response.is_success() {
        return delivery_for(response);
    }

    let requested = request
        .get("entry")
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let returned = response
        .body
        .as_ref()
        .and_then(|b| b.get("entry"))
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    if returned.len() != requested.len() {
        return Delivery::Nak {
            reason: format!(
                "bundle response itemized {} of {} entries",
                returned.len(),
                requested.len()
            ),
            class: FailureClass::Transient,
        };
    }

    let mut failures = Vec::new();
    for (index, (sent, result)) in requested.iter().zip(returned).enumerate() {
        let Some(code) = entry_status_code(result) else {
            return Delivery::Nak {
                reason: format!("bundle entry {} has no response status", index),
                class: FailureClass::Transient,
            };
        };
        if !(200..300).contains(&code) {
            let outcome = FhirResponse {
                status: code,
                body: result.pointer("/response/outcome").cloned(),
                location: None,
            };
            failures.push(EntryFailure {
                index,
                status: code.to_string(),
                reason: outcome
                    .outcome_text()
                    .unwrap_or_else(|| format!("HTTP {}", code)),
                entry: sent.clone(),
            });
        }
    }

    if failures.is_empty() {
        return Delivery::Ack {
            detail: Some(format!("{} entries accepted", requested.len())),
        };
    }

    let class = if failures
        .iter()
        .any(|f| f.status.parse().map_or(false, |s| classify_status(s) == FailureClass::Transient))
    {
        FailureClass::Transient
    } else {
        FailureClass::Permanent
    };
    // A transaction stands or falls as a whole; only batches are itemized.
    let transaction = request.get("type").and_then(JsonValue::as_str) == Some("transaction");

    if transaction {
        let first = &failures[0];
        Delivery::Nak {
            reason: format!(
                "transaction rejected: entry {} failed with {}: {}",
                first.index, first.status, first.reason
            ),
            class,
        }
    } else if failures.len() == requested.len() {
        Delivery::Nak {
            reason: format!("all {} bundle entries failed", failures.len()),
            class,
        }
    } else {
        Delivery::Partial {
            accepted: requested.len() - failures.len(),
            failures,
        }
    }
}

#[async_trait]
impl Connector for FhirClient {
    fn destination(&self) -> &str {
        &self.destination
    }

    async fn send(&self, envelope: &MessageEnvelope) -> Result<Delivery, ConnectorError> {
        let resource = envelope.body().content().as_json().ok_or_else(|| {
            ConnectorError::InvalidPayload("FHIR destinations need JSON content".into())
        })?;
        let resource_type = Self::resource_type(resource)?;

        if resource_type == "Bundle" {
            let response = self.submit_bundle(resource).await?;
            return Ok(bundle_delivery(resource, &response));
        }

        if let Some(query) = envelope
            .metadata()
            .get_in(Namespace::Transformer, FHIR_IF_NONE_EXIST)
        {
            return Ok(match self.conditional_create(resource, query).await? {
                ConditionalOutcome::Created(response) => delivery_for(&response),
                ConditionalOutcome::Existing(existing) => Delivery::Ack {
                    detail: existing
                        .get("id")
                        .and_then(JsonValue::as_str)
                        .map(|id| format!("{}/{} already exists", resource_type, id)),
                },
                ConditionalOutcome::Ambiguous(n) => Delivery::Nak {
                    reason: format!("conditional create matched {} resources", n),
                    class: FailureClass::Permanent,
                },
                ConditionalOutcome::SearchFailed(response) => delivery_for(&response),
            });
        }

        let response = if resource.get("id").is_some() {
            self.update(resource).await?
        } else {
            self.create(resource).await?
        };
        Ok(delivery_for(&response))
    }
}

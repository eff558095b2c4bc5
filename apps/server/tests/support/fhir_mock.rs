//! In-process FHIR server with scripted behavior

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value as JsonValue};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct FhirMockBehavior {
    /// Added before every response
    pub delay: Duration,
    /// Status returned for every create/update instead of success
    pub fail_status: Option<u16>,
    /// Entries returned by any search
    pub search_matches: usize,
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub if_none_exist: Option<String>,
    pub authorization: Option<String>,
    pub body: Option<JsonValue>,
}

#[derive(Clone)]
struct MockState {
    behavior: FhirMockBehavior,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

pub struct FhirMock {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    task: tokio::task::JoinHandle<()>,
}

impl FhirMock {
    pub async fn start(behavior: FhirMockBehavior) -> anyhow::Result<Self> {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = MockState {
            behavior,
            requests: Arc::clone(&requests),
        };
        let app = Router::new()
            .route("/", post(bundle))
            .route("/:resource_type", post(create).get(search))
            .route(
                "/:resource_type/:id",
                get(read).put(update).delete(remove),
            )
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(Self {
            addr,
            requests,
            task,
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_with(&self, method: Method) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method)
            .collect()
    }
}

impl Drop for FhirMock {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn record(state: &MockState, method: Method, path: String, headers: &HeaderMap, body: &[u8]) {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    state.requests.lock().unwrap().push(RecordedRequest {
        method,
        path,
        if_none_exist: header("if-none-exist"),
        authorization: header("authorization"),
        body: serde_json::from_slice(body).ok(),
    });
}

fn outcome(status: u16, text: &str) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(json!({
            "resourceType": "OperationOutcome",
            "issue": [{ "severity": "error", "code": "processing", "diagnostics": text }]
        })),
    )
        .into_response()
}

async fn create(
    State(state): State<MockState>,
    Path(resource_type): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    record(&state, Method::POST, format!("/{}", resource_type), &headers, &body);
    tokio::time::sleep(state.behavior.delay).await;
    if let Some(status) = state.behavior.fail_status {
        return outcome(status, "scripted failure");
    }

    let id = uuid::Uuid::new_v4().to_string();
    let mut resource: JsonValue = serde_json::from_slice(&body).unwrap_or_else(|_| json!({}));
    resource["id"] = json!(id);
    (
        StatusCode::CREATED,
        [("location", format!("{}/{}/_history/1", resource_type, id))],
        Json(resource),
    )
        .into_response()
}

async fn update(
    State(state): State<MockState>,
    Path((resource_type, id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    record(&state, Method::PUT, format!("/{}/{}", resource_type, id), &headers, &body);
    tokio::time::sleep(state.behavior.delay).await;
    if let Some(status) = state.behavior.fail_status {
        return outcome(status, "scripted failure");
    }
    let resource: JsonValue = serde_json::from_slice(&body).unwrap_or_else(|_| json!({}));
    (StatusCode::OK, Json(resource)).into_response()
}

async fn read(
    State(state): State<MockState>,
    Path((resource_type, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    record(&state, Method::GET, format!("/{}/{}", resource_type, id), &headers, &[]);
    (
        StatusCode::OK,
        Json(json!({ "resourceType": resource_type, "id": id })),
    )
        .into_response()
}

async fn remove(
    State(state): State<MockState>,
    Path((resource_type, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    record(&state, Method::DELETE, format!("/{}/{}", resource_type, id), &headers, &[]);
    StatusCode::NO_CONTENT.into_response()
}

async fn search(
    State(state): State<MockState>,
    Path(resource_type): Path<String>,
    headers: HeaderMap,
) -> Response {
    record(&state, Method::GET, format!("/{}", resource_type), &headers, &[]);
    let entries: Vec<JsonValue> = (0..state.behavior.search_matches)
        .map(|i| {
            json!({
                "resource": { "resourceType": resource_type, "id": format!("existing-{}", i) },
                "search": { "mode": "match" }
            })
        })
        .collect();
    (
        StatusCode::OK,
        Json(json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "total": entries.len(),
            "entry": entries
        })),
    )
        .into_response()
}

/// Batch/transaction: entries whose resource carries `"reject": true` fail.
async fn bundle(State(state): State<MockState>, headers: HeaderMap, body: Bytes) -> Response {
    record(&state, Method::POST, "/".to_string(), &headers, &body);
    let request: JsonValue = serde_json::from_slice(&body).unwrap_or_else(|_| json!({}));
    let entries: Vec<JsonValue> = request["entry"]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .map(|entry| {
                    if entry["resource"]["reject"] == json!(true) {
                        json!({ "response": { "status": "400 Bad Request" } })
                    } else {
                        json!({ "response": { "status": "201 Created" } })
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    let kind = if request["type"] == json!("transaction") {
        "transaction-response"
    } else {
        "batch-response"
    };
    (
        StatusCode::OK,
        Json(json!({ "resourceType": "Bundle", "type": kind, "entry": entries })),
    )
        .into_response()
}

//! Engine configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional file
//! (`CONDUIT_CONFIG` or `config/conduit.{toml,yaml,json}`), then environment
//! variables prefixed `CONDUIT__` with `__` as the nesting separator
//! (`CONDUIT__SERVER__PORT=9000`). A `.env` file is honoured when present.

use crate::pipeline::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_request_body_size: usize,
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_request_body_size: 10 * 1024 * 1024,
            cors_origins: vec!["*".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Envelopes processed concurrently
    pub workers: usize,
    /// Inbound units buffered between listeners and workers
    pub intake_capacity: usize,
    /// How long a listener waits for room in the intake queue
    pub handoff_timeout_ms: u64,
    /// Hard stop for in-flight work once a drain begins
    pub drain_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            intake_capacity: 256,
            handoff_timeout_ms: 5_000,
            drain_timeout_secs: 30,
        }
    }
}

impl PipelineConfig {
    pub fn handoff_timeout(&self) -> Duration {
        Duration::from_millis(self.handoff_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    pub file_enabled: bool,
    pub file_directory: String,
    pub file_prefix: String,
    /// daily, hourly, minutely or never
    pub file_rotation: String,
    pub opentelemetry_enabled: bool,
    pub otlp_endpoint: String,
    pub otlp_timeout_seconds: u64,
    pub trace_sample_ratio: f64,
    pub service_name: String,
    pub service_version: Option<String>,
    pub deployment_environment: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file_enabled: false,
            file_directory: "logs".to_string(),
            file_prefix: "conduit".to_string(),
            file_rotation: "daily".to_string(),
            opentelemetry_enabled: false,
            otlp_endpoint: "http://localhost:4317".to_string(),
            otlp_timeout_seconds: 10,
            trace_sample_ratio: 1.0,
            service_name: "conduit".to_string(),
            service_version: None,
            deployment_environment: "development".to_string(),
        }
    }
}

/// Where dead-letter and quarantine records live. In memory when no
/// directory is configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub id: String,
    #[serde(flatten)]
    pub transport: DestinationTransport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum DestinationTransport {
    Mllp(MllpDestinationConfig),
    Fhir(FhirDestinationConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MllpDestinationConfig {
    /// `host:port` of the receiving system
    pub address: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Idle connections older than this are closed instead of reused
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FhirDestinationConfig {
    pub base_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_pool_size")]
    pub max_concurrent: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default)]
    pub bearer_token: Option<String>,
}

fn default_pool_size() -> usize {
    4
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_ack_timeout_ms() -> u64 {
    30_000
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

fn default_max_frame_length() -> usize {
    conduit_mllp::DEFAULT_MAX_FRAME_LENGTH
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    Validator,
    Transformer,
    Router,
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validator => "validator",
            Self::Transformer => "transformer",
            Self::Router => "router",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Name routes refer to
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PluginKind,
    /// Built-in implementation, e.g. `hl7.structure`
    pub implementation: String,
    #[serde(default)]
    pub config: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoMatchPolicy {
    /// Dead-letter as unroutable
    #[default]
    Error,
    /// Acknowledge and discard
    Drop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub name: String,
    pub source: SourceConfig,
    #[serde(default)]
    pub validators: Vec<String>,
    #[serde(default)]
    pub transformers: Vec<String>,
    #[serde(default)]
    pub router: Option<String>,
    /// Static destinations used when the route has no router
    #[serde(default)]
    pub destinations: Vec<String>,
    /// Schema reference handed to validators
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub on_no_match: NoMatchPolicy,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum SourceConfig {
    Mllp(MllpSourceConfig),
    Http(HttpSourceConfig),
    File(FileSourceConfig),
}

impl SourceConfig {
    pub fn transport(&self) -> &'static str {
        match self {
            Self::Mllp(_) => "mllp",
            Self::Http(_) => "http",
            Self::File(_) => "file",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MllpSourceConfig {
    /// `host:port` to listen on; port 0 picks a free port
    pub bind: String,
    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
    /// Frames read ahead of their acknowledgements on one connection
    #[serde(default = "default_max_pending_frames")]
    pub max_pending_frames: usize,
    #[serde(default = "default_session_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// How long to hold an ACK for the pipeline outcome before accepting
    #[serde(default = "default_ack_wait_ms")]
    pub ack_wait_ms: u64,
}

fn default_max_pending_frames() -> usize {
    16
}

fn default_session_idle_timeout_secs() -> u64 {
    600
}

fn default_ack_wait_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSourceConfig {
    /// Path of the POST endpoint on the shared HTTP server
    pub path: String,
    /// How long a request waits for the outcome before answering 202
    #[serde(default = "default_sync_wait_ms")]
    pub sync_wait_ms: u64,
}

fn default_sync_wait_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSourceConfig {
    pub directory: PathBuf,
    /// Glob over file names (`*` and `?`)
    #[serde(default = "default_file_pattern")]
    pub pattern: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    pub archive_directory: PathBuf,
    pub error_directory: PathBuf,
    /// Claimed files; defaults to `<directory>/.processing`
    #[serde(default)]
    pub processing_directory: Option<PathBuf>,
    #[serde(default = "default_outcome_timeout_secs")]
    pub outcome_timeout_secs: u64,
    #[serde(default)]
    pub content_type: Option<String>,
}

impl FileSourceConfig {
    pub fn processing_directory(&self) -> PathBuf {
        self.processing_directory
            .clone()
            .unwrap_or_else(|| self.directory.join(".processing"))
    }
}

fn default_file_pattern() -> String {
    "*".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_outcome_timeout_secs() -> u64 {
    300
}

impl Config {
    /// Load from `CONDUIT_CONFIG` (or `config/conduit.*`) plus environment.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONDUIT_CONFIG").ok();
        Self::load_from(path.as_deref())
    }

    pub fn load_from(path: Option<&str>) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let file = match path {
            Some(path) => config::File::with_name(path).required(true),
            None => config::File::with_name("config/conduit").required(false),
        };

        let settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("CONDUIT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.server.host, self.server.port).parse()?)
    }

    pub fn destination(&self, id: &str) -> Option<&DestinationConfig> {
        self.destinations.iter().find(|d| d.id == id)
    }

    pub fn route(&self, name: &str) -> Option<&RouteConfig> {
        self.routes.iter().find(|r| r.name == name)
    }

    /// Reject configurations the engine cannot run. `extra_plugins` and
    /// `extra_destinations` name programmatically registered components.
    pub fn validate_with(
        &self,
        extra_plugins: &[(PluginKind, String)],
        extra_destinations: &[String],
    ) -> Result<(), String> {
        if self.pipeline.workers == 0 {
            return Err("pipeline.workers must be greater than zero".into());
        }
        if self.pipeline.intake_capacity == 0 {
            return Err("pipeline.intake_capacity must be greater than zero".into());
        }
        check_retry(&self.retry, "retry")?;

        let mut destination_ids = HashSet::new();
        for destination in &self.destinations {
            if !destination_ids.insert(destination.id.as_str()) {
                return Err(format!("duplicate destination id '{}'", destination.id));
            }
            match &destination.transport {
                DestinationTransport::Mllp(mllp) => {
                    if mllp.pool_size == 0 {
                        return Err(format!(
                            "destination '{}': pool_size must be greater than zero",
                            destination.id
                        ));
                    }
                }
                DestinationTransport::Fhir(fhir) => {
                    url::Url::parse(&fhir.base_url).map_err(|e| {
                        format!("destination '{}': invalid base_url: {}", destination.id, e)
                    })?;
                    if fhir.max_concurrent == 0 {
                        return Err(format!(
                            "destination '{}': max_concurrent must be greater than zero",
                            destination.id
                        ));
                    }
                }
            }
        }
        destination_ids.extend(extra_destinations.iter().map(String::as_str));

        let mut plugin_names: HashSet<(PluginKind, &str)> = HashSet::new();
        for plugin in &self.plugins {
            if !plugin_names.insert((plugin.kind, plugin.name.as_str())) {
                return Err(format!("duplicate {} plugin '{}'", plugin.kind, plugin.name));
            }
        }
        plugin_names.extend(extra_plugins.iter().map(|(k, n)| (*k, n.as_str())));

        let mut route_names = HashSet::new();
        let mut http_paths = HashSet::new();
        for route in &self.routes {
            if !route_names.insert(route.name.as_str()) {
                return Err(format!("duplicate route '{}'", route.name));
            }
            for name in &route.validators {
                if !plugin_names.contains(&(PluginKind::Validator, name.as_str())) {
                    return Err(format!(
                        "route '{}' references unknown validator '{}'",
                        route.name, name
                    ));
                }
            }
            for name in &route.transformers {
                if !plugin_names.contains(&(PluginKind::Transformer, name.as_str())) {
                    return Err(format!(
                        "route '{}' references unknown transformer '{}'",
                        route.name, name
                    ));
                }
            }
            if let Some(name) = &route.router {
                if !plugin_names.contains(&(PluginKind::Router, name.as_str())) {
                    return Err(format!(
                        "route '{}' references unknown router '{}'",
                        route.name, name
                    ));
                }
            }
            for destination in &route.destinations {
                if !destination_ids.contains(destination.as_str()) {
                    return Err(format!(
                        "route '{}' references unknown destination '{}'",
                        route.name, destination
                    ));
                }
            }
            if route.router.is_none()
                && route.destinations.is_empty()
                && route.on_no_match == NoMatchPolicy::Error
            {
                return Err(format!(
                    "route '{}' has neither a router nor destinations",
                    route.name
                ));
            }
            if let Some(retry) = &route.retry {
                check_retry(retry, &format!("route '{}' retry", route.name))?;
            }

            match &route.source {
                SourceConfig::Http(http) => {
                    if !http.path.starts_with('/') {
                        return Err(format!(
                            "route '{}': http path must start with '/'",
                            route.name
                        ));
                    }
                    if matches!(http.path.as_str(), "/health" | "/metrics")
                        || http.path.starts_with("/dead-letters")
                    {
                        return Err(format!(
                            "route '{}': http path '{}' is reserved",
                            route.name, http.path
                        ));
                    }
                    if !http_paths.insert(http.path.as_str()) {
                        return Err(format!("duplicate http path '{}'", http.path));
                    }
                }
                SourceConfig::Mllp(mllp) => {
                    if mllp.max_pending_frames == 0 {
                        return Err(format!(
                            "route '{}': max_pending_frames must be greater than zero",
                            route.name
                        ));
                    }
                }
                SourceConfig::File(file) => {
                    if file.archive_directory == file.directory
                        || file.error_directory == file.directory
                    {
                        return Err(format!(
                            "route '{}': archive and error directories must differ from the inbox",
                            route.name
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), String> {
        self.validate_with(&[], &[])
    }
}

fn check_retry(policy: &RetryPolicy, context: &str) -> Result<(), String> {
    if !(0.0..=1.0).contains(&policy.jitter_ratio) {
        return Err(format!("{context}: jitter_ratio must be within [0, 1]"));
    }
    if policy.multiplier < 1.0 {
        return Err(format!("{context}: multiplier must be at least 1.0"));
    }
    Ok(())
}

//! Pluggable pipeline stages
//!
//! Validators, transformers and routers share the [`Plugin`] lifecycle:
//! `initialize` is called once before the first message, `shutdown` once
//! when the engine stops. Stage methods take the envelope by shared
//! reference and report what should change; the orchestrator applies it.

pub mod condition;
pub mod registry;
pub mod routers;
pub mod transformers;
pub mod validators;

pub use condition::Condition;
pub use registry::{PluginRegistry, PluginRegistryBuilder};

use crate::envelope::{Attachment, Content, MessageEnvelope};
use crate::error::StageError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use thiserror::Error;

/// Free-form plugin settings from configuration.
pub type PluginSettings = Map<String, JsonValue>;

/// Key/value annotations returned by a stage. Keys are local; the
/// orchestrator files them under the stage's metadata namespace.
pub type Annotations = BTreeMap<String, String>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("Unknown {kind} implementation '{implementation}'")]
    UnknownImplementation {
        kind: crate::config::PluginKind,
        implementation: String,
    },

    #[error("Plugin '{name}' has invalid settings: {reason}")]
    InvalidSettings { name: String, reason: String },

    #[error("Plugin '{name}' failed to initialize: {reason}")]
    Initialization { name: String, reason: String },

    #[error("Plugin '{name}' failed to shut down: {reason}")]
    Shutdown { name: String, reason: String },

    #[error("Duplicate {kind} plugin '{name}'")]
    Duplicate {
        kind: crate::config::PluginKind,
        name: String,
    },

    #[error("Unknown {kind} plugin '{name}'")]
    Missing {
        kind: crate::config::PluginKind,
        name: String,
    },
}

/// Route-level facts handed to every stage call.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub route: &'a str,
    /// Schema reference configured on the route, if any
    pub schema: Option<&'a str>,
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(&mut self, _settings: &PluginSettings) -> Result<(), PluginError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

#[async_trait]
pub trait Validator: Plugin {
    /// Check the envelope. Must not change content; annotations become
    /// `validator.*` metadata, and a `schema_id` annotation is recorded on
    /// the body.
    async fn validate(
        &self,
        envelope: &MessageEnvelope,
        ctx: &StageContext<'_>,
    ) -> Result<Annotations, StageError>;
}

#[async_trait]
pub trait Transformer: Plugin {
    async fn transform(
        &self,
        envelope: &MessageEnvelope,
        ctx: &StageContext<'_>,
    ) -> Result<Transformed, StageError>;
}

#[async_trait]
pub trait Router: Plugin {
    async fn route(
        &self,
        envelope: &MessageEnvelope,
        ctx: &StageContext<'_>,
    ) -> Result<RouteDecision, StageError>;
}

/// Changes a transformer wants applied to the envelope.
#[derive(Debug, Clone, Default)]
pub struct Transformed {
    /// New content and its content type
    pub content: Option<(String, Content)>,
    pub schema_id: Option<String>,
    pub attachments: Vec<Attachment>,
    pub annotations: Annotations,
}

impl Transformed {
    /// Leave the envelope as it is.
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn with_content(content_type: impl Into<String>, content: Content) -> Self {
        Self {
            content: Some((content_type.into(), content)),
            ..Self::default()
        }
    }

    pub fn schema(mut self, schema_id: impl Into<String>) -> Self {
        self.schema_id = Some(schema_id.into());
        self
    }

    pub fn annotate(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// One or more destination ids; more than one splits the envelope
    Destinations(Vec<String>),
    /// Filtered out: acknowledge without delivery
    Drop,
    /// No rule matched; the route's `on_no_match` policy decides
    NoMatch,
}

impl RouteDecision {
    pub fn to(destination: impl Into<String>) -> Self {
        Self::Destinations(vec![destination.into()])
    }
}

/// Deserialize typed settings for plugin `name`.
pub(crate) fn parse_settings<T: DeserializeOwned>(
    name: &str,
    settings: &PluginSettings,
) -> Result<T, PluginError> {
    serde_json::from_value(JsonValue::Object(settings.clone())).map_err(|e| {
        PluginError::InvalidSettings {
            name: name.to_string(),
            reason: e.to_string(),
        }
    })
}

/// `*` matches any suffix; anything else must match exactly.
pub(crate) fn wildcard_match(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

//! Error types for the integration engine

use crate::api::response::ApiResponse;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Plugin error: {0}")]
    Plugin(#[from] crate::plugins::PluginError),

    #[error("Connector error: {0}")]
    Connector(#[from] crate::connectors::ConnectorError),

    #[error("Intake error: {0}")]
    Intake(#[from] crate::pipeline::IntakeError),

    #[error("Dead-letter store error: {0}")]
    DeadLetter(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Intake(crate::pipeline::IntakeError::Busy) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Intake(crate::pipeline::IntakeError::Closed) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Config(_) => StatusCode::BAD_REQUEST,
            Error::Plugin(_)
            | Error::Connector(_)
            | Error::DeadLetter(_)
            | Error::Io(_)
            | Error::Json(_)
            | Error::Internal(_)
            | Error::Other(_) => {
                tracing::error!("Internal error: {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        (status, Json(ApiResponse::<()>::failure(message))).into_response()
    }
}

/// How a failing component classifies its own error. The orchestrator never
/// guesses: it applies the retry, dead-letter or quarantine policy that
/// matches the class it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network, timeout or temporarily unavailable; retried with backoff
    Transient,
    /// Invalid schema, unroutable, malformed business content; dead-lettered
    Permanent,
    /// Unparseable input; quarantined and never retried
    Poison,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Poison => "poison",
        };
        f.write_str(s)
    }
}

/// Failure reported by a pipeline stage (parser, plugin or connector).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct StageError {
    pub class: FailureClass,
    pub message: String,
    /// Names of the violated rules, when the failure is a rule violation
    pub rules: Vec<String>,
}

impl StageError {
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            rules: Vec::new(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Permanent, message)
    }

    pub fn poison(message: impl Into<String>) -> Self {
        Self::new(FailureClass::Poison, message)
    }

    pub fn with_rules<I, S>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules.extend(rules.into_iter().map(Into::into));
        self
    }

    pub fn is_transient(&self) -> bool {
        self.class == FailureClass::Transient
    }

    /// Message plus violated rules, as shown to operators.
    pub fn describe(&self) -> String {
        if self.rules.is_empty() {
            self.message.clone()
        } else {
            format!("{} [{}]", self.message, self.rules.join(", "))
        }
    }
}

impl From<crate::connectors::ConnectorError> for StageError {
    fn from(err: crate::connectors::ConnectorError) -> Self {
        StageError::new(err.class(), err.to_string())
    }
}

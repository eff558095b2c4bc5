//! Outbound delivery to destination systems
//!
//! A [`Connector`] delivers one envelope to the destination it was built
//! for and reports what the remote side said. Connectors classify their own
//! failures; the orchestrator decides what to do with them.

pub mod fhir;
pub mod mllp;
pub mod pool;

pub use fhir::{ConditionalOutcome, FhirClient, FhirResponse};
pub use mllp::MllpSender;
pub use pool::{ConnectionPool, ManageConnection, PoolConfig, PooledConnection};

use crate::config::{DestinationConfig, DestinationTransport};
use crate::envelope::MessageEnvelope;
use crate::error::FailureClass;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },

    #[error("No connection to '{destination}' available within {waited:?}")]
    PoolExhausted {
        destination: String,
        waited: Duration,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("MLLP error: {0}")]
    Mllp(#[from] conduit_mllp::MllpError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Payload cannot be delivered: {0}")]
    InvalidPayload(String),

    #[error("Unknown destination '{0}'")]
    UnknownDestination(String),

    #[error("Connection closed by peer")]
    Closed,
}

impl ConnectorError {
    /// Transport trouble is transient; problems with the payload itself or
    /// the wiring are not.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::InvalidPayload(_) | Self::UnknownDestination(_) => FailureClass::Permanent,
            Self::Http(e) if e.is_builder() => FailureClass::Permanent,
            _ => FailureClass::Transient,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}

/// One entry of a batch that the destination rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryFailure {
    pub index: usize,
    pub status: String,
    pub reason: String,
    /// The request entry as submitted
    pub entry: JsonValue,
}

/// What the destination said about a delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Positive acknowledgement (HL7 AA/CA, HTTP 2xx)
    Ack { detail: Option<String> },
    /// Explicit rejection with its classification
    Nak { reason: String, class: FailureClass },
    /// Batch accepted except for the itemized entries
    Partial {
        accepted: usize,
        failures: Vec<EntryFailure>,
    },
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Destination id this connector serves
    fn destination(&self) -> &str;

    async fn send(&self, envelope: &MessageEnvelope) -> Result<Delivery, ConnectorError>;

    /// Periodic upkeep such as evicting dead pooled connections.
    async fn maintain(&self) {}

    async fn shutdown(&self) {}
}

/// Connectors by destination id.
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(destinations: &[DestinationConfig]) -> Result<Self, ConnectorError> {
        let mut registry = Self::new();
        for destination in destinations {
            let connector: Arc<dyn Connector> = match &destination.transport {
                DestinationTransport::Mllp(config) => {
                    Arc::new(MllpSender::new(&destination.id, config))
                }
                DestinationTransport::Fhir(config) => {
                    Arc::new(FhirClient::new(&destination.id, config)?)
                }
            };
            registry.insert(connector);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, connector: Arc<dyn Connector>) {
        self.connectors
            .insert(connector.destination().to_string(), connector);
    }

    pub fn contains(&self, destination: &str) -> bool {
        self.connectors.contains_key(destination)
    }

    pub fn destinations(&self) -> Vec<String> {
        self.connectors.keys().cloned().collect()
    }

    pub async fn send(
        &self,
        envelope: &MessageEnvelope,
        destination: &str,
    ) -> Result<Delivery, ConnectorError> {
        let connector = self
            .connectors
            .get(destination)
            .ok_or_else(|| ConnectorError::UnknownDestination(destination.to_string()))?;
        connector.send(envelope).await
    }

    /// Run every connector's upkeep on `interval` until cancelled.
    pub fn spawn_maintenance(
        &self,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let connectors: Vec<Arc<dyn Connector>> = self.connectors.values().cloned().collect();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        futures::future::join_all(connectors.iter().map(|c| c.maintain())).await;
                    }
                }
            }
            tracing::debug!("Connector maintenance stopped");
        })
    }

    pub async fn shutdown_all(&self) {
        futures::future::join_all(self.connectors.values().map(|c| c.shutdown())).await;
    }
}

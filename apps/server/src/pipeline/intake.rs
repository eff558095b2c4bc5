//! Hand-off point between listeners and the orchestrator

use crate::envelope::{MessageEnvelope, MessageStatus};
use crate::plugins::Annotations;
use bytes::Bytes;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntakeError {
    /// No room in the intake queue within the hand-off timeout
    #[error("Engine is busy; try again later")]
    Busy,

    #[error("Engine is not accepting messages")]
    Closed,
}

/// One payload as delivered by a listener.
#[derive(Debug)]
pub struct InboundUnit {
    pub route: String,
    /// Listener identity, recorded as the envelope `source`
    pub source: String,
    pub payload: Bytes,
    pub content_type: Option<String>,
    pub correlation_id: Option<Uuid>,
    /// Listener annotations, filed under `listener.*`
    pub annotations: Annotations,
    pub(crate) reply: Option<oneshot::Sender<ProcessingOutcome>>,
}

impl InboundUnit {
    pub fn new(route: impl Into<String>, source: impl Into<String>, payload: Bytes) -> Self {
        Self {
            route: route.into(),
            source: source.into(),
            payload,
            content_type: None,
            correlation_id: None,
            annotations: Annotations::new(),
            reply: None,
        }
    }

    pub fn content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn correlation_id(mut self, correlation_id: Option<Uuid>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn annotate(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Ask for the terminal outcome. The receiver resolves once processing
    /// ends; it errors if the unit is dropped unprocessed.
    pub fn with_reply(mut self) -> (Self, oneshot::Receiver<ProcessingOutcome>) {
        let (tx, rx) = oneshot::channel();
        self.reply = Some(tx);
        (self, rx)
    }
}

/// Final state of one inbound unit, reported back to its listener.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingOutcome {
    pub message_id: Uuid,
    pub correlation_id: Uuid,
    /// Terminal status, or the last status reached when `abandoned`
    pub status: MessageStatus,
    pub message_type: Option<String>,
    pub retry_count: u32,
    pub reason: Option<String>,
    /// Per-destination results when the envelope was split
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deliveries: Vec<DeliveryOutcome>,
    /// Processing stopped because the engine shut down
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub abandoned: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryOutcome {
    pub message_id: Uuid,
    pub destination: String,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub reason: Option<String>,
}

impl ProcessingOutcome {
    pub(crate) fn from_envelope(envelope: &MessageEnvelope, reason: Option<String>) -> Self {
        Self {
            message_id: envelope.message_id(),
            correlation_id: envelope.correlation_id(),
            status: envelope.status(),
            message_type: envelope.header().message_type().map(str::to_string),
            retry_count: envelope.retry_count(),
            reason,
            deliveries: Vec::new(),
            abandoned: false,
        }
    }

    pub(crate) fn abandoned(envelope: &MessageEnvelope) -> Self {
        Self {
            abandoned: true,
            ..Self::from_envelope(envelope, Some("engine shutting down".to_string()))
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        !self.abandoned && self.status == MessageStatus::Acknowledged
    }

    pub fn is_dead_letter(&self) -> bool {
        !self.abandoned && self.status == MessageStatus::DeadLetter
    }

    pub fn is_quarantined(&self) -> bool {
        !self.abandoned && self.status == MessageStatus::Quarantined
    }
}

/// Cloneable sender side of the intake queue.
#[derive(Clone)]
pub struct Intake {
    tx: mpsc::Sender<InboundUnit>,
    handoff_timeout: Duration,
}

impl Intake {
    pub fn channel(capacity: usize, handoff_timeout: Duration) -> (Self, mpsc::Receiver<InboundUnit>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                handoff_timeout,
            },
            rx,
        )
    }

    /// Queue a unit, waiting up to the hand-off timeout for room. A unit
    /// that cannot be queued is returned to nobody: the caller must refuse
    /// the message upstream.
    pub async fn submit(&self, unit: InboundUnit) -> Result<(), IntakeError> {
        use tokio::sync::mpsc::error::SendTimeoutError;

        match self.tx.send_timeout(unit, self.handoff_timeout).await {
            Ok(()) => {
                crate::metrics::INTAKE_DEPTH.set((self.tx.max_capacity() - self.tx.capacity()) as i64);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(unit)) => {
                tracing::warn!(route = %unit.route, source = %unit.source, "Intake queue full, refusing message");
                Err(IntakeError::Busy)
            }
            Err(SendTimeoutError::Closed(_)) => Err(IntakeError::Closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_submit_times_out_when_full() {
        let (intake, mut rx) = Intake::channel(1, Duration::from_millis(20));
        assert_ok!(
            intake
                .submit(InboundUnit::new("r", "s", Bytes::from_static(b"1")))
                .await
        );
        let err = assert_err!(
            intake
                .submit(InboundUnit::new("r", "s", Bytes::from_static(b"2")))
                .await
        );
        assert_eq!(err, IntakeError::Busy);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.payload, Bytes::from_static(b"1"));
    }

    #[tokio::test]
    async fn test_submit_after_close() {
        let (intake, rx) = Intake::channel(4, Duration::from_millis(20));
        drop(rx);
        let err = intake
            .submit(InboundUnit::new("r", "s", Bytes::new()))
            .await
            .unwrap_err();
        assert_eq!(err, IntakeError::Closed);
    }

    #[tokio::test]
    async fn test_dropped_unit_fails_reply() {
        let (unit, reply) = InboundUnit::new("r", "s", Bytes::new()).with_reply();
        drop(unit);
        assert!(reply.await.is_err());
    }
}

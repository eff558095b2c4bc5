//! Envelope lifecycle states and the legal edges between them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Received,
    Parsed,
    Validated,
    Transformed,
    Routed,
    Sent,
    Acknowledged,
    ParseFailed,
    ValidationFailed,
    TransformFailed,
    Unroutable,
    SendFailed,
    DeadLetter,
    Quarantined,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "RECEIVED",
            Self::Parsed => "PARSED",
            Self::Validated => "VALIDATED",
            Self::Transformed => "TRANSFORMED",
            Self::Routed => "ROUTED",
            Self::Sent => "SENT",
            Self::Acknowledged => "ACKNOWLEDGED",
            Self::ParseFailed => "PARSE_FAILED",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::TransformFailed => "TRANSFORM_FAILED",
            Self::Unroutable => "UNROUTABLE",
            Self::SendFailed => "SEND_FAILED",
            Self::DeadLetter => "DEAD_LETTER",
            Self::Quarantined => "QUARANTINED",
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Acknowledged | Self::DeadLetter | Self::Quarantined
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ParseFailed
                | Self::ValidationFailed
                | Self::TransformFailed
                | Self::Unroutable
                | Self::SendFailed
        )
    }

    /// Whether `next` is reachable from `self` in one step.
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        use MessageStatus::*;

        match (*self, next) {
            // Forward path
            (Received, Parsed)
            | (Parsed, Validated)
            | (Validated, Transformed)
            | (Transformed, Routed)
            | (Routed, Sent)
            | (Sent, Acknowledged) => true,

            // Routed straight to acknowledged only when a filter dropped it
            (Routed, Acknowledged) => true,

            // Stage failures
            (Received, ParseFailed)
            | (Parsed, ValidationFailed)
            | (Validated, TransformFailed)
            | (Transformed, Unroutable)
            | (Routed, SendFailed)
            | (Sent, SendFailed) => true,

            // Retry re-enters the stage that failed
            (ParseFailed, Received)
            | (ValidationFailed, Parsed)
            | (TransformFailed, Validated)
            | (Unroutable, Transformed)
            | (SendFailed, Routed) => true,

            (from, DeadLetter) if from.is_failure() => true,
            (Received | ParseFailed, Quarantined) => true,

            _ => false,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: MessageStatus,
    pub to: MessageStatus,
    pub at: DateTime<Utc>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Illegal status transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: MessageStatus,
    pub to: MessageStatus,
}

use crate::envelope::{MessageStatus, Namespace};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Parse,
    Validate,
    Transform,
    Route,
    Send,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Validate => "validate",
            Self::Transform => "transform",
            Self::Route => "route",
            Self::Send => "send",
        }
    }

    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Parse => Some(Self::Validate),
            Self::Validate => Some(Self::Transform),
            Self::Transform => Some(Self::Route),
            Self::Route => Some(Self::Send),
            Self::Send => None,
        }
    }

    /// Status an envelope must hold to enter this stage.
    pub fn entry_status(&self) -> MessageStatus {
        match self {
            Self::Parse => MessageStatus::Received,
            Self::Validate => MessageStatus::Parsed,
            Self::Transform => MessageStatus::Validated,
            Self::Route => MessageStatus::Transformed,
            Self::Send => MessageStatus::Routed,
        }
    }

    /// Status set when this stage completes.
    pub fn success_status(&self) -> MessageStatus {
        match self {
            Self::Parse => MessageStatus::Parsed,
            Self::Validate => MessageStatus::Validated,
            Self::Transform => MessageStatus::Transformed,
            Self::Route => MessageStatus::Routed,
            Self::Send => MessageStatus::Acknowledged,
        }
    }

    pub fn failure_status(&self) -> MessageStatus {
        match self {
            Self::Parse => MessageStatus::ParseFailed,
            Self::Validate => MessageStatus::ValidationFailed,
            Self::Transform => MessageStatus::TransformFailed,
            Self::Route => MessageStatus::Unroutable,
            Self::Send => MessageStatus::SendFailed,
        }
    }

    pub fn namespace(&self) -> Namespace {
        match self {
            Self::Parse => Namespace::Parser,
            Self::Validate => Namespace::Validator,
            Self::Transform => Namespace::Transformer,
            Self::Route => Namespace::Router,
            Self::Send => Namespace::Connector,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

use super::wildcard_match;
use crate::envelope::MessageEnvelope;
use serde::{Deserialize, Serialize};

/// Predicate over an envelope used by routers. Every criterion that is set
/// must hold; an empty condition matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Condition {
    /// Message type, `*` suffix wildcard allowed (`ADT_*`)
    #[serde(default)]
    pub message_type: Option<String>,
    /// Exact listener source id
    #[serde(default)]
    pub source: Option<String>,
    /// Field reference (`PID-3.1` or a JSON pointer)
    #[serde(default)]
    pub field: Option<String>,
    /// Required value of `field`; `*` suffix wildcard allowed
    #[serde(default)]
    pub equals: Option<String>,
    /// Require `field` to be present (`true`) or absent (`false`)
    #[serde(default)]
    pub exists: Option<bool>,
    /// Qualified metadata key, e.g. `listener.peer_addr`
    #[serde(default)]
    pub metadata: Option<String>,
    /// Required value of `metadata`
    #[serde(default)]
    pub metadata_equals: Option<String>,
}

impl Condition {
    pub fn check(&self) -> Result<(), String> {
        if self.field.is_none() && (self.equals.is_some() || self.exists.is_some()) {
            return Err("'equals' and 'exists' need a 'field'".into());
        }
        if self.metadata.is_none() && self.metadata_equals.is_some() {
            return Err("'metadata_equals' needs a 'metadata' key".into());
        }
        Ok(())
    }

    pub fn matches(&self, envelope: &MessageEnvelope) -> bool {
        if let Some(pattern) = &self.message_type {
            match envelope.header().message_type() {
                Some(message_type) if wildcard_match(pattern, message_type) => {}
                _ => return false,
            }
        }

        if let Some(source) = &self.source {
            if envelope.header().source() != source {
                return false;
            }
        }

        if let Some(path) = &self.field {
            let value = envelope.field(path);
            if let Some(exists) = self.exists {
                if value.is_some() != exists {
                    return false;
                }
            }
            if let Some(expected) = &self.equals {
                match value {
                    Some(ref v) if wildcard_match(expected, v) => {}
                    _ => return false,
                }
            }
            if self.exists.is_none() && self.equals.is_none() && value.is_none() {
                return false;
            }
        }

        if let Some(key) = &self.metadata {
            match (envelope.metadata().get(key), &self.metadata_equals) {
                (None, _) => return false,
                (Some(actual), Some(expected)) if actual != expected => return false,
                _ => {}
            }
        }

        true
    }
}

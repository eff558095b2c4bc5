//! The message envelope: header, body, attachments and audit trail
//!
//! An envelope wraps exactly one inbound payload for its whole trip through
//! the pipeline. Identity, status and retry bookkeeping are only mutable from
//! inside the crate; plugins and connectors receive shared references.

pub mod metadata;
pub mod status;

pub use metadata::{Metadata, MetadataError, Namespace};
pub use status::{InvalidTransition, MessageStatus, Transition};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use conduit_hl7::Message as Hl7Message;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    message_id: Uuid,
    correlation_id: Uuid,
    message_type: Option<String>,
    source: String,
    destination: Vec<String>,
    timestamp: DateTime<Utc>,
    status: MessageStatus,
    retry_count: u32,
    metadata: Metadata,
}

impl MessageHeader {
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn message_type(&self) -> Option<&str> {
        self.message_type.as_deref()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Empty until the routing stage has run.
    pub fn destination(&self) -> &[String] {
        &self.destination
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn status(&self) -> MessageStatus {
        self.status
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

/// Parsed form of the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Content {
    /// Not parsed yet
    Unparsed,
    Hl7(Hl7Message),
    Json(JsonValue),
    Text(String),
}

impl Content {
    pub fn as_hl7(&self) -> Option<&Hl7Message> {
        match self {
            Self::Hl7(message) => Some(message),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&JsonValue> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_parsed(&self) -> bool {
        !matches!(self, Self::Unparsed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBody {
    content_type: String,
    content: Content,
    #[serde(with = "base64_bytes")]
    raw_content: Bytes,
    schema_id: Option<String>,
    metadata: Metadata,
}

impl MessageBody {
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    /// Bytes exactly as received. Never altered after intake.
    pub fn raw_content(&self) -> &Bytes {
        &self.raw_content
    }

    pub fn schema_id(&self) -> Option<&str> {
        self.schema_id.as_deref()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

/// Binary part carried alongside the main body (e.g. an embedded PDF).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub content_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Bytes,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Attachment {
    pub fn new(content_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
            metadata: Metadata::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    header: MessageHeader,
    body: MessageBody,
    attachments: Vec<Attachment>,
    transitions: Vec<Transition>,
}

impl MessageEnvelope {
    /// Wrap a freshly received payload. The envelope starts in `RECEIVED`
    /// with unparsed content.
    pub fn receive(
        raw_content: Bytes,
        source: impl Into<String>,
        content_type: Option<String>,
        correlation_id: Option<Uuid>,
    ) -> Self {
        let message_id = Uuid::new_v4();
        Self {
            header: MessageHeader {
                message_id,
                correlation_id: correlation_id.unwrap_or(message_id),
                message_type: None,
                source: source.into(),
                destination: Vec::new(),
                timestamp: Utc::now(),
                status: MessageStatus::Received,
                retry_count: 0,
                metadata: Metadata::new(),
            },
            body: MessageBody {
                content_type: content_type.unwrap_or_default(),
                content: Content::Unparsed,
                raw_content,
                schema_id: None,
                metadata: Metadata::new(),
            },
            attachments: Vec::new(),
            transitions: Vec::new(),
        }
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    /// Every status change this envelope went through, oldest first.
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn message_id(&self) -> Uuid {
        self.header.message_id
    }

    pub fn correlation_id(&self) -> Uuid {
        self.header.correlation_id
    }

    pub fn status(&self) -> MessageStatus {
        self.header.status
    }

    pub fn retry_count(&self) -> u32 {
        self.header.retry_count
    }

    pub fn metadata(&self) -> &Metadata {
        &self.header.metadata
    }

    /// Resolve a field reference against the parsed content.
    ///
    /// HL7 content takes terser paths (`PID-3.1`); JSON content takes JSON
    /// pointers (`/resourceType`). Non-string JSON values are rendered as
    /// compact JSON.
    pub fn field(&self, path: &str) -> Option<String> {
        match &self.body.content {
            Content::Hl7(message) => message.get(path).map(str::to_string),
            Content::Json(value) if path.starts_with('/') => {
                value.pointer(path).and_then(|v| match v {
                    JsonValue::Null => None,
                    JsonValue::String(s) if s.is_empty() => None,
                    JsonValue::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                })
            }
            _ => None,
        }
    }

    /// Bytes to put on the wire for this envelope's current content.
    pub fn outbound_payload(&self) -> Bytes {
        match &self.body.content {
            Content::Hl7(message) => Bytes::from(message.encode()),
            Content::Json(value) => match serde_json::to_vec(value) {
                Ok(bytes) => Bytes::from(bytes),
                Err(_) => self.body.raw_content.clone(),
            },
            Content::Text(text) => Bytes::from(text.clone()),
            Content::Unparsed => self.body.raw_content.clone(),
        }
    }

    pub(crate) fn transition(&mut self, to: MessageStatus) -> Result<(), InvalidTransition> {
        let from = self.header.status;
        if !from.can_transition_to(to) {
            return Err(InvalidTransition { from, to });
        }
        self.transitions.push(Transition {
            from,
            to,
            at: Utc::now(),
        });
        self.header.status = to;
        Ok(())
    }

    pub(crate) fn increment_retry(&mut self) -> u32 {
        self.header.retry_count += 1;
        self.header.retry_count
    }

    pub(crate) fn set_message_type(&mut self, message_type: Option<String>) {
        self.header.message_type = message_type;
    }

    pub(crate) fn set_destinations(&mut self, destinations: Vec<String>) {
        self.header.destination = destinations;
    }

    pub(crate) fn set_content(&mut self, content_type: impl Into<String>, content: Content) {
        self.body.content_type = content_type.into();
        self.body.content = content;
    }

    pub(crate) fn set_schema_id(&mut self, schema_id: impl Into<String>) {
        self.body.schema_id = Some(schema_id.into());
    }

    pub(crate) fn push_attachment(&mut self, attachment: Attachment) {
        self.attachments.push(attachment);
    }

    pub(crate) fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.header.metadata
    }

    pub(crate) fn body_metadata_mut(&mut self) -> &mut Metadata {
        &mut self.body.metadata
    }

    /// Copy this envelope for one destination. The copy gets a fresh
    /// `message_id`, keeps the `correlation_id`, and records its parent.
    pub(crate) fn split_for(&self, destination: &str) -> Self {
        let mut child = self.clone();
        child.header.message_id = Uuid::new_v4();
        child.header.destination = vec![destination.to_string()];
        child
            .header
            .metadata
            .insert(Namespace::Pipeline, "parent_id", self.message_id().to_string());
        child
    }

    /// Build a dead-letter child carrying one failed part of a larger
    /// delivery (e.g. a single bundle entry).
    pub(crate) fn split_with_content(
        &self,
        destination: &str,
        content_type: &str,
        content: Content,
    ) -> Self {
        let mut child = self.split_for(destination);
        child.set_content(content_type, content);
        child
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

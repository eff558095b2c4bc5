//! Built-in transformers

use super::{parse_settings, Plugin, PluginError, PluginSettings, StageContext, Transformed};
use super::Transformer;
use crate::envelope::{Attachment, Content, MessageEnvelope, Namespace};
use crate::error::StageError;
use crate::pipeline::parse::FHIR_JSON_CONTENT_TYPE;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::NaiveDate;
use conduit_hl7::{FieldPath, Message, Segment};
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};
use std::collections::BTreeMap;

fn hl7_content(envelope: &MessageEnvelope) -> Result<&Message, StageError> {
    envelope
        .body()
        .content()
        .as_hl7()
        .ok_or_else(|| StageError::permanent("expected HL7 v2 content"))
}

/// Re-express HL7 v2 content as the JSON projection produced by
/// [`Message::to_json`].
pub struct Hl7ToJson {
    name: String,
}

impl Hl7ToJson {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Plugin for Hl7ToJson {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Transformer for Hl7ToJson {
    async fn transform(
        &self,
        envelope: &MessageEnvelope,
        _ctx: &StageContext<'_>,
    ) -> Result<Transformed, StageError> {
        let message = hl7_content(envelope)?;
        Ok(
            Transformed::with_content("application/json", Content::Json(message.to_json()))
                .schema("hl7v2-json"),
        )
    }
}

/// Map the PID segment of an HL7 v2 message to a FHIR `Patient`.
///
/// PID-3 becomes the identifier, PID-5 the name, PID-7 the birth date and
/// PID-8 the administrative gender. With `conditional` set (the default)
/// the result carries an `If-None-Exist` query on the identifier so FHIR
/// destinations create the patient only once.
pub struct PidToFhirPatient {
    name: String,
    settings: PidSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PidSettings {
    identifier_system: Option<String>,
    conditional: bool,
}

impl Default for PidSettings {
    fn default() -> Self {
        Self {
            identifier_system: None,
            conditional: true,
        }
    }
}

fn gender(code: &str) -> &'static str {
    match code {
        "M" => "male",
        "F" => "female",
        "O" | "A" | "N" => "other",
        _ => "unknown",
    }
}

fn birth_date(raw: &str) -> Option<String> {
    let digits = raw.get(..8)?;
    NaiveDate::parse_from_str(digits, "%Y%m%d")
        .ok()
        .map(|d| d.format("%Y-%m-%d").to_string())
}

impl PidToFhirPatient {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: PidSettings::default(),
        }
    }

    fn build(&self, message: &Message) -> Result<(JsonValue, Option<String>), StageError> {
        if !message.has_segment("PID") {
            return Err(StageError::permanent("message has no PID segment")
                .with_rules(["segment.PID.required"]));
        }
        let identifier = message.get("PID-3.1").ok_or_else(|| {
            StageError::permanent("PID-3 carries no identifier")
                .with_rules(["field.PID-3.1.required"])
        })?;

        let mut patient = Map::new();
        patient.insert("resourceType".into(), json!("Patient"));

        let mut id = Map::new();
        if let Some(system) = &self.settings.identifier_system {
            id.insert("system".into(), json!(system));
        }
        id.insert("value".into(), json!(identifier));
        if let Some(assigner) = message.get("PID-3.4") {
            id.insert("assigner".into(), json!({ "display": assigner }));
        }
        patient.insert("identifier".into(), JsonValue::Array(vec![JsonValue::Object(id)]));

        let mut name = Map::new();
        if let Some(family) = message.get("PID-5.1") {
            name.insert("family".into(), json!(family));
        }
        let given: Vec<&str> = ["PID-5.2", "PID-5.3"]
            .iter()
            .filter_map(|p| message.get(p))
            .collect();
        if !given.is_empty() {
            name.insert("given".into(), json!(given));
        }
        if !name.is_empty() {
            patient.insert("name".into(), JsonValue::Array(vec![JsonValue::Object(name)]));
        }

        if let Some(date) = message.get("PID-7.1").and_then(birth_date) {
            patient.insert("birthDate".into(), json!(date));
        }
        if let Some(code) = message.get("PID-8") {
            patient.insert("gender".into(), json!(gender(code)));
        }

        let condition = self.settings.conditional.then(|| {
            let token = match &self.settings.identifier_system {
                Some(system) => format!("{}|{}", system, identifier),
                None => identifier.to_string(),
            };
            format!("identifier={}", urlencoding::encode(&token))
        });

        Ok((JsonValue::Object(patient), condition))
    }
}

#[async_trait]
impl Plugin for PidToFhirPatient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, settings: &PluginSettings) -> Result<(), PluginError> {
        self.settings = parse_settings(&self.name, settings)?;
        Ok(())
    }
}

#[async_trait]
impl Transformer for PidToFhirPatient {
    async fn transform(
        &self,
        envelope: &MessageEnvelope,
        _ctx: &StageContext<'_>,
    ) -> Result<Transformed, StageError> {
        let (patient, condition) = self.build(hl7_content(envelope)?)?;
        let mut transformed =
            Transformed::with_content(FHIR_JSON_CONTENT_TYPE, Content::Json(patient))
                .schema("fhir/Patient");
        if let Some(query) = condition {
            transformed = transformed.annotate(FHIR_IF_NONE_EXIST, query);
        }
        Ok(transformed)
    }
}

/// Annotation key (under `transformer.`) carrying a conditional-create query
/// for FHIR destinations.
pub const FHIR_IF_NONE_EXIST: &str = "fhir_if_none_exist";

/// Pull encapsulated data (`OBX-2 = ED`) out of OBX segments into
/// attachments. OBX-5 components 2 and 3 give the MIME type, 4 the encoding
/// (`Base64` or `A` for plain text), 5 the data.
///
/// With `absorb_errors` (the default) an undecodable attachment is recorded
/// under `transformer.attachment_errors` and the message carries on.
pub struct ExtractAttachments {
    name: String,
    settings: AttachmentSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct AttachmentSettings {
    absorb_errors: bool,
}

impl Default for AttachmentSettings {
    fn default() -> Self {
        Self {
            absorb_errors: true,
        }
    }
}

fn mime_type(kind: &str, subtype: &str) -> String {
    if subtype.contains('/') {
        return subtype.to_ascii_lowercase();
    }
    let major = match kind.to_ascii_uppercase().as_str() {
        "AP" | "APPLICATION" => "application".to_string(),
        "IM" | "IMAGE" => "image".to_string(),
        "AU" | "AUDIO" => "audio".to_string(),
        "TX" | "TEXT" => "text".to_string(),
        "" => "application".to_string(),
        other => other.to_ascii_lowercase(),
    };
    let minor = if subtype.is_empty() {
        "octet-stream".to_string()
    } else {
        subtype.to_ascii_lowercase()
    };
    format!("{}/{}", major, minor)
}

fn obx_component<'a>(message: &Message, segment: &'a Segment, component: usize) -> &'a str {
    let path = FieldPath {
        segment: "OBX".to_string(),
        field: 5,
        component: Some(component),
        subcomponent: None,
    };
    message.value_in(segment, &path).unwrap_or_default()
}

fn decode_attachment(message: &Message, segment: &Segment) -> Result<Attachment, String> {
    let kind = obx_component(message, segment, 2);
    let subtype = obx_component(message, segment, 3);
    let encoding = obx_component(message, segment, 4);
    let data = obx_component(message, segment, 5);
    if data.is_empty() {
        return Err("no encapsulated data".to_string());
    }

    let bytes = match encoding.to_ascii_uppercase().as_str() {
        "BASE64" => STANDARD
            .decode(data.trim())
            .map_err(|e| format!("invalid base64: {}", e))?,
        "A" | "" => data.as_bytes().to_vec(),
        other => return Err(format!("unsupported encoding '{}'", other)),
    };

    let mut attachment = Attachment::new(mime_type(kind, subtype), bytes);
    if let Some(set_id) = segment.field(1).filter(|s| !s.is_empty()) {
        attachment
            .metadata
            .insert(Namespace::Transformer, "obx_set_id", set_id);
    }
    Ok(attachment)
}

impl ExtractAttachments {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: AttachmentSettings::default(),
        }
    }
}

#[async_trait]
impl Plugin for ExtractAttachments {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, settings: &PluginSettings) -> Result<(), PluginError> {
        self.settings = parse_settings(&self.name, settings)?;
        Ok(())
    }
}

#[async_trait]
impl Transformer for ExtractAttachments {
    async fn transform(
        &self,
        envelope: &MessageEnvelope,
        _ctx: &StageContext<'_>,
    ) -> Result<Transformed, StageError> {
        let message = hl7_content(envelope)?;
        let mut transformed = Transformed::unchanged();
        let mut errors = Vec::new();

        for (index, segment) in message.segments_named("OBX").enumerate() {
            if segment.field(2) != Some("ED") {
                continue;
            }
            match decode_attachment(message, segment) {
                Ok(attachment) => transformed.attachments.push(attachment),
                Err(reason) => {
                    let described = format!("OBX[{}]: {}", index + 1, reason);
                    if !self.settings.absorb_errors {
                        return Err(StageError::permanent(described)
                            .with_rules(["attachment.decodable"]));
                    }
                    tracing::warn!(
                        message_id = %envelope.message_id(),
                        "Attachment skipped: {}",
                        described
                    );
                    errors.push(described);
                }
            }
        }

        let extracted = transformed.attachments.len();
        transformed = transformed.annotate("attachments_extracted", extracted.to_string());
        if !errors.is_empty() {
            transformed = transformed.annotate("attachment_errors", errors.join("; "));
        }
        Ok(transformed)
    }
}

/// Stamp fixed metadata values, e.g. a facility code for later routing.
pub struct SetMetadata {
    name: String,
    values: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SetMetadataSettings {
    values: BTreeMap<String, String>,
}

impl SetMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: BTreeMap::new(),
        }
    }
}

#[async_trait]
impl Plugin for SetMetadata {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, settings: &PluginSettings) -> Result<(), PluginError> {
        let parsed: SetMetadataSettings = parse_settings(&self.name, settings)?;
        self.values = parsed.values;
        Ok(())
    }
}

#[async_trait]
impl Transformer for SetMetadata {
    async fn transform(
        &self,
        _envelope: &MessageEnvelope,
        _ctx: &StageContext<'_>,
    ) -> Result<Transformed, StageError> {
        Ok(Transformed {
            annotations: self.values.clone(),
            ..Transformed::default()
        })
    }
}

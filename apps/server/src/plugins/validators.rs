//! Built-in validators

use super::{parse_settings, wildcard_match, Annotations, Plugin, PluginError, PluginSettings};
use super::{StageContext, Validator};
use crate::envelope::MessageEnvelope;
use crate::error::StageError;
use async_trait::async_trait;
use conduit_hl7::FieldPath;
use serde::Deserialize;
use serde_json::Value as JsonValue;

/// Structural checks on HL7 v2 content: message type and version
/// allow-lists, plus per-schema required segments and fields.
///
/// The schema comes from the route's `schema` reference, or else the first
/// schema whose `message_types` match. A route that names an unknown schema
/// fails permanently.
pub struct Hl7StructureValidator {
    name: String,
    settings: Hl7StructureSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Hl7StructureSettings {
    allowed_message_types: Vec<String>,
    allowed_versions: Vec<String>,
    require_control_id: bool,
    schemas: Vec<Hl7Schema>,
}

impl Default for Hl7StructureSettings {
    fn default() -> Self {
        Self {
            allowed_message_types: Vec::new(),
            allowed_versions: Vec::new(),
            require_control_id: true,
            schemas: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct Hl7Schema {
    id: String,
    #[serde(default)]
    message_types: Vec<String>,
    #[serde(default)]
    required_segments: Vec<String>,
    #[serde(default)]
    required_fields: Vec<String>,
}

impl Hl7StructureValidator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: Hl7StructureSettings::default(),
        }
    }

    fn schema_for(
        &self,
        reference: Option<&str>,
        message_type: Option<&str>,
    ) -> Result<Option<&Hl7Schema>, StageError> {
        match reference {
            Some(id) => self
                .settings
                .schemas
                .iter()
                .find(|s| s.id == id)
                .map(Some)
                .ok_or_else(|| {
                    StageError::permanent(format!("schema '{}' not found", id))
                        .with_rules(["schema.exists"])
                }),
            None => Ok(message_type.and_then(|mt| {
                self.settings
                    .schemas
                    .iter()
                    .find(|s| s.message_types.iter().any(|p| wildcard_match(p, mt)))
            })),
        }
    }
}

#[async_trait]
impl Plugin for Hl7StructureValidator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, settings: &PluginSettings) -> Result<(), PluginError> {
        let parsed: Hl7StructureSettings = parse_settings(&self.name, settings)?;
        for schema in &parsed.schemas {
            for path in &schema.required_fields {
                FieldPath::parse(path).map_err(|e| PluginError::InvalidSettings {
                    name: self.name.clone(),
                    reason: format!("schema '{}': {}", schema.id, e),
                })?;
            }
        }
        self.settings = parsed;
        Ok(())
    }
}

#[async_trait]
impl Validator for Hl7StructureValidator {
    async fn validate(
        &self,
        envelope: &MessageEnvelope,
        ctx: &StageContext<'_>,
    ) -> Result<Annotations, StageError> {
        let message = envelope
            .body()
            .content()
            .as_hl7()
            .ok_or_else(|| StageError::permanent("expected HL7 v2 content"))?;

        let message_type = message.message_type();
        let mut violations = Vec::new();

        if !self.settings.allowed_message_types.is_empty() {
            let allowed = message_type.as_deref().map_or(false, |mt| {
                self.settings
                    .allowed_message_types
                    .iter()
                    .any(|p| wildcard_match(p, mt))
            });
            if !allowed {
                violations.push("message_type.allowed".to_string());
            }
        }

        if !self.settings.allowed_versions.is_empty() {
            let allowed = message
                .version()
                .map_or(false, |v| self.settings.allowed_versions.iter().any(|a| a == v));
            if !allowed {
                violations.push("version.allowed".to_string());
            }
        }

        if self.settings.require_control_id && message.control_id().is_none() {
            violations.push("field.MSH-10.required".to_string());
        }

        let schema = self.schema_for(ctx.schema, message_type.as_deref())?;
        if let Some(schema) = schema {
            for segment in &schema.required_segments {
                if !message.has_segment(segment) {
                    violations.push(format!("segment.{}.required", segment));
                }
            }
            for path in &schema.required_fields {
                if message.get(path).is_none() {
                    violations.push(format!("field.{}.required", path));
                }
            }
        }

        if !violations.is_empty() {
            return Err(StageError::permanent(format!(
                "HL7 structure validation failed for {}",
                message_type.as_deref().unwrap_or("unknown message type")
            ))
            .with_rules(violations));
        }

        let mut annotations = Annotations::new();
        if let Some(schema) = schema {
            annotations.insert("schema_id".into(), schema.id.clone());
        }
        if let Some(version) = message.version() {
            annotations.insert("hl7_version".into(), version.to_string());
        }
        Ok(annotations)
    }
}

/// Checks on FHIR JSON: resource type allow-list, required top-level
/// elements per resource type, and bundle type. Bundle entries are
/// checked one by one.
pub struct FhirResourceValidator {
    name: String,
    settings: FhirResourceSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FhirResourceSettings {
    allowed_resource_types: Vec<String>,
    required_elements: Vec<RequiredElements>,
    bundle_types: Vec<String>,
}

impl Default for FhirResourceSettings {
    fn default() -> Self {
        Self {
            allowed_resource_types: Vec::new(),
            required_elements: Vec::new(),
            bundle_types: vec!["batch".into(), "transaction".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RequiredElements {
    resource_type: String,
    elements: Vec<String>,
}

fn is_populated(value: Option<&JsonValue>) -> bool {
    match value {
        None | Some(JsonValue::Null) => false,
        Some(JsonValue::String(s)) => !s.is_empty(),
        Some(JsonValue::Array(items)) => !items.is_empty(),
        Some(JsonValue::Object(map)) => !map.is_empty(),
        Some(_) => true,
    }
}

impl FhirResourceValidator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: FhirResourceSettings::default(),
        }
    }

    fn check_resource(&self, resource: &JsonValue, prefix: &str, violations: &mut Vec<String>) {
        let Some(resource_type) = resource.get("resourceType").and_then(JsonValue::as_str) else {
            violations.push(format!("{prefix}resourceType.required"));
            return;
        };

        if !self.settings.allowed_resource_types.is_empty()
            && resource_type != "Bundle"
            && !self
                .settings
                .allowed_resource_types
                .iter()
                .any(|t| t == resource_type)
        {
            violations.push(format!("{prefix}resourceType.allowed"));
        }

        for required in self
            .settings
            .required_elements
            .iter()
            .filter(|r| r.resource_type == resource_type)
        {
            for element in &required.elements {
                if !is_populated(resource.get(element)) {
                    violations.push(format!("{prefix}{resource_type}.{element}.required"));
                }
            }
        }
    }
}

#[async_trait]
impl Plugin for FhirResourceValidator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, settings: &PluginSettings) -> Result<(), PluginError> {
        self.settings = parse_settings(&self.name, settings)?;
        Ok(())
    }
}

#[async_trait]
impl Validator for FhirResourceValidator {
    async fn validate(
        &self,
        envelope: &MessageEnvelope,
        ctx: &StageContext<'_>,
    ) -> Result<Annotations, StageError> {
        let resource = envelope
            .body()
            .content()
            .as_json()
            .ok_or_else(|| StageError::permanent("expected FHIR JSON content"))?;

        let mut violations = Vec::new();
        self.check_resource(resource, "", &mut violations);

        let resource_type = resource
            .get("resourceType")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();

        if resource_type == "Bundle" {
            let bundle_type = resource.get("type").and_then(JsonValue::as_str);
            if !bundle_type.map_or(false, |t| self.settings.bundle_types.iter().any(|a| a == t)) {
                violations.push("Bundle.type.allowed".into());
            }
            let entries = resource
                .get("entry")
                .and_then(JsonValue::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for (index, entry) in entries.iter().enumerate() {
                match entry.get("resource") {
                    Some(inner) => {
                        self.check_resource(inner, &format!("entry[{index}]."), &mut violations)
                    }
                    None => {
                        let method = entry.pointer("/request/method").and_then(JsonValue::as_str);
                        if !matches!(method, Some("DELETE" | "GET")) {
                            violations.push(format!("entry[{index}].resource.required"));
                        }
                    }
                }
            }
        }

        if !violations.is_empty() {
            return Err(
                StageError::permanent(format!("FHIR validation failed for {resource_type}"))
                    .with_rules(violations),
            );
        }

        let mut annotations = Annotations::new();
        annotations.insert("resource_type".into(), resource_type.to_string());
        annotations.insert(
            "schema_id".into(),
            ctx.schema
                .map(str::to_string)
                .unwrap_or_else(|| format!("fhir/{resource_type}")),
        );
        Ok(annotations)
    }
}

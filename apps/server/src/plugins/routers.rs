//! Built-in routers

use super::{parse_settings, Condition, Plugin, PluginError, PluginSettings};
use super::{RouteDecision, Router, StageContext};
use crate::envelope::MessageEnvelope;
use crate::error::StageError;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;

lazy_static! {
    static ref TEMPLATE_VARIABLE: Regex =
        Regex::new(r"\$\{([a-z_]+)(?::([^}]+))?\}").expect("valid template regex");
}

fn invalid(name: &str, reason: impl Into<String>) -> PluginError {
    PluginError::InvalidSettings {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// First matching rule wins. `otherwise` applies when nothing matches;
/// without it the decision is `NoMatch`.
pub struct ContentBasedRouter {
    name: String,
    settings: ContentBasedSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ContentBasedSettings {
    rules: Vec<RoutingRule>,
    otherwise: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RoutingRule {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    when: Condition,
    destinations: Vec<String>,
}

impl ContentBasedRouter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: ContentBasedSettings::default(),
        }
    }
}

#[async_trait]
impl Plugin for ContentBasedRouter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, settings: &PluginSettings) -> Result<(), PluginError> {
        let parsed: ContentBasedSettings = parse_settings(&self.name, settings)?;
        for (index, rule) in parsed.rules.iter().enumerate() {
            if rule.destinations.is_empty() {
                return Err(invalid(&self.name, format!("rule {index} has no destinations")));
            }
            rule.when
                .check()
                .map_err(|e| invalid(&self.name, format!("rule {index}: {e}")))?;
        }
        self.settings = parsed;
        Ok(())
    }
}

#[async_trait]
impl Router for ContentBasedRouter {
    async fn route(
        &self,
        envelope: &MessageEnvelope,
        _ctx: &StageContext<'_>,
    ) -> Result<RouteDecision, StageError> {
        for (index, rule) in self.settings.rules.iter().enumerate() {
            if rule.when.matches(envelope) {
                tracing::debug!(
                    message_id = %envelope.message_id(),
                    rule = rule.name.as_deref().unwrap_or("unnamed"),
                    index,
                    "Routing rule matched"
                );
                return Ok(RouteDecision::Destinations(rule.destinations.clone()));
            }
        }
        if self.settings.otherwise.is_empty() {
            Ok(RouteDecision::NoMatch)
        } else {
            Ok(RouteDecision::Destinations(self.settings.otherwise.clone()))
        }
    }
}

/// Fan out to a static recipient list, optionally extended from a
/// comma-separated metadata value or message field.
pub struct RecipientListRouter {
    name: String,
    settings: RecipientListSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RecipientListSettings {
    recipients: Vec<String>,
    metadata_key: Option<String>,
    field: Option<String>,
}

impl RecipientListRouter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: RecipientListSettings::default(),
        }
    }
}

#[async_trait]
impl Plugin for RecipientListRouter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, settings: &PluginSettings) -> Result<(), PluginError> {
        let parsed: RecipientListSettings = parse_settings(&self.name, settings)?;
        if parsed.recipients.is_empty() && parsed.metadata_key.is_none() && parsed.field.is_none()
        {
            return Err(invalid(&self.name, "no recipients configured"));
        }
        self.settings = parsed;
        Ok(())
    }
}

#[async_trait]
impl Router for RecipientListRouter {
    async fn route(
        &self,
        envelope: &MessageEnvelope,
        _ctx: &StageContext<'_>,
    ) -> Result<RouteDecision, StageError> {
        let mut recipients: Vec<String> = Vec::new();
        let computed = [
            self.settings
                .metadata_key
                .as_deref()
                .and_then(|key| envelope.metadata().get(key))
                .map(str::to_string),
            self.settings
                .field
                .as_deref()
                .and_then(|path| envelope.field(path)),
        ];

        let listed = self.settings.recipients.iter().cloned();
        let extra = computed
            .into_iter()
            .flatten()
            .flat_map(|list| {
                list.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            });

        for recipient in listed.chain(extra) {
            if !recipients.contains(&recipient) {
                recipients.push(recipient);
            }
        }

        if recipients.is_empty() {
            Ok(RouteDecision::NoMatch)
        } else {
            Ok(RouteDecision::Destinations(recipients))
        }
    }
}

/// Compute the destination from a template such as `lab-${field:MSH-5}`.
///
/// Variables: `${message_type}`, `${source}`, `${field:<path>}` and
/// `${metadata:<key>}`. An unresolved variable, or a result outside the
/// optional `allowed` list, yields `NoMatch`.
pub struct DynamicRouter {
    name: String,
    settings: DynamicSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DynamicSettings {
    expression: String,
    allowed: Vec<String>,
}

impl DynamicRouter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: DynamicSettings::default(),
        }
    }

    fn evaluate(&self, envelope: &MessageEnvelope) -> Option<String> {
        let mut out = String::new();
        let mut last = 0;
        for captures in TEMPLATE_VARIABLE.captures_iter(&self.settings.expression) {
            let whole = captures.get(0)?;
            out.push_str(&self.settings.expression[last..whole.start()]);
            let argument = captures.get(2).map(|m| m.as_str());
            let value = match (captures.get(1)?.as_str(), argument) {
                ("message_type", None) => envelope.header().message_type().map(str::to_string),
                ("source", None) => Some(envelope.header().source().to_string()),
                ("field", Some(path)) => envelope.field(path),
                ("metadata", Some(key)) => envelope.metadata().get(key).map(str::to_string),
                _ => None,
            }?;
            out.push_str(&value);
            last = whole.end();
        }
        out.push_str(&self.settings.expression[last..]);
        let out = out.trim().to_string();
        (!out.is_empty()).then_some(out)
    }
}

#[async_trait]
impl Plugin for DynamicRouter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, settings: &PluginSettings) -> Result<(), PluginError> {
        let parsed: DynamicSettings = parse_settings(&self.name, settings)?;
        if parsed.expression.trim().is_empty() {
            return Err(invalid(&self.name, "expression is empty"));
        }
        for captures in TEMPLATE_VARIABLE.captures_iter(&parsed.expression) {
            let variable = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
            let has_argument = captures.get(2).is_some();
            let known = matches!(
                (variable, has_argument),
                ("message_type", false) | ("source", false) | ("field", true) | ("metadata", true)
            );
            if !known {
                return Err(invalid(
                    &self.name,
                    format!("unknown template variable '{}'", &captures[0]),
                ));
            }
        }
        self.settings = parsed;
        Ok(())
    }
}

#[async_trait]
impl Router for DynamicRouter {
    async fn route(
        &self,
        envelope: &MessageEnvelope,
        _ctx: &StageContext<'_>,
    ) -> Result<RouteDecision, StageError> {
        let Some(destination) = self.evaluate(envelope) else {
            return Ok(RouteDecision::NoMatch);
        };
        if !self.settings.allowed.is_empty() && !self.settings.allowed.contains(&destination) {
            tracing::warn!(
                message_id = %envelope.message_id(),
                destination = %destination,
                "Computed destination is not in the allowed list"
            );
            return Ok(RouteDecision::NoMatch);
        }
        Ok(RouteDecision::to(destination))
    }
}

/// Pass matching envelopes to `destinations`; drop everything else.
pub struct FilterRouter {
    name: String,
    settings: FilterSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FilterSettings {
    accept: Condition,
    destinations: Vec<String>,
}

impl FilterRouter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: FilterSettings::default(),
        }
    }
}

#[async_trait]
impl Plugin for FilterRouter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, settings: &PluginSettings) -> Result<(), PluginError> {
        let parsed: FilterSettings = parse_settings(&self.name, settings)?;
        if parsed.destinations.is_empty() {
            return Err(invalid(&self.name, "no destinations configured"));
        }
        parsed.accept.check().map_err(|e| invalid(&self.name, e))?;
        self.settings = parsed;
        Ok(())
    }
}

#[async_trait]
impl Router for FilterRouter {
    async fn route(
        &self,
        envelope: &MessageEnvelope,
        _ctx: &StageContext<'_>,
    ) -> Result<RouteDecision, StageError> {
        if self.settings.accept.matches(envelope) {
            Ok(RouteDecision::Destinations(self.settings.destinations.clone()))
        } else {
            Ok(RouteDecision::Drop)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Content, Namespace};
    use bytes::Bytes;
    use serde_json::{json, Value as JsonValue};

    const CTX: StageContext<'static> = StageContext {
        route: "test",
        schema: None,
    };

    fn envelope(raw: &str) -> MessageEnvelope {
        let mut envelope =
            MessageEnvelope::receive(Bytes::from(raw.to_string()), "mllp-in", None, None);
        let message = conduit_hl7::Message::parse(raw).unwrap();
        envelope.set_message_type(message.message_type());
        envelope.set_content("x-application/hl7-v2+er7", Content::Hl7(message));
        envelope
    }

    fn settings(value: JsonValue) -> PluginSettings {
        match value {
            JsonValue::Object(map) => map,
            _ => unreachable!(),
        }
    }

    const ADT: &str = "MSH|^~\\&|EPIC|HOSP|LAB|HOSP|20240101||ADT^A01|1|P|2.5\rPID|1||12345\r";
    const ORU: &str = "MSH|^~\\&|LIS|HOSP|EMR|HOSP|20240101||ORU^R01|2|P|2.5\r";

    #[tokio::test]
    async fn test_content_based_first_match_wins() {
        let mut router = ContentBasedRouter::new("cbr");
        router
            .initialize(&settings(json!({
                "rules": [
                    {"name": "adt", "when": {"message_type": "ADT_*"}, "destinations": ["D1"]},
                    {"when": {"source": "mllp-in"}, "destinations": ["D2"]}
                ]
            })))
            .await
            .unwrap();

        assert_eq!(
            router.route(&envelope(ADT), &CTX).await.unwrap(),
            RouteDecision::to("D1")
        );
        assert_eq!(
            router.route(&envelope(ORU), &CTX).await.unwrap(),
            RouteDecision::to("D2")
        );
    }

    #[tokio::test]
    async fn test_content_based_no_match() {
        let mut router = ContentBasedRouter::new("cbr");
        router
            .initialize(&settings(json!({
                "rules": [{"when": {"message_type": "SIU_*"}, "destinations": ["D1"]}]
            })))
            .await
            .unwrap();
        assert_eq!(
            router.route(&envelope(ADT), &CTX).await.unwrap(),
            RouteDecision::NoMatch
        );
    }

    #[tokio::test]
    async fn test_recipient_list_merges_computed_recipients() {
        let mut router = RecipientListRouter::new("list");
        router
            .initialize(&settings(json!({
                "recipients": ["D1", "D2"],
                "metadata_key": "transformer.extra_recipients"
            })))
            .await
            .unwrap();

        let mut env = envelope(ADT);
        env.metadata_mut()
            .insert(Namespace::Transformer, "extra_recipients", "D2, D3");
        assert_eq!(
            router.route(&env, &CTX).await.unwrap(),
            RouteDecision::Destinations(vec!["D1".into(), "D2".into(), "D3".into()])
        );
    }

    #[tokio::test]
    async fn test_dynamic_router_templates() {
        let mut router = DynamicRouter::new("dyn");
        router
            .initialize(&settings(json!({
                "expression": "lab-${field:MSH-5}",
                "allowed": ["lab-LAB"]
            })))
            .await
            .unwrap();
        assert_eq!(
            router.route(&envelope(ADT), &CTX).await.unwrap(),
            RouteDecision::to("lab-LAB")
        );
        // MSH-5 is EMR here, outside the allowed list
        assert_eq!(
            router.route(&envelope(ORU), &CTX).await.unwrap(),
            RouteDecision::NoMatch
        );
    }

    #[tokio::test]
    async fn test_dynamic_router_rejects_unknown_variable() {
        let mut router = DynamicRouter::new("dyn");
        let result = router
            .initialize(&settings(json!({"expression": "${weather}"})))
            .await;
        assert!(matches!(result, Err(PluginError::InvalidSettings { .. })));
    }

    #[tokio::test]
    async fn test_filter_drops_non_matching() {
        let mut router = FilterRouter::new("filter");
        router
            .initialize(&settings(json!({
                "accept": {"message_type": "ADT_A01"},
                "destinations": ["D1"]
            })))
            .await
            .unwrap();
        assert_eq!(
            router.route(&envelope(ADT), &CTX).await.unwrap(),
            RouteDecision::to("D1")
        );
        assert_eq!(
            router.route(&envelope(ORU), &CTX).await.unwrap(),
            RouteDecision::Drop
        );
    }
}

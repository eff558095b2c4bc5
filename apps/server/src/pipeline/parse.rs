//! Parse stage: content detection and syntax checks
//!
//! Undecodable input is poison and goes to quarantine; a declared but
//! unsupported content type is a permanent failure.

use crate::envelope::Content;
use crate::error::StageError;
use serde_json::Value as JsonValue;

pub const HL7_V2_CONTENT_TYPE: &str = "x-application/hl7-v2+er7";
pub const FHIR_JSON_CONTENT_TYPE: &str = "application/fhir+json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Syntax {
    Hl7,
    Json,
}

#[derive(Debug)]
pub struct Parsed {
    pub content_type: String,
    pub content: Content,
    pub message_type: Option<String>,
}

/// Media type without parameters, lowercased.
fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn declared_syntax(content_type: &str) -> Result<Option<Syntax>, StageError> {
    match essence(content_type).as_str() {
        "" | "text/plain" | "application/octet-stream" => Ok(None),
        "x-application/hl7-v2+er7" | "application/hl7-v2" | "application/hl7-v2+er7"
        | "text/hl7v2" => Ok(Some(Syntax::Hl7)),
        "application/json" | "application/fhir+json" | "application/json+fhir" => {
            Ok(Some(Syntax::Json))
        }
        other => Err(StageError::permanent(format!(
            "unsupported content type '{}'",
            other
        ))),
    }
}

fn sniff(raw: &[u8]) -> Option<Syntax> {
    let start = raw
        .iter()
        .position(|b| !b.is_ascii_whitespace() && *b != 0xEF && *b != 0xBB && *b != 0xBF)?;
    let rest = &raw[start..];
    if rest.starts_with(b"MSH") {
        Some(Syntax::Hl7)
    } else if rest.starts_with(b"{") || rest.starts_with(b"[") {
        Some(Syntax::Json)
    } else {
        None
    }
}

/// Detect and parse `raw`. `declared` is the content type reported by the
/// listener, if any.
pub fn parse(raw: &[u8], declared: Option<&str>) -> Result<Parsed, StageError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(StageError::poison("empty payload"));
    }

    let syntax = match declared.map(declared_syntax).transpose()?.flatten() {
        Some(syntax) => syntax,
        None => sniff(raw)
            .ok_or_else(|| StageError::poison("payload is neither HL7 v2 nor JSON"))?,
    };

    match syntax {
        Syntax::Hl7 => {
            let text = std::str::from_utf8(raw)
                .map_err(|e| StageError::poison(format!("payload is not valid UTF-8: {}", e)))?;
            let message = conduit_hl7::Message::parse(text)
                .map_err(|e| StageError::poison(format!("malformed HL7 v2 message: {}", e)))?;
            Ok(Parsed {
                content_type: HL7_V2_CONTENT_TYPE.to_string(),
                message_type: message.message_type(),
                content: Content::Hl7(message),
            })
        }
        Syntax::Json => {
            let value: JsonValue = serde_json::from_slice(raw)
                .map_err(|e| StageError::poison(format!("malformed JSON: {}", e)))?;
            let resource_type = value
                .get("resourceType")
                .and_then(JsonValue::as_str)
                .map(str::to_string);
            let content_type = if resource_type.is_some() {
                FHIR_JSON_CONTENT_TYPE
            } else {
                "application/json"
            };
            Ok(Parsed {
                content_type: content_type.to_string(),
                message_type: resource_type,
                content: Content::Json(value),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureClass;

    #[test]
    fn test_sniffs_hl7() {
        let parsed = parse(
            b"MSH|^~\\&|A|B|C|D|20240101||ADT^A01|1|P|2.5\rPID|1\r",
            None,
        )
        .unwrap();
        assert_eq!(parsed.content_type, HL7_V2_CONTENT_TYPE);
        assert_eq!(parsed.message_type.as_deref(), Some("ADT_A01"));
        assert!(parsed.content.as_hl7().is_some());
    }

    #[test]
    fn test_sniffs_fhir_json() {
        let parsed = parse(br#"  {"resourceType":"Bundle","type":"batch"}"#, None).unwrap();
        assert_eq!(parsed.content_type, FHIR_JSON_CONTENT_TYPE);
        assert_eq!(parsed.message_type.as_deref(), Some("Bundle"));
    }

    #[test]
    fn test_garbage_is_poison() {
        let err = parse(&[0xff, 0xfe, 0x00, 0x41], None).unwrap_err();
        assert_eq!(err.class, FailureClass::Poison);

        let err = parse(b"MSH|broken", None).unwrap_err();
        assert_eq!(err.class, FailureClass::Poison);

        let err = parse(b"{\"resourceType\":", Some("application/fhir+json")).unwrap_err();
        assert_eq!(err.class, FailureClass::Poison);

        let err = parse(b"   ", None).unwrap_err();
        assert_eq!(err.class, FailureClass::Poison);
    }

    #[test]
    fn test_unsupported_declared_type_is_permanent() {
        let err = parse(b"<Patient/>", Some("application/fhir+xml")).unwrap_err();
        assert_eq!(err.class, FailureClass::Permanent);
    }

    #[test]
    fn test_declared_type_parameters_are_ignored() {
        let parsed = parse(br#"{"a":1}"#, Some("application/json; charset=utf-8")).unwrap();
        assert_eq!(parsed.content_type, "application/json");
        assert_eq!(parsed.message_type, None);
    }
}

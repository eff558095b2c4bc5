//! Acknowledgement (ACK/NAK) construction and interpretation

use crate::error::{Hl7Error, Result};
use crate::message::{Delimiters, Message};
use chrono::Utc;
use std::fmt;
use std::str::FromStr;

/// MSA-1 acknowledgement code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckCode {
    /// Application accept
    AA,
    /// Application error
    AE,
    /// Application reject
    AR,
    /// Commit accept (enhanced mode)
    CA,
    /// Commit error (enhanced mode)
    CE,
    /// Commit reject (enhanced mode)
    CR,
}

impl AckCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckCode::AA => "AA",
            AckCode::AE => "AE",
            AckCode::AR => "AR",
            AckCode::CA => "CA",
            AckCode::CE => "CE",
            AckCode::CR => "CR",
        }
    }

    /// Whether the peer accepted the message.
    pub fn is_positive(&self) -> bool {
        matches!(self, AckCode::AA | AckCode::CA)
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AckCode {
    type Err = Hl7Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AA" => Ok(AckCode::AA),
            "AE" => Ok(AckCode::AE),
            "AR" => Ok(AckCode::AR),
            "CA" => Ok(AckCode::CA),
            "CE" => Ok(AckCode::CE),
            "CR" => Ok(AckCode::CR),
            other => Err(Hl7Error::UnknownAckCode(other.to_string())),
        }
    }
}

/// A decoded acknowledgement returned by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    pub code: AckCode,
    /// MSA-2: control id of the message being acknowledged
    pub acknowledged_control_id: Option<String>,
    /// MSA-3 text, falling back to ERR-8 when present
    pub text: Option<String>,
}

impl Acknowledgement {
    pub fn is_positive(&self) -> bool {
        self.code.is_positive()
    }
}

/// Build an `ACK` answering `original`.
///
/// Sender and receiver are swapped, the trigger event, processing id and
/// version are copied from the original, and MSA-2 echoes its control id.
pub fn build_ack(original: &Message, code: AckCode, text: Option<&str>) -> String {
    let d = *original.delimiters();
    let header = AckHeader {
        sending_application: original.get("MSH-5").unwrap_or_default(),
        sending_facility: original.get("MSH-6").unwrap_or_default(),
        receiving_application: original.get("MSH-3").unwrap_or_default(),
        receiving_facility: original.get("MSH-4").unwrap_or_default(),
        trigger: original.trigger_event(),
        processing_id: original.processing_id().unwrap_or("P"),
        version: original.version().unwrap_or("2.5"),
    };
    render_ack(&d, &header, code, original.control_id().unwrap_or_default(), text)
}

/// Build an `ACK` when the inbound bytes could not be parsed at all, so no
/// header fields can be echoed.
pub fn build_bare_ack(code: AckCode, text: Option<&str>) -> String {
    let header = AckHeader {
        sending_application: "",
        sending_facility: "",
        receiving_application: "",
        receiving_facility: "",
        trigger: None,
        processing_id: "P",
        version: "2.5",
    };
    render_ack(&Delimiters::default(), &header, code, "", text)
}

/// Decode a peer acknowledgement. The message must contain an MSA segment
/// with a known code.
pub fn parse_ack(input: &str) -> Result<Acknowledgement> {
    let message = Message::parse(input)?;
    let msa = message
        .segment("MSA")
        .ok_or_else(|| Hl7Error::NotAnAck("missing MSA segment".into()))?;
    let code_raw = msa
        .field(1)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Hl7Error::NotAnAck("missing MSA-1".into()))?;
    let code = code_raw.parse::<AckCode>()?;

    let text = message
        .get("MSA-3")
        .or_else(|| message.get("ERR-8"))
        .map(String::from);

    Ok(Acknowledgement {
        code,
        acknowledged_control_id: message.get("MSA-2").map(String::from),
        text,
    })
}

struct AckHeader<'a> {
    sending_application: &'a str,
    sending_facility: &'a str,
    receiving_application: &'a str,
    receiving_facility: &'a str,
    trigger: Option<&'a str>,
    processing_id: &'a str,
    version: &'a str,
}

fn render_ack(
    d: &Delimiters,
    header: &AckHeader<'_>,
    code: AckCode,
    acknowledged_control_id: &str,
    text: Option<&str>,
) -> String {
    let f = d.field;
    let message_type = match header.trigger {
        Some(trigger) => format!("ACK{c}{}{c}ACK", trigger, c = d.component),
        None => "ACK".to_string(),
    };
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    // MSH-10 is limited to 20 characters in v2.5.
    let control_id: String = uuid::Uuid::new_v4().simple().to_string().chars().take(20).collect();

    let mut out = format!(
        "MSH{f}{enc}{f}{sa}{f}{sf}{f}{ra}{f}{rf}{f}{ts}{f}{f}{mt}{f}{cid}{f}{pid}{f}{ver}\r",
        enc = d.encoding_characters(),
        sa = header.sending_application,
        sf = header.sending_facility,
        ra = header.receiving_application,
        rf = header.receiving_facility,
        ts = timestamp,
        mt = message_type,
        cid = control_id,
        pid = header.processing_id,
        ver = header.version,
    );
    out.push_str(&format!("MSA{f}{}{f}{}", code, acknowledged_control_id));
    if let Some(text) = text {
        out.push(f);
        out.push_str(&d.escape_text(text));
    }
    out.push('\r');
    out
}

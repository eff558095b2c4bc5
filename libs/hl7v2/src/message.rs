//! HL7 v2 message model and ER7 parser

use crate::error::{Hl7Error, Result};
use crate::path::FieldPath;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Encoding characters declared in MSH-1 and MSH-2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delimiters {
    pub field: char,
    pub component: char,
    pub repetition: char,
    pub escape: char,
    pub subcomponent: char,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            field: '|',
            component: '^',
            repetition: '~',
            escape: '\\',
            subcomponent: '&',
        }
    }
}

impl Delimiters {
    /// The MSH-2 value for these delimiters.
    pub fn encoding_characters(&self) -> String {
        [self.component, self.repetition, self.escape, self.subcomponent]
            .iter()
            .collect()
    }

    /// Escape free text so it can be carried inside a single field.
    pub fn escape_text(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            if c == self.escape {
                out.push_str(&format!("{e}E{e}", e = self.escape));
            } else if c == self.field {
                out.push_str(&format!("{e}F{e}", e = self.escape));
            } else if c == self.component {
                out.push_str(&format!("{e}S{e}", e = self.escape));
            } else if c == self.subcomponent {
                out.push_str(&format!("{e}T{e}", e = self.escape));
            } else if c == self.repetition {
                out.push_str(&format!("{e}R{e}", e = self.escape));
            } else if c == '\r' || c == '\n' {
                out.push(' ');
            } else {
                out.push(c);
            }
        }
        out
    }

    fn from_header(header: &str) -> Result<Self> {
        let mut chars = header.chars().skip(3);
        let field = chars
            .next()
            .ok_or_else(|| Hl7Error::InvalidDelimiters("missing field separator".into()))?;
        let encoding: Vec<char> = chars.take_while(|c| *c != field).collect();
        if encoding.len() < 4 {
            return Err(Hl7Error::InvalidDelimiters(format!(
                "expected 4 encoding characters, found {}",
                encoding.len()
            )));
        }

        let delimiters = Self {
            field,
            component: encoding[0],
            repetition: encoding[1],
            escape: encoding[2],
            subcomponent: encoding[3],
        };

        let all = [
            delimiters.field,
            delimiters.component,
            delimiters.repetition,
            delimiters.escape,
            delimiters.subcomponent,
        ];
        for (i, c) in all.iter().enumerate() {
            if c.is_ascii_alphanumeric() || c.is_whitespace() || all[i + 1..].contains(c) {
                return Err(Hl7Error::InvalidDelimiters(format!(
                    "delimiter {:?} is not usable",
                    c
                )));
            }
        }
        Ok(delimiters)
    }
}

/// One segment. `fields[0]` is the segment name so that `fields[n]` is
/// field `n`; for `MSH`, `fields[1]` holds the field separator itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub name: String,
    pub fields: Vec<String>,
}

impl Segment {
    /// Raw value of field `n` (1-based), all repetitions included.
    pub fn field(&self, n: usize) -> Option<&str> {
        if n == 0 {
            return None;
        }
        self.fields.get(n).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    delimiters: Delimiters,
    segments: Vec<Segment>,
}

impl Message {
    /// Parse an ER7-encoded message.
    ///
    /// Segments may be terminated by `\r`, `\n` or `\r\n`. The message must
    /// start with `MSH` and declare usable delimiters, every segment needs a
    /// three character alphanumeric name, and MSH-9 must be populated.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim_start_matches('\u{feff}').trim_start();
        if input.trim().is_empty() {
            return Err(Hl7Error::Empty);
        }
        if !input.starts_with("MSH") {
            return Err(Hl7Error::MissingMsh);
        }

        let delimiters = Delimiters::from_header(input)?;
        let mut segments = Vec::new();

        for (index, line) in input
            .split(['\r', '\n'])
            .filter(|l| !l.trim().is_empty())
            .enumerate()
        {
            let mut fields: Vec<String> = line.split(delimiters.field).map(String::from).collect();
            let name = fields[0].clone();
            if name.len() != 3 || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(Hl7Error::InvalidSegment { index, name });
            }
            if index == 0 && name != "MSH" {
                return Err(Hl7Error::MissingMsh);
            }
            if name == "MSH" {
                fields.insert(1, delimiters.field.to_string());
            }
            segments.push(Segment { name, fields });
        }

        let message = Self {
            delimiters,
            segments,
        };
        if message.get("MSH-9.1").map_or(true, str::is_empty) {
            return Err(Hl7Error::MissingField("MSH-9".into()));
        }
        Ok(message)
    }

    pub fn delimiters(&self) -> &Delimiters {
        &self.delimiters
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// First segment with the given name.
    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    pub fn segments_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Segment> + 'a {
        self.segments.iter().filter(move |s| s.name == name)
    }

    pub fn has_segment(&self, name: &str) -> bool {
        self.segment(name).is_some()
    }

    /// Value at a terser-style path such as `PID-5.1`. Returns `None` for
    /// malformed paths, absent segments and empty values.
    pub fn get(&self, path: &str) -> Option<&str> {
        let path = FieldPath::parse(path).ok()?;
        self.get_path(&path)
    }

    pub fn get_path(&self, path: &FieldPath) -> Option<&str> {
        let segment = self.segment(&path.segment)?;
        self.value_in(segment, path)
    }

    /// Resolve a path against a specific segment instance (e.g. one of many OBX).
    pub fn value_in<'a>(&self, segment: &'a Segment, path: &FieldPath) -> Option<&'a str> {
        let raw = segment.field(path.field)?;
        // MSH-1 and MSH-2 contain delimiter characters and are never split.
        if segment.name == "MSH" && path.field <= 2 {
            return non_empty(raw);
        }

        let mut value = raw.split(self.delimiters.repetition).next()?;
        if let Some(component) = path.component {
            value = value.split(self.delimiters.component).nth(component - 1)?;
        }
        if let Some(subcomponent) = path.subcomponent {
            value = value.split(self.delimiters.subcomponent).nth(subcomponent - 1)?;
        }
        non_empty(value)
    }

    /// Message type as `<code>_<trigger>`, e.g. `ADT_A01`; `ACK` messages
    /// without a trigger event yield just the code.
    pub fn message_type(&self) -> Option<String> {
        let code = self.get("MSH-9.1")?;
        match self.get("MSH-9.2") {
            Some(trigger) => Some(format!("{}_{}", code, trigger)),
            None => Some(code.to_string()),
        }
    }

    pub fn trigger_event(&self) -> Option<&str> {
        self.get("MSH-9.2")
    }

    pub fn control_id(&self) -> Option<&str> {
        self.get("MSH-10")
    }

    pub fn processing_id(&self) -> Option<&str> {
        self.get("MSH-11.1")
    }

    pub fn version(&self) -> Option<&str> {
        self.get("MSH-12.1")
    }

    pub fn sending_application(&self) -> Option<&str> {
        self.get("MSH-3.1")
    }

    pub fn sending_facility(&self) -> Option<&str> {
        self.get("MSH-4.1")
    }

    pub fn receiving_application(&self) -> Option<&str> {
        self.get("MSH-5.1")
    }

    pub fn receiving_facility(&self) -> Option<&str> {
        self.get("MSH-6.1")
    }

    /// Serialize back to ER7 with `\r` segment terminators.
    pub fn encode(&self) -> String {
        let sep = self.delimiters.field.to_string();
        let mut out = String::new();
        for segment in &self.segments {
            if segment.name == "MSH" {
                out.push_str("MSH");
                out.push(self.delimiters.field);
                out.push_str(&segment.fields[2..].join(&sep));
            } else {
                out.push_str(&segment.fields.join(&sep));
            }
            out.push('\r');
        }
        out
    }

    /// JSON projection: segment name to a list of occurrences, each mapping
    /// populated field numbers to their raw values.
    pub fn to_json(&self) -> JsonValue {
        let mut root = Map::new();
        for segment in &self.segments {
            let mut fields = Map::new();
            for (n, value) in segment.fields.iter().enumerate().skip(1) {
                if !value.is_empty() {
                    fields.insert(n.to_string(), JsonValue::String(value.clone()));
                }
            }
            let entry = root
                .entry(segment.name.clone())
                .or_insert_with(|| JsonValue::Array(Vec::new()));
            if let JsonValue::Array(items) = entry {
                items.push(JsonValue::Object(fields));
            }
        }
        JsonValue::Object(root)
    }
}

fn non_empty(value: &str) -> Option<&str> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

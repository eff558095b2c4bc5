//! Terser-style field paths (`PID-5`, `PID-5.1`, `OBX-5.4.2`)

use crate::error::{Hl7Error, Result};
use std::fmt;
use std::str::FromStr;

/// Address of a field, component or sub-component inside a message.
///
/// Indices are 1-based as in the HL7 standard. Only the first repetition of
/// a repeating field is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    pub segment: String,
    pub field: usize,
    pub component: Option<usize>,
    pub subcomponent: Option<usize>,
}

impl FieldPath {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || Hl7Error::InvalidPath(raw.to_string());

        let (segment, rest) = raw.trim().split_once('-').ok_or_else(invalid)?;
        if segment.len() != 3 || !segment.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }

        let mut parts = rest.split('.');
        let field = parse_index(parts.next()).ok_or_else(invalid)?;
        let component = match parts.next() {
            Some(p) => Some(parse_index(Some(p)).ok_or_else(invalid)?),
            None => None,
        };
        let subcomponent = match parts.next() {
            Some(p) => Some(parse_index(Some(p)).ok_or_else(invalid)?),
            None => None,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self {
            segment: segment.to_ascii_uppercase(),
            field,
            component,
            subcomponent,
        })
    }
}

fn parse_index(part: Option<&str>) -> Option<usize> {
    part.and_then(|p| p.parse::<usize>().ok()).filter(|n| *n > 0)
}

impl FromStr for FieldPath {
    type Err = Hl7Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.segment, self.field)?;
        if let Some(c) = self.component {
            write!(f, ".{}", c)?;
        }
        if let Some(s) = self.subcomponent {
            write!(f, ".{}", s)?;
        }
        Ok(())
    }
}

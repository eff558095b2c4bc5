//! Error types for HL7 v2 handling

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Hl7Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Hl7Error {
    #[error("Message is empty")]
    Empty,

    #[error("Message does not start with an MSH segment")]
    MissingMsh,

    #[error("Invalid delimiters in MSH header: {0}")]
    InvalidDelimiters(String),

    #[error("Invalid segment at position {index}: {name:?}")]
    InvalidSegment { index: usize, name: String },

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field path: {0}")]
    InvalidPath(String),

    #[error("Not an acknowledgement: {0}")]
    NotAnAck(String),

    #[error("Unknown acknowledgement code: {0}")]
    UnknownAckCode(String),
}

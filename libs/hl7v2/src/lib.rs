//! HL7 v2 message support for the Conduit integration engine.
//!
//! Covers the subset of HL7 v2 (ER7 "pipe and hat" encoding) an interface
//! engine needs on the wire:
//! - Delimiter-aware parsing driven by the `MSH` header
//! - Field addressing with terser-style paths (`PID-5.1`, `MSH-9.2`)
//! - Message type classification (`ADT^A01` becomes `ADT_A01`)
//! - Construction of `ACK` messages for inbound traffic and
//!   interpretation of acknowledgements returned by peers
//!
//! # Example
//!
//! ```rust
//! use conduit_hl7::{AckCode, Message};
//!
//! let raw = "MSH|^~\\&|ADT|HOSP|LAB|HOSP|20240101120000||ADT^A01|MSG0001|P|2.5\rPID|1||12345^^^HOSP||DOE^JOHN\r";
//! let message = Message::parse(raw).unwrap();
//! assert_eq!(message.message_type().as_deref(), Some("ADT_A01"));
//! assert_eq!(message.get("PID-5.2"), Some("JOHN"));
//!
//! let ack = conduit_hl7::build_ack(&message, AckCode::AA, None);
//! assert!(ack.contains("MSA|AA|MSG0001"));
//! ```

pub mod ack;
pub mod error;
pub mod message;
pub mod path;

pub use ack::{build_ack, build_bare_ack, parse_ack, AckCode, Acknowledgement};
pub use error::{Hl7Error, Result};
pub use message::{Delimiters, Message, Segment};
pub use path::FieldPath;

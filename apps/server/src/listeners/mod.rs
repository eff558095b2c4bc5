//! Transport listeners: each turns inbound bytes into units on the intake

pub mod file;
pub mod http;
pub mod mllp;

pub use file::{FileDisposition, FilePoller};
pub use http::HttpBinding;
pub use mllp::MllpListener;

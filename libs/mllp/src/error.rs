use thiserror::Error;

#[derive(Error, Debug)]
pub enum MllpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed with {buffered} bytes of an unterminated frame")]
    IncompleteFrame { buffered: usize },

    #[error("Payload cannot be framed: {0}")]
    InvalidPayload(String),
}

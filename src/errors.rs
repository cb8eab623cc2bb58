use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaqError {
    #[error("could not open {port}: {source}")]
    Connection {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("link closed: {0}")]
    LinkClosed(String),
    #[error("malformed reply: {0}")]
    MalformedReply(String),
    #[error("no streamed samples available yet")]
    NoSamples,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("acquisition task failed: {0}")]
    Task(String),
}

impl DaqError {
    /// Whether this error ends the acquisition loop.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DaqError::Connection { .. }
                | DaqError::Handshake(_)
                | DaqError::LinkClosed(_)
                | DaqError::Io(_)
                | DaqError::Serial(_)
                | DaqError::Task(_)
        )
    }
}

/// Why a single record was dropped by the parser. Never surfaced past the loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("expected 2 comma-separated fields, found {0}")]
    FieldCount(usize),
    #[error("bad timestamp field {0:?}")]
    Timestamp(String),
    #[error("bad value field {0:?}")]
    Value(String),
}

pub type Result<T> = std::result::Result<T, DaqError>;

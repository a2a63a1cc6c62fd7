//! Error types for flowgate

use thiserror::Error;

/// Main error type for flowgate
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("pipe closed")]
    ClosedPipe,

    #[error("end of stream")]
    EndOfStream,

    #[error("read timeout")]
    ReadTimeout,

    #[error("timeout on sniffing")]
    SniffingTimeout,

    #[error("unknown content")]
    UnknownContent,

    #[error("no outbound handler available for {0}")]
    HandlerMissing(String),

    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl Error {
    /// True for the quiet terminations: a drained closed pipe reads as
    /// end-of-stream, not as a fault.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Error::EndOfStream)
    }
}

/// Result type alias for flowgate
pub type Result<T> = std::result::Result<T, Error>;

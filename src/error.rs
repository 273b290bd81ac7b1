use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Not enough buffered bytes to decode a full message yet.
    #[error("incomplete message")]
    IncompleteMessage,
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Header block or chunk exceeded its hard cap.
    #[error("message too large: {0}")]
    TooLarge(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    /// Raised by business handlers; translated to an error envelope.
    #[error("handler error: {0}")]
    Handler(String),
    #[error("unexpected response: {0}")]
    Response(String),
    /// Terminal failure of an outbound request executor.
    #[error("request execution failed: {0}")]
    Execution(String),
    #[error(transparent)]
    Conversion(#[from] std::num::TryFromIntError),
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
    /// Attempting to extract a value failed due to the input being fully consumed
    #[error("end of stream error")]
    EndOfStream,
    #[error("unknown action `{0}`")]
    UnknownAction(String),
    #[error("wrong value type: {0}")]
    WrongType(String),
}

impl Error {
    /// `true` for wire-level errors that should surface as an HTTP status
    /// on the offending connection before it is drained and closed.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::TooLarge(_) | Error::IncompleteMessage
        )
    }
}

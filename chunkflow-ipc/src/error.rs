//! IPC error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Failed to decode message: {0}")]
    Decode(String),

    #[error("Stream error: {0}")]
    Io(String),

    /// The peer closed its end of the channel
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u32, actual: u32 },

    /// Execution context could not be started
    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    /// A large payload segment was out of order, oversized or unannounced
    #[error("Rejected segment: {0}")]
    Segment(String),
}

impl IpcError {
    /// Whether the stream can still be read after this error.
    ///
    /// A frame that fails to decode only loses that frame; the next line is
    /// independent of it.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, IpcError::Decode(_) | IpcError::Segment(_))
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::Io(err.to_string())
    }
}

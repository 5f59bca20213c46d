//! Inter-process communication for Chunkflow
//!
//! This crate provides the message protocol and the line-framed transports
//! used between the pool manager and its execution contexts.

pub mod error;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use error::IpcError;
pub use protocol::{
    CoordinatorMessage, LargeTaskMetadata, MessageEnvelope, Payload, PayloadEncoding, TaskId,
    WorkerMessage, IPC_PROTOCOL_VERSION,
};
pub use transport::{ChildProcessTransport, FrameReader, FrameWriter, IpcTransport, StdioTransport};

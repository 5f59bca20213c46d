//! IPC transport implementations
//!
//! Messages are framed as one JSON-encoded [`MessageEnvelope`] per line.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};

use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, IPC_PROTOCOL_VERSION};

/// IPC transport trait for different communication mechanisms
#[async_trait]
pub trait IpcTransport: Send {
    /// Send a message to the other end
    async fn send<T: Serialize + Send + Sync>(
        &mut self,
        message: &MessageEnvelope<T>,
    ) -> Result<(), IpcError>;

    /// Receive a message from the other end
    async fn receive<T: DeserializeOwned + Send>(&mut self) -> Result<MessageEnvelope<T>, IpcError>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), IpcError>;
}

/// Reads line-framed envelopes from a byte stream
pub struct FrameReader<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            line: String::new(),
        }
    }

    /// Read the next envelope, skipping blank lines
    pub async fn read<T: DeserializeOwned>(&mut self) -> Result<MessageEnvelope<T>, IpcError> {
        loop {
            self.line.clear();
            let read = self.reader.read_line(&mut self.line).await?;
            if read == 0 {
                return Err(IpcError::ConnectionClosed);
            }

            let frame = self.line.trim_end();
            if frame.is_empty() {
                continue;
            }

            let envelope: MessageEnvelope<T> = serde_json::from_str(frame)
                .map_err(|e| IpcError::Decode(e.to_string()))?;

            if !envelope.is_compatible() {
                return Err(IpcError::ProtocolVersionMismatch {
                    expected: IPC_PROTOCOL_VERSION,
                    actual: envelope.protocol_version,
                });
            }

            return Ok(envelope);
        }
    }
}

/// Writes line-framed envelopes to a byte stream
pub struct FrameWriter<W> {
    writer: W,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(inner: W) -> Self {
        Self { writer: inner }
    }

    pub async fn write<T: Serialize>(&mut self, envelope: &MessageEnvelope<T>) -> Result<(), IpcError> {
        let mut frame = serde_json::to_vec(envelope)
            .map_err(|e| IpcError::Encode(e.to_string()))?;
        frame.push(b'\n');

        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), IpcError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Stdin/Stdout IPC transport, used on the context side of a process
pub struct StdioTransport {
    reader: FrameReader<tokio::io::Stdin>,
    writer: FrameWriter<tokio::io::Stdout>,
}

impl StdioTransport {
    /// Create a new stdio transport
    pub fn new() -> Self {
        Self {
            reader: FrameReader::new(tokio::io::stdin()),
            writer: FrameWriter::new(tokio::io::stdout()),
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IpcTransport for StdioTransport {
    async fn send<T: Serialize + Send + Sync>(
        &mut self,
        message: &MessageEnvelope<T>,
    ) -> Result<(), IpcError> {
        self.writer.write(message).await
    }

    async fn receive<T: DeserializeOwned + Send>(&mut self) -> Result<MessageEnvelope<T>, IpcError> {
        self.reader.read().await
    }

    async fn close(&mut self) -> Result<(), IpcError> {
        // Stdin/stdout don't need explicit closing
        Ok(())
    }
}

/// Child process transport for parent-child communication
pub struct ChildProcessTransport {
    writer: Option<FrameWriter<ChildStdin>>,
    reader: Option<FrameReader<ChildStdout>>,
}

impl ChildProcessTransport {
    /// Create a new child process transport
    pub fn new(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self {
            writer: Some(FrameWriter::new(stdin)),
            reader: Some(FrameReader::new(stdout)),
        }
    }

    /// Split into independently owned halves so reads and writes can run on
    /// separate tasks
    pub fn into_split(self) -> Result<(FrameWriter<ChildStdin>, FrameReader<ChildStdout>), IpcError> {
        match (self.writer, self.reader) {
            (Some(writer), Some(reader)) => Ok((writer, reader)),
            _ => Err(IpcError::ConnectionClosed),
        }
    }
}

#[async_trait]
impl IpcTransport for ChildProcessTransport {
    async fn send<T: Serialize + Send + Sync>(
        &mut self,
        message: &MessageEnvelope<T>,
    ) -> Result<(), IpcError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| IpcError::Io("stdin already closed".to_string()))?;
        writer.write(message).await
    }

    async fn receive<T: DeserializeOwned + Send>(&mut self) -> Result<MessageEnvelope<T>, IpcError> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| IpcError::Io("stdout already closed".to_string()))?;
        reader.read().await
    }

    async fn close(&mut self) -> Result<(), IpcError> {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        let _ = self.reader.take();
        Ok(())
    }
}

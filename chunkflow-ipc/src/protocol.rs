//! IPC protocol definitions and message types
//!
//! Both directions are closed tagged enums so that every consumer matches
//! them exhaustively. The JSON shapes are:
//!
//! ```text
//! manager -> context   {"action": "task", "taskId": .., "type": .., "payload": ..}
//!                      {"action": "ping", "timestamp": ..}
//!                      {"action": "initLargeTask" | "largeTaskChunk" | "finalizeLargeTask", ..}
//! context -> manager   {"type": "RESPONSE", "taskId": .., "success": .., "result"?, "error"?}
//!                      {"type": "PONG", "timestamp": ..}   {"type": "READY", ..}
//! ```

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::IpcError;

/// IPC protocol version for compatibility checking
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// Identifier of a submitted task, unique per manager
pub type TaskId = Uuid;

/// Task input as it travels over the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum Payload {
    /// Raw binary data, base64 encoded in JSON
    Bytes(#[serde(with = "serde_base64")] Bytes),
    /// Structured value
    Json(JsonValue),
}

/// How a reassembled large payload must be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    Bytes,
    Json,
}

impl Payload {
    pub fn encoding(&self) -> PayloadEncoding {
        match self {
            Payload::Bytes(_) => PayloadEncoding::Bytes,
            Payload::Json(_) => PayloadEncoding::Json,
        }
    }

    /// Flatten the payload into bytes for segmented transfer
    pub fn into_bytes(self) -> Result<Bytes, IpcError> {
        match self {
            Payload::Bytes(bytes) => Ok(bytes),
            Payload::Json(value) => serde_json::to_vec(&value)
                .map(Bytes::from)
                .map_err(|e| IpcError::Encode(e.to_string())),
        }
    }

    /// Rebuild a payload from flattened bytes
    pub fn from_bytes(encoding: PayloadEncoding, bytes: Bytes) -> Result<Self, IpcError> {
        match encoding {
            PayloadEncoding::Bytes => Ok(Payload::Bytes(bytes)),
            PayloadEncoding::Json => serde_json::from_slice(&bytes)
                .map(Payload::Json)
                .map_err(|e| IpcError::Decode(e.to_string())),
        }
    }
}

/// Announcement sent ahead of a segmented payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LargeTaskMetadata {
    pub total_size: u64,
    pub total_chunks: u32,
    pub encoding: PayloadEncoding,
}

/// Messages sent from the manager to an execution context
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum WorkerMessage {
    /// Initialization message sent once after launch
    Init { context_id: String, category: String },

    /// Execute a task delivered in a single message
    Task {
        task_id: TaskId,
        #[serde(rename = "type")]
        task_type: String,
        payload: Payload,
    },

    /// Liveness probe
    Ping { timestamp: i64 },

    /// Ask the context to clean up and exit
    Terminate,

    /// First phase of a segmented transfer
    InitLargeTask {
        task_id: TaskId,
        #[serde(rename = "type")]
        task_type: String,
        metadata: LargeTaskMetadata,
    },

    /// One segment of a segmented transfer
    LargeTaskChunk {
        task_id: TaskId,
        chunk_index: u32,
        total_chunks: u32,
        #[serde(with = "serde_base64")]
        chunk: Bytes,
        is_last_chunk: bool,
    },

    /// Assemble the segments and execute
    FinalizeLargeTask {
        task_id: TaskId,
        #[serde(rename = "type")]
        task_type: String,
    },

    /// Discard any partial segment state for the task
    AbortLargeTask { task_id: TaskId },
}

impl WorkerMessage {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            WorkerMessage::Task { task_id, .. }
            | WorkerMessage::InitLargeTask { task_id, .. }
            | WorkerMessage::LargeTaskChunk { task_id, .. }
            | WorkerMessage::FinalizeLargeTask { task_id, .. }
            | WorkerMessage::AbortLargeTask { task_id } => Some(*task_id),
            WorkerMessage::Init { .. } | WorkerMessage::Ping { .. } | WorkerMessage::Terminate => {
                None
            }
        }
    }
}

/// Messages sent from an execution context back to the manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum CoordinatorMessage {
    /// Context finished initialization
    Ready { context_id: String },

    /// Outcome of a task
    Response {
        task_id: TaskId,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<JsonValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Answer to a liveness probe, echoing its timestamp
    Pong { timestamp: i64 },

    /// Context acknowledged a terminate notice
    TerminateAck,

    /// Runtime fault reported by the context
    Error {
        #[serde(default)]
        task_id: Option<TaskId>,
        message: String,
    },
}

impl CoordinatorMessage {
    pub fn success(task_id: TaskId, result: JsonValue) -> Self {
        CoordinatorMessage::Response {
            task_id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(task_id: TaskId, error: impl Into<String>) -> Self {
        CoordinatorMessage::Response {
            task_id,
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            CoordinatorMessage::Response { task_id, .. } => Some(*task_id),
            CoordinatorMessage::Error { task_id, .. } => *task_id,
            CoordinatorMessage::Ready { .. }
            | CoordinatorMessage::Pong { .. }
            | CoordinatorMessage::TerminateAck => None,
        }
    }
}

/// Message envelope for process transports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    /// Create a new message envelope
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Check if protocol version is compatible
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == IPC_PROTOCOL_VERSION
    }
}

mod serde_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_message_wire_shape() {
        let task_id = Uuid::new_v4();
        let message = WorkerMessage::Task {
            task_id,
            task_type: "hashChunk".to_string(),
            payload: Payload::Bytes(Bytes::from_static(b"abc")),
        };

        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["action"], "task");
        assert_eq!(value["taskId"], task_id.to_string());
        assert_eq!(value["type"], "hashChunk");
        assert_eq!(value["payload"]["kind"], "bytes");
        assert_eq!(value["payload"]["data"], "YWJj");
    }

    #[test]
    fn test_control_messages_wire_shape() {
        let ping = serde_json::to_value(WorkerMessage::Ping { timestamp: 42 }).unwrap();
        assert_eq!(ping, json!({"action": "ping", "timestamp": 42}));

        let pong = serde_json::to_value(CoordinatorMessage::Pong { timestamp: 42 }).unwrap();
        assert_eq!(pong, json!({"type": "PONG", "timestamp": 42}));

        let terminate = serde_json::to_value(WorkerMessage::Terminate).unwrap();
        assert_eq!(terminate, json!({"action": "terminate"}));

        let ack = serde_json::to_value(CoordinatorMessage::TerminateAck).unwrap();
        assert_eq!(ack, json!({"type": "TERMINATE_ACK"}));
    }

    #[test]
    fn test_chunk_message_parses_from_json() {
        let task_id = Uuid::new_v4();
        let raw = json!({
            "action": "largeTaskChunk",
            "taskId": task_id,
            "chunkIndex": 2,
            "totalChunks": 3,
            "chunk": "aGVsbG8=",
            "isLastChunk": true
        });

        match serde_json::from_value::<WorkerMessage>(raw).unwrap() {
            WorkerMessage::LargeTaskChunk {
                chunk_index,
                total_chunks,
                chunk,
                is_last_chunk,
                ..
            } => {
                assert_eq!(chunk_index, 2);
                assert_eq!(total_chunks, 3);
                assert_eq!(&chunk[..], b"hello");
                assert!(is_last_chunk);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_failed_response_omits_result() {
        let task_id = Uuid::new_v4();
        let value = serde_json::to_value(CoordinatorMessage::failure(task_id, "boom")).unwrap();
        assert_eq!(value["type"], "RESPONSE");
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "boom");
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_json_payload_flattening() {
        let value = json!({"fileSize": 100, "chunkSize": 30});
        let payload = Payload::Json(value.clone());
        let bytes = payload.clone().into_bytes().unwrap();
        assert_eq!(bytes, Bytes::from(serde_json::to_vec(&value).unwrap()));

        let rebuilt = Payload::from_bytes(PayloadEncoding::Json, bytes).unwrap();
        assert_eq!(rebuilt, payload);

        let broken = Payload::from_bytes(PayloadEncoding::Json, Bytes::from_static(b"{oops"));
        assert!(matches!(broken, Err(IpcError::Decode(_))));
    }

    #[test]
    fn test_message_envelope() {
        let envelope = MessageEnvelope::new(WorkerMessage::Ping { timestamp: 1 });
        assert_eq!(envelope.protocol_version, IPC_PROTOCOL_VERSION);
        assert!(envelope.is_compatible());

        let stale = MessageEnvelope {
            protocol_version: IPC_PROTOCOL_VERSION + 1,
            ..envelope
        };
        assert!(!stale.is_compatible());
    }
}

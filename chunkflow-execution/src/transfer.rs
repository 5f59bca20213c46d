//! Segmented transfer of large payloads
//!
//! Payloads above the transfer threshold are sent as an announcement, an
//! ordered run of chunks and a finalize message. The receiving context
//! rebuilds the payload with [`LargeTaskAssembler`] and only then runs it.

use bytes::{Bytes, BytesMut};
use chunkflow_ipc::{IpcError, LargeTaskMetadata, Payload, PayloadEncoding, TaskId, WorkerMessage};
use std::path::Path;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::error::{ExecutionError, ExecutionResult};
use crate::task::TaskPayload;

/// Upper bound on the buffer reserved up front for an announced payload
const MAX_PREALLOCATION: usize = 64 * 1024 * 1024;

/// Size limits for a single delivery
#[derive(Debug, Clone, Copy)]
pub struct TransferPolicy {
    /// Payloads larger than this are segmented
    pub threshold: usize,
    /// Size of each segment
    pub chunk_size: usize,
}

impl TransferPolicy {
    pub fn needs_segmenting(&self, size: usize) -> bool {
        size > self.threshold
    }

    pub fn chunk_count(&self, size: u64) -> u64 {
        size.div_ceil(self.chunk_size.max(1) as u64)
    }
}

/// Send a task to a context, segmenting its payload when required.
///
/// JSON payloads are encoded once here, off the control loop; the encoded
/// form is both the size measurement and the segment source. File payloads
/// are streamed from disk one chunk at a time.
pub async fn deliver(
    outbox: &UnboundedSender<WorkerMessage>,
    task_id: TaskId,
    task_type: &str,
    payload: &TaskPayload,
    policy: TransferPolicy,
) -> ExecutionResult<()> {
    let (wire, encoded) = match payload {
        TaskPayload::File(path) => {
            return deliver_file(outbox, task_id, task_type, path, policy).await
        }
        TaskPayload::Bytes(bytes) => (Payload::Bytes(bytes.clone()), bytes.clone()),
        TaskPayload::Json(value) => {
            let encoded = serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|e| ExecutionError::InvalidPayload(e.to_string()))?;
            (Payload::Json(value.clone()), encoded)
        }
    };

    if !policy.needs_segmenting(encoded.len()) {
        return send(
            outbox,
            WorkerMessage::Task {
                task_id,
                task_type: task_type.to_string(),
                payload: wire,
            },
        );
    }
    deliver_segments(outbox, task_id, task_type, wire.encoding(), encoded, policy).await
}

async fn deliver_segments(
    outbox: &UnboundedSender<WorkerMessage>,
    task_id: TaskId,
    task_type: &str,
    encoding: PayloadEncoding,
    bytes: Bytes,
    policy: TransferPolicy,
) -> ExecutionResult<()> {
    let total_size = bytes.len() as u64;
    let total_chunks = chunk_total(&policy, total_size)?;
    debug!(
        "Segmenting payload of task {} into {} chunks ({} bytes)",
        task_id, total_chunks, total_size
    );

    send(
        outbox,
        WorkerMessage::InitLargeTask {
            task_id,
            task_type: task_type.to_string(),
            metadata: LargeTaskMetadata {
                total_size,
                total_chunks,
                encoding,
            },
        },
    )?;

    for index in 0..total_chunks {
        let start = index as usize * policy.chunk_size;
        let end = (start + policy.chunk_size).min(bytes.len());
        send(
            outbox,
            WorkerMessage::LargeTaskChunk {
                task_id,
                chunk_index: index,
                total_chunks,
                chunk: bytes.slice(start..end),
                is_last_chunk: index + 1 == total_chunks,
            },
        )?;
        tokio::task::yield_now().await;
    }

    send(
        outbox,
        WorkerMessage::FinalizeLargeTask {
            task_id,
            task_type: task_type.to_string(),
        },
    )
}

async fn deliver_file(
    outbox: &UnboundedSender<WorkerMessage>,
    task_id: TaskId,
    task_type: &str,
    path: &Path,
    policy: TransferPolicy,
) -> ExecutionResult<()> {
    let file_error =
        |e: std::io::Error| ExecutionError::TransferFailed(format!("{}: {}", path.display(), e));

    let mut file = tokio::fs::File::open(path).await.map_err(file_error)?;
    let total_size = file.metadata().await.map_err(file_error)?.len();

    if !policy.needs_segmenting(total_size as usize) {
        let mut buffer = Vec::with_capacity(total_size as usize);
        file.read_to_end(&mut buffer).await.map_err(file_error)?;
        return send(
            outbox,
            WorkerMessage::Task {
                task_id,
                task_type: task_type.to_string(),
                payload: Payload::Bytes(Bytes::from(buffer)),
            },
        );
    }

    let total_chunks = chunk_total(&policy, total_size)?;
    debug!(
        "Streaming {} into {} chunks for task {}",
        path.display(),
        total_chunks,
        task_id
    );

    send(
        outbox,
        WorkerMessage::InitLargeTask {
            task_id,
            task_type: task_type.to_string(),
            metadata: LargeTaskMetadata {
                total_size,
                total_chunks,
                encoding: PayloadEncoding::Bytes,
            },
        },
    )?;

    let mut remaining = total_size;
    for index in 0..total_chunks {
        let len = remaining.min(policy.chunk_size as u64) as usize;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer).await.map_err(file_error)?;
        remaining -= len as u64;

        send(
            outbox,
            WorkerMessage::LargeTaskChunk {
                task_id,
                chunk_index: index,
                total_chunks,
                chunk: Bytes::from(buffer),
                is_last_chunk: index + 1 == total_chunks,
            },
        )?;
        tokio::task::yield_now().await;
    }

    send(
        outbox,
        WorkerMessage::FinalizeLargeTask {
            task_id,
            task_type: task_type.to_string(),
        },
    )
}

fn chunk_total(policy: &TransferPolicy, total_size: u64) -> ExecutionResult<u32> {
    u32::try_from(policy.chunk_count(total_size)).map_err(|_| {
        ExecutionError::TransferFailed(format!(
            "payload of {} bytes needs too many chunks",
            total_size
        ))
    })
}

fn send(outbox: &UnboundedSender<WorkerMessage>, message: WorkerMessage) -> ExecutionResult<()> {
    outbox
        .send(message)
        .map_err(|_| ExecutionError::TransferFailed("execution context channel closed".to_string()))
}

struct Assembly {
    task_id: TaskId,
    task_type: String,
    metadata: LargeTaskMetadata,
    next_index: u32,
    buffer: BytesMut,
    saw_last: bool,
}

/// Context-side reassembly of segmented payloads.
///
/// At most one assembly is active; a new announcement discards the previous one.
#[derive(Default)]
pub struct LargeTaskAssembler {
    active: Option<Assembly>,
}

impl LargeTaskAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_task(&self) -> Option<TaskId> {
        self.active.as_ref().map(|a| a.task_id)
    }

    /// Start a new assembly. Returns the task whose partial state was dropped.
    pub fn begin(
        &mut self,
        task_id: TaskId,
        task_type: String,
        metadata: LargeTaskMetadata,
    ) -> Result<Option<TaskId>, IpcError> {
        let discarded = self.active.take().map(|a| a.task_id);
        if let Some(old) = discarded {
            warn!("Discarding partial payload of task {}", old);
        }

        if metadata.total_chunks == 0 {
            return Err(IpcError::Segment(format!(
                "task {} announced zero chunks",
                task_id
            )));
        }

        let capacity = (metadata.total_size as usize).min(MAX_PREALLOCATION);
        self.active = Some(Assembly {
            task_id,
            task_type,
            metadata,
            next_index: 0,
            buffer: BytesMut::with_capacity(capacity),
            saw_last: false,
        });
        Ok(discarded)
    }

    /// Append one chunk. Any violation drops the assembly.
    pub fn push_chunk(
        &mut self,
        task_id: TaskId,
        chunk_index: u32,
        total_chunks: u32,
        chunk: &[u8],
        is_last_chunk: bool,
    ) -> Result<(), IpcError> {
        let assembly = match self.active.as_mut() {
            Some(assembly) if assembly.task_id == task_id => assembly,
            _ => {
                return Err(IpcError::Segment(format!(
                    "chunk for task {} without an announcement",
                    task_id
                )))
            }
        };

        let problem = if assembly.saw_last {
            Some(format!("chunk {} arrived after the last chunk", chunk_index))
        } else if chunk_index != assembly.next_index {
            Some(format!(
                "expected chunk {} but received {}",
                assembly.next_index, chunk_index
            ))
        } else if total_chunks != assembly.metadata.total_chunks {
            Some(format!(
                "chunk count changed from {} to {}",
                assembly.metadata.total_chunks, total_chunks
            ))
        } else if is_last_chunk != (chunk_index + 1 == total_chunks) {
            Some(format!("last-chunk flag mismatch at chunk {}", chunk_index))
        } else if (assembly.buffer.len() + chunk.len()) as u64 > assembly.metadata.total_size {
            Some(format!(
                "payload exceeds announced size of {} bytes",
                assembly.metadata.total_size
            ))
        } else {
            None
        };

        if let Some(problem) = problem {
            self.active = None;
            return Err(IpcError::Segment(format!("task {}: {}", task_id, problem)));
        }

        assembly.buffer.extend_from_slice(chunk);
        assembly.next_index += 1;
        assembly.saw_last = is_last_chunk;
        Ok(())
    }

    /// Complete the assembly and rebuild the payload
    pub fn finalize(&mut self, task_id: TaskId) -> Result<(String, Payload), IpcError> {
        let assembly = match self.active.take() {
            Some(assembly) if assembly.task_id == task_id => assembly,
            other => {
                self.active = other;
                return Err(IpcError::Segment(format!(
                    "finalize for task {} without an active transfer",
                    task_id
                )));
            }
        };

        if !assembly.saw_last || assembly.buffer.len() as u64 != assembly.metadata.total_size {
            return Err(IpcError::Segment(format!(
                "task {} finalized with {} of {} chunks ({} of {} bytes)",
                task_id,
                assembly.next_index,
                assembly.metadata.total_chunks,
                assembly.buffer.len(),
                assembly.metadata.total_size
            )));
        }

        let payload = Payload::from_bytes(assembly.metadata.encoding, assembly.buffer.freeze())?;
        Ok((assembly.task_type, payload))
    }

    /// Drop partial state for the task, if it is the active one
    pub fn abort(&mut self, task_id: TaskId) -> bool {
        if self.active_task() == Some(task_id) {
            self.active = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn policy() -> TransferPolicy {
        TransferPolicy {
            threshold: 16,
            chunk_size: 10,
        }
    }

    fn feed(
        assembler: &mut LargeTaskAssembler,
        messages: Vec<WorkerMessage>,
    ) -> Result<(String, Payload), IpcError> {
        let mut finished = None;
        for message in messages {
            match message {
                WorkerMessage::InitLargeTask {
                    task_id,
                    task_type,
                    metadata,
                } => {
                    assembler.begin(task_id, task_type, metadata)?;
                }
                WorkerMessage::LargeTaskChunk {
                    task_id,
                    chunk_index,
                    total_chunks,
                    chunk,
                    is_last_chunk,
                } => assembler.push_chunk(task_id, chunk_index, total_chunks, &chunk, is_last_chunk)?,
                WorkerMessage::FinalizeLargeTask { task_id, .. } => {
                    finished = Some(assembler.finalize(task_id)?)
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }
        Ok(finished.expect("transfer was not finalized"))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WorkerMessage>) -> Vec<WorkerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[tokio::test]
    async fn test_small_payload_is_sent_whole() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let payload = TaskPayload::Bytes(Bytes::from_static(b"tiny"));
        deliver(&tx, Uuid::new_v4(), "hashChunk", &payload, policy())
            .await
            .unwrap();

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], WorkerMessage::Task { .. }));
    }

    #[tokio::test]
    async fn test_large_payload_segments_and_reassembles() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let data: Vec<u8> = (0..45u8).collect();
        let task_id = Uuid::new_v4();
        deliver(&tx, task_id, "hashChunk", &TaskPayload::from(data.clone()), policy())
            .await
            .unwrap();

        let messages = drain(&mut rx);
        // init + 5 chunks + finalize
        assert_eq!(messages.len(), 7);
        match &messages[5] {
            WorkerMessage::LargeTaskChunk {
                chunk_index,
                chunk,
                is_last_chunk,
                ..
            } => {
                assert_eq!(*chunk_index, 4);
                assert_eq!(chunk.len(), 5);
                assert!(*is_last_chunk);
            }
            other => panic!("unexpected message: {:?}", other),
        }

        let mut assembler = LargeTaskAssembler::new();
        let (task_type, payload) = feed(&mut assembler, messages).unwrap();
        assert_eq!(task_type, "hashChunk");
        assert_eq!(payload, Payload::Bytes(Bytes::from(data)));
        assert!(assembler.active_task().is_none());
    }

    #[tokio::test]
    async fn test_small_json_is_sent_whole() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let value = json!({ "n": 1 });
        deliver(&tx, Uuid::new_v4(), "echo", &TaskPayload::from(value.clone()), policy())
            .await
            .unwrap();

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            WorkerMessage::Task { payload, .. } => assert_eq!(payload, &Payload::Json(value)),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_large_json_keeps_encoding() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let value = json!({ "fileSize": 1_000_000, "chunkSize": 4096, "note": "segmented" });
        deliver(&tx, Uuid::new_v4(), "calculateChunks", &TaskPayload::from(value.clone()), policy())
            .await
            .unwrap();

        let (_, payload) = feed(&mut LargeTaskAssembler::new(), drain(&mut rx)).unwrap();
        assert_eq!(payload, Payload::Json(value));
    }

    #[tokio::test]
    async fn test_file_payload_is_streamed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        file.write_all(&data).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let payload = TaskPayload::File(file.path().to_path_buf());
        let policy = TransferPolicy {
            threshold: 100,
            chunk_size: 64,
        };
        deliver(&tx, Uuid::new_v4(), "hashChunk", &payload, policy)
            .await
            .unwrap();

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 2 + 16);
        let (_, rebuilt) = feed(&mut LargeTaskAssembler::new(), messages).unwrap();
        assert_eq!(rebuilt, Payload::Bytes(Bytes::from(data)));
    }

    #[tokio::test]
    async fn test_missing_file_fails_transfer() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let payload = TaskPayload::File("/nonexistent/upload.bin".into());
        let err = deliver(&tx, Uuid::new_v4(), "hashChunk", &payload, policy())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::TransferFailed(_)));
    }

    #[tokio::test]
    async fn test_closed_channel_fails_transfer() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let err = deliver(&tx, Uuid::new_v4(), "echo", &TaskPayload::from(vec![0u8; 64]), policy())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::TransferFailed(_)));
    }

    fn metadata(total_size: u64, total_chunks: u32) -> LargeTaskMetadata {
        LargeTaskMetadata {
            total_size,
            total_chunks,
            encoding: PayloadEncoding::Bytes,
        }
    }

    #[test]
    fn test_out_of_order_chunk_drops_assembly() {
        let mut assembler = LargeTaskAssembler::new();
        let task_id = Uuid::new_v4();
        assembler.begin(task_id, "echo".into(), metadata(6, 2)).unwrap();

        let err = assembler.push_chunk(task_id, 1, 2, b"def", true).unwrap_err();
        assert!(matches!(err, IpcError::Segment(_)));
        assert!(assembler.active_task().is_none());
    }

    #[test]
    fn test_oversized_and_incomplete_transfers_rejected() {
        let mut assembler = LargeTaskAssembler::new();
        let task_id = Uuid::new_v4();
        assembler.begin(task_id, "echo".into(), metadata(4, 2)).unwrap();
        assert!(assembler.push_chunk(task_id, 0, 2, b"abcde", false).is_err());

        assembler.begin(task_id, "echo".into(), metadata(6, 2)).unwrap();
        assembler.push_chunk(task_id, 0, 2, b"abc", false).unwrap();
        assert!(assembler.finalize(task_id).is_err());
    }

    #[test]
    fn test_new_announcement_discards_previous() {
        let mut assembler = LargeTaskAssembler::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assembler.begin(first, "echo".into(), metadata(6, 2)).unwrap();
        assembler.push_chunk(first, 0, 2, b"abc", false).unwrap();

        let discarded = assembler.begin(second, "echo".into(), metadata(3, 1)).unwrap();
        assert_eq!(discarded, Some(first));
        assert!(assembler.push_chunk(first, 1, 2, b"def", true).is_err());

        assembler.begin(second, "echo".into(), metadata(3, 1)).unwrap();
        assembler.push_chunk(second, 0, 1, b"xyz", true).unwrap();
        let (_, payload) = assembler.finalize(second).unwrap();
        assert_eq!(payload, Payload::Bytes(Bytes::from_static(b"xyz")));
    }

    #[test]
    fn test_abort_only_affects_matching_task() {
        let mut assembler = LargeTaskAssembler::new();
        let task_id = Uuid::new_v4();
        assembler.begin(task_id, "echo".into(), metadata(3, 1)).unwrap();

        assert!(!assembler.abort(Uuid::new_v4()));
        assert!(assembler.abort(task_id));
        assert!(assembler.active_task().is_none());
    }
}

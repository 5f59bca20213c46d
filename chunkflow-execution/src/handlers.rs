//! Task handlers shared by execution contexts and the fallback executor
//!
//! Both paths run the same [`TaskRegistry`], so a task produces the same
//! result whether it ran in a context or inline.

use chunkflow_ipc::Payload;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::{ExecutionError, ExecutionResult};

/// A named, synchronous unit of work
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> &str;

    fn handle(&self, payload: Payload) -> ExecutionResult<JsonValue>;
}

/// Lookup table from task type to handler
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the reference handlers
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(CalculateChunks);
        registry.register(HashChunk);
        registry.register(Echo);
        registry
    }

    pub fn register<H: TaskHandler + 'static>(&mut self, handler: H) -> &mut Self {
        self.handlers
            .insert(handler.task_type().to_string(), Arc::new(handler));
        self
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Run a handler, turning panics into task failures
    pub fn execute(&self, task_type: &str, payload: Payload) -> ExecutionResult<JsonValue> {
        let handler = self
            .handlers
            .get(task_type)
            .ok_or_else(|| ExecutionError::UnknownTaskType(task_type.to_string()))?;

        match catch_unwind(AssertUnwindSafe(|| handler.handle(payload))) {
            Ok(result) => result,
            Err(panic) => Err(ExecutionError::TaskFailed(format!(
                "handler '{}' panicked: {}",
                task_type,
                panic_message(panic.as_ref())
            ))),
        }
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn json_input<T: for<'de> Deserialize<'de>>(payload: Payload, task_type: &str) -> ExecutionResult<T> {
    match payload {
        Payload::Json(value) => serde_json::from_value(value)
            .map_err(|e| ExecutionError::InvalidPayload(format!("{}: {}", task_type, e))),
        Payload::Bytes(_) => Err(ExecutionError::InvalidPayload(format!(
            "{} expects a structured payload",
            task_type
        ))),
    }
}

/// Splits a file of `fileSize` bytes into `chunkSize` ranges
pub struct CalculateChunks;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkPlanInput {
    file_size: u64,
    chunk_size: u64,
}

impl TaskHandler for CalculateChunks {
    fn task_type(&self) -> &str {
        "calculateChunks"
    }

    fn handle(&self, payload: Payload) -> ExecutionResult<JsonValue> {
        let input: ChunkPlanInput = json_input(payload, self.task_type())?;
        if input.chunk_size == 0 {
            return Err(ExecutionError::InvalidPayload(
                "calculateChunks: chunkSize must be greater than 0".to_string(),
            ));
        }

        let total = input.file_size.div_ceil(input.chunk_size);
        let chunks: Vec<JsonValue> = (0..total)
            .map(|index| {
                let start = index * input.chunk_size;
                let end = (start + input.chunk_size).min(input.file_size);
                json!({ "index": index, "start": start, "end": end, "size": end - start })
            })
            .collect();

        Ok(json!({ "totalChunks": total, "chunks": chunks }))
    }
}

/// SHA-256 of a raw buffer
pub struct HashChunk;

impl TaskHandler for HashChunk {
    fn task_type(&self) -> &str {
        "hashChunk"
    }

    fn handle(&self, payload: Payload) -> ExecutionResult<JsonValue> {
        match payload {
            Payload::Bytes(bytes) => {
                let digest = Sha256::digest(&bytes);
                Ok(json!({ "hash": hex::encode(digest), "size": bytes.len() }))
            }
            Payload::Json(_) => Err(ExecutionError::InvalidPayload(
                "hashChunk expects a binary payload".to_string(),
            )),
        }
    }
}

/// Returns structured input unchanged and describes binary input
pub struct Echo;

impl TaskHandler for Echo {
    fn task_type(&self) -> &str {
        "echo"
    }

    fn handle(&self, payload: Payload) -> ExecutionResult<JsonValue> {
        Ok(match payload {
            Payload::Json(value) => value,
            Payload::Bytes(bytes) => json!({ "size": bytes.len() }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    struct Explode;

    impl TaskHandler for Explode {
        fn task_type(&self) -> &str {
            "explode"
        }

        fn handle(&self, _payload: Payload) -> ExecutionResult<JsonValue> {
            panic!("kaboom")
        }
    }

    #[test]
    fn test_calculate_chunks() {
        let registry = TaskRegistry::with_builtins();
        let result = registry
            .execute(
                "calculateChunks",
                Payload::Json(json!({ "fileSize": 25, "chunkSize": 10 })),
            )
            .unwrap();

        assert_eq!(result["totalChunks"], 3);
        assert_eq!(result["chunks"][2], json!({ "index": 2, "start": 20, "end": 25, "size": 5 }));
    }

    #[test]
    fn test_calculate_chunks_rejects_zero_chunk_size() {
        let registry = TaskRegistry::with_builtins();
        let err = registry
            .execute(
                "calculateChunks",
                Payload::Json(json!({ "fileSize": 25, "chunkSize": 0 })),
            )
            .unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidPayload(_)));
    }

    #[test]
    fn test_hash_chunk() {
        let registry = TaskRegistry::with_builtins();
        let result = registry
            .execute("hashChunk", Payload::Bytes(Bytes::from_static(b"abc")))
            .unwrap();
        assert_eq!(
            result["hash"],
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(result["size"], 3);

        let err = registry
            .execute("hashChunk", Payload::Json(json!("abc")))
            .unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidPayload(_)));
    }

    #[test]
    fn test_unknown_task_type() {
        let registry = TaskRegistry::with_builtins();
        let err = registry.execute("resize", Payload::Json(json!({}))).unwrap_err();
        assert!(matches!(err, ExecutionError::UnknownTaskType(t) if t == "resize"));
    }

    #[test]
    fn test_panics_become_failures() {
        let mut registry = TaskRegistry::new();
        registry.register(Explode);
        let err = registry.execute("explode", Payload::Json(json!(null))).unwrap_err();
        match err {
            ExecutionError::TaskFailed(message) => assert!(message.contains("kaboom")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_registry_lists_types() {
        let registry = TaskRegistry::with_builtins();
        assert_eq!(registry.task_types(), vec!["calculateChunks", "echo", "hashChunk"]);
        assert!(registry.contains("echo"));
    }
}

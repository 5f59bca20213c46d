//! Context-side message loop
//!
//! [`ContextRuntime`] is the state machine every execution context runs,
//! whether it lives on a thread in this process or in a child process
//! speaking over stdio (see [`worker_main`]).

use chunkflow_ipc::{
    CoordinatorMessage, IpcError, IpcTransport, MessageEnvelope, Payload, StdioTransport, TaskId,
    WorkerMessage,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::handlers::TaskRegistry;
use crate::transfer::LargeTaskAssembler;

/// Replies produced by one inbound message
#[derive(Debug, Default)]
pub struct RuntimeStep {
    pub replies: Vec<CoordinatorMessage>,
    /// The context should stop after sending the replies
    pub exit: bool,
}

impl RuntimeStep {
    fn reply(message: CoordinatorMessage) -> Self {
        Self {
            replies: vec![message],
            exit: false,
        }
    }

    fn none() -> Self {
        Self::default()
    }
}

pub struct ContextRuntime {
    registry: Arc<TaskRegistry>,
    assembler: LargeTaskAssembler,
    context_id: Option<String>,
    category: Option<String>,
    tasks_handled: u64,
}

impl ContextRuntime {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self {
            registry,
            assembler: LargeTaskAssembler::new(),
            context_id: None,
            category: None,
            tasks_handled: 0,
        }
    }

    pub fn context_id(&self) -> Option<&str> {
        self.context_id.as_deref()
    }

    pub fn tasks_handled(&self) -> u64 {
        self.tasks_handled
    }

    /// Process one message from the manager
    pub fn handle(&mut self, message: WorkerMessage) -> RuntimeStep {
        match message {
            WorkerMessage::Init {
                context_id,
                category,
            } => {
                debug!("Context {} initialized for category {}", context_id, category);
                self.context_id = Some(context_id.clone());
                self.category = Some(category);
                RuntimeStep::reply(CoordinatorMessage::Ready { context_id })
            }
            WorkerMessage::Ping { timestamp } => {
                RuntimeStep::reply(CoordinatorMessage::Pong { timestamp })
            }
            WorkerMessage::Terminate => RuntimeStep {
                replies: vec![CoordinatorMessage::TerminateAck],
                exit: true,
            },
            WorkerMessage::Task {
                task_id,
                task_type,
                payload,
            } => RuntimeStep::reply(self.run(task_id, &task_type, payload)),
            WorkerMessage::InitLargeTask {
                task_id,
                task_type,
                metadata,
            } => match self.assembler.begin(task_id, task_type, metadata) {
                Ok(_) => RuntimeStep::none(),
                Err(e) => RuntimeStep::reply(fault(task_id, e)),
            },
            WorkerMessage::LargeTaskChunk {
                task_id,
                chunk_index,
                total_chunks,
                chunk,
                is_last_chunk,
            } => match self
                .assembler
                .push_chunk(task_id, chunk_index, total_chunks, &chunk, is_last_chunk)
            {
                Ok(()) => RuntimeStep::none(),
                Err(e) => RuntimeStep::reply(fault(task_id, e)),
            },
            WorkerMessage::FinalizeLargeTask { task_id, .. } => {
                match self.assembler.finalize(task_id) {
                    Ok((task_type, payload)) => {
                        RuntimeStep::reply(self.run(task_id, &task_type, payload))
                    }
                    Err(e) => RuntimeStep::reply(fault(task_id, e)),
                }
            }
            WorkerMessage::AbortLargeTask { task_id } => {
                if self.assembler.abort(task_id) {
                    debug!("Dropped partial payload of task {}", task_id);
                }
                RuntimeStep::none()
            }
        }
    }

    fn run(&mut self, task_id: TaskId, task_type: &str, payload: Payload) -> CoordinatorMessage {
        self.tasks_handled += 1;
        match self.registry.execute(task_type, payload) {
            Ok(result) => CoordinatorMessage::success(task_id, result),
            Err(e) => {
                debug!("Task {} ({}) failed: {}", task_id, task_type, e);
                CoordinatorMessage::failure(task_id, e.to_string())
            }
        }
    }
}

fn fault(task_id: TaskId, error: IpcError) -> CoordinatorMessage {
    warn!("Segmented transfer for task {} rejected: {}", task_id, error);
    CoordinatorMessage::Error {
        task_id: Some(task_id),
        message: error.to_string(),
    }
}

/// Entry point of a process context: serve the manager over stdin/stdout
/// until it sends a terminate notice or closes the pipe.
pub async fn worker_main(registry: TaskRegistry) -> Result<(), IpcError> {
    let mut transport = StdioTransport::default();
    let mut runtime = ContextRuntime::new(Arc::new(registry));
    info!("Execution context started (pid {})", std::process::id());

    loop {
        let envelope: MessageEnvelope<WorkerMessage> = match transport.receive().await {
            Ok(envelope) => envelope,
            Err(IpcError::ConnectionClosed) => {
                info!("Manager closed the channel, exiting");
                return Ok(());
            }
            Err(e) if e.is_recoverable() => {
                warn!("Discarding unreadable message: {}", e);
                let report = CoordinatorMessage::Error {
                    task_id: None,
                    message: e.to_string(),
                };
                transport.send(&MessageEnvelope::new(report)).await?;
                continue;
            }
            Err(e) => {
                error!("Fatal IPC error: {}", e);
                return Err(e);
            }
        };

        let step = runtime.handle(envelope.message);
        for reply in step.replies {
            transport.send(&MessageEnvelope::new(reply)).await?;
        }
        if step.exit {
            info!(
                "Terminating after {} tasks",
                runtime.tasks_handled()
            );
            transport.close().await?;
            return Ok(());
        }
    }
}

//! Starting execution contexts
//!
//! A launcher turns a category's bootstrap description into a running
//! context and hands back the two channel ends the manager talks through.
//! In-process contexts run [`ContextRuntime`] on a dedicated OS thread;
//! process contexts run `chunkflow worker` (or any program speaking the same
//! JSON-lines protocol) as a child process.

use async_trait::async_trait;
use chunkflow_config::{BootstrapConfig, CategoryPoolConfig};
use chunkflow_ipc::{
    ChildProcessTransport, CoordinatorMessage, FrameReader, FrameWriter, IpcError, MessageEnvelope,
    WorkerMessage,
};
use chunkflow_resilience::ProcessShutdownManager;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::context::ContextId;
use crate::error::ExecutionResult;
use crate::handlers::TaskRegistry;
use crate::runtime::ContextRuntime;

/// One-shot action that destroys a context
pub struct KillSwitch(Option<Box<dyn FnOnce() + Send>>);

impl KillSwitch {
    pub fn new(kill: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(kill)))
    }

    pub fn noop() -> Self {
        Self(None)
    }

    /// Run the action. Later calls do nothing.
    pub fn trigger(&mut self) {
        if let Some(kill) = self.0.take() {
            kill();
        }
    }
}

impl std::fmt::Debug for KillSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("KillSwitch").field(&self.0.is_some()).finish()
    }
}

/// Channel ends of a freshly launched context.
///
/// The context has exited once `inbox` yields `None`.
#[derive(Debug)]
pub struct ContextLink {
    pub outbox: mpsc::UnboundedSender<WorkerMessage>,
    pub inbox: mpsc::UnboundedReceiver<CoordinatorMessage>,
    pub kill: KillSwitch,
}

#[async_trait]
pub trait ContextLauncher: Send + Sync {
    async fn launch(
        &self,
        context_id: ContextId,
        category: &CategoryPoolConfig,
    ) -> ExecutionResult<ContextLink>;

    /// Whether contexts can run in parallel with the caller at all
    fn supports_parallelism(&self) -> bool {
        true
    }
}

/// Threads for in-process categories, child processes for the rest
pub struct DefaultLauncher {
    registry: Arc<TaskRegistry>,
    kill_grace: Duration,
}

impl DefaultLauncher {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self {
            registry,
            kill_grace: Duration::from_secs(2),
        }
    }

    /// Time a child process gets between SIGTERM and SIGKILL
    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    fn launch_thread(&self, context_id: ContextId, category: &str) -> ExecutionResult<ContextLink> {
        let (outbox, mut worker_rx) = mpsc::unbounded_channel::<WorkerMessage>();
        let (worker_tx, inbox) = mpsc::unbounded_channel::<CoordinatorMessage>();
        let stop = Arc::new(AtomicBool::new(false));

        let registry = self.registry.clone();
        let stopped = stop.clone();
        let short_id: String = context_id.simple().to_string().chars().take(8).collect();
        std::thread::Builder::new()
            .name(format!("chunkflow-{}-{}", category, short_id))
            .spawn(move || {
                let mut runtime = ContextRuntime::new(registry);
                while let Some(message) = worker_rx.blocking_recv() {
                    if stopped.load(Ordering::Acquire) {
                        break;
                    }
                    let step = runtime.handle(message);
                    for reply in step.replies {
                        if worker_tx.send(reply).is_err() {
                            return;
                        }
                    }
                    if step.exit {
                        break;
                    }
                }
                debug!("Context thread exiting after {} tasks", runtime.tasks_handled());
            })
            .map_err(|e| IpcError::LaunchFailed(format!("thread spawn failed: {}", e)))?;

        // A running handler cannot be interrupted; the thread stops at its next message.
        let kill = KillSwitch::new(move || stop.store(true, Ordering::Release));
        Ok(ContextLink {
            outbox,
            inbox,
            kill,
        })
    }

    fn launch_process(
        &self,
        context_id: ContextId,
        program: &str,
        args: &[String],
    ) -> ExecutionResult<ContextLink> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| IpcError::LaunchFailed(format!("{}: {}", program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| IpcError::LaunchFailed("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| IpcError::LaunchFailed("child stdout unavailable".to_string()))?;
        let (writer, reader) = ChildProcessTransport::new(stdin, stdout).into_split()?;

        info!(
            "Launched process context {} (pid {:?})",
            context_id,
            child.id()
        );

        let (outbox, worker_rx) = mpsc::unbounded_channel();
        let (worker_tx, inbox) = mpsc::unbounded_channel();
        tokio::spawn(write_frames(writer, worker_rx));
        tokio::spawn(read_frames(reader, worker_tx));

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let grace = self.kill_grace;
        tokio::spawn(async move {
            let killed = tokio::select! {
                _ = kill_rx => true,
                status = child.wait() => {
                    debug!("Process context {} exited: {:?}", context_id, status);
                    false
                }
            };
            if killed {
                if let Err(e) = ProcessShutdownManager::shutdown_process(child, grace).await {
                    warn!("Failed to stop process context {}: {}", context_id, e);
                }
            }
        });

        let kill = KillSwitch::new(move || {
            let _ = kill_tx.send(());
        });
        Ok(ContextLink {
            outbox,
            inbox,
            kill,
        })
    }
}

async fn write_frames(
    mut writer: FrameWriter<ChildStdin>,
    mut outbox: mpsc::UnboundedReceiver<WorkerMessage>,
) {
    while let Some(message) = outbox.recv().await {
        if let Err(e) = writer.write(&MessageEnvelope::new(message)).await {
            debug!("Process context stdin closed: {}", e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_frames(
    mut reader: FrameReader<ChildStdout>,
    inbox: mpsc::UnboundedSender<CoordinatorMessage>,
) {
    loop {
        let message = match reader.read::<CoordinatorMessage>().await {
            Ok(envelope) => envelope.message,
            Err(IpcError::ConnectionClosed) => return,
            Err(e) if e.is_recoverable() => CoordinatorMessage::Error {
                task_id: None,
                message: format!("unreadable frame from context: {}", e),
            },
            Err(e) => {
                warn!("Dropping process context after IPC error: {}", e);
                return;
            }
        };
        if inbox.send(message).is_err() {
            return;
        }
    }
}

#[async_trait]
impl ContextLauncher for DefaultLauncher {
    async fn launch(
        &self,
        context_id: ContextId,
        category: &CategoryPoolConfig,
    ) -> ExecutionResult<ContextLink> {
        match &category.bootstrap {
            BootstrapConfig::InProcess => self.launch_thread(context_id, &category.name),
            BootstrapConfig::Process { program, args } => {
                self.launch_process(context_id, program, args)
            }
        }
    }

    fn supports_parallelism(&self) -> bool {
        std::thread::available_parallelism().is_ok()
    }
}

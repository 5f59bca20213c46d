//! Public handle to a running pool

use chunkflow_config::{PoolConfig, Validatable};
use chunkflow_ipc::TaskId;
use chunkflow_logging::StructuredLogger;
use chunkflow_resilience::{ShutdownCoordinator, ShutdownPhase};
use serde_json::Value as JsonValue;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::dispatcher::{Command, Dispatcher, DispatcherParts};
use crate::error::{ExecutionError, ExecutionResult};
use crate::events::EventSink;
use crate::factory::ContextFactory;
use crate::fallback::FallbackExecutor;
use crate::handlers::TaskRegistry;
use crate::launcher::{ContextLauncher, DefaultLauncher};
use crate::sizing::{PressureProbe, SysinfoProbe};
use crate::status::{PoolStatus, ShutdownReport};
use crate::task::{TaskRequest, TaskSubmission};

/// Deferred result of a submitted task
#[derive(Debug)]
pub struct TaskHandle {
    task_id: TaskId,
    rx: oneshot::Receiver<ExecutionResult<JsonValue>>,
}

impl TaskHandle {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }
}

impl Future for TaskHandle {
    type Output = ExecutionResult<JsonValue>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ExecutionError::ManagerStopped)))
    }
}

/// Cloneable handle to a worker pool.
///
/// The pool shuts down without a grace period once every handle is dropped.
#[derive(Clone)]
pub struct PoolManager {
    commands: mpsc::UnboundedSender<Command>,
    coordinator: Arc<ShutdownCoordinator>,
    default_timeout: Duration,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("phase", &self.coordinator.phase())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl PoolManager {
    pub fn builder(
        config: PoolConfig,
        events: Arc<dyn EventSink>,
        logger: Arc<dyn StructuredLogger>,
    ) -> PoolManagerBuilder {
        PoolManagerBuilder {
            config,
            events,
            logger,
            launcher: None,
            registry: None,
            pressure: None,
        }
    }

    /// Admit a task. The returned handle resolves with its result.
    pub fn submit(&self, submission: TaskSubmission) -> TaskHandle {
        let request = TaskRequest::from_submission(submission, self.default_timeout);
        let task_id = request.id;
        let (responder, rx) = oneshot::channel();

        if !self.coordinator.is_accepting() {
            let _ = responder.send(Err(ExecutionError::ShuttingDown));
        } else if let Err(mpsc::error::SendError(Command::Submit { responder, .. })) =
            self.commands.send(Command::Submit { request, responder })
        {
            let _ = responder.send(Err(ExecutionError::ManagerStopped));
        }

        TaskHandle { task_id, rx }
    }

    /// Snapshot of contexts, queues and counters
    pub async fn status(&self) -> ExecutionResult<PoolStatus> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Status { reply })
            .map_err(|_| ExecutionError::ManagerStopped)?;
        rx.await.map_err(|_| ExecutionError::ManagerStopped)
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.coordinator.phase()
    }

    /// Drain, cancel what is left and destroy every context
    pub async fn terminate(&self) -> ExecutionResult<ShutdownReport> {
        self.coordinator
            .begin_drain()
            .map_err(|_| ExecutionError::ShuttingDown)?;

        let drained = match self.coordinator.drain().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Cancelling remaining work: {}", e);
                false
            }
        };
        self.coordinator.begin_termination();

        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Terminate { drained, reply })
            .map_err(|_| ExecutionError::ManagerStopped)?;
        rx.await.map_err(|_| ExecutionError::ManagerStopped)
    }

    /// Resolve once the pool has fully terminated
    pub async fn terminated(&self) {
        self.coordinator.wait_terminated().await
    }
}

pub struct PoolManagerBuilder {
    config: PoolConfig,
    events: Arc<dyn EventSink>,
    logger: Arc<dyn StructuredLogger>,
    launcher: Option<Arc<dyn ContextLauncher>>,
    registry: Option<TaskRegistry>,
    pressure: Option<Box<dyn PressureProbe>>,
}

impl PoolManagerBuilder {
    /// Replace the thread/process launcher
    pub fn launcher(mut self, launcher: Arc<dyn ContextLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Handlers used by in-process contexts and the fallback executor
    pub fn registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn pressure_probe(mut self, probe: impl PressureProbe + 'static) -> Self {
        self.pressure = Some(Box::new(probe));
        self
    }

    /// Validate the configuration and spawn the control loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> ExecutionResult<PoolManager> {
        self.config.validate()?;

        let registry = Arc::new(self.registry.unwrap_or_else(TaskRegistry::with_builtins));
        let launcher = self
            .launcher
            .unwrap_or_else(|| Arc::new(DefaultLauncher::new(registry.clone())));
        let factory = Arc::new(ContextFactory::new(
            launcher,
            self.config.readiness_timeout,
            self.events.clone(),
        ));
        let coordinator = Arc::new(ShutdownCoordinator::new(self.config.shutdown_grace_period));
        let (commands, command_rx) = mpsc::unbounded_channel();

        info!(
            "Starting pool manager: {} categories, at most {} contexts",
            self.config.categories.len(),
            self.config.max_workers
        );
        let default_timeout = self.config.worker_task_timeout;
        let dispatcher = Dispatcher::new(DispatcherParts {
            config: self.config,
            factory,
            fallback: FallbackExecutor::new(registry),
            pressure: self
                .pressure
                .unwrap_or_else(|| Box::new(SysinfoProbe::new())),
            coordinator: coordinator.clone(),
            events: self.events,
            logger: self.logger,
            commands: command_rx,
        });
        tokio::spawn(dispatcher.run());

        Ok(PoolManager {
            commands,
            coordinator,
            default_timeout,
        })
    }
}

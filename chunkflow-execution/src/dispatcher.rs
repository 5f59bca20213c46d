//! The control loop
//!
//! A single task owns every context, queue and pending task. Handles reach it
//! through [`Command`]s; contexts, timers, creation jobs, transfers and
//! fallback runs report back through one internal event channel. Nothing here
//! is shared, so nothing here is locked.

use chrono::Utc;
use chunkflow_config::{CategoryPoolConfig, PoolConfig};
use chunkflow_ipc::{CoordinatorMessage, TaskId, WorkerMessage};
use chunkflow_logging::{classify_fault, ErrorInfo, LogEvent, LogLevel, StructuredLogger};
use chunkflow_resilience::{CircuitBreaker, CircuitBreakerConfig, ShutdownCoordinator, ShutdownPhase};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::context::{ContextId, ContextStatus, ExecutionContext};
use crate::error::{ExecutionError, ExecutionResult};
use crate::events::{EventSink, LifecycleEvent, RestartReason};
use crate::factory::{ContextFactory, LiveContext};
use crate::fallback::FallbackExecutor;
use crate::health::{HealthAction, HealthMonitor};
use crate::queue::AdmissionQueue;
use crate::sizing::{CategoryLoad, PoolSizingController, PressureProbe, SizingDecision};
use crate::status::{CategoryStatus, PoolStatus, ShutdownReport};
use crate::task::TaskRequest;
use crate::transfer::{deliver, TransferPolicy};

pub(crate) type Responder = oneshot::Sender<ExecutionResult<JsonValue>>;

pub(crate) enum Command {
    Submit {
        request: TaskRequest,
        responder: Responder,
    },
    Status {
        reply: oneshot::Sender<PoolStatus>,
    },
    Terminate {
        drained: bool,
        reply: oneshot::Sender<ShutdownReport>,
    },
}

enum Event {
    Context {
        id: ContextId,
        message: CoordinatorMessage,
    },
    ContextClosed {
        id: ContextId,
    },
    TaskTimedOut {
        task_id: TaskId,
        dispatch_id: u64,
    },
    CreationFinished {
        job: u64,
        category: String,
        purpose: CreationPurpose,
        result: ExecutionResult<LiveContext>,
    },
    TransferFinished {
        task_id: TaskId,
        dispatch_id: u64,
        result: ExecutionResult<()>,
    },
    FallbackFinished {
        job: u64,
        result: ExecutionResult<JsonValue>,
    },
}

enum CreationPurpose {
    Fill,
    Replace {
        old: ContextId,
        reason: RestartReason,
    },
}

/// Why a creation job was not started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CreationRefusal {
    /// No parallelism, or the pool is past draining
    Unavailable,
    CategoryFull,
    /// `max_workers` is reached across all categories
    GlobalCap,
    BreakerOpen,
}

/// A queued task
struct Waiting {
    request: TaskRequest,
    responder: Responder,
    attempts: u32,
}

/// A task assigned to a context
struct PendingTask {
    request: TaskRequest,
    responder: Responder,
    seq: u64,
    attempts: u32,
    context_id: ContextId,
    dispatch_id: u64,
    timer: JoinHandle<()>,
    transfer: Option<JoinHandle<()>>,
    /// Handed to a transfer task, which may have split it into segments
    segmented: bool,
}

impl PendingTask {
    fn clear_timers(&mut self) {
        self.timer.abort();
        if let Some(transfer) = self.transfer.take() {
            transfer.abort();
        }
    }
}

struct FallbackJob {
    responder: Responder,
    handle: JoinHandle<()>,
}

struct CategoryState {
    config: CategoryPoolConfig,
    target: usize,
    creating: usize,
    queue: AdmissionQueue<Waiting>,
}

/// Everything the control loop needs, assembled by the manager builder
pub(crate) struct DispatcherParts {
    pub config: PoolConfig,
    pub factory: Arc<ContextFactory>,
    pub fallback: FallbackExecutor,
    pub pressure: Box<dyn PressureProbe>,
    pub coordinator: Arc<ShutdownCoordinator>,
    pub events: Arc<dyn EventSink>,
    pub logger: Arc<dyn StructuredLogger>,
    pub commands: mpsc::UnboundedReceiver<Command>,
}

pub(crate) struct Dispatcher {
    config: PoolConfig,
    order: Vec<String>,
    categories: HashMap<String, CategoryState>,
    contexts: HashMap<ContextId, ExecutionContext>,
    pending: HashMap<TaskId, PendingTask>,
    fallbacks: HashMap<u64, FallbackJob>,
    creations: HashMap<u64, JoinHandle<()>>,
    /// Armed task timers by dispatch id
    timers: HashMap<u64, AbortHandle>,
    next_job: u64,
    next_dispatch: u64,
    factory: Arc<ContextFactory>,
    fallback: FallbackExecutor,
    parallel: bool,
    health: HealthMonitor,
    sizing: PoolSizingController,
    pressure: Box<dyn PressureProbe>,
    breaker: CircuitBreaker,
    transfer: TransferPolicy,
    coordinator: Arc<ShutdownCoordinator>,
    events: Arc<dyn EventSink>,
    logger: Arc<dyn StructuredLogger>,
    commands: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<Event>,
    event_rx: mpsc::UnboundedReceiver<Event>,
}

impl Dispatcher {
    pub fn new(parts: DispatcherParts) -> Self {
        let DispatcherParts {
            config,
            factory,
            fallback,
            pressure,
            coordinator,
            events,
            logger,
            commands,
        } = parts;

        let order: Vec<String> = config.categories.iter().map(|c| c.name.clone()).collect();
        let categories = config
            .categories
            .iter()
            .map(|c| {
                (
                    c.name.clone(),
                    CategoryState {
                        config: c.clone(),
                        target: c.pool_size,
                        creating: 0,
                        queue: AdmissionQueue::new(),
                    },
                )
            })
            .collect();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            order,
            categories,
            contexts: HashMap::new(),
            pending: HashMap::new(),
            fallbacks: HashMap::new(),
            creations: HashMap::new(),
            timers: HashMap::new(),
            next_job: 0,
            next_dispatch: 0,
            parallel: factory.supports_parallelism(),
            health: HealthMonitor::from_config(&config),
            sizing: PoolSizingController::from_config(&config),
            breaker: CircuitBreaker::new(CircuitBreakerConfig {
                failure_threshold: config.max_creation_failures,
                success_threshold: 1,
                cooldown: config.creation_retry_cooldown,
            }),
            transfer: TransferPolicy {
                threshold: config.max_data_transfer_size,
                chunk_size: config.transfer_chunk_size,
            },
            factory,
            fallback,
            pressure,
            coordinator,
            events,
            logger,
            commands,
            event_tx,
            event_rx,
            config,
        }
    }

    pub async fn run(mut self) {
        if self.parallel {
            for name in self.order.clone() {
                self.refill(&name);
            }
        } else {
            info!("Parallel execution unavailable, every task runs inline");
        }

        let period = self.config.health_check_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(Command::Submit { request, responder }) => self.on_submit(request, responder),
                    Some(Command::Status { reply }) => {
                        let _ = reply.send(self.status());
                    }
                    Some(Command::Terminate { drained, reply }) => {
                        let report = self.shutdown(drained).await;
                        let _ = reply.send(report);
                        break;
                    }
                    None => {
                        debug!("All pool manager handles dropped, terminating");
                        let _ = self.coordinator.begin_drain();
                        self.coordinator.begin_termination();
                        self.shutdown(false).await;
                        break;
                    }
                },
                Some(event) = self.event_rx.recv() => self.on_event(event),
                _ = ticker.tick() => self.on_tick(),
            }
        }
        debug!("Pool control loop stopped");
    }

    // ---- admission and dispatch ----

    fn on_submit(&mut self, request: TaskRequest, responder: Responder) {
        if !self.coordinator.is_accepting() {
            let _ = responder.send(Err(ExecutionError::ShuttingDown));
            return;
        }
        if !self.categories.contains_key(&request.category) {
            let _ = responder.send(Err(ExecutionError::UnknownCategory(request.category)));
            return;
        }
        if !self.fallback.supports(&request.task_type) {
            let _ = responder.send(Err(ExecutionError::UnknownTaskType(request.task_type)));
            return;
        }

        self.coordinator.task_started();
        debug!(
            "Admitted task {} ({}/{}, priority {})",
            request.id, request.category, request.task_type, request.priority
        );

        if !self.parallel {
            self.run_fallback(request, responder, "parallel execution unavailable".to_string());
            return;
        }

        let category = request.category.clone();
        if let Some(state) = self.categories.get_mut(&category) {
            state.queue.push(
                request.priority,
                Waiting {
                    request,
                    responder,
                    attempts: 0,
                },
            );
        }
        self.dispatch(&category);
        self.ensure_capacity(&category);
    }

    /// Hand queued tasks to idle contexts until one side runs out
    fn dispatch(&mut self, category: &str) {
        loop {
            let Some(context_id) = self.idle_context(category) else {
                return;
            };
            let Some((seq, waiting)) = self
                .categories
                .get_mut(category)
                .and_then(|state| state.queue.pop())
            else {
                return;
            };
            self.assign(context_id, seq, waiting);
        }
    }

    fn idle_context(&self, category: &str) -> Option<ContextId> {
        self.contexts
            .values()
            .filter(|ctx| ctx.category == category && ctx.is_available())
            .min_by_key(|ctx| (ctx.tasks_completed, ctx.created_at))
            .map(|ctx| ctx.id)
    }

    fn assign(&mut self, context_id: ContextId, seq: u64, waiting: Waiting) {
        if !self.contexts.contains_key(&context_id) {
            if let Some(state) = self.categories.get_mut(&waiting.request.category) {
                state.queue.push_at(waiting.request.priority, seq, waiting);
            }
            return;
        }
        let Waiting {
            request,
            responder,
            attempts,
        } = waiting;
        let Some(ctx) = self.contexts.get_mut(&context_id) else {
            return;
        };

        self.next_dispatch += 1;
        let dispatch_id = self.next_dispatch;
        let task_id = request.id;

        let tx = self.event_tx.clone();
        let after = request.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(Event::TaskTimedOut {
                task_id,
                dispatch_id,
            });
        });

        self.timers.insert(dispatch_id, timer.abort_handle());
        ctx.assign(task_id);
        let inline = request
            .payload
            .known_size()
            .filter(|size| !self.transfer.needs_segmenting(*size))
            .and_then(|_| request.payload.to_wire());

        let (transfer, segmented) = match inline {
            Some(payload) => {
                let message = WorkerMessage::Task {
                    task_id,
                    task_type: request.task_type.clone(),
                    payload,
                };
                if let Err(e) = ctx.send(message) {
                    // the pump reports the closed channel and the task is recovered then
                    debug!("Dispatch of task {} failed: {}", task_id, e);
                }
                (None, false)
            }
            None => {
                let outbox = ctx.outbox().clone();
                let tx = self.event_tx.clone();
                let task_type = request.task_type.clone();
                let payload = request.payload.clone();
                let policy = self.transfer;
                let handle = tokio::spawn(async move {
                    let result = deliver(&outbox, task_id, &task_type, &payload, policy).await;
                    let _ = tx.send(Event::TransferFinished {
                        task_id,
                        dispatch_id,
                        result,
                    });
                });
                (Some(handle), true)
            }
        };

        debug!("Task {} assigned to context {}", task_id, context_id);
        self.pending.insert(
            task_id,
            PendingTask {
                request,
                responder,
                seq,
                attempts,
                context_id,
                dispatch_id,
                timer,
                transfer,
                segmented,
            },
        );
    }

    /// Grow towards the target when tasks wait, or give up on the pool
    fn ensure_capacity(&mut self, category: &str) {
        let live = self.live_in(category);
        let Some(state) = self.categories.get(category) else {
            return;
        };
        if state.queue.is_empty() || self.idle_context(category).is_some() {
            return;
        }

        let mut creating = state.creating;
        let queued = state.queue.len();
        let target = state.target;
        let mut refusal = None;
        while live + creating < target && creating < queued {
            match self.spawn_creation(category, CreationPurpose::Fill) {
                Ok(()) => creating += 1,
                Err(reason) => {
                    refusal = Some(reason);
                    break;
                }
            }
        }

        if live > 0 || creating > 0 {
            return;
        }
        if refusal == Some(CreationRefusal::GlobalCap) && self.reclaim_for(category) {
            return;
        }
        self.abandon_queue(category, "no execution context can be created");
    }

    /// Free a slot under the global cap for a category without contexts.
    ///
    /// Only categories holding more than one context give one up, idle ones
    /// immediately and busy ones when their next task settles. Returns false
    /// when no category can give anything up.
    fn reclaim_for(&mut self, starved: &str) -> bool {
        let mut donors: Vec<String> = self
            .order
            .iter()
            .filter(|name| name.as_str() != starved && self.live_in(name) > 1)
            .cloned()
            .collect();
        if donors.is_empty() {
            return false;
        }
        donors.sort_by_key(|name| {
            let baseline = self
                .categories
                .get(name)
                .map_or(0, |state| state.config.pool_size);
            std::cmp::Reverse(self.live_in(name).saturating_sub(baseline))
        });

        let idle = donors
            .iter()
            .find_map(|name| self.idle_context(name).map(|id| (name.clone(), id)));
        let Some((donor, id)) = idle else {
            debug!("Category {} waits for a busy context to be reclaimed", starved);
            return true;
        };

        info!("Reclaiming context {} of {} for category {}", id, donor, starved);
        self.retire(id);
        self.spawn_creation(starved, CreationPurpose::Fill).is_ok()
    }

    /// Tasks are queued but the category has no context, live or coming
    fn is_starved(&self, category: &str) -> bool {
        self.categories.get(category).is_some_and(|state| {
            !state.queue.is_empty() && state.creating == 0 && self.live_in(category) == 0
        })
    }

    /// First category other than `except` that is starved
    fn starved_category(&self, except: &str) -> Option<String> {
        self.order
            .iter()
            .find(|name| name.as_str() != except && self.is_starved(name))
            .cloned()
    }

    /// Retire a just-freed context the pool no longer wants: one above the
    /// category target, or one of several while another category has none.
    fn release_surplus(&mut self, id: ContextId, category: &str) {
        if self.contexts.get(&id).is_none_or(|ctx| !ctx.is_available()) {
            return;
        }
        let live = self.live_in(category);
        let target = self.categories.get(category).map_or(0, |state| state.target);
        if live > target {
            debug!("Category {} is above its target of {}", category, target);
            self.retire(id);
            return;
        }
        if live > 1 {
            if let Some(starved) = self.starved_category(category) {
                self.retire(id);
                self.ensure_capacity(&starved);
            }
        }
    }

    /// Route every queued task of a category away from the pool
    fn abandon_queue(&mut self, category: &str, reason: &str) {
        let Some(state) = self.categories.get_mut(category) else {
            return;
        };
        let waiting = state.queue.drain();
        if waiting.is_empty() {
            return;
        }
        warn!(
            "Routing {} queued tasks of category {} away from the pool: {}",
            waiting.len(),
            category,
            reason
        );
        for task in waiting {
            self.fallback_or_fail(
                task.request,
                task.responder,
                ExecutionError::NoContextAvailable(category.to_string()),
            );
        }
    }

    /// Stop the timer and any transfer of a task leaving the pending set
    fn disarm(&mut self, pending: &mut PendingTask) {
        self.timers.remove(&pending.dispatch_id);
        pending.clear_timers();
    }

    // ---- settling ----

    fn settle(&self, responder: Responder, result: ExecutionResult<JsonValue>) {
        let _ = responder.send(result);
        self.coordinator.task_completed();
    }

    fn fallback_or_fail(&mut self, request: TaskRequest, responder: Responder, cause: ExecutionError) {
        if self.config.fallback_to_main_thread {
            self.run_fallback(request, responder, cause.to_string());
        } else {
            self.settle(responder, Err(cause));
        }
    }

    fn run_fallback(&mut self, request: TaskRequest, responder: Responder, reason: String) {
        self.events.emit(LifecycleEvent::FallbackExecuted {
            task_id: request.id,
            category: request.category.clone(),
            task_type: request.task_type.clone(),
            reason: reason.clone(),
        });
        self.logger.log(
            LogEvent::new(LogLevel::Info, "Task executed inline")
                .with_field("task_id", request.id)
                .with_field("category", &request.category)
                .with_field("reason", &reason),
        );

        self.next_job += 1;
        let job = self.next_job;
        let executor = self.fallback.clone();
        let tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            let result = executor.run(request.task_type, request.payload).await;
            let _ = tx.send(Event::FallbackFinished { job, result });
        });
        self.fallbacks.insert(job, FallbackJob { responder, handle });
    }

    // ---- events ----

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Context { id, message } => self.on_context_message(id, message),
            Event::ContextClosed { id } => self.on_context_closed(id),
            Event::TaskTimedOut {
                task_id,
                dispatch_id,
            } => self.on_timeout(task_id, dispatch_id),
            Event::CreationFinished {
                job,
                category,
                purpose,
                result,
            } => self.on_creation_finished(job, &category, purpose, result),
            Event::TransferFinished {
                task_id,
                dispatch_id,
                result,
            } => self.on_transfer_finished(task_id, dispatch_id, result),
            Event::FallbackFinished { job, result } => {
                if let Some(fallback) = self.fallbacks.remove(&job) {
                    self.settle(fallback.responder, result);
                }
            }
        }
    }

    fn on_context_message(&mut self, id: ContextId, message: CoordinatorMessage) {
        let Some(category) = self.contexts.get(&id).map(|ctx| ctx.category.clone()) else {
            return;
        };

        match message {
            CoordinatorMessage::Response {
                task_id,
                success,
                result,
                error,
            } => {
                let owned = self
                    .pending
                    .get(&task_id)
                    .is_some_and(|pending| pending.context_id == id);
                if owned {
                    if let Some(mut pending) = self.pending.remove(&task_id) {
                        self.disarm(&mut pending);
                        let outcome = if success {
                            Ok(result.unwrap_or(JsonValue::Null))
                        } else {
                            Err(ExecutionError::TaskFailed(
                                error.unwrap_or_else(|| "task failed".to_string()),
                            ))
                        };
                        self.settle(pending.responder, outcome);
                    }
                    if let Some(ctx) = self.contexts.get_mut(&id) {
                        ctx.tasks_completed += 1;
                        ctx.release();
                        ctx.record_response();
                    }
                    self.release_surplus(id, &category);
                } else {
                    debug!("Discarding late response for task {} from {}", task_id, id);
                    if let Some(ctx) = self.contexts.get_mut(&id) {
                        ctx.record_late_response();
                    }
                }
                self.dispatch(&category);
            }
            CoordinatorMessage::Pong { .. } => {
                if let Some(ctx) = self.contexts.get_mut(&id) {
                    ctx.record_response();
                }
                self.dispatch(&category);
            }
            CoordinatorMessage::Ready { .. } | CoordinatorMessage::TerminateAck => {}
            CoordinatorMessage::Error { task_id, message } => {
                self.on_context_error(id, &category, task_id, message)
            }
        }
    }

    fn on_context_error(
        &mut self,
        id: ContextId,
        category: &str,
        task_id: Option<TaskId>,
        message: String,
    ) {
        self.report_fault(id, category, &message);

        let failed = task_id.filter(|task_id| {
            self.pending
                .get(task_id)
                .is_some_and(|pending| pending.context_id == id)
        });
        if let Some(mut pending) = failed.and_then(|task_id| self.pending.remove(&task_id)) {
            self.disarm(&mut pending);
            if let Some(ctx) = self.contexts.get_mut(&id) {
                ctx.release();
            }
            if pending.segmented {
                self.fallback_or_fail(
                    pending.request,
                    pending.responder,
                    ExecutionError::TransferFailed(message),
                );
            } else {
                self.settle(pending.responder, Err(ExecutionError::TaskFailed(message)));
            }
        }

        let action = match self.contexts.get_mut(&id) {
            Some(ctx) => self.health.on_fault(ctx),
            None => return,
        };
        match action {
            HealthAction::Restart(reason) => self.restart(id, reason),
            HealthAction::Probe | HealthAction::Nothing => self.dispatch(category),
        }
    }

    fn report_fault(&self, id: ContextId, category: &str, message: &str) {
        let (fault_category, severity) = classify_fault(message);
        self.events.emit(LifecycleEvent::ContextFault {
            context_id: id,
            category: category.to_string(),
            message: message.to_string(),
            fault_category,
            severity,
        });
        self.logger.log(
            LogEvent::new(LogLevel::Warn, "Execution context fault")
                .with_field("context_id", id)
                .with_field("category", category)
                .with_error(ErrorInfo::classified("CONTEXT_FAULT", message)),
        );
    }

    fn on_context_closed(&mut self, id: ContextId) {
        let Some(category) = self.contexts.get_mut(&id).map(|ctx| {
            ctx.record_fault();
            ctx.mark_error();
            ctx.category.clone()
        }) else {
            return;
        };
        self.report_fault(id, &category, "execution context channel closed unexpectedly");
        self.restart(id, RestartReason::ChannelClosed);
    }

    fn on_timeout(&mut self, task_id: TaskId, dispatch_id: u64) {
        let current = self
            .pending
            .get(&task_id)
            .is_some_and(|pending| pending.dispatch_id == dispatch_id);
        if !current {
            return;
        }
        let Some(mut pending) = self.pending.remove(&task_id) else {
            return;
        };
        let segmented = pending.segmented;
        self.disarm(&mut pending);
        warn!(
            "Task {} timed out after {:?} on context {}",
            task_id, pending.request.timeout, pending.context_id
        );
        self.settle(
            pending.responder,
            Err(ExecutionError::Timeout {
                task_id,
                after: pending.request.timeout,
            }),
        );

        let context_id = pending.context_id;
        let action = match self.contexts.get_mut(&context_id) {
            Some(ctx) => {
                if segmented {
                    let _ = ctx.send(WorkerMessage::AbortLargeTask { task_id });
                }
                ctx.release();
                self.health.on_timeout(ctx)
            }
            None => return,
        };
        match action {
            HealthAction::Restart(reason) => self.restart(context_id, reason),
            HealthAction::Probe | HealthAction::Nothing => {
                let category = pending.request.category;
                self.release_surplus(context_id, &category);
                self.dispatch(&category);
                self.ensure_capacity(&category);
            }
        }
    }

    fn on_transfer_finished(&mut self, task_id: TaskId, dispatch_id: u64, result: ExecutionResult<()>) {
        let current = self
            .pending
            .get(&task_id)
            .is_some_and(|pending| pending.dispatch_id == dispatch_id);
        if !current {
            return;
        }

        match result {
            Ok(()) => {
                if let Some(pending) = self.pending.get_mut(&task_id) {
                    pending.transfer = None;
                }
            }
            Err(e) => {
                let Some(mut pending) = self.pending.remove(&task_id) else {
                    return;
                };
                self.disarm(&mut pending);
                warn!("Transfer of task {} failed: {}", task_id, e);
                if let Some(ctx) = self.contexts.get_mut(&pending.context_id) {
                    let _ = ctx.send(WorkerMessage::AbortLargeTask { task_id });
                    ctx.release();
                }
                let category = pending.request.category.clone();
                let cause = match e {
                    ExecutionError::TransferFailed(_) => e,
                    other => ExecutionError::TransferFailed(other.to_string()),
                };
                self.fallback_or_fail(pending.request, pending.responder, cause);
                self.dispatch(&category);
            }
        }
    }

    // ---- context lifecycle ----

    fn live_in(&self, category: &str) -> usize {
        self.contexts
            .values()
            .filter(|ctx| ctx.category == category)
            .count()
    }

    fn total_size(&self) -> usize {
        self.contexts.len() + self.categories.values().map(|c| c.creating).sum::<usize>()
    }

    /// Start a creation job if the caps and the creation breaker allow it
    fn spawn_creation(
        &mut self,
        category: &str,
        purpose: CreationPurpose,
    ) -> Result<(), CreationRefusal> {
        if !self.parallel || self.coordinator.phase() > ShutdownPhase::Draining {
            return Err(CreationRefusal::Unavailable);
        }
        let live = self.live_in(category);
        let total = self.total_size();
        let Some(state) = self.categories.get(category) else {
            return Err(CreationRefusal::Unavailable);
        };
        if live + state.creating >= state.config.max_pool_size {
            return Err(CreationRefusal::CategoryFull);
        }
        if total >= self.config.max_workers {
            return Err(CreationRefusal::GlobalCap);
        }
        if !self.breaker.allow_request() {
            debug!("Creation breaker open, not creating a context for {}", category);
            return Err(CreationRefusal::BreakerOpen);
        }

        let config = state.config.clone();
        if let Some(state) = self.categories.get_mut(category) {
            state.creating += 1;
        }
        self.next_job += 1;
        let job = self.next_job;
        let factory = self.factory.clone();
        let tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            let result = factory.create(&config).await;
            let event = Event::CreationFinished {
                job,
                category: config.name,
                purpose,
                result,
            };
            if let Err(mpsc::error::SendError(Event::CreationFinished {
                result: Ok(mut live),
                ..
            })) = tx.send(event)
            {
                live.kill.trigger();
            }
        });
        self.creations.insert(job, handle);
        Ok(())
    }

    fn on_creation_finished(
        &mut self,
        job: u64,
        category: &str,
        purpose: CreationPurpose,
        result: ExecutionResult<LiveContext>,
    ) {
        self.creations.remove(&job);
        if let Some(state) = self.categories.get_mut(category) {
            state.creating = state.creating.saturating_sub(1);
        }

        match result {
            Ok(live) => {
                self.breaker.record_success();
                let id = live.id;
                self.install(live);
                if let CreationPurpose::Replace { old, reason } = purpose {
                    info!("Context {} replaced by {} ({})", old, id, reason);
                    self.events.emit(LifecycleEvent::ContextRestarted {
                        old_context_id: old,
                        new_context_id: id,
                        category: category.to_string(),
                        reason,
                    });
                }
                self.dispatch(category);
            }
            Err(e) => {
                self.breaker.record_failure();
                if let CreationPurpose::Replace { old, .. } = purpose {
                    warn!("Replacement for context {} failed: {}", old, e);
                    self.abandon_queue(category, "context restart failed");
                }
                self.ensure_capacity(category);
            }
        }
    }

    fn install(&mut self, live: LiveContext) {
        let LiveContext {
            id,
            category,
            outbox,
            mut inbox,
            kill,
        } = live;

        let tx = self.event_tx.clone();
        let pump = tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                if tx.send(Event::Context { id, message }).is_err() {
                    return;
                }
            }
            let _ = tx.send(Event::ContextClosed { id });
        });
        self.contexts
            .insert(id, ExecutionContext::new(id, category, outbox, kill, pump));
    }

    /// Tear a context down, recover its task and start a replacement
    fn restart(&mut self, id: ContextId, reason: RestartReason) {
        let Some(ctx) = self.contexts.remove(&id) else {
            return;
        };
        let category = ctx.category.clone();
        let orphan = ctx.current_task;
        warn!("Restarting context {} of category {}: {}", id, category, reason);
        self.logger.log(
            LogEvent::new(LogLevel::Warn, "Restarting execution context")
                .with_field("context_id", id)
                .with_field("category", &category)
                .with_field("reason", reason.to_string()),
        );
        ctx.destroy();

        if let Some(task_id) = orphan {
            self.recover(task_id);
        }

        match self.spawn_creation(&category, CreationPurpose::Replace { old: id, reason }) {
            Ok(()) => self.dispatch(&category),
            Err(CreationRefusal::GlobalCap) => {
                self.dispatch(&category);
                self.ensure_capacity(&category);
            }
            Err(_) => self.abandon_queue(&category, "context restart not possible"),
        }
    }

    /// Put a task whose context was lost back in line, or give up on it
    fn recover(&mut self, task_id: TaskId) {
        let Some(mut pending) = self.pending.remove(&task_id) else {
            return;
        };
        self.disarm(&mut pending);
        let attempts = pending.attempts + 1;
        if attempts <= self.config.max_task_retries {
            debug!("Re-queueing task {} (attempt {})", task_id, attempts + 1);
            if let Some(state) = self.categories.get_mut(&pending.request.category) {
                state.queue.push_at(
                    pending.request.priority,
                    pending.seq,
                    Waiting {
                        request: pending.request,
                        responder: pending.responder,
                        attempts,
                    },
                );
            }
        } else {
            let cause = ExecutionError::ContextLost(format!(
                "task {} lost its context {} times",
                task_id, attempts
            ));
            self.fallback_or_fail(pending.request, pending.responder, cause);
        }
    }

    /// Retire one idle context of the category
    fn retire_one(&mut self, category: &str) {
        if let Some(id) = self.idle_context(category) {
            self.retire(id);
        }
    }

    /// Ask an idle context to terminate and drop it from the pool
    fn retire(&mut self, id: ContextId) {
        let Some(ctx) = self.contexts.remove(&id) else {
            return;
        };
        debug!("Retiring idle context {} of category {}", id, ctx.category);
        let _ = ctx.send(WorkerMessage::Terminate);
        self.events.emit(LifecycleEvent::ContextTerminated {
            context_id: id,
            category: ctx.category.clone(),
            acknowledged: false,
        });
        ctx.retire(self.config.terminate_ack_timeout);
    }

    // ---- periodic work ----

    fn on_tick(&mut self) {
        let ids: Vec<ContextId> = self.contexts.keys().copied().collect();
        for id in ids {
            let action = match self.contexts.get_mut(&id) {
                Some(ctx) => self.health.on_probe_tick(ctx),
                None => continue,
            };
            match action {
                HealthAction::Probe => {
                    if let Some(ctx) = self.contexts.get(&id) {
                        let _ = ctx.send(WorkerMessage::Ping {
                            timestamp: Utc::now().timestamp_millis(),
                        });
                    }
                }
                HealthAction::Restart(reason) => self.restart(id, reason),
                HealthAction::Nothing => {}
            }
        }

        if self.config.auto_adjust_pool && self.parallel {
            let pressure = self.pressure.sample();
            for name in self.order.clone() {
                let load = self.load_of(&name);
                let headroom = self.config.max_workers.saturating_sub(self.total_size());
                match self.sizing.decide(load, pressure, headroom) {
                    SizingDecision::Grow { to } => {
                        debug!("Growing category {} to {}", name, to);
                        if let Some(state) = self.categories.get_mut(&name) {
                            state.target = to;
                        }
                    }
                    SizingDecision::Shrink { to } => {
                        debug!("Shrinking category {} to {}", name, to);
                        if let Some(state) = self.categories.get_mut(&name) {
                            state.target = to;
                        }
                        if self.live_in(&name) > to {
                            self.retire_one(&name);
                        }
                    }
                    SizingDecision::Hold => {}
                }
            }
        }

        if self.coordinator.is_accepting() {
            for name in self.order.clone() {
                if self.is_starved(&name) {
                    self.ensure_capacity(&name);
                }
            }
            for name in self.order.clone() {
                self.refill(&name);
            }
        }

        let status = self.status();
        self.events.emit(LifecycleEvent::PoolMetrics(status));
    }

    fn load_of(&self, category: &str) -> CategoryLoad {
        let idle = self
            .contexts
            .values()
            .filter(|ctx| ctx.category == category && ctx.is_available())
            .count();
        let live = self.live_in(category);
        match self.categories.get(category) {
            Some(state) => CategoryLoad {
                backlog: state.queue.len(),
                size: live + state.creating,
                idle,
                target: state.target,
                baseline: state.config.pool_size,
                max: state.config.max_pool_size,
            },
            None => CategoryLoad {
                backlog: 0,
                size: live,
                idle,
                target: 0,
                baseline: 0,
                max: 0,
            },
        }
    }

    /// Create contexts until the category reaches its target
    fn refill(&mut self, category: &str) {
        loop {
            let live = self.live_in(category);
            let Some(state) = self.categories.get(category) else {
                return;
            };
            if live + state.creating >= state.target {
                return;
            }
            if self.spawn_creation(category, CreationPurpose::Fill).is_err() {
                return;
            }
        }
    }

    // ---- reporting ----

    fn status(&mut self) -> PoolStatus {
        let mut contexts: Vec<_> = self.contexts.values().map(|ctx| ctx.snapshot()).collect();
        contexts.sort_by_key(|snapshot| (snapshot.category.clone(), snapshot.created_at));

        let categories = self
            .order
            .iter()
            .filter_map(|name| {
                let state = self.categories.get(name)?;
                let of_category = || self.contexts.values().filter(|ctx| &ctx.category == name);
                Some(CategoryStatus {
                    name: name.clone(),
                    target_size: state.target,
                    live: of_category().count(),
                    creating: state.creating,
                    idle: of_category().filter(|ctx| ctx.is_available()).count(),
                    busy: of_category()
                        .filter(|ctx| ctx.status == ContextStatus::Busy)
                        .count(),
                    queued: state.queue.len(),
                })
            })
            .collect();

        PoolStatus {
            phase: self.coordinator.phase(),
            contexts,
            categories,
            active_tasks: self.coordinator.active_task_count(),
            in_flight: self.pending.len(),
            fallback_running: self.fallbacks.len(),
            live_timers: self.timers.len(),
            creation_breaker: self.breaker.state(),
        }
    }

    // ---- termination ----

    async fn shutdown(&mut self, drained: bool) -> ShutdownReport {
        let mut report = ShutdownReport {
            drained,
            ..ShutdownReport::default()
        };
        let cancelled = || Err(ExecutionError::Cancelled("pool manager terminated".to_string()));

        for name in self.order.clone() {
            let waiting = match self.categories.get_mut(&name) {
                Some(state) => state.queue.drain(),
                None => continue,
            };
            for task in waiting {
                self.settle(task.responder, cancelled());
                report.cancelled_tasks += 1;
            }
        }
        for (_, mut pending) in std::mem::take(&mut self.pending) {
            self.disarm(&mut pending);
            self.settle(pending.responder, cancelled());
            report.cancelled_tasks += 1;
        }
        for (_, fallback) in std::mem::take(&mut self.fallbacks) {
            fallback.handle.abort();
            self.settle(fallback.responder, cancelled());
            report.cancelled_tasks += 1;
        }
        for (_, creation) in self.creations.drain() {
            creation.abort();
        }

        let mut outstanding: HashSet<ContextId> = HashSet::new();
        for ctx in self.contexts.values() {
            if ctx.send(WorkerMessage::Terminate).is_ok() {
                outstanding.insert(ctx.id);
            }
        }

        let mut acknowledged: HashSet<ContextId> = HashSet::new();
        let deadline = Instant::now() + self.config.terminate_ack_timeout;
        while !outstanding.is_empty() {
            match tokio::time::timeout_at(deadline, self.event_rx.recv()).await {
                Ok(Some(Event::Context {
                    id,
                    message: CoordinatorMessage::TerminateAck,
                })) => {
                    if outstanding.remove(&id) {
                        acknowledged.insert(id);
                    }
                }
                Ok(Some(Event::ContextClosed { id })) => {
                    outstanding.remove(&id);
                }
                Ok(Some(Event::CreationFinished {
                    result: Ok(mut live),
                    ..
                })) => live.kill.trigger(),
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }

        for (id, ctx) in std::mem::take(&mut self.contexts) {
            let acked = acknowledged.contains(&id);
            if acked {
                report.contexts_acknowledged += 1;
            } else {
                report.contexts_forced += 1;
            }
            self.events.emit(LifecycleEvent::ContextTerminated {
                context_id: id,
                category: ctx.category.clone(),
                acknowledged: acked,
            });
            ctx.destroy();
        }

        self.coordinator.finish();
        info!(
            "Pool terminated: {} tasks cancelled, {} contexts acknowledged, {} forced",
            report.cancelled_tasks, report.contexts_acknowledged, report.contexts_forced
        );
        report
    }
}

//! Shared fixtures for pool manager integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chunkflow_config::{CategoryPoolConfig, PoolConfig};
use chunkflow_execution::{
    ChannelEventSink, ContextId, ContextLauncher, ContextLink, ContextRuntime, ExecutionError,
    ExecutionResult, KillSwitch, LifecycleEvent, NoPressure, PoolManager, PressureProbe,
    SystemPressure, TaskHandler, TaskRegistry,
};
use chunkflow_ipc::{CoordinatorMessage, Payload, WorkerMessage};
use chunkflow_logging::NoopLogger;
use serde_json::{json, Value as JsonValue};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const CATEGORY: &str = "work";

/// Handler built from a closure
pub struct FnHandler<F> {
    name: &'static str,
    run: F,
}

impl<F> TaskHandler for FnHandler<F>
where
    F: Fn(Payload) -> ExecutionResult<JsonValue> + Send + Sync,
{
    fn task_type(&self) -> &str {
        self.name
    }

    fn handle(&self, payload: Payload) -> ExecutionResult<JsonValue> {
        (self.run)(payload)
    }
}

fn label_of(payload: &Payload) -> Option<String> {
    match payload {
        Payload::Json(value) => value["label"].as_str().map(str::to_string),
        Payload::Bytes(_) => None,
    }
}

/// Builtins plus the task types the scripted contexts react to.
///
/// `sleep`, `hang`, `crash` and `flaky` are intercepted by scripted contexts;
/// the handlers below only run once a task reaches the handler itself, which
/// for `hang` and `crash` means inline fallback.
pub fn test_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::with_builtins();
    registry
        .register(handler("sleep", |payload| {
            Ok(json!({ "label": label_of(&payload) }))
        }))
        .register(handler("hang", |_| Ok(json!({ "inline": true }))))
        .register(handler("crash", |_| Ok(json!({ "inline": true }))))
        .register(handler("flaky", |_| Ok(json!({ "recovered": true }))))
        .register(handler("panic", |_| panic!("handler blew up")));
    registry
}

fn handler<F>(name: &'static str, run: F) -> FnHandler<F>
where
    F: Fn(Payload) -> ExecutionResult<JsonValue> + Send + Sync,
{
    FnHandler { name, run }
}

/// Launches contexts as tokio tasks around [`ContextRuntime`]
pub struct ScriptedLauncher {
    registry: Arc<TaskRegistry>,
    launches: AtomicUsize,
    failing_launches: AtomicUsize,
    healthy_launches: Option<usize>,
    deaf_to_pings: bool,
    parallel: bool,
    crashed_once: Arc<AtomicBool>,
    dispatched: Arc<Mutex<Vec<String>>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(test_registry()),
            launches: AtomicUsize::new(0),
            failing_launches: AtomicUsize::new(0),
            healthy_launches: None,
            deaf_to_pings: false,
            parallel: true,
            crashed_once: Arc::new(AtomicBool::new(false)),
            dispatched: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fail the next `count` launches
    pub fn failing(self, count: usize) -> Self {
        self.failing_launches.store(count, Ordering::SeqCst);
        self
    }

    /// Let the first `count` launches succeed and fail every later one
    pub fn fail_after(mut self, count: usize) -> Self {
        self.healthy_launches = Some(count);
        self
    }

    pub fn deaf_to_pings(mut self) -> Self {
        self.deaf_to_pings = true;
        self
    }

    pub fn without_parallelism(mut self) -> Self {
        self.parallel = false;
        self
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Labels of tasks in the order contexts received them
    pub fn dispatched(&self) -> Vec<String> {
        self.dispatched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContextLauncher for ScriptedLauncher {
    async fn launch(
        &self,
        _context_id: ContextId,
        _category: &CategoryPoolConfig,
    ) -> ExecutionResult<ContextLink> {
        let launched = self.launches.fetch_add(1, Ordering::SeqCst);
        let exhausted = self.healthy_launches.is_some_and(|limit| launched >= limit);
        if exhausted
            || self
                .failing_launches
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(ExecutionError::CreationFailed("scripted launch failure".into()));
        }

        let (outbox, worker_rx) = mpsc::unbounded_channel();
        let (worker_tx, inbox) = mpsc::unbounded_channel();
        let script = Script {
            registry: self.registry.clone(),
            deaf_to_pings: self.deaf_to_pings,
            crashed_once: self.crashed_once.clone(),
            dispatched: self.dispatched.clone(),
        };
        let handle = tokio::spawn(script.serve(worker_rx, worker_tx));

        Ok(ContextLink {
            outbox,
            inbox,
            kill: KillSwitch::new(move || handle.abort()),
        })
    }

    fn supports_parallelism(&self) -> bool {
        self.parallel
    }
}

struct Script {
    registry: Arc<TaskRegistry>,
    deaf_to_pings: bool,
    crashed_once: Arc<AtomicBool>,
    dispatched: Arc<Mutex<Vec<String>>>,
}

impl Script {
    async fn serve(
        self,
        mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
        tx: mpsc::UnboundedSender<CoordinatorMessage>,
    ) {
        let mut runtime = ContextRuntime::new(self.registry.clone());
        while let Some(message) = rx.recv().await {
            match &message {
                WorkerMessage::Ping { .. } if self.deaf_to_pings => continue,
                WorkerMessage::Task {
                    task_type, payload, ..
                } => {
                    let label = label_of(payload).unwrap_or_else(|| task_type.clone());
                    self.dispatched.lock().unwrap().push(label);
                    match task_type.as_str() {
                        "sleep" => {
                            if let Payload::Json(value) = payload {
                                let ms = value["ms"].as_u64().unwrap_or(0);
                                tokio::time::sleep(Duration::from_millis(ms)).await;
                            }
                        }
                        "hang" => std::future::pending::<()>().await,
                        "crash" => return,
                        "flaky" if !self.crashed_once.swap(true, Ordering::SeqCst) => return,
                        _ => {}
                    }
                }
                _ => {}
            }

            let step = runtime.handle(message);
            for reply in step.replies {
                if tx.send(reply).is_err() {
                    return;
                }
            }
            if step.exit {
                return;
            }
        }
    }
}

/// Single-category config with probes and sizing out of the way
pub fn pool_config(pool_size: usize, max_pool_size: usize) -> PoolConfig {
    PoolConfig {
        max_workers: 8,
        worker_task_timeout: Duration::from_secs(5),
        auto_adjust_pool: false,
        health_check_interval: Duration::from_secs(3600),
        categories: vec![CategoryPoolConfig::new(CATEGORY, pool_size, max_pool_size)],
        ..PoolConfig::default()
    }
}

/// Reports the same pressure on every sample
pub struct FixedPressure(pub SystemPressure);

impl FixedPressure {
    pub fn memory(ratio: f64) -> Self {
        Self(SystemPressure {
            memory_ratio: Some(ratio),
            cpu_ratio: None,
        })
    }
}

impl PressureProbe for FixedPressure {
    fn sample(&mut self) -> SystemPressure {
        self.0
    }
}

pub fn start(
    config: PoolConfig,
    launcher: Arc<ScriptedLauncher>,
) -> (PoolManager, mpsc::UnboundedReceiver<LifecycleEvent>) {
    start_with_pressure(config, launcher, NoPressure)
}

pub fn start_with_pressure(
    config: PoolConfig,
    launcher: Arc<ScriptedLauncher>,
    pressure: impl PressureProbe + 'static,
) -> (PoolManager, mpsc::UnboundedReceiver<LifecycleEvent>) {
    let (tx, events) = mpsc::unbounded_channel();
    let manager = PoolManager::builder(
        config,
        Arc::new(ChannelEventSink::new(tx)),
        Arc::new(NoopLogger),
    )
    .launcher(launcher)
    .registry(test_registry())
    .pressure_probe(pressure)
    .start()
    .unwrap();
    (manager, events)
}

/// Poll status until the default category has `count` idle contexts
pub async fn wait_for_idle(manager: &PoolManager, count: usize) {
    wait_for_idle_in(manager, CATEGORY, count).await
}

pub async fn wait_for_idle_in(manager: &PoolManager, category: &str, count: usize) {
    for _ in 0..1000 {
        let status = manager.status().await.unwrap();
        if status.category(category).is_some_and(|c| c.idle >= count) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never reached {} idle contexts", category, count);
}

pub fn drain_events(events: &mut mpsc::UnboundedReceiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

pub fn sleep_task(label: &str, ms: u64) -> JsonValue {
    json!({ "label": label, "ms": ms })
}

//! Graceful shutdown coordination
//!
//! The coordinator tracks the shutdown phase and the number of active tasks.
//! Phases only move forward: accepting, draining, terminating, terminated.

use log::{error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

/// Lifecycle phase of a component that is being shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPhase {
    /// New work is admitted
    Accepting,
    /// New work is refused, admitted work may finish
    Draining,
    /// Remaining work is being cancelled
    Terminating,
    /// Nothing is left running
    Terminated,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Accepting => write!(f, "accepting"),
            ShutdownPhase::Draining => write!(f, "draining"),
            ShutdownPhase::Terminating => write!(f, "terminating"),
            ShutdownPhase::Terminated => write!(f, "terminated"),
        }
    }
}

/// Graceful shutdown coordinator
pub struct ShutdownCoordinator {
    phase: watch::Sender<ShutdownPhase>,
    active_tasks: AtomicUsize,
    grace_period: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator with the given drain window
    pub fn new(grace_period: Duration) -> Self {
        let (phase, _) = watch::channel(ShutdownPhase::Accepting);
        Self {
            phase,
            active_tasks: AtomicUsize::new(0),
            grace_period,
        }
    }

    /// Subscribe to phase changes
    pub fn subscribe(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase.subscribe()
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn is_accepting(&self) -> bool {
        self.phase() == ShutdownPhase::Accepting
    }

    /// Check if shutdown is in progress
    pub fn is_shutting_down(&self) -> bool {
        self.phase() != ShutdownPhase::Accepting
    }

    /// Increment active task counter
    pub fn task_started(&self) {
        self.active_tasks.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement active task counter
    pub fn task_completed(&self) {
        let _ = self
            .active_tasks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                Some(count.saturating_sub(1))
            });
    }

    /// Get current active task count
    pub fn active_task_count(&self) -> usize {
        self.active_tasks.load(Ordering::SeqCst)
    }

    /// Stop admitting work. Only the first caller succeeds.
    pub fn begin_drain(&self) -> Result<(), ShutdownError> {
        let mut started = false;
        self.phase.send_if_modified(|phase| {
            if *phase == ShutdownPhase::Accepting {
                *phase = ShutdownPhase::Draining;
                started = true;
                true
            } else {
                false
            }
        });

        if started {
            info!("Starting graceful shutdown");
            Ok(())
        } else {
            Err(ShutdownError::AlreadyShuttingDown)
        }
    }

    /// Wait for active work to finish within the grace period.
    ///
    /// Returns `Err(TasksRemaining)` when the window expires first.
    pub async fn drain(&self) -> Result<(), ShutdownError> {
        if self.wait_for_tasks(self.grace_period).await {
            info!("All active tasks drained");
            Ok(())
        } else {
            let remaining = self.active_task_count();
            warn!(
                "Grace period of {:?} expired with {} tasks still active",
                self.grace_period, remaining
            );
            Err(ShutdownError::TasksRemaining(remaining))
        }
    }

    /// Enter the cancellation phase
    pub fn begin_termination(&self) {
        self.advance_to(ShutdownPhase::Terminating);
    }

    /// Mark shutdown as complete
    pub fn finish(&self) {
        self.advance_to(ShutdownPhase::Terminated);
    }

    /// Resolve once the terminated phase is reached
    pub async fn wait_terminated(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|phase| *phase == ShutdownPhase::Terminated).await;
    }

    fn advance_to(&self, next: ShutdownPhase) {
        self.phase.send_if_modified(|phase| {
            if *phase < next {
                *phase = next;
                true
            } else {
                false
            }
        });
    }

    /// Wait for all tasks to complete within the given timeout
    async fn wait_for_tasks(&self, timeout_duration: Duration) -> bool {
        let start = tokio::time::Instant::now();

        loop {
            let active = self.active_task_count();
            if active == 0 {
                return true;
            }
            if start.elapsed() >= timeout_duration {
                return false;
            }

            // Adaptive sleep based on task count
            let sleep_duration = if active > 10 {
                Duration::from_millis(100)
            } else {
                Duration::from_millis(50)
            };
            let remaining = timeout_duration.saturating_sub(start.elapsed());
            tokio::time::sleep(sleep_duration.min(remaining)).await;
        }
    }
}

/// Shutdown error types
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    /// Shutdown already in progress
    #[error("Shutdown already in progress")]
    AlreadyShuttingDown,

    /// Tasks remaining after the grace period
    #[error("Grace period expired with {0} tasks still active")]
    TasksRemaining(usize),

    /// An external process could not be stopped
    #[error("Process shutdown error: {0}")]
    ProcessError(String),
}

/// Process shutdown manager for external processes
pub struct ProcessShutdownManager;

impl ProcessShutdownManager {
    /// Shutdown a process gracefully with escalating signals
    pub async fn shutdown_process(
        mut child: tokio::process::Child,
        graceful_timeout: Duration,
    ) -> Result<std::process::ExitStatus, ShutdownError> {
        // Phase 1: Try graceful termination (SIGTERM on Unix)
        if let Some(id) = child.id() {
            info!("Initiating graceful shutdown for process {}", id);

            #[cfg(unix)]
            {
                use nix::sys::signal::{self, Signal};
                use nix::unistd::Pid;

                if let Err(e) = signal::kill(Pid::from_raw(id as i32), Signal::SIGTERM) {
                    warn!("Failed to send SIGTERM to process {}: {}", id, e);
                }
            }
        }

        // Wait for graceful termination
        match timeout(graceful_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!("Process terminated gracefully with status: {:?}", status);
                return Ok(status);
            }
            Ok(Err(e)) => {
                error!("Error waiting for process: {}", e);
            }
            Err(_) => {
                warn!("Process did not terminate gracefully within timeout");
            }
        }

        // Phase 2: Force termination
        info!("Forcing process termination");
        if let Err(e) = child.kill().await {
            error!("Failed to kill process: {}", e);
            return Err(ShutdownError::ProcessError(e.to_string()));
        }

        match timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => {
                info!("Process terminated forcefully with status: {:?}", status);
                Ok(status)
            }
            Ok(Err(e)) => Err(ShutdownError::ProcessError(e.to_string())),
            Err(_) => Err(ShutdownError::ProcessError(
                "Process unresponsive to termination".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_task_counting() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        assert!(coordinator.is_accepting());
        assert_eq!(coordinator.active_task_count(), 0);

        coordinator.task_started();
        coordinator.task_started();
        assert_eq!(coordinator.active_task_count(), 2);

        coordinator.task_completed();
        coordinator.task_completed();
        // Extra completion doesn't go negative
        coordinator.task_completed();
        assert_eq!(coordinator.active_task_count(), 0);
    }

    #[tokio::test]
    async fn test_phases_only_move_forward() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let mut rx = coordinator.subscribe();

        coordinator.begin_drain().unwrap();
        assert!(matches!(
            coordinator.begin_drain(),
            Err(ShutdownError::AlreadyShuttingDown)
        ));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ShutdownPhase::Draining);

        coordinator.finish();
        coordinator.begin_termination();
        assert_eq!(coordinator.phase(), ShutdownPhase::Terminated);
        coordinator.wait_terminated().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_completes_when_tasks_finish() {
        let coordinator = Arc::new(ShutdownCoordinator::new(Duration::from_secs(5)));
        coordinator.task_started();

        let worker = coordinator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            worker.task_completed();
        });

        coordinator.begin_drain().unwrap();
        coordinator.drain().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(300));
        coordinator.task_started();
        coordinator.begin_drain().unwrap();

        let start = tokio::time::Instant::now();
        let result = coordinator.drain().await;
        assert!(matches!(result, Err(ShutdownError::TasksRemaining(1))));
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_shutdown_sends_sigterm() {
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();

        let status = ProcessShutdownManager::shutdown_process(child, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(!status.success());
    }
}

//! Context health rules
//!
//! Restart decisions are driven by counters only: consecutive missed
//! probes/timeouts and recorded faults.

use chunkflow_config::PoolConfig;

use crate::context::{ContextStatus, ExecutionContext};
use crate::events::RestartReason;

#[derive(Debug, Clone, PartialEq)]
pub enum HealthAction {
    Nothing,
    /// Send a liveness probe
    Probe,
    Restart(RestartReason),
}

#[derive(Debug, Clone, Copy)]
pub struct HealthMonitor {
    unresponsive_threshold: u32,
    error_restart_threshold: u32,
}

impl HealthMonitor {
    pub fn new(unresponsive_threshold: u32, error_restart_threshold: u32) -> Self {
        Self {
            unresponsive_threshold,
            error_restart_threshold,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.unresponsive_threshold, config.error_restart_threshold)
    }

    /// The context let a task time out. Call after releasing the task.
    pub fn on_timeout(&self, ctx: &mut ExecutionContext) -> HealthAction {
        let streak = ctx.record_missed();
        self.check_streak(streak)
    }

    /// Periodic probe
    pub fn on_probe_tick(&self, ctx: &mut ExecutionContext) -> HealthAction {
        if ctx.status == ContextStatus::Error {
            return HealthAction::Nothing;
        }

        if ctx.probe_outstanding {
            ctx.unresponsive_streak += 1;
            if ctx.status == ContextStatus::Idle {
                ctx.status = ContextStatus::Unresponsive;
            }
            if let HealthAction::Restart(reason) = self.check_streak(ctx.unresponsive_streak) {
                return HealthAction::Restart(reason);
            }
        }

        ctx.probe_outstanding = true;
        HealthAction::Probe
    }

    /// The context reported a runtime fault
    pub fn on_fault(&self, ctx: &mut ExecutionContext) -> HealthAction {
        let count = ctx.record_fault();
        if count >= self.error_restart_threshold {
            ctx.mark_error();
            HealthAction::Restart(RestartReason::Faults { count })
        } else {
            HealthAction::Nothing
        }
    }

    fn check_streak(&self, streak: u32) -> HealthAction {
        if streak >= self.unresponsive_threshold {
            HealthAction::Restart(RestartReason::Unresponsive { streak })
        } else {
            HealthAction::Nothing
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::KillSwitch;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn context() -> ExecutionContext {
        let (tx, _rx) = mpsc::unbounded_channel();
        ExecutionContext::new(
            Uuid::new_v4(),
            "hash".into(),
            tx,
            KillSwitch::noop(),
            tokio::spawn(async {}),
        )
    }

    #[tokio::test]
    async fn test_timeouts_restart_at_threshold() {
        let monitor = HealthMonitor::new(3, 3);
        let mut ctx = context();

        assert_eq!(monitor.on_timeout(&mut ctx), HealthAction::Nothing);
        assert_eq!(ctx.status, ContextStatus::Unresponsive);
        assert_eq!(monitor.on_timeout(&mut ctx), HealthAction::Nothing);
        assert_eq!(
            monitor.on_timeout(&mut ctx),
            HealthAction::Restart(RestartReason::Unresponsive { streak: 3 })
        );
    }

    #[tokio::test]
    async fn test_missed_probes_accumulate() {
        let monitor = HealthMonitor::new(2, 3);
        let mut ctx = context();

        assert_eq!(monitor.on_probe_tick(&mut ctx), HealthAction::Probe);
        assert_eq!(ctx.unresponsive_streak, 0);

        // no pong before the next tick
        assert_eq!(monitor.on_probe_tick(&mut ctx), HealthAction::Probe);
        assert_eq!(ctx.unresponsive_streak, 1);
        assert_eq!(ctx.status, ContextStatus::Unresponsive);

        ctx.record_response();
        assert_eq!(ctx.status, ContextStatus::Idle);
        assert_eq!(monitor.on_probe_tick(&mut ctx), HealthAction::Probe);
        assert_eq!(monitor.on_probe_tick(&mut ctx), HealthAction::Probe);
        assert!(matches!(
            monitor.on_probe_tick(&mut ctx),
            HealthAction::Restart(RestartReason::Unresponsive { streak: 2 })
        ));
    }

    #[tokio::test]
    async fn test_busy_context_stays_busy_on_missed_probe() {
        let monitor = HealthMonitor::new(3, 3);
        let mut ctx = context();
        ctx.assign(Uuid::new_v4());

        monitor.on_probe_tick(&mut ctx);
        monitor.on_probe_tick(&mut ctx);
        assert_eq!(ctx.status, ContextStatus::Busy);
        assert_eq!(ctx.unresponsive_streak, 1);
    }

    #[tokio::test]
    async fn test_faults_mark_error() {
        let monitor = HealthMonitor::new(3, 2);
        let mut ctx = context();

        assert_eq!(monitor.on_fault(&mut ctx), HealthAction::Nothing);
        assert!(matches!(
            monitor.on_fault(&mut ctx),
            HealthAction::Restart(RestartReason::Faults { count: 2 })
        ));
        assert_eq!(ctx.status, ContextStatus::Error);
        assert_eq!(monitor.on_probe_tick(&mut ctx), HealthAction::Nothing);
    }
}

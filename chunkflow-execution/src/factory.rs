//! Context creation with a readiness handshake

use chrono::Utc;
use chunkflow_config::CategoryPoolConfig;
use chunkflow_ipc::{CoordinatorMessage, WorkerMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::ContextId;
use crate::error::{ExecutionError, ExecutionResult};
use crate::events::{EventSink, LifecycleEvent};
use crate::launcher::{ContextLauncher, ContextLink, KillSwitch};

/// A context that completed the handshake
#[derive(Debug)]
pub struct LiveContext {
    pub id: ContextId,
    pub category: String,
    pub outbox: mpsc::UnboundedSender<WorkerMessage>,
    pub inbox: mpsc::UnboundedReceiver<CoordinatorMessage>,
    pub kill: KillSwitch,
}

pub struct ContextFactory {
    launcher: Arc<dyn ContextLauncher>,
    readiness_timeout: Duration,
    events: Arc<dyn EventSink>,
}

impl ContextFactory {
    pub fn new(
        launcher: Arc<dyn ContextLauncher>,
        readiness_timeout: Duration,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            launcher,
            readiness_timeout,
            events,
        }
    }

    pub fn supports_parallelism(&self) -> bool {
        self.launcher.supports_parallelism()
    }

    /// Launch a context and wait until it answers.
    ///
    /// A context that fails the handshake is destroyed before returning.
    pub async fn create(&self, category: &CategoryPoolConfig) -> ExecutionResult<LiveContext> {
        let id = Uuid::new_v4();
        let link = match self.launcher.launch(id, category).await {
            Ok(link) => link,
            Err(e) => return Err(self.failed(&category.name, e.to_string())),
        };
        self.events.emit(LifecycleEvent::ContextCreated {
            context_id: id,
            category: category.name.clone(),
        });

        let ContextLink {
            outbox,
            mut inbox,
            mut kill,
        } = link;

        let handshake = handshake(id, &category.name, &outbox, &mut inbox);
        let outcome = match tokio::time::timeout(self.readiness_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "no readiness signal within {:?}",
                self.readiness_timeout
            )),
        };

        match outcome {
            Ok(()) => {
                debug!("Context {} ready for category {}", id, category.name);
                self.events.emit(LifecycleEvent::ContextReady {
                    context_id: id,
                    category: category.name.clone(),
                });
                Ok(LiveContext {
                    id,
                    category: category.name.clone(),
                    outbox,
                    inbox,
                    kill,
                })
            }
            Err(reason) => {
                kill.trigger();
                Err(self.failed(&category.name, format!("context {}: {}", id, reason)))
            }
        }
    }

    fn failed(&self, category: &str, reason: String) -> ExecutionError {
        warn!("Context creation failed for category {}: {}", category, reason);
        self.events.emit(LifecycleEvent::ContextCreationFailed {
            category: category.to_string(),
            reason: reason.clone(),
        });
        ExecutionError::CreationFailed(reason)
    }
}

async fn handshake(
    id: ContextId,
    category: &str,
    outbox: &mpsc::UnboundedSender<WorkerMessage>,
    inbox: &mut mpsc::UnboundedReceiver<CoordinatorMessage>,
) -> Result<(), String> {
    let closed = || "channel closed during startup".to_string();
    outbox
        .send(WorkerMessage::Init {
            context_id: id.to_string(),
            category: category.to_string(),
        })
        .map_err(|_| closed())?;
    outbox
        .send(WorkerMessage::Ping {
            timestamp: Utc::now().timestamp_millis(),
        })
        .map_err(|_| closed())?;

    loop {
        match inbox.recv().await {
            Some(CoordinatorMessage::Ready { .. }) | Some(CoordinatorMessage::Pong { .. }) => {
                return Ok(())
            }
            Some(other) => debug!("Ignoring {:?} during startup of {}", other, id),
            None => return Err(closed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelEventSink;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Contexts that never answer
    struct MuteLauncher {
        killed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ContextLauncher for MuteLauncher {
        async fn launch(
            &self,
            _context_id: ContextId,
            _category: &CategoryPoolConfig,
        ) -> ExecutionResult<ContextLink> {
            let (outbox, rx) = mpsc::unbounded_channel();
            let (tx, inbox) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                // keep both ends open without replying
                let _hold = (rx, tx);
                std::future::pending::<()>().await;
            });
            let killed = self.killed.clone();
            Ok(ContextLink {
                outbox,
                inbox,
                kill: KillSwitch::new(move || killed.store(true, Ordering::SeqCst)),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_context_is_destroyed() {
        let killed = Arc::new(AtomicBool::new(false));
        let (tx, mut events) = mpsc::unbounded_channel();
        let factory = ContextFactory::new(
            Arc::new(MuteLauncher {
                killed: killed.clone(),
            }),
            Duration::from_millis(500),
            Arc::new(ChannelEventSink::new(tx)),
        );

        let err = factory
            .create(&CategoryPoolConfig::new("hash", 1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::CreationFailed(_)));
        assert!(killed.load(Ordering::SeqCst));

        assert!(matches!(events.recv().await, Some(LifecycleEvent::ContextCreated { .. })));
        assert!(matches!(
            events.recv().await,
            Some(LifecycleEvent::ContextCreationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_thread_context_becomes_ready() {
        let (tx, mut events) = mpsc::unbounded_channel();
        let launcher = crate::launcher::DefaultLauncher::new(Arc::new(
            crate::handlers::TaskRegistry::with_builtins(),
        ));
        let factory = ContextFactory::new(
            Arc::new(launcher),
            Duration::from_secs(5),
            Arc::new(ChannelEventSink::new(tx)),
        );

        let mut live = factory
            .create(&CategoryPoolConfig::new("chunk", 1, 1))
            .await
            .unwrap();
        assert_eq!(live.category, "chunk");

        assert!(matches!(events.recv().await, Some(LifecycleEvent::ContextCreated { .. })));
        assert!(matches!(
            events.recv().await,
            Some(LifecycleEvent::ContextReady { context_id, .. }) if context_id == live.id
        ));
        live.kill.trigger();
    }
}

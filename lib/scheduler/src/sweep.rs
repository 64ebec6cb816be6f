//! Periodic approval-expiry sweep.
//!
//! The orchestrator never watches the clock. `ExpirySweeper` is the
//! collaborator that does: on every tick it calls
//! `Orchestrator::sweep_expired` with the current time, failing any
//! instance whose approval gate has passed its deadline. The same tick
//! calls `Orchestrator::resume_stalled` so an instance whose advance
//! failed part way is picked up again without a restart.

use chrono::{DateTime, Utc};
use flowgate_workflow::orchestrator::{
    Orchestrator, OrchestratorError, RecoveryReport, SweepReport,
};
use flowgate_workflow::{ActionDispatcher, ExecutionStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default time between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub expired: SweepReport,
    pub resumed: RecoveryReport,
}

/// Calls the orchestrator's expiry sweep on a fixed interval.
pub struct ExpirySweeper<S: ExecutionStore, D: ActionDispatcher> {
    orchestrator: Arc<Orchestrator<S, D>>,
    interval: Duration,
}

impl<S: ExecutionStore, D: ActionDispatcher> ExpirySweeper<S, D> {
    /// Creates a sweeper with the default interval.
    pub fn new(orchestrator: Arc<Orchestrator<S, D>>) -> Self {
        Self {
            orchestrator,
            interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    /// Sets the time between sweeps.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Returns the time between sweeps.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs one sweep as of `now`, then resumes stalled instances.
    ///
    /// # Errors
    ///
    /// Returns an error if the running instances cannot be listed.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, OrchestratorError> {
        let expired = self.orchestrator.sweep_expired(now).await?;
        let resumed = self.orchestrator.resume_stalled().await?;
        debug!(
            examined = expired.examined,
            expired = expired.expired.len(),
            resumed = resumed.resumed.len(),
            "approval sweep tick"
        );
        Ok(TickReport { expired, resumed })
    }
}

impl<S, D> ExpirySweeper<S, D>
where
    S: ExecutionStore + 'static,
    D: ActionDispatcher + 'static,
{
    /// Spawns the sweep loop onto the runtime.
    ///
    /// The first sweep runs immediately. Failed ticks are logged and the
    /// loop keeps going; abort the handle to stop it.
    pub fn spawn(self) -> JoinHandle<()> {
        info!(interval_secs = self.interval.as_secs(), "starting approval sweeper");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            loop {
                interval.tick().await;
                if let Err(e) = self.tick(Utc::now()).await {
                    warn!(error = %e, "approval sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use flowgate_workflow::{
        ActionSpec, ApprovalSpec, DomainEvent, ExecutionInstance, ExecutionStatus,
        HandlerRegistry, InMemoryExecutionStore, TriggerType, Versioned, WorkflowDefinition,
    };
    use serde_json::json;

    type Engine = Orchestrator<Arc<InMemoryExecutionStore>, HandlerRegistry>;

    fn gated() -> WorkflowDefinition {
        WorkflowDefinition::new("sign-off", TriggerType::FormSubmitted).with_action(
            ActionSpec::new("notify", 1).with_approval(ApprovalSpec::parallel(
                vec!["carol".to_string()],
                ChronoDuration::minutes(10),
            )),
        )
    }

    fn engine() -> (Arc<Engine>, Arc<InMemoryExecutionStore>) {
        let store = Arc::new(InMemoryExecutionStore::new());
        let engine = Orchestrator::new(Arc::clone(&store), HandlerRegistry::new());
        (Arc::new(engine), store)
    }

    async fn suspended(engine: &Engine) -> flowgate_core::ExecutionId {
        let event = DomainEvent::new(TriggerType::FormSubmitted, json!({}));
        let instance = engine.start_execution(&gated(), event).await.unwrap();
        assert!(instance.is_suspended());
        instance.id
    }

    #[tokio::test]
    async fn tick_expires_only_past_deadline() {
        let (engine, _store) = engine();
        let id = suspended(&engine).await;
        let sweeper = ExpirySweeper::new(Arc::clone(&engine));

        let early = sweeper.tick(Utc::now()).await.unwrap();
        assert!(early.expired.expired.is_empty());
        assert_eq!(
            engine.get(id).await.unwrap().status,
            ExecutionStatus::Running
        );

        let late = sweeper
            .tick(Utc::now() + ChronoDuration::minutes(11))
            .await
            .unwrap();
        assert_eq!(late.expired.expired, vec![id]);
        assert_eq!(engine.get(id).await.unwrap().status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn spawned_loop_sweeps_overdue_gates() {
        let (engine, store) = engine();
        let id = suspended(&engine).await;

        let Versioned {
            mut value,
            revision,
        } = store.load(id).await.unwrap().unwrap();
        value.pending_approvals[0].expires_at = Utc::now() - ChronoDuration::minutes(1);
        store.compare_and_swap(&value, revision).await.unwrap();

        let handle = ExpirySweeper::new(Arc::clone(&engine))
            .with_interval(Duration::from_millis(10))
            .spawn();
        let mut status = ExecutionStatus::Running;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = engine.get(id).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
        }
        handle.abort();

        assert_eq!(status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn tick_resumes_an_instance_left_between_actions() {
        let (engine, store) = engine();
        let definition = WorkflowDefinition::new("notify", TriggerType::FormSubmitted)
            .with_action(ActionSpec::new("notify", 1));
        let event = DomainEvent::new(TriggerType::FormSubmitted, json!({}));
        let instance = ExecutionInstance::new(&definition, event, Utc::now());
        let id = instance.id;
        store.insert(&instance).await.unwrap();

        let report = ExpirySweeper::new(Arc::clone(&engine))
            .tick(Utc::now())
            .await
            .unwrap();

        assert_eq!(report.resumed.resumed, vec![id]);
        // No handler is registered, so the action fails and so does the run.
        assert_eq!(engine.get(id).await.unwrap().status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn tick_leaves_suspended_instances_alone() {
        let (engine, _store) = engine();
        let id = suspended(&engine).await;

        let report = ExpirySweeper::new(Arc::clone(&engine))
            .tick(Utc::now())
            .await
            .unwrap();

        assert!(report.resumed.resumed.is_empty());
        assert!(engine.get(id).await.unwrap().is_suspended());
    }

    #[test]
    fn default_interval() {
        let (engine, _store) = engine();
        let sweeper = ExpirySweeper::new(engine);
        assert_eq!(sweeper.interval(), DEFAULT_SWEEP_INTERVAL);
    }
}

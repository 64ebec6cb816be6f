//! Execution orchestrator.
//!
//! Drives execution instances from creation to a terminal status. The
//! orchestrator holds no per-instance state in memory: every decision is
//! made against a freshly loaded instance, and every change is written back
//! with a compare-and-swap on the revision it was loaded at. Any number of
//! orchestrators (in one process or several) can therefore share a store.
//!
//! The per-action loop:
//! 1. Load the instance; stop if it is terminal, suspended on a gate, or
//!    another writer holds the dispatch checkpoint
//! 2. Complete it if no action is left, or cancel it if a cancel is pending
//! 3. Open an approval gate for a gated action that is not yet approved
//! 4. Otherwise write the `in_flight` checkpoint, dispatch, and record the
//!    step (a failure step fails the instance)
//!
//! Nothing here waits on a clock. Approval expiry happens only when
//! `sweep_expired` is called, and an instance whose advance failed part
//! way is driven again only by `resume_stalled` or `recover`.

use crate::approval::ApprovalError;
use crate::definition::{ActionSpec, WorkflowDefinition};
use crate::dispatch::{ActionContext, ActionDispatcher, ActionResult};
use crate::error::{DefinitionError, ExecutionError, TriggerMatchError};
use crate::execution::{ExecutionInstance, ExecutionStatus, StepResult, rejection_message};
use crate::store::{ExecutionStore, StoreError, Versioned};
use crate::trigger::{DomainEvent, TriggerMatcher};
use chrono::{DateTime, Utc};
use flowgate_core::{ExecutionId, WorkflowId};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

/// Write attempts before a mutation gives up on revision conflicts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Errors that can occur during orchestration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    /// Execution store error.
    Store(StoreError),
    /// The mutation would break an instance invariant.
    Execution(ExecutionError),
    /// The approval call was refused.
    Approval(ApprovalError),
    /// The definition cannot be executed.
    InvalidDefinition(DefinitionError),
    /// No execution with the id exists.
    NotFound { id: ExecutionId },
    /// Every write attempt lost a revision race.
    Contention { id: ExecutionId, attempts: u32 },
}

impl std::fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(e) => write!(f, "execution store error: {e}"),
            Self::Execution(e) => write!(f, "{e}"),
            Self::Approval(e) => write!(f, "approval refused: {e}"),
            Self::InvalidDefinition(e) => write!(f, "invalid definition: {e}"),
            Self::NotFound { id } => write!(f, "execution not found: {id}"),
            Self::Contention { id, attempts } => {
                write!(f, "execution {id} kept changing, gave up after {attempts} attempts")
            }
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<ExecutionError> for OrchestratorError {
    fn from(e: ExecutionError) -> Self {
        Self::Execution(e)
    }
}

impl From<ApprovalError> for OrchestratorError {
    fn from(e: ApprovalError) -> Self {
        Self::Approval(e)
    }
}

impl From<DefinitionError> for OrchestratorError {
    fn from(e: DefinitionError) -> Self {
        Self::InvalidDefinition(e)
    }
}

/// What one event did.
#[derive(Debug, Default)]
pub struct EventOutcome {
    /// Instances created for matching definitions, in match order.
    pub started: Vec<ExecutionInstance>,
    /// Definitions skipped as malformed or invalid.
    pub skipped: Vec<TriggerMatchError>,
    /// Matched definitions whose execution could not be started or driven.
    pub failed: Vec<StartFailure>,
}

/// A matched definition the orchestrator could not run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartFailure {
    pub workflow_id: WorkflowId,
    /// Set when the instance was persisted before the failure. It stays
    /// `Running` and is picked up again by `resume_stalled`.
    pub execution_id: Option<ExecutionId>,
    pub error: OrchestratorError,
}

/// Result of one expiry sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Running instances looked at.
    pub examined: usize,
    /// Instances failed because a gate expired.
    pub expired: Vec<ExecutionId>,
    /// Instances the sweep could not update.
    pub errors: usize,
}

/// Result of resuming running instances after a restart.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Instances resumed (they may still be running, e.g. suspended).
    pub resumed: Vec<ExecutionId>,
    /// Instances that could not be resumed.
    pub failed: Vec<(ExecutionId, OrchestratorError)>,
}

/// Number of instances per status.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    fn record(&mut self, status: ExecutionStatus) {
        match status {
            ExecutionStatus::Running => self.running += 1,
            ExecutionStatus::Completed => self.completed += 1,
            ExecutionStatus::Failed => self.failed += 1,
            ExecutionStatus::Cancelled => self.cancelled += 1,
        }
    }

    /// Returns the count for one status.
    #[must_use]
    pub fn get(&self, status: ExecutionStatus) -> usize {
        match status {
            ExecutionStatus::Running => self.running,
            ExecutionStatus::Completed => self.completed,
            ExecutionStatus::Failed => self.failed,
            ExecutionStatus::Cancelled => self.cancelled,
        }
    }

    /// Returns the total across all statuses.
    #[must_use]
    pub fn total(&self) -> usize {
        ExecutionStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

/// The next thing the loop should do for an instance.
enum Next {
    /// Terminal, suspended, or someone else is dispatching.
    Stop,
    Complete,
    Cancel,
    OpenGate(u32),
    Dispatch(ActionSpec),
}

fn next_step(instance: &ExecutionInstance) -> Next {
    if instance.is_terminal() || instance.in_flight.is_some() {
        return Next::Stop;
    }
    let Some(action) = instance.next_action() else {
        return Next::Complete;
    };
    if instance.cancel_requested.is_some() {
        return Next::Cancel;
    }
    if action.is_gated() && !instance.is_approved(action.order) {
        if instance.pending_approval(action.order).is_some() {
            return Next::Stop;
        }
        return Next::OpenGate(action.order);
    }
    Next::Dispatch(action.clone())
}

/// The workflow execution orchestrator.
pub struct Orchestrator<S: ExecutionStore, D: ActionDispatcher> {
    store: S,
    dispatcher: D,
    matcher: TriggerMatcher,
    max_attempts: u32,
}

impl<S: ExecutionStore, D: ActionDispatcher> Orchestrator<S, D> {
    /// Creates an orchestrator over a store and dispatcher.
    pub fn new(store: S, dispatcher: D) -> Self {
        Self {
            store,
            dispatcher,
            matcher: TriggerMatcher::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Sets how many times a write is retried on revision conflicts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Returns the execution store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the action dispatcher.
    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// Starts one execution per definition the event matches.
    ///
    /// Every match is independent. Malformed and invalid definitions are
    /// reported as skipped, and a match whose instance cannot be created or
    /// advanced is reported as failed; neither stops the others.
    #[instrument(skip_all, fields(event_type = %event.event_type))]
    pub async fn handle_event(
        &self,
        event: &DomainEvent,
        definitions: &[WorkflowDefinition],
    ) -> EventOutcome {
        let report = self.matcher.match_event(event, definitions);
        let mut outcome = EventOutcome {
            started: Vec::with_capacity(report.matched.len()),
            skipped: report.skipped,
            failed: Vec::new(),
        };

        for definition in report.matched {
            if let Err(source) = definition.validate() {
                warn!(
                    workflow_id = %definition.id,
                    error = %source,
                    "skipping invalid workflow definition"
                );
                outcome
                    .skipped
                    .push(TriggerMatchError::InvalidDefinition { source });
                continue;
            }

            let id = match self.create(definition, event.clone()).await {
                Ok(instance) => instance.id,
                Err(error) => {
                    warn!(workflow_id = %definition.id, error = %error, "failed to create execution");
                    outcome.failed.push(StartFailure {
                        workflow_id: definition.id,
                        execution_id: None,
                        error,
                    });
                    continue;
                }
            };
            match self.advance(id).await {
                Ok(instance) => outcome.started.push(instance),
                Err(error) => {
                    warn!(
                        workflow_id = %definition.id,
                        execution_id = %id,
                        error = %error,
                        "execution created but could not be advanced"
                    );
                    outcome.failed.push(StartFailure {
                        workflow_id: definition.id,
                        execution_id: Some(id),
                        error,
                    });
                }
            }
        }

        outcome
    }

    /// Creates an instance for a definition and runs it as far as it goes.
    ///
    /// # Errors
    ///
    /// Returns an error if the definition is invalid or a write fails.
    #[instrument(skip_all, fields(workflow_id = %definition.id))]
    pub async fn start_execution(
        &self,
        definition: &WorkflowDefinition,
        event: DomainEvent,
    ) -> Result<ExecutionInstance, OrchestratorError> {
        let instance = self.create(definition, event).await?;
        self.advance(instance.id).await
    }

    async fn create(
        &self,
        definition: &WorkflowDefinition,
        event: DomainEvent,
    ) -> Result<ExecutionInstance, OrchestratorError> {
        definition.validate()?;
        let instance = ExecutionInstance::new(definition, event, Utc::now());
        self.store.insert(&instance).await?;
        info!(
            execution_id = %instance.id,
            started_by = %instance.started_by,
            actions = instance.snapshot.actions.len(),
            "execution created"
        );
        Ok(instance)
    }

    /// Runs an instance until it is terminal or suspended.
    ///
    /// Backs off without changes if another writer holds the dispatch
    /// checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is missing or a write fails.
    #[instrument(skip_all, fields(execution_id = %id))]
    pub async fn advance(&self, id: ExecutionId) -> Result<ExecutionInstance, OrchestratorError> {
        let mut conflicts = 0;
        loop {
            let Versioned {
                value: mut instance,
                revision,
            } = self.load(id).await?;
            let now = Utc::now();

            let action = match next_step(&instance) {
                Next::Stop => {
                    if instance.in_flight.is_some() {
                        debug!("action in flight elsewhere, backing off");
                    }
                    return Ok(instance);
                }
                Next::Complete => {
                    instance.complete(now)?;
                    None
                }
                Next::Cancel => {
                    instance.cancel(now)?;
                    None
                }
                Next::OpenGate(order) => {
                    let opened = instance.open_approval(order, now).map(|_| ());
                    match opened {
                        Ok(()) => {}
                        Err(e @ ExecutionError::DeadlineOutOfRange { .. }) => {
                            warn!(action_order = order, error = %e, "approval gate cannot open");
                            instance.fail(e.to_string(), now)?;
                        }
                        Err(e) => return Err(e.into()),
                    }
                    None
                }
                Next::Dispatch(action) => {
                    instance.begin_action(action.order, now)?;
                    Some(action)
                }
            };

            match self.store.compare_and_swap(&instance, revision).await {
                Ok(_) => {}
                Err(StoreError::RevisionConflict { .. }) => {
                    conflicts += 1;
                    if conflicts >= self.max_attempts {
                        return Err(OrchestratorError::Contention {
                            id,
                            attempts: conflicts,
                        });
                    }
                    debug!(conflicts, "revision conflict, reloading");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            let Some(action) = action else {
                log_transition(&instance);
                return Ok(instance);
            };

            let instance = self.run_action(&instance, &action).await?;
            if instance.is_terminal() {
                return Ok(instance);
            }
            conflicts = 0;
        }
    }

    /// Dispatches a checkpointed action and records its step.
    async fn run_action(
        &self,
        instance: &ExecutionInstance,
        action: &ActionSpec,
    ) -> Result<ExecutionInstance, OrchestratorError> {
        let started_at = Utc::now();
        debug!(
            action_order = action.order,
            action_type = %action.action_type,
            "dispatching action"
        );
        let result = self.dispatch(instance, action).await;
        let finished_at = Utc::now();

        let failure = (!result.is_success()).then(|| {
            result
                .message
                .clone()
                .unwrap_or_else(|| format!("action {} ({}) failed", action.order, action.action_type))
        });
        let step = StepResult {
            action_order: action.order,
            action_type: action.action_type.clone(),
            outcome: result.outcome,
            started_at,
            finished_at,
            output: result.output,
            message: result.message,
        };

        let (instance, ()) = self
            .mutate(instance.id, |instance| {
                instance.record_step(step.clone())?;
                if let Some(message) = &failure {
                    instance.fail(message.clone(), finished_at)?;
                }
                Ok(())
            })
            .await?;

        match &failure {
            Some(message) => warn!(
                action_order = action.order,
                error = %message,
                "action failed, execution failed"
            ),
            None => info!(action_order = action.order, "action succeeded"),
        }
        Ok(instance)
    }

    async fn dispatch(&self, instance: &ExecutionInstance, action: &ActionSpec) -> ActionResult {
        let context = ActionContext {
            execution_id: instance.id,
            workflow_id: instance.workflow_id,
            action_order: action.order,
            started_by: instance.started_by.clone(),
            trigger: instance.trigger.clone(),
        };
        match self
            .dispatcher
            .dispatch(&action.action_type, &action.parameters, &context)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(action_order = action.order, error = %e, "action could not be dispatched");
                ActionResult::failure(e.to_string())
            }
        }
    }

    /// Resumes an instance after a crash.
    ///
    /// A leftover dispatch checkpoint is cleared and the interrupted action
    /// is dispatched again.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is missing or a write fails.
    #[instrument(skip_all, fields(execution_id = %id))]
    pub async fn recover(&self, id: ExecutionId) -> Result<ExecutionInstance, OrchestratorError> {
        let current = self.load(id).await?.value;
        if current.is_terminal() {
            return Ok(current);
        }
        if current.in_flight.is_some() {
            let (_, interrupted) = self
                .mutate(id, |instance| {
                    instance.ensure_running()?;
                    Ok(instance.take_in_flight())
                })
                .await?;
            if let Some(action) = interrupted {
                warn!(
                    action_order = action.action_order,
                    started_at = %action.started_at,
                    "replaying interrupted action"
                );
            }
        }
        self.advance(id).await
    }

    /// Resumes every running instance in the store.
    ///
    /// # Errors
    ///
    /// Returns an error only if the running instances cannot be listed.
    #[instrument(skip_all)]
    pub async fn recover_running(&self) -> Result<RecoveryReport, OrchestratorError> {
        let running = self.store.list(Some(ExecutionStatus::Running)).await?;
        let mut report = RecoveryReport::default();
        for instance in running {
            match self.recover(instance.id).await {
                Ok(_) => report.resumed.push(instance.id),
                Err(e) => {
                    warn!(execution_id = %instance.id, error = %e, "failed to recover execution");
                    report.failed.push((instance.id, e));
                }
            }
        }
        info!(
            resumed = report.resumed.len(),
            failed = report.failed.len(),
            "recovered running executions"
        );
        Ok(report)
    }

    /// Drives every running instance that is neither suspended on a gate
    /// nor holding a dispatch checkpoint.
    ///
    /// Such an instance is one whose last advance failed after a write
    /// committed (a store error or contention). Advancing it again is safe
    /// while another writer works on it: the revision check lets only one
    /// of them start each action.
    ///
    /// # Errors
    ///
    /// Returns an error only if the running instances cannot be listed.
    #[instrument(skip_all)]
    pub async fn resume_stalled(&self) -> Result<RecoveryReport, OrchestratorError> {
        let running = self.store.list(Some(ExecutionStatus::Running)).await?;
        let mut report = RecoveryReport::default();
        let stalled = running
            .iter()
            .filter(|i| !i.is_suspended() && i.in_flight.is_none());
        for instance in stalled {
            match self.advance(instance.id).await {
                Ok(_) => report.resumed.push(instance.id),
                Err(e) => {
                    warn!(execution_id = %instance.id, error = %e, "failed to resume stalled execution");
                    report.failed.push((instance.id, e));
                }
            }
        }
        if !report.resumed.is_empty() || !report.failed.is_empty() {
            info!(
                resumed = report.resumed.len(),
                failed = report.failed.len(),
                "resumed stalled executions"
            );
        }
        Ok(report)
    }

    /// Records an approval and resumes the instance once the gate approves.
    ///
    /// Once the approval is written the call succeeds. If resuming then
    /// fails, the approved instance is returned as written and is left to
    /// `resume_stalled`.
    ///
    /// # Errors
    ///
    /// Returns an error, leaving the instance unchanged, if the instance is
    /// terminal, no gate is open for the action, or the gate refuses the
    /// call.
    #[instrument(skip_all, fields(execution_id = %id, action_order = action_order, identity = %identity))]
    pub async fn approve(
        &self,
        id: ExecutionId,
        action_order: u32,
        identity: &str,
    ) -> Result<ExecutionInstance, OrchestratorError> {
        let (instance, approved) = self
            .mutate(id, |instance| {
                instance.ensure_running()?;
                let gate = instance.pending_approval_mut(action_order).ok_or(
                    ExecutionError::NoPendingApproval {
                        execution_id: id,
                        action_order,
                    },
                )?;
                let resolved = gate.approve(identity, Utc::now())?.is_resolved();
                if resolved {
                    instance.settle_approval(action_order)?;
                }
                Ok(resolved)
            })
            .await?;

        if !approved {
            info!("approval recorded, gate still pending");
            return Ok(instance);
        }
        info!("approval gate approved, resuming");
        match self.advance(id).await {
            Ok(instance) => Ok(instance),
            Err(e) => {
                // The approval is committed; resume_stalled drives the rest.
                warn!(error = %e, "approval recorded but execution could not be resumed");
                Ok(instance)
            }
        }
    }

    /// Rejects a gate, failing the instance.
    ///
    /// # Errors
    ///
    /// Returns an error, leaving the instance unchanged, if the instance is
    /// terminal, no gate is open for the action, or the gate refuses the
    /// call.
    #[instrument(skip_all, fields(execution_id = %id, action_order = action_order, identity = %identity))]
    pub async fn reject(
        &self,
        id: ExecutionId,
        action_order: u32,
        identity: &str,
        reason: Option<String>,
    ) -> Result<ExecutionInstance, OrchestratorError> {
        let (instance, ()) = self
            .mutate(id, |instance| {
                instance.ensure_running()?;
                let now = Utc::now();
                let gate = instance.pending_approval_mut(action_order).ok_or(
                    ExecutionError::NoPendingApproval {
                        execution_id: id,
                        action_order,
                    },
                )?;
                let message = rejection_message(gate.reject(identity, reason.clone(), now)?);
                instance.settle_approval(action_order)?;
                instance.fail(message, now)?;
                Ok(())
            })
            .await?;

        warn!(
            error = instance.error_message.as_deref().unwrap_or_default(),
            "approval rejected, execution failed"
        );
        Ok(instance)
    }

    /// Cancels a running instance.
    ///
    /// With nothing in flight the instance is cancelled at once. Otherwise
    /// the request is recorded and applied before the next action starts.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is missing or terminal.
    #[instrument(skip_all, fields(execution_id = %id, requested_by = %requested_by))]
    pub async fn cancel(
        &self,
        id: ExecutionId,
        requested_by: &str,
    ) -> Result<ExecutionInstance, OrchestratorError> {
        let (instance, ()) = self
            .mutate(id, |instance| {
                let now = Utc::now();
                instance.request_cancel(requested_by, now)?;
                if instance.in_flight.is_none() {
                    instance.cancel(now)?;
                }
                Ok(())
            })
            .await?;

        if instance.is_terminal() {
            info!("execution cancelled");
        } else {
            info!("cancel requested, applies once the in-flight action returns");
        }
        Ok(instance)
    }

    /// Expires every gate past its deadline, failing its instance.
    ///
    /// # Errors
    ///
    /// Returns an error only if the running instances cannot be listed;
    /// per-instance failures are counted in the report.
    #[instrument(skip_all, fields(now = %now))]
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport, OrchestratorError> {
        let running = self.store.list(Some(ExecutionStatus::Running)).await?;
        let mut report = SweepReport {
            examined: running.len(),
            ..SweepReport::default()
        };

        let overdue = running
            .iter()
            .filter(|i| i.pending_approvals.iter().any(|g| g.is_overdue(now)));
        for instance in overdue {
            let expired = self
                .mutate(instance.id, |instance| {
                    instance
                        .expire_overdue_approvals(now)
                        .map_err(OrchestratorError::from)
                })
                .await;
            match expired {
                Ok((_, orders)) if !orders.is_empty() => {
                    warn!(
                        execution_id = %instance.id,
                        ?orders,
                        "approval expired, execution failed"
                    );
                    report.expired.push(instance.id);
                }
                Ok(_) => {}
                Err(OrchestratorError::Execution(ExecutionError::AlreadyTerminal { .. })) => {
                    debug!(execution_id = %instance.id, "finished before it could be expired");
                }
                Err(e) => {
                    warn!(execution_id = %instance.id, error = %e, "failed to expire approvals");
                    report.errors += 1;
                }
            }
        }

        if !report.expired.is_empty() || report.errors > 0 {
            info!(
                examined = report.examined,
                expired = report.expired.len(),
                errors = report.errors,
                "expiry sweep finished"
            );
        }
        Ok(report)
    }

    /// Returns one instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is missing or the load fails.
    pub async fn get(&self, id: ExecutionId) -> Result<ExecutionInstance, OrchestratorError> {
        Ok(self.load(id).await?.value)
    }

    /// Lists instances, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn list(
        &self,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<ExecutionInstance>, OrchestratorError> {
        Ok(self.store.list(status).await?)
    }

    /// Counts instances per status.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn status_counts(&self) -> Result<StatusCounts, OrchestratorError> {
        let mut counts = StatusCounts::default();
        for instance in self.store.list(None).await? {
            counts.record(instance.status);
        }
        Ok(counts)
    }

    async fn load(&self, id: ExecutionId) -> Result<Versioned<ExecutionInstance>, OrchestratorError> {
        self.store
            .load(id)
            .await?
            .ok_or(OrchestratorError::NotFound { id })
    }

    /// Loads, applies `apply`, and writes back, reloading on conflicts.
    ///
    /// An error from `apply` aborts without writing.
    async fn mutate<T, F>(
        &self,
        id: ExecutionId,
        mut apply: F,
    ) -> Result<(ExecutionInstance, T), OrchestratorError>
    where
        F: FnMut(&mut ExecutionInstance) -> Result<T, OrchestratorError> + Send,
        T: Send,
    {
        for attempt in 1..=self.max_attempts {
            let Versioned {
                value: mut instance,
                revision,
            } = self.load(id).await?;
            let output = apply(&mut instance)?;
            match self.store.compare_and_swap(&instance, revision).await {
                Ok(_) => return Ok((instance, output)),
                Err(StoreError::RevisionConflict { .. }) => {
                    debug!(execution_id = %id, attempt, "revision conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(OrchestratorError::Contention {
            id,
            attempts: self.max_attempts,
        })
    }
}

fn log_transition(instance: &ExecutionInstance) {
    match instance.status {
        ExecutionStatus::Completed => info!(
            execution_id = %instance.id,
            steps = instance.steps_completed.len(),
            execution_ms = instance.execution_time().map(|d| d.num_milliseconds()),
            "execution completed"
        ),
        ExecutionStatus::Cancelled => info!(
            execution_id = %instance.id,
            steps = instance.steps_completed.len(),
            "execution cancelled"
        ),
        ExecutionStatus::Failed => warn!(
            execution_id = %instance.id,
            error = instance.error_message.as_deref().unwrap_or_default(),
            "execution failed"
        ),
        ExecutionStatus::Running => {
            for gate in &instance.pending_approvals {
                info!(
                    execution_id = %instance.id,
                    action_order = gate.action_order,
                    expires_at = %gate.expires_at,
                    "approval gate opened, execution suspended"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalStatus;
    use crate::definition::{ApprovalSpec, TriggerType};
    use crate::dispatch::{ActionHandler, HandlerRegistry};
    use crate::execution::{APPROVAL_EXPIRED_MESSAGE, StepOutcome};
    use crate::store::{InMemoryExecutionStore, Revision};
    use async_trait::async_trait;
    use chrono::Duration;
    use serde_json::{Map, Value as JsonValue, json};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    type Calls = Arc<Mutex<Vec<u32>>>;
    type Engine = Orchestrator<Arc<InMemoryExecutionStore>, HandlerRegistry>;

    /// Records the order of every action it runs.
    struct RecordingHandler {
        calls: Calls,
        failure: Option<&'static str>,
    }

    #[async_trait]
    impl ActionHandler for RecordingHandler {
        async fn execute(
            &self,
            _parameters: &Map<String, JsonValue>,
            context: &ActionContext,
        ) -> ActionResult {
            self.calls.lock().unwrap().push(context.action_order);
            match self.failure {
                Some(message) => ActionResult::failure(message),
                None => ActionResult::success(json!({"order": context.action_order})),
            }
        }
    }

    /// Requests a cancel on its own execution while it runs.
    struct CancellingHandler {
        store: Arc<InMemoryExecutionStore>,
        calls: Calls,
    }

    #[async_trait]
    impl ActionHandler for CancellingHandler {
        async fn execute(
            &self,
            _parameters: &Map<String, JsonValue>,
            context: &ActionContext,
        ) -> ActionResult {
            self.calls.lock().unwrap().push(context.action_order);
            let Versioned {
                mut value,
                revision,
            } = self.store.load(context.execution_id).await.unwrap().unwrap();
            value.request_cancel("ops", Utc::now()).unwrap();
            self.store.compare_and_swap(&value, revision).await.unwrap();
            ActionResult::success(json!({}))
        }
    }

    /// Records its order, yielding to other tasks around the record.
    struct YieldingHandler {
        calls: Calls,
    }

    #[async_trait]
    impl ActionHandler for YieldingHandler {
        async fn execute(
            &self,
            _parameters: &Map<String, JsonValue>,
            context: &ActionContext,
        ) -> ActionResult {
            tokio::task::yield_now().await;
            self.calls.lock().unwrap().push(context.action_order);
            tokio::task::yield_now().await;
            ActionResult::success(json!({}))
        }
    }

    /// Store whose writes can be made to fail.
    #[derive(Clone, Default)]
    struct FlakyStore {
        inner: InMemoryExecutionStore,
        fail_writes: Arc<AtomicBool>,
        always_conflict: bool,
        /// `Some(n)`: let `n` writes through, then fail the next one.
        fail_after: Arc<Mutex<Option<usize>>>,
    }

    impl FlakyStore {
        fn fail_once_after(&self, writes: usize) {
            *self.fail_after.lock().unwrap() = Some(writes);
        }

        fn take_scheduled_failure(&self) -> bool {
            let mut countdown = self.fail_after.lock().unwrap();
            match countdown.as_mut() {
                Some(0) => {
                    *countdown = None;
                    true
                }
                Some(n) => {
                    *n -= 1;
                    false
                }
                None => false,
            }
        }
    }

    /// Store that approves a gate through another orchestrator right after
    /// a listing, before the caller acts on what it listed.
    struct ApprovingStore {
        inner: Arc<InMemoryExecutionStore>,
        approver: Engine,
        pending: Mutex<Option<(ExecutionId, u32, &'static str)>>,
    }

    #[async_trait]
    impl ExecutionStore for ApprovingStore {
        async fn insert(&self, instance: &ExecutionInstance) -> Result<Revision, StoreError> {
            self.inner.insert(instance).await
        }

        async fn load(
            &self,
            id: ExecutionId,
        ) -> Result<Option<Versioned<ExecutionInstance>>, StoreError> {
            self.inner.load(id).await
        }

        async fn compare_and_swap(
            &self,
            instance: &ExecutionInstance,
            expected: Revision,
        ) -> Result<Revision, StoreError> {
            self.inner.compare_and_swap(instance, expected).await
        }

        async fn list(
            &self,
            status: Option<ExecutionStatus>,
        ) -> Result<Vec<ExecutionInstance>, StoreError> {
            let listed = self.inner.list(status).await?;
            let pending = self.pending.lock().unwrap().take();
            if let Some((id, order, identity)) = pending {
                self.approver.approve(id, order, identity).await.unwrap();
            }
            Ok(listed)
        }
    }

    #[async_trait]
    impl ExecutionStore for FlakyStore {
        async fn insert(&self, instance: &ExecutionInstance) -> Result<Revision, StoreError> {
            self.inner.insert(instance).await
        }

        async fn load(
            &self,
            id: ExecutionId,
        ) -> Result<Option<Versioned<ExecutionInstance>>, StoreError> {
            self.inner.load(id).await
        }

        async fn compare_and_swap(
            &self,
            instance: &ExecutionInstance,
            expected: Revision,
        ) -> Result<Revision, StoreError> {
            if self.always_conflict {
                return Err(StoreError::RevisionConflict {
                    id: instance.id,
                    expected,
                });
            }
            if self.fail_writes.load(Ordering::SeqCst) || self.take_scheduled_failure() {
                return Err(StoreError::Backend {
                    message: "disk full".to_string(),
                });
            }
            self.inner.compare_and_swap(instance, expected).await
        }

        async fn list(
            &self,
            status: Option<ExecutionStatus>,
        ) -> Result<Vec<ExecutionInstance>, StoreError> {
            self.inner.list(status).await
        }
    }

    fn registry(calls: &Calls) -> HandlerRegistry {
        let handler = |failure| {
            Arc::new(RecordingHandler {
                calls: Arc::clone(calls),
                failure,
            })
        };
        HandlerRegistry::new()
            .with_handler("send_message", handler(None))
            .with_handler("create_task", handler(None))
            .with_handler("boom", handler(Some("smtp down")))
    }

    fn engine(store: &Arc<InMemoryExecutionStore>, calls: &Calls) -> Engine {
        Orchestrator::new(Arc::clone(store), registry(calls))
    }

    fn setup() -> (Engine, Arc<InMemoryExecutionStore>, Calls) {
        let store = Arc::new(InMemoryExecutionStore::new());
        let calls = Calls::default();
        (engine(&store, &calls), store, calls)
    }

    fn event() -> DomainEvent {
        DomainEvent::new(TriggerType::Manual, json!({"record": 7})).with_actor("dana")
    }

    fn two_actions() -> WorkflowDefinition {
        WorkflowDefinition::new("notify-and-task", TriggerType::Manual)
            .with_action(ActionSpec::new("send_message", 1))
            .with_action(ActionSpec::new("create_task", 2))
    }

    fn gated(approval: ApprovalSpec) -> WorkflowDefinition {
        WorkflowDefinition::new("gated", TriggerType::Manual)
            .with_action(ActionSpec::new("send_message", 1))
            .with_action(ActionSpec::new("create_task", 2).with_approval(approval))
    }

    fn alice_then_bob() -> ApprovalSpec {
        ApprovalSpec::sequential(
            vec!["alice".to_string(), "bob".to_string()],
            Duration::hours(1),
        )
    }

    fn calls_of(calls: &Calls) -> Vec<u32> {
        calls.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn ungated_actions_run_to_completion() {
        let (engine, _store, calls) = setup();

        let instance = engine.start_execution(&two_actions(), event()).await.unwrap();

        assert_eq!(instance.status, ExecutionStatus::Completed);
        assert_eq!(instance.steps_completed.len(), 2);
        assert!(instance.steps_completed.iter().all(StepResult::is_success));
        assert!(instance.completed_at.is_some());
        assert!(instance.execution_time().is_some());
        assert!(instance.in_flight.is_none());
        assert_eq!(calls_of(&calls), vec![1, 2]);
        assert_eq!(engine.get(instance.id).await.unwrap(), instance);
    }

    #[tokio::test]
    async fn sequential_approvals_resume_and_complete() {
        let (engine, _store, calls) = setup();

        let instance = engine
            .start_execution(&gated(alice_then_bob()), event())
            .await
            .unwrap();
        assert_eq!(instance.status, ExecutionStatus::Running);
        assert!(instance.is_suspended());
        assert_eq!(instance.steps_completed.len(), 1);
        assert_eq!(calls_of(&calls), vec![1]);

        let instance = engine.approve(instance.id, 2, "alice").await.unwrap();
        assert!(instance.is_suspended());
        assert_eq!(
            instance.pending_approval(2).unwrap().approved_by,
            vec!["alice".to_string()]
        );

        let instance = engine.approve(instance.id, 2, "bob").await.unwrap();
        assert_eq!(instance.status, ExecutionStatus::Completed);
        assert_eq!(instance.steps_completed.len(), 2);
        assert!(instance.pending_approvals.is_empty());
        assert_eq!(instance.resolved_approvals.len(), 1);
        assert!(instance.is_approved(2));
        assert_eq!(calls_of(&calls), vec![1, 2]);
    }

    #[tokio::test]
    async fn out_of_order_approval_changes_nothing() {
        let (engine, _store, calls) = setup();
        let instance = engine
            .start_execution(&gated(alice_then_bob()), event())
            .await
            .unwrap();

        let err = engine.approve(instance.id, 2, "bob").await.unwrap_err();
        assert_eq!(
            err,
            OrchestratorError::Approval(ApprovalError::OutOfOrder {
                identity: "bob".to_string(),
                expected: "alice".to_string(),
            })
        );

        let stored = engine.get(instance.id).await.unwrap();
        assert_eq!(stored, instance);
        assert!(stored.pending_approval(2).unwrap().approved_by.is_empty());
        assert!(stored.is_suspended());
        assert_eq!(calls_of(&calls), vec![1]);
    }

    #[tokio::test]
    async fn parallel_approvals_accept_any_order() {
        let (engine, _store, _calls) = setup();
        let spec = ApprovalSpec::parallel(
            vec!["alice".to_string(), "bob".to_string()],
            Duration::hours(1),
        );
        let instance = engine.start_execution(&gated(spec), event()).await.unwrap();

        engine.approve(instance.id, 2, "bob").await.unwrap();
        let instance = engine.approve(instance.id, 2, "alice").await.unwrap();
        assert_eq!(instance.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn expired_approval_fails_on_sweep() {
        let (engine, _store, calls) = setup();
        let instance = engine
            .start_execution(&gated(alice_then_bob()), event())
            .await
            .unwrap();

        let report = engine
            .sweep_expired(Utc::now() + Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(report.expired, vec![instance.id]);
        assert_eq!(report.errors, 0);

        let instance = engine.get(instance.id).await.unwrap();
        assert_eq!(instance.status, ExecutionStatus::Failed);
        assert_eq!(
            instance.error_message.as_deref(),
            Some(APPROVAL_EXPIRED_MESSAGE)
        );
        assert_eq!(instance.steps_completed.len(), 1);
        assert!(instance.pending_approvals.is_empty());
        assert!(matches!(
            instance.resolved_approvals[0].status,
            ApprovalStatus::Expired { .. }
        ));
        assert_eq!(calls_of(&calls), vec![1]);
    }

    #[tokio::test]
    async fn sweep_only_touches_overdue_gates() {
        let (engine, _store, _calls) = setup();
        let short = engine
            .start_execution(&gated(alice_then_bob()), event())
            .await
            .unwrap();
        let long_spec =
            ApprovalSpec::sequential(vec!["alice".to_string()], Duration::days(1));
        let long = engine
            .start_execution(&gated(long_spec), event())
            .await
            .unwrap();
        let done = engine.start_execution(&two_actions(), event()).await.unwrap();

        let report = engine
            .sweep_expired(Utc::now() + Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.expired, vec![short.id]);

        assert_eq!(
            engine.get(long.id).await.unwrap().status,
            ExecutionStatus::Running
        );
        assert_eq!(engine.get(done.id).await.unwrap(), done);

        let nothing = engine.sweep_expired(Utc::now()).await.unwrap();
        assert!(nothing.expired.is_empty());
    }

    #[tokio::test]
    async fn cancel_while_suspended_stops_before_next_action() {
        let (engine, _store, calls) = setup();
        let instance = engine
            .start_execution(&gated(alice_then_bob()), event())
            .await
            .unwrap();

        let instance = engine.cancel(instance.id, "ops").await.unwrap();
        assert_eq!(instance.status, ExecutionStatus::Cancelled);
        assert_eq!(instance.steps_completed.len(), 1);
        assert!(instance.pending_approvals.is_empty());
        assert!(instance.error_message.is_none());

        let err = engine.approve(instance.id, 2, "alice").await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Execution(ExecutionError::AlreadyTerminal { .. })
        ));
        assert_eq!(calls_of(&calls), vec![1]);
    }

    #[tokio::test]
    async fn cancel_during_dispatch_applies_before_next_action() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let calls = Calls::default();
        let registry = registry(&calls).with_handler(
            "cancel_me",
            Arc::new(CancellingHandler {
                store: Arc::clone(&store),
                calls: Arc::clone(&calls),
            }),
        );
        let engine = Orchestrator::new(Arc::clone(&store), registry);
        let definition = WorkflowDefinition::new("cancel", TriggerType::Manual)
            .with_action(ActionSpec::new("cancel_me", 1))
            .with_action(ActionSpec::new("create_task", 2));

        let instance = engine.start_execution(&definition, event()).await.unwrap();

        assert_eq!(instance.status, ExecutionStatus::Cancelled);
        assert_eq!(instance.steps_completed.len(), 1);
        assert_eq!(instance.steps_completed[0].action_order, 1);
        assert!(instance.cancel_requested.is_some());
        assert_eq!(calls_of(&calls), vec![1]);
    }

    #[tokio::test]
    async fn cancel_landing_during_last_action_still_completes() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let calls = Calls::default();
        let registry = HandlerRegistry::new().with_handler(
            "cancel_me",
            Arc::new(CancellingHandler {
                store: Arc::clone(&store),
                calls: Arc::clone(&calls),
            }),
        );
        let engine = Orchestrator::new(Arc::clone(&store), registry);
        let definition = WorkflowDefinition::new("last", TriggerType::Manual)
            .with_action(ActionSpec::new("cancel_me", 1));

        let instance = engine.start_execution(&definition, event()).await.unwrap();
        assert_eq!(instance.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_of_terminal_instance_is_refused() {
        let (engine, _store, _calls) = setup();
        let instance = engine.start_execution(&two_actions(), event()).await.unwrap();

        assert!(matches!(
            engine.cancel(instance.id, "ops").await,
            Err(OrchestratorError::Execution(ExecutionError::AlreadyTerminal { .. }))
        ));
        assert_eq!(engine.get(instance.id).await.unwrap(), instance);
    }

    #[tokio::test]
    async fn handler_failure_fails_execution() {
        let (engine, _store, calls) = setup();
        let definition = WorkflowDefinition::new("fails", TriggerType::Manual)
            .with_action(ActionSpec::new("boom", 1))
            .with_action(ActionSpec::new("create_task", 2));

        let instance = engine.start_execution(&definition, event()).await.unwrap();

        assert_eq!(instance.status, ExecutionStatus::Failed);
        assert_eq!(instance.error_message.as_deref(), Some("smtp down"));
        assert_eq!(instance.steps_completed.len(), 1);
        assert_eq!(instance.steps_completed[0].outcome, StepOutcome::Failure);
        assert_eq!(calls_of(&calls), vec![1]);
    }

    #[tokio::test]
    async fn unknown_action_type_fails_execution() {
        let (engine, _store, _calls) = setup();
        let definition = WorkflowDefinition::new("fax", TriggerType::Manual)
            .with_action(ActionSpec::new("send_fax", 1));

        let instance = engine.start_execution(&definition, event()).await.unwrap();

        assert_eq!(instance.status, ExecutionStatus::Failed);
        assert_eq!(
            instance.error_message.as_deref(),
            Some("unknown action type: send_fax")
        );
        assert_eq!(instance.steps_completed.len(), 1);
    }

    #[tokio::test]
    async fn rejection_fails_with_reason() {
        let (engine, _store, calls) = setup();
        let instance = engine
            .start_execution(&gated(alice_then_bob()), event())
            .await
            .unwrap();

        let instance = engine
            .reject(instance.id, 2, "bob", Some("over budget".to_string()))
            .await
            .unwrap();

        assert_eq!(instance.status, ExecutionStatus::Failed);
        assert_eq!(
            instance.error_message.as_deref(),
            Some("approval rejected by bob: over budget")
        );
        assert!(instance.pending_approvals.is_empty());
        assert_eq!(instance.resolved_approvals.len(), 1);
        assert_eq!(calls_of(&calls), vec![1]);
    }

    #[tokio::test]
    async fn approval_without_open_gate_is_refused() {
        let (engine, _store, _calls) = setup();
        let instance = engine
            .start_execution(&gated(alice_then_bob()), event())
            .await
            .unwrap();

        assert!(matches!(
            engine.approve(instance.id, 1, "alice").await,
            Err(OrchestratorError::Execution(ExecutionError::NoPendingApproval { .. }))
        ));
        assert!(matches!(
            engine.approve(ExecutionId::new(), 2, "alice").await,
            Err(OrchestratorError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn resuming_in_a_new_orchestrator_matches_uninterrupted_run() {
        fn summary(instance: &ExecutionInstance) -> (ExecutionStatus, Vec<(u32, StepOutcome)>) {
            (
                instance.status,
                instance
                    .steps_completed
                    .iter()
                    .map(|s| (s.action_order, s.outcome))
                    .collect(),
            )
        }
        let definition = gated(alice_then_bob());

        let (uninterrupted, _store, _calls) = setup();
        let straight = uninterrupted
            .start_execution(&definition, event())
            .await
            .unwrap();
        uninterrupted.approve(straight.id, 2, "alice").await.unwrap();
        let straight = uninterrupted.approve(straight.id, 2, "bob").await.unwrap();

        let store = Arc::new(InMemoryExecutionStore::new());
        let calls = Calls::default();
        let first = engine(&store, &calls);
        let id = first.start_execution(&definition, event()).await.unwrap().id;
        first.approve(id, 2, "alice").await.unwrap();
        drop(first);

        let second = engine(&store, &calls);
        let report = second.recover_running().await.unwrap();
        assert_eq!(report.resumed, vec![id]);
        let resumed = second.approve(id, 2, "bob").await.unwrap();

        assert_eq!(summary(&resumed), summary(&straight));
        assert_eq!(
            resumed.resolved_approvals[0].approved_by,
            straight.resolved_approvals[0].approved_by
        );
        assert_eq!(calls_of(&calls), vec![1, 2]);
    }

    #[tokio::test]
    async fn advance_backs_off_and_recover_replays_interrupted_action() {
        let (engine, store, calls) = setup();
        let definition = two_actions();
        let instance = ExecutionInstance::new(&definition, event(), Utc::now());
        let revision = store.insert(&instance).await.unwrap();

        let mut crashed = instance.clone();
        crashed.begin_action(1, Utc::now()).unwrap();
        store.compare_and_swap(&crashed, revision).await.unwrap();

        let untouched = engine.advance(instance.id).await.unwrap();
        assert_eq!(untouched, crashed);
        assert!(calls_of(&calls).is_empty());

        let recovered = engine.recover(instance.id).await.unwrap();
        assert_eq!(recovered.status, ExecutionStatus::Completed);
        assert_eq!(recovered.steps_completed.len(), 2);
        assert_eq!(calls_of(&calls), vec![1, 2]);
    }

    #[tokio::test]
    async fn recover_running_resumes_every_running_instance() {
        let (engine, store, calls) = setup();
        let definition = two_actions();
        let mut ids = Vec::new();
        for _ in 0..2 {
            let instance = ExecutionInstance::new(&definition, event(), Utc::now());
            store.insert(&instance).await.unwrap();
            ids.push(instance.id);
        }

        let report = engine.recover_running().await.unwrap();
        assert_eq!(report.resumed.len(), 2);
        assert!(report.failed.is_empty());
        for id in ids {
            assert_eq!(
                engine.get(id).await.unwrap().status,
                ExecutionStatus::Completed
            );
        }
        assert_eq!(calls_of(&calls).len(), 4);
    }

    #[tokio::test]
    async fn failed_write_never_advances_state() {
        let store = FlakyStore::default();
        let calls = Calls::default();
        let engine = Orchestrator::new(store.clone(), registry(&calls));
        store.fail_writes.store(true, Ordering::SeqCst);

        let err = engine
            .start_execution(&two_actions(), event())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Store(StoreError::Backend { .. })));

        let stored = store.list(None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, ExecutionStatus::Running);
        assert!(stored[0].steps_completed.is_empty());
        assert!(stored[0].in_flight.is_none());
        assert!(calls_of(&calls).is_empty());

        store.fail_writes.store(false, Ordering::SeqCst);
        let instance = engine.advance(stored[0].id).await.unwrap();
        assert_eq!(instance.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn endless_conflicts_give_up() {
        let store = FlakyStore {
            always_conflict: true,
            ..FlakyStore::default()
        };
        let calls = Calls::default();
        let engine = Orchestrator::new(store.clone(), registry(&calls)).with_max_attempts(3);
        let instance = ExecutionInstance::new(&two_actions(), event(), Utc::now());
        store.insert(&instance).await.unwrap();

        assert_eq!(
            engine.cancel(instance.id, "ops").await.unwrap_err(),
            OrchestratorError::Contention {
                id: instance.id,
                attempts: 3,
            }
        );
        assert!(matches!(
            engine.advance(instance.id).await,
            Err(OrchestratorError::Contention { attempts: 3, .. })
        ));
        assert!(calls_of(&calls).is_empty());
    }

    #[tokio::test]
    async fn event_starts_matches_and_reports_invalid_definitions() {
        let (engine, _store, _calls) = setup();
        let empty = WorkflowDefinition::new("empty", TriggerType::Manual);
        let definitions = vec![
            two_actions(),
            empty,
            WorkflowDefinition::new("other", TriggerType::RecordDeleted)
                .with_action(ActionSpec::new("send_message", 1)),
            two_actions().with_condition(json!({"op": "equals", "field": "record", "value": 8})),
        ];

        let outcome = engine.handle_event(&event(), &definitions).await;

        assert_eq!(outcome.started.len(), 1);
        assert_eq!(outcome.started[0].workflow_id, definitions[0].id);
        assert_eq!(outcome.started[0].started_by, "dana");
        assert_eq!(outcome.skipped.len(), 1);
        assert!(matches!(
            outcome.skipped[0],
            TriggerMatchError::InvalidDefinition {
                source: DefinitionError::NoActions { .. }
            }
        ));
    }

    #[tokio::test]
    async fn one_failed_start_does_not_stop_the_others() {
        let store = FlakyStore::default();
        let calls = Calls::default();
        let engine = Orchestrator::new(store.clone(), registry(&calls));
        let definitions = vec![two_actions(), two_actions()];
        store.fail_once_after(0);

        let outcome = engine.handle_event(&event(), &definitions).await;

        assert_eq!(outcome.started.len(), 1);
        assert_eq!(outcome.started[0].status, ExecutionStatus::Completed);
        assert_eq!(outcome.failed.len(), 1);
        let failure = &outcome.failed[0];
        let mut ids = vec![failure.workflow_id, outcome.started[0].workflow_id];
        ids.sort();
        let mut expected = vec![definitions[0].id, definitions[1].id];
        expected.sort();
        assert_eq!(ids, expected);
        assert!(matches!(
            failure.error,
            OrchestratorError::Store(StoreError::Backend { .. })
        ));

        let stalled = failure.execution_id.unwrap();
        assert!(engine.get(stalled).await.unwrap().steps_completed.is_empty());
        let report = engine.resume_stalled().await.unwrap();
        assert_eq!(report.resumed, vec![stalled]);
        assert_eq!(
            engine.get(stalled).await.unwrap().status,
            ExecutionStatus::Completed
        );
        assert_eq!(calls_of(&calls), vec![1, 2, 1, 2]);
    }

    #[tokio::test]
    async fn approval_stands_when_resuming_fails() {
        let store = FlakyStore::default();
        let calls = Calls::default();
        let engine = Orchestrator::new(store.clone(), registry(&calls));
        let spec = ApprovalSpec::parallel(vec!["alice".to_string()], Duration::hours(1));
        let instance = engine.start_execution(&gated(spec), event()).await.unwrap();
        assert!(instance.is_suspended());

        // The approval write lands, the first write of the resumed run fails.
        store.fail_once_after(1);
        let approved = engine.approve(instance.id, 2, "alice").await.unwrap();

        assert_eq!(approved.status, ExecutionStatus::Running);
        assert!(approved.is_approved(2));
        assert!(!approved.is_suspended());
        assert_eq!(engine.get(instance.id).await.unwrap(), approved);
        assert_eq!(calls_of(&calls), vec![1]);

        let report = engine.resume_stalled().await.unwrap();
        assert_eq!(report.resumed, vec![instance.id]);
        assert_eq!(
            engine.get(instance.id).await.unwrap().status,
            ExecutionStatus::Completed
        );
        assert_eq!(calls_of(&calls), vec![1, 2]);
    }

    #[tokio::test]
    async fn resume_stalled_skips_suspended_and_checkpointed_instances() {
        let (engine, store, calls) = setup();
        let suspended = engine
            .start_execution(&gated(alice_then_bob()), event())
            .await
            .unwrap();
        let mut checkpointed = ExecutionInstance::new(&two_actions(), event(), Utc::now());
        checkpointed.begin_action(1, Utc::now()).unwrap();
        store.insert(&checkpointed).await.unwrap();

        let report = engine.resume_stalled().await.unwrap();

        assert!(report.resumed.is_empty());
        assert!(report.failed.is_empty());
        assert_eq!(engine.get(suspended.id).await.unwrap(), suspended);
        assert_eq!(engine.get(checkpointed.id).await.unwrap(), checkpointed);
        assert_eq!(calls_of(&calls), vec![1]);
    }

    #[tokio::test]
    async fn out_of_range_deadline_fails_the_instance() {
        let (engine, store, calls) = setup();
        let mut instance = ExecutionInstance::new(&gated(alice_then_bob()), event(), Utc::now());
        if let Some(approval) = instance.snapshot.actions[1].approval.as_mut() {
            approval.expires_after_secs = 10_000_000_000_000;
        }
        store.insert(&instance).await.unwrap();

        let report = engine.recover_running().await.unwrap();

        assert_eq!(report.resumed, vec![instance.id]);
        assert!(report.failed.is_empty());
        let stored = engine.get(instance.id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Failed);
        assert!(
            stored
                .error_message
                .as_deref()
                .unwrap()
                .contains("out of range")
        );
        assert!(stored.pending_approvals.is_empty());
        assert_eq!(calls_of(&calls), vec![1]);
    }

    #[tokio::test]
    async fn oversized_expiry_cannot_start() {
        let (engine, store, calls) = setup();
        let spec = ApprovalSpec {
            expires_after_secs: 10_000_000_000_000,
            ..alice_then_bob()
        };

        assert!(matches!(
            engine.start_execution(&gated(spec), event()).await,
            Err(OrchestratorError::InvalidDefinition(
                DefinitionError::InvalidApproval { .. }
            ))
        ));
        assert!(store.is_empty().await);
        assert!(calls_of(&calls).is_empty());
    }

    #[tokio::test]
    async fn approval_landing_mid_sweep_wins_over_expiry() {
        let inner = Arc::new(InMemoryExecutionStore::new());
        let calls = Calls::default();
        let approver = engine(&inner, &calls);
        let spec = ApprovalSpec::parallel(vec!["alice".to_string()], Duration::hours(1));
        let instance = approver.start_execution(&gated(spec), event()).await.unwrap();
        let sweeper = Orchestrator::new(
            ApprovingStore {
                inner: Arc::clone(&inner),
                approver,
                pending: Mutex::new(Some((instance.id, 2, "alice"))),
            },
            registry(&calls),
        );

        let report = sweeper
            .sweep_expired(Utc::now() + Duration::hours(2))
            .await
            .unwrap();

        assert_eq!(report.examined, 1);
        assert!(report.expired.is_empty());
        assert_eq!(report.errors, 0);
        let stored = sweeper.get(instance.id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert!(stored.is_approved(2));
        assert_eq!(calls_of(&calls), vec![1, 2]);
    }

    #[tokio::test]
    async fn concurrent_advances_dispatch_each_action_once() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let calls = Calls::default();
        let registry = HandlerRegistry::new()
            .with_handler(
                "send_message",
                Arc::new(YieldingHandler {
                    calls: Arc::clone(&calls),
                }),
            )
            .with_handler(
                "create_task",
                Arc::new(YieldingHandler {
                    calls: Arc::clone(&calls),
                }),
            );
        let engine = Orchestrator::new(Arc::clone(&store), registry);
        let instance = ExecutionInstance::new(&two_actions(), event(), Utc::now());
        store.insert(&instance).await.unwrap();

        let (first, second) = tokio::join!(engine.advance(instance.id), engine.advance(instance.id));
        first.unwrap();
        second.unwrap();

        let stored = engine.get(instance.id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);
        let orders: Vec<u32> = stored.steps_completed.iter().map(|s| s.action_order).collect();
        assert_eq!(orders, vec![1, 2]);
        assert_eq!(calls_of(&calls), vec![1, 2]);
    }

    #[tokio::test]
    async fn invalid_definition_cannot_start() {
        let (engine, store, _calls) = setup();
        let definition = WorkflowDefinition::new("empty", TriggerType::Manual);

        assert!(matches!(
            engine.start_execution(&definition, event()).await,
            Err(OrchestratorError::InvalidDefinition(_))
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn status_counts_group_instances() {
        let (engine, _store, _calls) = setup();
        engine.start_execution(&two_actions(), event()).await.unwrap();
        engine.start_execution(&two_actions(), event()).await.unwrap();
        let suspended = engine
            .start_execution(&gated(alice_then_bob()), event())
            .await
            .unwrap();
        engine
            .start_execution(&gated(alice_then_bob()), event())
            .await
            .unwrap();
        engine.cancel(suspended.id, "ops").await.unwrap();

        let counts = engine.status_counts().await.unwrap();
        assert_eq!(
            counts,
            StatusCounts {
                running: 1,
                completed: 2,
                failed: 0,
                cancelled: 1,
            }
        );
        assert_eq!(counts.total(), 4);
        assert_eq!(
            engine
                .list(Some(ExecutionStatus::Completed))
                .await
                .unwrap()
                .len(),
            2
        );
    }
}

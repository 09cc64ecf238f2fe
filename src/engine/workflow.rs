// Workflow Engine
// Drives the workflow state machine across Sequential, Parallel and Hierarchical plans

//! # Workflow Engine
//!
//! The engine accepts a [`WorkflowPlan`], creates its [`WorkflowState`] and
//! hands it to a runner task. The runner is the only writer of that state
//! while it is active; control operations talk to it through a cancellation
//! token and a pause flag, and read it through a `watch` snapshot.
//!
//! ## Execution Model
//!
//! Every topology runs as a list of stages (plan phases) executed in order.
//! Inside a stage all assignments are dispatched concurrently, bounded by the
//! workflow's `max_concurrent_tasks` and by each agent type's shared cap in
//! the [`AgentRegistry`](crate::engine::agents::AgentRegistry).
//!
//! ```text
//! stage k:  worker ─┐
//!           worker ─┼─ StepEvent ─→ runner ─→ persist ─→ StateStore
//!           worker ─┘                 │
//!                                     └─→ EventBus
//! ```
//!
//! Workers never touch the state. They announce a dispatch, wait for the
//! runner to append and persist the step, invoke the agent, then report the
//! result. This keeps `execution_history` equal to the steps actually
//! dispatched.
//!
//! ## Stage Outcome
//!
//! Failed optional assignments are left out of the count. With `s`
//! successes among `c` counted assignments out of `n`:
//!
//! - `s == n`: SUCCESS
//! - `c == 0` or `s / c >= quorum`: SUCCESS_PARTIAL
//! - otherwise FAILED, which fails the workflow
//!
//! ## Control
//!
//! - `pause()` is honored at the next stage boundary; the runner persists
//!   PAUSED and exits. `resume()` rebuilds a runner from `StateStore::get`.
//! - A RUNNING snapshot whose writer lock is free has no runner behind it,
//!   e.g. one loaded from the store after a restart. `cancel()` closes it,
//!   `pause()` parks it and `resume()` restarts its current stage. Steps it
//!   left RUNNING are closed as CANCELLED first.
//! - Finished workflows are dropped from the engine once their final state
//!   is stored; later reads are served from the store.
//! - `cancel()` stops new dispatches at once and gives in-flight steps
//!   `cancel_grace_ms` before they are force-marked CANCELLED.
//! - Every step and status change is persisted before the runner moves on.
//!   Store failures are retried with backoff; exhaustion fails the workflow
//!   with a non-recoverable error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::coordinator::AgentCoordinator;
use crate::engine::events::{EventBus, WorkflowEvent};
use crate::engine::storage::StateStore;
use crate::models::{
    AgentCapability, AgentId, AgentInput, AgentResponse, ErrorKind, ExecutionStep, ExecutionSummary, Phase,
    StageOutcome, StepError, StepStatus, WorkflowPlan, WorkflowResult, WorkflowState, WorkflowStatus,
};
use crate::{OrchestratorError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Time in-flight steps get to finish after `cancel()`
    pub cancel_grace_ms: u64,
    /// Per-step deadline for plans that do not set one
    pub step_timeout_ms: u64,
    /// Per-stage deadline for plans that do not set one
    pub phase_timeout_ms: u64,
    /// Per-workflow worker cap; derived from agent type limits when unset
    pub max_concurrent_tasks: Option<usize>,
    /// Store write retries before the workflow is failed
    pub store_retries: u32,
    pub store_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cancel_grace_ms: 5_000,
            step_timeout_ms: 60_000,
            phase_timeout_ms: 300_000,
            max_concurrent_tasks: None,
            store_retries: 3,
            store_backoff_ms: 100,
        }
    }
}

/// Control side of one workflow
struct WorkflowHandle {
    cancel: CancellationToken,
    cancel_requested_at: Mutex<Option<DateTime<Utc>>>,
    pause_requested: AtomicBool,
    /// Held by whoever writes the state: the runner, or a control call on a parked workflow
    writer: Arc<tokio::sync::Mutex<()>>,
    /// Last persisted snapshot
    latest: watch::Sender<WorkflowState>,
}

impl WorkflowHandle {
    fn new(state: WorkflowState) -> Self {
        let (latest, _) = watch::channel(state);
        Self {
            cancel: CancellationToken::new(),
            cancel_requested_at: Mutex::new(None),
            pause_requested: AtomicBool::new(false),
            writer: Arc::new(tokio::sync::Mutex::new(())),
            latest,
        }
    }

    fn status(&self) -> WorkflowStatus {
        self.latest.borrow().status
    }

    fn snapshot(&self) -> WorkflowState {
        self.latest.borrow().clone()
    }
}

struct EngineInner {
    config: EngineConfig,
    coordinator: Arc<AgentCoordinator>,
    store: Arc<dyn StateStore>,
    events: EventBus,
    workflows: DashMap<Uuid, Arc<WorkflowHandle>>,
}

/// Workflow control surface
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(
        coordinator: Arc<AgentCoordinator>,
        store: Arc<dyn StateStore>,
        events: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                coordinator,
                store,
                events,
                workflows: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.inner.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.inner.events.subscribe()
    }

    /// Accept a plan and start executing it
    ///
    /// Unpinned assignments get the highest-priority agent of their
    /// capability. The PENDING and RUNNING snapshots are persisted before
    /// this returns.
    pub async fn start(&self, mut plan: WorkflowPlan) -> Result<Uuid> {
        plan.normalize()?;
        self.pin_agents(&mut plan);

        let state = WorkflowState::new(plan);
        let workflow_id = state.workflow_id;
        let handle = Arc::new(WorkflowHandle::new(state.clone()));
        let writer = handle.writer.clone().lock_owned().await;
        self.inner.workflows.insert(workflow_id, handle.clone());

        let mut runner = Runner::new(self.inner.clone(), handle, state);
        let accepted = async {
            runner.persist().await?;
            runner.set_status(WorkflowStatus::Running).await
        };
        if let Err(e) = accepted.await {
            error!(%workflow_id, "Workflow could not be persisted at start: {}", e);
            self.inner.workflows.remove(&workflow_id);
            return Err(e);
        }

        info!(
            %workflow_id,
            topology = %runner.state.topology,
            stages = runner.state.total_steps,
            "Workflow started"
        );
        tokio::spawn(runner.drive(writer));
        Ok(workflow_id)
    }

    /// Latest snapshot of a workflow
    pub async fn get_status(&self, workflow_id: Uuid) -> Result<WorkflowState> {
        Ok(self.handle(workflow_id).await?.snapshot())
    }

    pub async fn summary(&self, workflow_id: Uuid) -> Result<ExecutionSummary> {
        Ok(self.get_status(workflow_id).await?.summary())
    }

    /// Every persisted version of a workflow, oldest first
    pub async fn history(&self, workflow_id: Uuid) -> Result<Vec<WorkflowState>> {
        self.inner.store.history(workflow_id).await
    }

    /// Request cancellation
    ///
    /// Returns once the workflow is CANCELLED or the running stage has been
    /// wound down, which takes at most the cancel grace period plus store
    /// writes.
    pub async fn cancel(&self, workflow_id: Uuid) -> Result<()> {
        let handle = self.handle(workflow_id).await?;
        match handle.status() {
            WorkflowStatus::Cancelled => return Ok(()),
            status if status.is_terminal() => {
                return Err(OrchestratorError::InvalidTransition {
                    from: status.to_string(),
                    to: WorkflowStatus::Cancelled.to_string(),
                });
            }
            _ => {}
        }

        {
            let mut requested = handle.cancel_requested_at.lock().unwrap_or_else(|p| p.into_inner());
            requested.get_or_insert_with(Utc::now);
        }
        handle.cancel.cancel();
        info!(%workflow_id, "Cancellation requested");

        // Waits for an active runner to wind down
        let writer = handle.writer.clone().lock_owned().await;
        let state = handle.snapshot();
        match state.status {
            WorkflowStatus::Cancelled => Ok(()),
            WorkflowStatus::Paused | WorkflowStatus::Pending => {
                let mut runner = Runner::new(self.inner.clone(), handle, state);
                runner.finish_cancelled().await;
                drop(writer);
                Ok(())
            }
            WorkflowStatus::Running => {
                // Still RUNNING with the writer free: nothing is driving it
                let mut runner = Runner::new(self.inner.clone(), handle, state);
                let closed = runner.close_orphaned_steps("cancelled by request");
                warn!(%workflow_id, closed, "Cancelling workflow that has no runner");
                runner.finish_cancelled().await;
                drop(writer);
                Ok(())
            }
            other => Err(OrchestratorError::InvalidTransition {
                from: other.to_string(),
                to: WorkflowStatus::Cancelled.to_string(),
            }),
        }
    }

    /// Ask the runner to pause at the next stage boundary
    pub async fn pause(&self, workflow_id: Uuid) -> Result<()> {
        let handle = self.handle(workflow_id).await?;
        let status = handle.status();
        if status != WorkflowStatus::Running {
            return Err(OrchestratorError::InvalidTransition {
                from: status.to_string(),
                to: WorkflowStatus::Paused.to_string(),
            });
        }

        if let Ok(writer) = handle.writer.clone().try_lock_owned() {
            if handle.status() == WorkflowStatus::Running {
                let mut runner = Runner::new(self.inner.clone(), handle.clone(), handle.snapshot());
                let closed = runner.close_orphaned_steps("no runner to finish the step");
                runner.set_status(WorkflowStatus::Paused).await?;
                drop(writer);
                info!(%workflow_id, closed, "Workflow without a runner parked");
                return Ok(());
            }
        }

        handle.pause_requested.store(true, Ordering::SeqCst);
        info!(%workflow_id, "Pause requested");
        Ok(())
    }

    /// Continue a paused workflow from its persisted snapshot
    ///
    /// A RUNNING workflow with no runner is picked up too: its current stage
    /// runs again from the start.
    pub async fn resume(&self, workflow_id: Uuid) -> Result<()> {
        let handle = self.handle(workflow_id).await?;
        let not_resumable = |status: WorkflowStatus| OrchestratorError::InvalidTransition {
            from: status.to_string(),
            to: WorkflowStatus::Running.to_string(),
        };

        let writer = match handle.status() {
            WorkflowStatus::Paused => handle.writer.clone().lock_owned().await,
            WorkflowStatus::Running => handle
                .writer
                .clone()
                .try_lock_owned()
                .map_err(|_| not_resumable(WorkflowStatus::Running))?,
            status => return Err(not_resumable(status)),
        };
        let state = self.stored(workflow_id).await?;

        handle.pause_requested.store(false, Ordering::SeqCst);
        let stored_status = state.status;
        let mut runner = Runner::new(self.inner.clone(), handle, state);
        match stored_status {
            WorkflowStatus::Paused => runner.set_status(WorkflowStatus::Running).await?,
            WorkflowStatus::Running => {
                let closed = runner.close_orphaned_steps("stage restarted after its runner was lost");
                runner.persist().await?;
                warn!(%workflow_id, closed, "Restarting stage of a workflow that had no runner");
            }
            status => return Err(not_resumable(status)),
        }
        info!(%workflow_id, stage = runner.state.current_step, "Workflow resumed");
        tokio::spawn(runner.drive(writer));
        Ok(())
    }

    /// Wait until the workflow is terminal or paused
    pub async fn wait(&self, workflow_id: Uuid) -> Result<WorkflowState> {
        let mut updates = self.handle(workflow_id).await?.latest.subscribe();
        loop {
            {
                let state = updates.borrow_and_update();
                if state.status.is_terminal() || state.status == WorkflowStatus::Paused {
                    return Ok(state.clone());
                }
            }
            if updates.changed().await.is_err() {
                // Handle released after the final write
                return self.stored(workflow_id).await;
            }
        }
    }

    /// Number of workflows the engine is tracking in memory
    pub fn tracked_workflows(&self) -> usize {
        self.inner.workflows.len()
    }

    /// Pause every running workflow and wait up to `timeout` for them to park
    ///
    /// Returns the ids that did not reach a boundary in time.
    pub async fn shutdown(&self, timeout: Duration) -> Vec<Uuid> {
        let running: Vec<Uuid> = self
            .inner
            .workflows
            .iter()
            .filter(|entry| entry.value().status() == WorkflowStatus::Running)
            .map(|entry| *entry.key())
            .collect();

        for id in &running {
            let _ = self.pause(*id).await;
        }

        let mut stuck = Vec::new();
        for id in running {
            if tokio::time::timeout(timeout, self.wait(id)).await.is_err() {
                warn!(workflow_id = %id, "Workflow still running at shutdown");
                stuck.push(id);
            }
        }
        stuck
    }

    async fn handle(&self, workflow_id: Uuid) -> Result<Arc<WorkflowHandle>> {
        if let Some(handle) = self.inner.workflows.get(&workflow_id) {
            return Ok(Arc::clone(&handle));
        }

        let state = self.stored(workflow_id).await?;
        if state.status.is_terminal() {
            return Ok(Arc::new(WorkflowHandle::new(state)));
        }

        // Not started by this process, or parked: adopt the persisted snapshot
        let handle = self
            .inner
            .workflows
            .entry(workflow_id)
            .or_insert_with(|| Arc::new(WorkflowHandle::new(state)));
        Ok(Arc::clone(&handle))
    }

    async fn stored(&self, workflow_id: Uuid) -> Result<WorkflowState> {
        self.inner
            .store
            .get(workflow_id)
            .await?
            .ok_or_else(|| OrchestratorError::WorkflowNotFound(workflow_id.to_string()))
    }

    fn pin_agents(&self, plan: &mut WorkflowPlan) {
        let registry = self.inner.coordinator.registry();
        for assignment in plan.phases.iter_mut().flat_map(|p| p.assignments.iter_mut()) {
            if assignment.agent_id.is_some() {
                continue;
            }
            assignment.agent_id = Some(match registry.primary(assignment.capability) {
                Some(agent) => agent.agent_id.clone(),
                None => {
                    warn!(capability = %assignment.capability, "No agent registered for capability");
                    AgentId::from(assignment.capability.as_str())
                }
            });
        }
    }
}

enum StepEvent {
    Dispatched {
        slot: usize,
        step_id: Uuid,
        started_at: DateTime<Utc>,
        ack: oneshot::Sender<bool>,
    },
    Finished {
        slot: usize,
        step_id: Uuid,
        result: Result<(AgentResponse, u32)>,
    },
}

/// Why a stage stopped without an outcome
enum StageAbort {
    Cancelled,
    Persistence(OrchestratorError),
}

/// Executes one assignment
struct Worker {
    slot: usize,
    agent_id: AgentId,
    capability: AgentCapability,
    input: AgentInput,
    coordinator: Arc<AgentCoordinator>,
    permits: Arc<Semaphore>,
    stop: CancellationToken,
    abort: CancellationToken,
    events: mpsc::UnboundedSender<StepEvent>,
    step_timeout: Duration,
}

impl Worker {
    async fn run(mut self) {
        let _permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = self.stop.cancelled() => return,
        };
        if self.stop.is_cancelled() {
            return;
        }

        let step_id = Uuid::new_v4();
        let (ack, acked) = oneshot::channel();
        let dispatched = StepEvent::Dispatched {
            slot: self.slot,
            step_id,
            started_at: Utc::now(),
            ack,
        };
        if self.events.send(dispatched).is_err() || !matches!(acked.await, Ok(true)) {
            return;
        }

        self.input.step_id = step_id;
        let invocation = self.coordinator.invoke_validated(
            &self.agent_id,
            self.capability,
            self.input,
            self.abort.clone(),
        );
        let result = match tokio::time::timeout(self.step_timeout, invocation).await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::WorkflowTimeout {
                scope: format!("step {}", step_id),
                timeout_ms: self.step_timeout.as_millis() as u64,
            }),
        };
        let _ = self.events.send(StepEvent::Finished {
            slot: self.slot,
            step_id,
            result,
        });
    }
}

/// Single writer of one workflow's state
struct Runner {
    inner: Arc<EngineInner>,
    handle: Arc<WorkflowHandle>,
    state: WorkflowState,
}

impl Runner {
    fn new(inner: Arc<EngineInner>, handle: Arc<WorkflowHandle>, state: WorkflowState) -> Self {
        Self { inner, handle, state }
    }

    async fn drive(mut self, _writer: OwnedMutexGuard<()>) {
        while self.state.current_step < self.state.total_steps {
            if self.handle.cancel.is_cancelled() {
                return self.finish_cancelled().await;
            }
            if self.handle.pause_requested.swap(false, Ordering::SeqCst) {
                if let Err(e) = self.set_status(WorkflowStatus::Paused).await {
                    return self.fail_unrecoverable(e).await;
                }
                info!(workflow_id = %self.state.workflow_id, stage = self.state.current_step, "Workflow paused");
                return;
            }

            let index = self.state.current_step;
            match self.run_stage(index).await {
                Err(StageAbort::Cancelled) => return self.finish_cancelled().await,
                Err(StageAbort::Persistence(e)) => return self.fail_unrecoverable(e).await,
                Ok((outcome, stage_error)) => {
                    let failed = outcome.status == StepStatus::Failed;
                    self.inner.events.publish(WorkflowEvent::StageFinished {
                        workflow_id: self.state.workflow_id,
                        phase: index,
                        status: outcome.status,
                        succeeded: outcome.succeeded,
                        total: outcome.total,
                        at: Utc::now(),
                    });
                    info!(
                        workflow_id = %self.state.workflow_id,
                        stage = %outcome.name,
                        status = ?outcome.status,
                        succeeded = outcome.succeeded,
                        total = outcome.total,
                        "Stage finished"
                    );

                    self.state.carry = if failed { Value::Null } else { outcome.output.clone() };
                    self.state.stage_outcomes.push(outcome);
                    self.state.current_step += 1;
                    if let Err(e) = self.persist().await {
                        return self.fail_unrecoverable(e).await;
                    }
                    if failed {
                        return self.finish(WorkflowStatus::Failed, stage_error).await;
                    }
                }
            }
        }
        self.finish(WorkflowStatus::Completed, None).await;
    }

    async fn run_stage(&mut self, index: usize) -> std::result::Result<(StageOutcome, Option<StepError>), StageAbort> {
        let phase = self.state.plan.phases[index].clone();
        let workflow_id = self.state.workflow_id;
        let started_at = Utc::now();
        let total = phase.assignments.len();

        let step_timeout = Duration::from_millis(
            self.state
                .plan
                .step_timeout_ms
                .unwrap_or(self.inner.config.step_timeout_ms),
        );
        let phase_timeout_ms = self
            .state
            .plan
            .phase_timeout_ms
            .unwrap_or(self.inner.config.phase_timeout_ms);
        let grace = Duration::from_millis(self.inner.config.cancel_grace_ms);

        let permits = Arc::new(Semaphore::new(self.concurrency_limit(&phase)));
        let cancel = self.handle.cancel.clone();
        let stop = cancel.child_token();
        let abort = CancellationToken::new();
        let (events, mut rx) = mpsc::unbounded_channel();
        let mut workers = JoinSet::new();

        for (slot, assignment) in phase.assignments.iter().enumerate() {
            let agent_id = self.agent_for(assignment.agent_id.as_ref(), assignment.capability);
            let input = AgentInput {
                workflow_id,
                step_id: Uuid::nil(),
                task: self.state.plan.description.clone(),
                question: assignment.question.clone(),
                instruction: assignment.instruction.clone(),
                previous: self.state.carry.clone(),
                context: self.state.plan.context.clone(),
                attempt: 0,
            };
            workers.spawn(
                Worker {
                    slot,
                    agent_id,
                    capability: assignment.capability,
                    input,
                    coordinator: self.inner.coordinator.clone(),
                    permits: permits.clone(),
                    stop: stop.clone(),
                    abort: abort.clone(),
                    events: events.clone(),
                    step_timeout,
                }
                .run(),
            );
        }
        drop(events);

        let input_ref = if index == 0 {
            "request".to_string()
        } else {
            format!("stage-{}", index)
        };
        let mut steps: Vec<Option<Uuid>> = vec![None; total];
        let mut answers: Vec<Option<AgentResponse>> = vec![None; total];
        let deadline = Instant::now() + Duration::from_millis(phase_timeout_ms);
        let mut grace_deadline: Option<Instant> = None;
        let mut timed_out = false;

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        StepEvent::Dispatched { slot, step_id, started_at, ack } => {
                            if stop.is_cancelled() {
                                let _ = ack.send(false);
                                continue;
                            }
                            let assignment = &phase.assignments[slot];
                            let agent_id = self.agent_for(assignment.agent_id.as_ref(), assignment.capability);
                            self.state.execution_history.push(ExecutionStep {
                                step_id,
                                agent_id: agent_id.clone(),
                                assignment_id: assignment.assignment_id.clone(),
                                phase: index,
                                phase_name: phase.name.clone(),
                                input_ref: input_ref.clone(),
                                output_ref: None,
                                status: StepStatus::Running,
                                retry_count: 0,
                                started_at: Some(started_at),
                                ended_at: None,
                                error: None,
                                metadata: serde_json::Map::new(),
                            });
                            if let Err(e) = self.persist().await {
                                // Never dispatched
                                self.state.execution_history.pop();
                                let _ = ack.send(false);
                                abort.cancel();
                                return Err(StageAbort::Persistence(e));
                            }
                            steps[slot] = Some(step_id);
                            self.inner.events.publish(WorkflowEvent::StepDispatched {
                                workflow_id,
                                step_id,
                                agent_id,
                                phase: index,
                                at: started_at,
                            });
                            let _ = ack.send(true);
                        }
                        StepEvent::Finished { slot, step_id, result } => {
                            answers[slot] = self.finish_step(step_id, result);
                            if let Err(e) = self.persist().await {
                                abort.cancel();
                                return Err(StageAbort::Persistence(e));
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if !timed_out => {
                    timed_out = true;
                    stop.cancel();
                    abort.cancel();
                    warn!(%workflow_id, stage = %phase.name, timeout_ms = phase_timeout_ms, "Stage deadline exceeded");
                    if cancel.is_cancelled() {
                        // Cancellation was already winding the stage down
                        let error = OrchestratorError::Cancelled("stage deadline reached during cancel grace".to_string());
                        self.close_running(index, StepStatus::Cancelled, error.to_step_error());
                    } else {
                        let error = OrchestratorError::WorkflowTimeout {
                            scope: format!("stage {}", phase.name),
                            timeout_ms: phase_timeout_ms,
                        };
                        self.close_running(index, StepStatus::Failed, error.to_step_error());
                    }
                    if let Err(e) = self.persist().await {
                        return Err(StageAbort::Persistence(e));
                    }
                    break;
                }
                _ = cancel.cancelled(), if grace_deadline.is_none() => {
                    grace_deadline = Some(Instant::now() + grace);
                    info!(%workflow_id, stage = %phase.name, grace_ms = self.inner.config.cancel_grace_ms, "Stopping dispatch, waiting for in-flight steps");
                }
                _ = tokio::time::sleep_until(grace_deadline.unwrap_or(deadline)), if grace_deadline.is_some() => {
                    abort.cancel();
                    let error = OrchestratorError::Cancelled("grace period elapsed".to_string());
                    let closed = self.close_running(index, StepStatus::Cancelled, error.to_step_error());
                    warn!(%workflow_id, closed, "In-flight steps force-cancelled");
                    if let Err(e) = self.persist().await {
                        return Err(StageAbort::Persistence(e));
                    }
                    break;
                }
            }
        }
        workers.abort_all();

        if cancel.is_cancelled() {
            return Err(StageAbort::Cancelled);
        }

        let dispatched = steps.iter().filter(|s| s.is_some()).count();
        let succeeded = answers.iter().filter(|a| a.is_some()).count();
        let counted = phase
            .assignments
            .iter()
            .zip(&answers)
            .filter(|(assignment, answer)| !assignment.optional || answer.is_some())
            .count();
        let quorum = self.state.plan.quorum;
        let status = if succeeded == total {
            StepStatus::Success
        } else if counted == 0 || succeeded as f64 / counted as f64 >= quorum - f64::EPSILON {
            StepStatus::SuccessPartial
        } else {
            StepStatus::Failed
        };

        // Merge in participating-agent order, then plan order
        let mut ordered: Vec<(usize, usize, String, AgentResponse)> = answers
            .iter()
            .enumerate()
            .filter_map(|(slot, answer)| {
                let assignment = &phase.assignments[slot];
                let pinned = self.agent_for(assignment.agent_id.as_ref(), assignment.capability);
                answer
                    .clone()
                    .map(|r| (self.state.merge_rank(&pinned), slot, assignment.question.clone(), r))
            })
            .collect();
        ordered.sort_by_key(|(rank, slot, _, _)| (*rank, *slot));
        let ordered: Vec<(String, AgentResponse)> = ordered.into_iter().map(|(_, _, q, r)| (q, r)).collect();
        let aggregate = self.inner.coordinator.aggregate_stage(&ordered);

        for conflict in &aggregate.conflicts {
            let Ok(record) = serde_json::to_value(conflict) else { continue };
            // Matched through the answer, which may come from an alternate agent
            let involved: Vec<Uuid> = phase
                .assignments
                .iter()
                .zip(steps.iter().zip(&answers))
                .filter_map(|(assignment, (step_id, answer))| {
                    let answer = answer.as_ref()?;
                    let matches =
                        assignment.question == conflict.question && conflict.agents.contains(&answer.agent_id);
                    if matches {
                        *step_id
                    } else {
                        None
                    }
                })
                .collect();
            for step_id in involved {
                let Some(step) = self.state.step_mut(step_id) else { continue };
                let entry = step
                    .metadata
                    .entry("conflicts")
                    .or_insert_with(|| Value::Array(vec![]));
                if let Value::Array(list) = entry {
                    list.push(record.clone());
                }
            }
            self.inner.events.publish(WorkflowEvent::ConflictRecorded {
                workflow_id,
                phase: index,
                conflict: conflict.clone(),
            });
        }

        let stage_error = if status != StepStatus::Failed {
            None
        } else if timed_out {
            Some(
                OrchestratorError::WorkflowTimeout {
                    scope: format!("stage {}", phase.name),
                    timeout_ms: phase_timeout_ms,
                }
                .to_step_error(),
            )
        } else if total == 1 {
            steps[0]
                .and_then(|id| self.state.step(id))
                .and_then(|s| s.error.clone())
        } else {
            Some(StepError::new(
                ErrorKind::QuorumNotMet,
                format!(
                    "stage {}: {} of {} counted assignments succeeded, quorum {}",
                    phase.name, succeeded, counted, quorum
                ),
                true,
            ))
        };

        let outcome = StageOutcome {
            index,
            name: phase.name.clone(),
            status,
            total,
            dispatched,
            succeeded,
            output: aggregate.output,
            conflicts: aggregate.conflicts,
            started_at,
            ended_at: Utc::now(),
        };
        Ok((outcome, stage_error))
    }

    /// Record a step result; returns the response when it succeeded
    fn finish_step(&mut self, step_id: Uuid, result: Result<(AgentResponse, u32)>) -> Option<AgentResponse> {
        let workflow_id = self.state.workflow_id;
        let step = self.state.step_mut(step_id)?;
        if step.status.is_finished() {
            // Already force-closed by a deadline
            return None;
        }
        step.ended_at = Some(Utc::now());

        let (status, agent_id, retry_count, response) = match result {
            Ok((response, retries)) => {
                step.status = if response.limitations.is_some() {
                    StepStatus::SuccessPartial
                } else {
                    StepStatus::Success
                };
                step.retry_count = retries;
                step.output_ref = Some(step_id.to_string());
                step.metadata
                    .insert("answered_by".to_string(), Value::String(response.agent_id.to_string()));
                (step.status, step.agent_id.clone(), retries, Some(response))
            }
            Err(e) => {
                step.status = match e {
                    OrchestratorError::Cancelled(_) => StepStatus::Cancelled,
                    _ => StepStatus::Failed,
                };
                step.error = Some(e.to_step_error());
                warn!(%workflow_id, %step_id, agent_id = %step.agent_id, "Step failed: {}", e);
                (step.status, step.agent_id.clone(), 0, None)
            }
        };

        if let Some(response) = &response {
            self.state.outputs.insert(step_id.to_string(), response.clone());
        }
        debug!(%workflow_id, %step_id, ?status, "Step finished");
        self.inner.events.publish(WorkflowEvent::StepFinished {
            workflow_id,
            step_id,
            agent_id,
            status,
            retry_count,
            at: Utc::now(),
        });
        response
    }

    /// Force-close RUNNING steps of a stage; returns how many were closed
    fn close_running(&mut self, index: usize, status: StepStatus, error: StepError) -> usize {
        let now = Utc::now();
        let mut closed = 0;
        for step in self
            .state
            .execution_history
            .iter_mut()
            .filter(|s| s.phase == index && s.status == StepStatus::Running)
        {
            step.status = status;
            step.ended_at = Some(now);
            step.error = Some(error.clone());
            closed += 1;
            self.inner.events.publish(WorkflowEvent::StepFinished {
                workflow_id: self.state.workflow_id,
                step_id: step.step_id,
                agent_id: step.agent_id.clone(),
                status,
                retry_count: step.retry_count,
                at: now,
            });
        }
        closed
    }

    /// Close steps left RUNNING by a runner that no longer exists
    fn close_orphaned_steps(&mut self, reason: &str) -> usize {
        let error = OrchestratorError::Cancelled(reason.to_string()).to_step_error();
        (0..self.state.plan.phases.len())
            .map(|index| self.close_running(index, StepStatus::Cancelled, error.clone()))
            .sum()
    }

    /// Stop tracking a finished workflow; the store holds its final state
    fn release(&self) {
        let workflow_id = self.state.workflow_id;
        self.inner
            .workflows
            .remove_if(&workflow_id, |_, handle| Arc::ptr_eq(handle, &self.handle));
    }

    fn agent_for(&self, pinned: Option<&AgentId>, capability: AgentCapability) -> AgentId {
        pinned
            .cloned()
            .unwrap_or_else(|| AgentId::from(capability.as_str()))
    }

    fn concurrency_limit(&self, phase: &Phase) -> usize {
        if let Some(limit) = self
            .state
            .plan
            .max_concurrent_tasks
            .or(self.inner.config.max_concurrent_tasks)
        {
            return limit.max(1);
        }

        let registry = self.inner.coordinator.registry();
        let mut capabilities: Vec<AgentCapability> = phase.assignments.iter().map(|a| a.capability).collect();
        capabilities.sort();
        capabilities.dedup();
        capabilities
            .iter()
            .map(|c| registry.type_limit(*c))
            .sum::<usize>()
            .clamp(1, phase.assignments.len().max(1))
    }

    /// Write the next version, retrying transient store failures
    async fn persist(&mut self) -> Result<()> {
        let workflow_id = self.state.workflow_id;
        let version = self.state.version + 1;
        self.state.version = version;
        self.state.updated_at = Utc::now();

        let retries = self.inner.config.store_retries;
        let mut attempt = 0u32;
        loop {
            match self.inner.store.put(workflow_id, version, &self.state).await {
                Ok(()) => {
                    self.handle.latest.send_replace(self.state.clone());
                    return Ok(());
                }
                Err(e @ OrchestratorError::VersionConflict { .. }) => {
                    self.state.version = version - 1;
                    return Err(e);
                }
                Err(e) if attempt < retries => {
                    attempt += 1;
                    warn!(%workflow_id, version, attempt, "State store write failed, retrying: {}", e);
                    self.inner.events.publish(WorkflowEvent::PersistenceRetry {
                        workflow_id,
                        version,
                        attempt,
                        error: e.to_string(),
                    });
                    let backoff = self.inner.config.store_backoff_ms.saturating_mul(1 << (attempt - 1).min(16));
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => {
                    self.state.version = version - 1;
                    return Err(OrchestratorError::Persistence(format!(
                        "version {} not stored after {} attempts: {}",
                        version,
                        attempt + 1,
                        e
                    )));
                }
            }
        }
    }

    /// Transition, persist, announce
    async fn set_status(&mut self, to: WorkflowStatus) -> Result<()> {
        let from = self.state.status;
        self.state.transition(to)?;
        if let Err(e) = self.persist().await {
            self.state.status = from;
            return Err(e);
        }
        self.inner.events.publish(WorkflowEvent::StatusChanged {
            workflow_id: self.state.workflow_id,
            from,
            to,
            version: self.state.version,
            at: Utc::now(),
        });
        Ok(())
    }

    async fn finish(&mut self, status: WorkflowStatus, error: Option<StepError>) {
        self.state.result = Some(self.build_result(status));
        self.state.error = error;
        match self.set_status(status).await {
            Ok(()) => {
                info!(
                    workflow_id = %self.state.workflow_id,
                    status = %status,
                    outcome = ?self.state.result.as_ref().map(|r| r.outcome),
                    "Workflow finished"
                );
                self.release();
            }
            Err(e @ OrchestratorError::InvalidTransition { .. }) => {
                error!(workflow_id = %self.state.workflow_id, "Cannot finish workflow: {}", e);
            }
            Err(e) => self.fail_unrecoverable(e).await,
        }
    }

    async fn finish_cancelled(&mut self) {
        let requested = *self
            .handle
            .cancel_requested_at
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        self.state.cancel_requested_at = requested.or_else(|| Some(Utc::now()));
        let error = OrchestratorError::Cancelled("cancelled by request".to_string()).to_step_error();
        self.finish(WorkflowStatus::Cancelled, Some(error)).await;
    }

    /// Mark FAILED after the store gave up; the final snapshot is written best-effort
    async fn fail_unrecoverable(&mut self, cause: OrchestratorError) {
        let workflow_id = self.state.workflow_id;
        error!(%workflow_id, "Failing workflow, state can no longer be persisted: {}", cause);

        let from = self.state.status;
        if from.can_transition_to(WorkflowStatus::Failed) {
            self.state.status = WorkflowStatus::Failed;
        }
        self.state.updated_at = Utc::now();
        self.state.error = Some(StepError::new(ErrorKind::Persistence, cause.to_string(), false));
        self.state.result = Some(self.build_result(WorkflowStatus::Failed));

        let version = self.state.version + 1;
        let stored = self.inner.store.put(workflow_id, version, &self.state).await.is_ok();
        if stored {
            self.state.version = version;
        }
        self.handle.latest.send_replace(self.state.clone());
        self.inner.events.publish(WorkflowEvent::StatusChanged {
            workflow_id,
            from,
            to: self.state.status,
            version: self.state.version,
            at: Utc::now(),
        });
        // The store still holds an older snapshot; keep serving this one
        if stored {
            self.release();
        }
    }

    fn build_result(&self, status: WorkflowStatus) -> WorkflowResult {
        let outcome = match status {
            WorkflowStatus::Completed => StepStatus::Success,
            WorkflowStatus::Cancelled => StepStatus::Cancelled,
            _ => StepStatus::Failed,
        };

        let limitations: Vec<String> = self
            .state
            .execution_history
            .iter()
            .filter_map(|step| {
                self.state
                    .output_of(step)
                    .and_then(|r| r.limitations.as_ref())
                    .map(|l| format!("{}: {}", step.agent_id, l))
            })
            .collect();

        // Degraded stages or answers turn a completed run into a partial success
        let degraded = !limitations.is_empty()
            || self
                .state
                .stage_outcomes
                .iter()
                .any(|s| s.status != StepStatus::Success);
        let outcome = if outcome == StepStatus::Success && degraded {
            StepStatus::SuccessPartial
        } else {
            outcome
        };

        WorkflowResult {
            outcome,
            output: self
                .state
                .stage_outcomes
                .last()
                .map(|s| s.output.clone())
                .unwrap_or(Value::Null),
            stage_outputs: self.state.stage_outcomes.iter().map(|s| s.output.clone()).collect(),
            conflicts: self
                .state
                .stage_outcomes
                .iter()
                .flat_map(|s| s.conflicts.iter().cloned())
                .collect(),
            limitations,
        }
    }
}

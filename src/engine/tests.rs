// Workflow scenarios run end to end against scripted agents

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, Semaphore};
use tokio_test::assert_err;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::agents::{AgentAdapter, AgentRegistration, AgentRegistry};
use super::coordinator::{AgentCoordinator, CoordinatorConfig};
use super::events::{EventBus, WorkflowEvent};
use super::storage::{InMemoryStateStore, StateStore};
use super::workflow::{EngineConfig, WorkflowEngine};
use crate::models::{
    AgentCapability, AgentId, AgentInput, AgentResponse, Assignment, ErrorKind, ExecutionStep, Phase, StepStatus,
    Task, TaskKind, WorkflowPlan, WorkflowState, WorkflowStatus,
};
use crate::{OrchestratorError, Result};

struct ScriptedAgent {
    content: String,
    confidence: f64,
    fail: bool,
    delay: Duration,
    /// Ignores cancellation while sleeping
    stubborn: bool,
    gate: Option<Arc<Semaphore>>,
    inputs: Mutex<Vec<AgentInput>>,
}

impl ScriptedAgent {
    fn answering(content: &str) -> Self {
        Self {
            content: content.to_string(),
            confidence: 0.9,
            fail: false,
            delay: Duration::ZERO,
            stubborn: false,
            gate: None,
            inputs: Mutex::new(vec![]),
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::answering("")
        }
    }

    fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn stubborn(mut self) -> Self {
        self.stubborn = true;
        self
    }

    fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn inputs(&self) -> Vec<AgentInput> {
        self.inputs.lock().unwrap().clone()
    }

    fn calls(&self) -> usize {
        self.inputs.lock().unwrap().len()
    }
}

#[async_trait]
impl AgentAdapter for ScriptedAgent {
    async fn invoke(&self, input: AgentInput, cancel: CancellationToken) -> Result<AgentResponse> {
        self.inputs.lock().unwrap().push(input);

        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.map_err(|e| OrchestratorError::Agent {
                agent_id: "scripted".to_string(),
                message: e.to_string(),
            })?;
        }

        if !self.delay.is_zero() {
            if self.stubborn {
                tokio::time::sleep(self.delay).await;
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => {}
                    _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled("aborted".to_string())),
                }
            }
        }

        if self.fail {
            return Err(OrchestratorError::Agent {
                agent_id: "scripted".to_string(),
                message: "scripted failure".to_string(),
            });
        }
        Ok(AgentResponse::new("scripted", self.content.clone(), self.confidence))
    }
}

fn registry(agents: &[(&str, AgentCapability, &Arc<ScriptedAgent>)]) -> Arc<AgentRegistry> {
    let mut registry = AgentRegistry::new();
    for (id, capability, agent) in agents {
        let adapter: Arc<dyn AgentAdapter> = (*agent).clone();
        registry
            .register(AgentRegistration::new(*id, *capability, 1, adapter).with_max_concurrent_tasks(10))
            .unwrap();
    }
    Arc::new(registry)
}

fn engine(registry: Arc<AgentRegistry>, store: Arc<dyn StateStore>, config: EngineConfig) -> WorkflowEngine {
    let coordinator = Arc::new(AgentCoordinator::new(registry, CoordinatorConfig::default()));
    WorkflowEngine::new(coordinator, store, EventBus::default(), config)
}

fn agent(content: &str) -> Arc<ScriptedAgent> {
    Arc::new(ScriptedAgent::answering(content))
}

fn ask(capability: AgentCapability, agent_id: &str) -> Assignment {
    Assignment::new(capability, format!("question for {}", agent_id)).with_agent(agent_id)
}

fn drain(rx: &mut broadcast::Receiver<WorkflowEvent>, workflow_id: Uuid) -> Vec<WorkflowEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if event.workflow_id() == workflow_id {
            events.push(event);
        }
    }
    events
}

async fn wait_for_dispatch(rx: &mut broadcast::Receiver<WorkflowEvent>) {
    loop {
        if let WorkflowEvent::StepDispatched { .. } = rx.recv().await.unwrap() {
            return;
        }
    }
}

async fn run(engine: &WorkflowEngine, plan: WorkflowPlan) -> WorkflowState {
    let id = engine.start(plan).await.unwrap();
    engine.wait(id).await.unwrap()
}

/// Store the snapshots a process leaves behind when it dies mid-stage:
/// RUNNING, with the first step of stage 0 still RUNNING
async fn store_abandoned(store: &InMemoryStateStore, mut plan: WorkflowPlan) -> WorkflowState {
    plan.normalize().unwrap();
    let mut state = WorkflowState::new(plan);
    state.version = 1;
    store.put(state.workflow_id, 1, &state).await.unwrap();

    state.transition(WorkflowStatus::Running).unwrap();
    let phase = state.plan.phases[0].clone();
    let assignment = &phase.assignments[0];
    state.execution_history.push(ExecutionStep {
        step_id: Uuid::new_v4(),
        agent_id: assignment.agent_id.clone().unwrap(),
        assignment_id: assignment.assignment_id.clone(),
        phase: 0,
        phase_name: phase.name.clone(),
        input_ref: "request".to_string(),
        output_ref: None,
        status: StepStatus::Running,
        retry_count: 0,
        started_at: Some(chrono::Utc::now()),
        ended_at: None,
        error: None,
        metadata: serde_json::Map::new(),
    });
    state.version = 2;
    store.put(state.workflow_id, 2, &state).await.unwrap();
    state
}

#[tokio::test]
async fn test_history_length_equals_dispatched_steps() {
    let (a, b, c) = (agent("a"), agent("b"), agent("c"));
    let registry = registry(&[
        ("a", AgentCapability::Sales, &a),
        ("b", AgentCapability::Manager, &b),
        ("c", AgentCapability::CustomerSupport, &c),
    ]);
    let store = Arc::new(InMemoryStateStore::default());
    let engine = engine(registry, store.clone(), EngineConfig::default());
    let mut events = engine.subscribe();

    let plan = WorkflowPlan::parallel(
        "three agents",
        vec![
            ask(AgentCapability::Sales, "a"),
            ask(AgentCapability::Manager, "b"),
            ask(AgentCapability::CustomerSupport, "c"),
        ],
    );
    let state = run(&engine, plan).await;

    let dispatched = drain(&mut events, state.workflow_id)
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::StepDispatched { .. }))
        .count();
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.execution_history.len(), 3);
    assert_eq!(dispatched, 3);
    assert_eq!(state.summary().steps_dispatched, 3);
    assert!(state.execution_history.iter().all(|s| s.status == StepStatus::Success));
    assert_eq!(state.result.as_ref().unwrap().outcome, StepStatus::Success);

    // Every version was written, in order
    let versions: Vec<u64> = store
        .history(state.workflow_id)
        .await
        .unwrap()
        .iter()
        .map(|s| s.version)
        .collect();
    assert_eq!(versions, (1..=state.version).collect::<Vec<_>>());
    assert_eq!(store.get(state.workflow_id).await.unwrap().unwrap().status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn test_sequential_steps_receive_previous_output() {
    let (first, second) = (agent("draft quote"), agent("approved"));
    let registry = registry(&[
        ("sales-1", AgentCapability::Sales, &first),
        ("manager-1", AgentCapability::Manager, &second),
    ]);
    let engine = engine(registry, Arc::new(InMemoryStateStore::default()), EngineConfig::default());

    let plan = WorkflowPlan::sequential(
        "quote then approve",
        vec![ask(AgentCapability::Sales, "sales-1"), ask(AgentCapability::Manager, "manager-1")],
    );
    let state = run(&engine, plan).await;

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(first.inputs()[0].previous, Value::Null);
    assert_eq!(second.inputs()[0].previous, Value::String("draft quote".to_string()));
    assert_eq!(state.execution_history[0].input_ref, "request");
    assert_eq!(state.execution_history[1].input_ref, "stage-1");
    assert_eq!(state.result.unwrap().output, Value::String("approved".to_string()));
}

#[tokio::test]
async fn test_optional_failure_in_sequence_degrades_and_continues() {
    let (one, two, three) = (
        agent("one"),
        Arc::new(ScriptedAgent::failing()),
        agent("three"),
    );
    let registry = registry(&[
        ("one", AgentCapability::CustomerSupport, &one),
        ("two", AgentCapability::Sales, &two),
        ("three", AgentCapability::Manager, &three),
    ]);
    let engine = engine(registry, Arc::new(InMemoryStateStore::default()), EngineConfig::default());

    let plan = WorkflowPlan::sequential(
        "three optional steps",
        vec![
            ask(AgentCapability::CustomerSupport, "one").optional(),
            ask(AgentCapability::Sales, "two").optional(),
            ask(AgentCapability::Manager, "three").optional(),
        ],
    );
    let state = run(&engine, plan).await;

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.result.as_ref().unwrap().outcome, StepStatus::SuccessPartial);
    assert_eq!(state.execution_history.len(), 3);
    assert_eq!(state.execution_history[1].status, StepStatus::Failed);
    assert_eq!(state.stage_outcomes[1].status, StepStatus::SuccessPartial);
    assert_eq!(three.calls(), 1);
    assert_eq!(three.inputs()[0].previous, Value::Null);
}

#[tokio::test]
async fn test_required_failure_aborts_remaining_steps() {
    let (one, two, three) = (agent("one"), Arc::new(ScriptedAgent::failing()), agent("three"));
    let registry = registry(&[
        ("one", AgentCapability::CustomerSupport, &one),
        ("two", AgentCapability::Sales, &two),
        ("three", AgentCapability::Manager, &three),
    ]);
    let engine = engine(registry, Arc::new(InMemoryStateStore::default()), EngineConfig::default());

    let plan = WorkflowPlan::sequential(
        "required steps",
        vec![
            ask(AgentCapability::CustomerSupport, "one"),
            ask(AgentCapability::Sales, "two"),
            ask(AgentCapability::Manager, "three"),
        ],
    );
    let state = run(&engine, plan).await;

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(state.execution_history.len(), 2);
    assert_eq!(three.calls(), 0);
    let error = state.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Agent);
    // Partial results survive the failure
    let result = state.result.unwrap();
    assert_eq!(result.outcome, StepStatus::Failed);
    assert_eq!(result.stage_outputs[0], Value::String("one".to_string()));
}

fn quorum_plan(successes: usize, failures: usize) -> (Arc<AgentRegistry>, WorkflowPlan) {
    let good = agent("ok");
    let bad = Arc::new(ScriptedAgent::failing());
    let mut agents: Vec<(String, Arc<ScriptedAgent>)> = Vec::new();
    for i in 0..successes {
        agents.push((format!("good-{}", i), good.clone()));
    }
    for i in 0..failures {
        agents.push((format!("bad-{}", i), bad.clone()));
    }

    let entries: Vec<(&str, AgentCapability, &Arc<ScriptedAgent>)> = agents
        .iter()
        .map(|(id, a)| (id.as_str(), AgentCapability::Sales, a))
        .collect();
    let assignments = agents
        .iter()
        .map(|(id, _)| Assignment::new(AgentCapability::Sales, "same question").with_agent(id.as_str()))
        .collect();
    (registry(&entries), WorkflowPlan::parallel("quorum", assignments).with_quorum(0.6))
}

#[tokio::test]
async fn test_quorum_met_gives_partial_success() {
    let (registry, plan) = quorum_plan(3, 2);
    let engine = engine(registry, Arc::new(InMemoryStateStore::default()), EngineConfig::default());

    let state = run(&engine, plan).await;
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.stage_outcomes[0].status, StepStatus::SuccessPartial);
    assert_eq!(state.stage_outcomes[0].succeeded, 3);
    assert_eq!(state.result.unwrap().outcome, StepStatus::SuccessPartial);
}

#[tokio::test]
async fn test_quorum_missed_fails_the_stage() {
    let (registry, plan) = quorum_plan(2, 3);
    let engine = engine(registry, Arc::new(InMemoryStateStore::default()), EngineConfig::default());

    let state = run(&engine, plan).await;
    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(state.stage_outcomes[0].status, StepStatus::Failed);
    assert_eq!(state.error.unwrap().kind, ErrorKind::QuorumNotMet);
    // Siblings were not aborted by the failures
    assert_eq!(state.execution_history.len(), 5);
}

#[tokio::test]
async fn test_unregistered_agent_counts_as_failed_subtask() {
    let sales = agent("quote");
    let registry = registry(&[("sales-1", AgentCapability::Sales, &sales)]);
    let engine = engine(registry, Arc::new(InMemoryStateStore::default()), EngineConfig::default());

    let plan = WorkflowPlan::parallel(
        "one ghost",
        vec![ask(AgentCapability::Sales, "sales-1"), ask(AgentCapability::FieldService, "ghost")],
    )
    .with_quorum(0.5);
    let state = run(&engine, plan).await;

    assert_eq!(state.status, WorkflowStatus::Completed);
    let ghost = state
        .execution_history
        .iter()
        .find(|s| s.agent_id == AgentId::from("ghost"))
        .unwrap();
    assert_eq!(ghost.status, StepStatus::Failed);
    assert_eq!(ghost.error.as_ref().unwrap().kind, ErrorKind::AgentUnavailable);
}

#[tokio::test(start_paused = true)]
async fn test_merge_order_ignores_completion_order() {
    // "slow" is registered first in the plan but finishes last
    let slow = Arc::new(ScriptedAgent::answering("forty").with_delay(Duration::from_millis(50)));
    let fast = agent("forty-five");
    let registry = registry(&[
        ("slow", AgentCapability::Sales, &slow),
        ("fast", AgentCapability::Sales, &fast),
    ]);
    let engine = engine(registry, Arc::new(InMemoryStateStore::default()), EngineConfig::default());

    let plan = WorkflowPlan::parallel(
        "price check",
        vec![
            Assignment::new(AgentCapability::Sales, "price?").with_agent("slow"),
            Assignment::new(AgentCapability::Sales, "price?").with_agent("fast"),
        ],
    );
    let state = run(&engine, plan).await;

    let output = &state.result.as_ref().unwrap().output;
    assert_eq!(output["unresolved"], true);
    assert_eq!(output["candidates"][0]["agent_id"], "slow");
    assert_eq!(output["candidates"][1]["agent_id"], "fast");

    // The conflict is recorded on the stage and on both steps
    assert_eq!(state.stage_outcomes[0].conflicts.len(), 1);
    for step in &state.execution_history {
        assert_eq!(step.metadata["conflicts"].as_array().unwrap().len(), 1);
    }
}

#[tokio::test]
async fn test_higher_confidence_answer_wins_inside_a_stage() {
    let confident = Arc::new(ScriptedAgent::answering("Plan A is 40").with_confidence(0.9));
    let unsure = Arc::new(ScriptedAgent::answering("Plan A is 45").with_confidence(0.65));
    let registry = registry(&[
        ("agent-1", AgentCapability::Sales, &confident),
        ("agent-2", AgentCapability::Sales, &unsure),
    ]);
    let engine = engine(registry, Arc::new(InMemoryStateStore::default()), EngineConfig::default());

    let plan = WorkflowPlan::parallel(
        "compare pricing answers",
        vec![
            Assignment::new(AgentCapability::Sales, "pricing").with_agent("agent-1"),
            Assignment::new(AgentCapability::Sales, "pricing").with_agent("agent-2"),
        ],
    );
    let state = run(&engine, plan).await;

    let result = state.result.unwrap();
    assert_eq!(result.output, Value::String("Plan A is 40".to_string()));
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].selected, Some(AgentId::from("agent-1")));
}

#[tokio::test]
async fn test_low_confidence_answer_is_kept_with_limitations() {
    let unsure = Arc::new(ScriptedAgent::answering("maybe").with_confidence(0.3));
    let registry = registry(&[("sales-1", AgentCapability::Sales, &unsure)]);
    let engine = engine(registry, Arc::new(InMemoryStateStore::default()), EngineConfig::default());

    let state = run(
        &engine,
        WorkflowPlan::sequential("unsure", vec![ask(AgentCapability::Sales, "sales-1")]),
    )
    .await;

    assert_eq!(state.status, WorkflowStatus::Completed);
    let step = &state.execution_history[0];
    assert_eq!(step.status, StepStatus::SuccessPartial);
    assert_eq!(step.retry_count, 1);
    let result = state.result.unwrap();
    assert_eq!(result.outcome, StepStatus::SuccessPartial);
    assert_eq!(result.limitations.len(), 1);
}

#[tokio::test]
async fn test_hierarchical_phases_run_in_order() {
    let (support, sales, field, manager) = (agent("needs fiber"), agent("fiber plan"), agent("no visit"), agent("approved"));
    let registry = registry(&[
        ("support-1", AgentCapability::CustomerSupport, &support),
        ("sales-1", AgentCapability::Sales, &sales),
        ("field-1", AgentCapability::FieldService, &field),
        ("manager-1", AgentCapability::Manager, &manager),
    ]);
    let coordinator = AgentCoordinator::new(registry.clone(), CoordinatorConfig::default());
    let plan = coordinator
        .coordinate(&Task::new("Customer wants faster internet", TaskKind::CustomerInquiry))
        .unwrap();
    let engine = engine(registry, Arc::new(InMemoryStateStore::default()), EngineConfig::default());

    let state = run(&engine, plan).await;

    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(state.stage_outcomes.len(), 3);
    for step in state.execution_history.iter().filter(|s| s.phase > 0) {
        assert!(step.started_at.unwrap() >= state.stage_outcomes[step.phase - 1].ended_at);
    }

    assert_eq!(sales.inputs()[0].previous, Value::String("needs fiber".to_string()));
    let review_input = &manager.inputs()[0].previous;
    assert_eq!(review_input["offer"], "fiber plan");
    assert_eq!(review_input["service"], "no visit");
    assert_eq!(state.result.unwrap().output, Value::String("approved".to_string()));
}

#[tokio::test]
async fn test_pause_and_resume_matches_uninterrupted_run() {
    let plan = || {
        WorkflowPlan::sequential(
            "three steps",
            vec![
                ask(AgentCapability::CustomerSupport, "one"),
                ask(AgentCapability::Sales, "two"),
                ask(AgentCapability::Manager, "three"),
            ],
        )
    };

    let uninterrupted = {
        let (one, two, three) = (agent("1"), agent("2"), agent("3"));
        let registry = registry(&[
            ("one", AgentCapability::CustomerSupport, &one),
            ("two", AgentCapability::Sales, &two),
            ("three", AgentCapability::Manager, &three),
        ]);
        let engine = engine(registry, Arc::new(InMemoryStateStore::default()), EngineConfig::default());
        run(&engine, plan()).await.result.unwrap()
    };

    let gate = Arc::new(Semaphore::new(0));
    let one = Arc::new(ScriptedAgent::answering("1").gated(gate.clone()));
    let (two, three) = (agent("2"), agent("3"));
    let registry = registry(&[
        ("one", AgentCapability::CustomerSupport, &one),
        ("two", AgentCapability::Sales, &two),
        ("three", AgentCapability::Manager, &three),
    ]);
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::default());
    let first_engine = engine(registry.clone(), store.clone(), EngineConfig::default());
    let mut events = first_engine.subscribe();

    let id = first_engine.start(plan()).await.unwrap();
    wait_for_dispatch(&mut events).await;
    first_engine.pause(id).await.unwrap();
    gate.add_permits(1);

    let paused = first_engine.wait(id).await.unwrap();
    assert_eq!(paused.status, WorkflowStatus::Paused);
    assert_eq!(paused.current_step, 1);
    assert_eq!(two.calls(), 0);
    assert_err!(first_engine.pause(id).await);

    // A fresh engine continues purely from the stored snapshot
    let second_engine = engine(registry, store.clone(), EngineConfig::default());
    second_engine.resume(id).await.unwrap();
    let finished = second_engine.wait(id).await.unwrap();

    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(finished.execution_history.len(), 3);
    let resumed = finished.result.unwrap();
    assert_eq!(resumed.output, uninterrupted.output);
    assert_eq!(resumed.stage_outputs, uninterrupted.stage_outputs);
    assert_eq!(resumed.outcome, uninterrupted.outcome);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_force_closes_steps_after_grace() {
    let stuck = Arc::new(ScriptedAgent::answering("late").with_delay(Duration::from_secs(120)).stubborn());
    let registry = registry(&[("stuck", AgentCapability::FieldService, &stuck)]);
    let engine = engine(registry, Arc::new(InMemoryStateStore::default()), EngineConfig::default());
    let mut events = engine.subscribe();

    let plan = WorkflowPlan::parallel(
        "three slow visits",
        vec![
            ask(AgentCapability::FieldService, "stuck"),
            ask(AgentCapability::FieldService, "stuck"),
            ask(AgentCapability::FieldService, "stuck"),
        ],
    )
    .with_max_concurrency(1)
    .with_step_timeout(Duration::from_secs(600));
    let id = engine.start(plan).await.unwrap();
    wait_for_dispatch(&mut events).await;

    let cancelled_at = chrono::Utc::now();
    let before = tokio::time::Instant::now();
    engine.cancel(id).await.unwrap();
    assert!(before.elapsed() >= Duration::from_secs(5));

    let state = engine.get_status(id).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Cancelled);
    assert!(state.cancel_requested_at.is_some());
    assert_eq!(state.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    // Only the step running at cancel time exists, and it was force-closed
    assert_eq!(state.execution_history.len(), 1);
    assert_eq!(state.execution_history[0].status, StepStatus::Cancelled);
    let grace = chrono::Duration::seconds(5);
    assert!(state
        .execution_history
        .iter()
        .all(|s| s.started_at.unwrap() <= cancelled_at + grace));

    // Cancelling again is a no-op
    engine.cancel(id).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_step_finishes_within_grace() {
    let quick = Arc::new(ScriptedAgent::answering("done").with_delay(Duration::from_secs(2)));
    let registry = registry(&[("quick", AgentCapability::Sales, &quick)]);
    let engine = engine(registry, Arc::new(InMemoryStateStore::default()), EngineConfig::default());
    let mut events = engine.subscribe();

    let plan = WorkflowPlan::sequential(
        "two steps",
        vec![ask(AgentCapability::Sales, "quick"), ask(AgentCapability::Sales, "quick")],
    );
    let id = engine.start(plan).await.unwrap();
    wait_for_dispatch(&mut events).await;

    let before = tokio::time::Instant::now();
    engine.cancel(id).await.unwrap();
    assert!(before.elapsed() < Duration::from_secs(5));

    let state = engine.get_status(id).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Cancelled);
    assert_eq!(state.execution_history.len(), 1);
    assert_eq!(state.execution_history[0].status, StepStatus::Success);
    assert_eq!(quick.calls(), 1);
}

#[tokio::test]
async fn test_control_operations_follow_the_state_machine() {
    let gate = Arc::new(Semaphore::new(0));
    let gated = Arc::new(ScriptedAgent::answering("x").gated(gate.clone()));
    let other = agent("y");
    let registry = registry(&[
        ("gated", AgentCapability::Sales, &gated),
        ("other", AgentCapability::Manager, &other),
    ]);
    let engine = engine(registry, Arc::new(InMemoryStateStore::default()), EngineConfig::default());
    let mut events = engine.subscribe();

    let plan = WorkflowPlan::sequential(
        "two steps",
        vec![ask(AgentCapability::Sales, "gated"), ask(AgentCapability::Manager, "other")],
    );
    let id = engine.start(plan).await.unwrap();
    assert_err!(engine.resume(id).await);

    wait_for_dispatch(&mut events).await;
    engine.pause(id).await.unwrap();
    gate.add_permits(1);
    assert_eq!(engine.wait(id).await.unwrap().status, WorkflowStatus::Paused);

    // Cancelling a paused workflow needs no runner
    engine.cancel(id).await.unwrap();
    let state = engine.get_status(id).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Cancelled);
    assert_eq!(other.calls(), 0);
    assert!(matches!(
        engine.resume(id).await,
        Err(OrchestratorError::InvalidTransition { .. })
    ));

    let done = engine
        .start(WorkflowPlan::sequential("one", vec![ask(AgentCapability::Manager, "other")]))
        .await
        .unwrap();
    engine.wait(done).await.unwrap();
    assert!(matches!(
        engine.cancel(done).await,
        Err(OrchestratorError::InvalidTransition { .. })
    ));
    assert!(matches!(
        engine.get_status(Uuid::new_v4()).await,
        Err(OrchestratorError::WorkflowNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_phase_deadline_fails_running_steps() {
    let stuck = Arc::new(ScriptedAgent::answering("late").with_delay(Duration::from_secs(30)).stubborn());
    let registry = registry(&[("stuck", AgentCapability::FieldService, &stuck)]);
    let engine = engine(registry, Arc::new(InMemoryStateStore::default()), EngineConfig::default());

    let plan = WorkflowPlan::parallel("slow", vec![ask(AgentCapability::FieldService, "stuck")])
        .with_phase_timeout(Duration::from_secs(1));
    let state = run(&engine, plan).await;

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(state.execution_history[0].status, StepStatus::Failed);
    assert_eq!(state.execution_history[0].error.as_ref().unwrap().kind, ErrorKind::Timeout);
    assert_eq!(state.error.unwrap().kind, ErrorKind::Timeout);
}

#[tokio::test(start_paused = true)]
async fn test_step_deadline_fails_the_step() {
    let slow = Arc::new(ScriptedAgent::answering("late").with_delay(Duration::from_secs(30)));
    let registry = registry(&[("slow", AgentCapability::Sales, &slow)]);
    let engine = engine(registry, Arc::new(InMemoryStateStore::default()), EngineConfig::default());

    let plan = WorkflowPlan::sequential("slow", vec![ask(AgentCapability::Sales, "slow")])
        .with_step_timeout(Duration::from_secs(1));
    let state = run(&engine, plan).await;

    assert_eq!(state.status, WorkflowStatus::Failed);
    assert_eq!(state.execution_history[0].error.as_ref().unwrap().kind, ErrorKind::Timeout);
}

/// Store that rejects every write from `fail_from` on
struct FlakyStore {
    inner: InMemoryStateStore,
    fail_from: u64,
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn put(&self, workflow_id: Uuid, version: u64, state: &WorkflowState) -> Result<()> {
        if version >= self.fail_from {
            return Err(OrchestratorError::Persistence("disk full".to_string()));
        }
        self.inner.put(workflow_id, version, state).await
    }

    async fn get(&self, workflow_id: Uuid) -> Result<Option<WorkflowState>> {
        self.inner.get(workflow_id).await
    }

    async fn list(&self) -> Result<Vec<WorkflowState>> {
        self.inner.list().await
    }

    async fn history(&self, workflow_id: Uuid) -> Result<Vec<WorkflowState>> {
        self.inner.history(workflow_id).await
    }

    async fn cleanup_terminal(&self, max_age: Duration) -> Result<usize> {
        self.inner.cleanup_terminal(max_age).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_store_exhaustion_fails_workflow_unrecoverably() {
    let sales = agent("quote");
    let registry = registry(&[("sales-1", AgentCapability::Sales, &sales)]);
    let store = Arc::new(FlakyStore {
        inner: InMemoryStateStore::default(),
        fail_from: 3,
    });
    let engine = engine(registry, store.clone(), EngineConfig::default());
    let mut events = engine.subscribe();

    let state = run(
        &engine,
        WorkflowPlan::sequential("doomed", vec![ask(AgentCapability::Sales, "sales-1")]),
    )
    .await;

    assert_eq!(state.status, WorkflowStatus::Failed);
    let error = state.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Persistence);
    assert!(!error.recoverable);
    // The step that could not be recorded never ran
    assert!(state.execution_history.is_empty());
    assert_eq!(sales.calls(), 0);

    let retries = drain(&mut events, state.workflow_id)
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::PersistenceRetry { .. }))
        .count();
    assert_eq!(retries, 3);
    assert_eq!(store.get(state.workflow_id).await.unwrap().unwrap().version, 2);
}

#[tokio::test]
async fn test_start_surfaces_store_failure() {
    let sales = agent("quote");
    let registry = registry(&[("sales-1", AgentCapability::Sales, &sales)]);
    let store = Arc::new(FlakyStore {
        inner: InMemoryStateStore::default(),
        fail_from: 1,
    });
    let config = EngineConfig {
        store_backoff_ms: 1,
        ..EngineConfig::default()
    };
    let engine = engine(registry, store, config);

    let err = engine
        .start(WorkflowPlan::sequential("doomed", vec![ask(AgentCapability::Sales, "sales-1")]))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Persistence(_)));
}

#[tokio::test]
async fn test_cyclic_plan_is_rejected_before_start() {
    let sales = agent("quote");
    let registry = registry(&[("sales-1", AgentCapability::Sales, &sales)]);
    let engine = engine(registry, Arc::new(InMemoryStateStore::default()), EngineConfig::default());

    let plan = WorkflowPlan::hierarchical(
        "loop",
        vec![
            Phase::new("a", vec![ask(AgentCapability::Sales, "sales-1")]).depends_on(&["b"]),
            Phase::new("b", vec![ask(AgentCapability::Sales, "sales-1")]).depends_on(&["a"]),
        ],
    );
    assert!(matches!(engine.start(plan).await, Err(OrchestratorError::InvalidPlan(_))));
    assert_eq!(sales.calls(), 0);
}

#[tokio::test]
async fn test_unpinned_assignment_gets_registered_agent() {
    let sales = agent("quote");
    let registry = registry(&[("sales-1", AgentCapability::Sales, &sales)]);
    let engine = engine(registry, Arc::new(InMemoryStateStore::default()), EngineConfig::default());

    let plan = WorkflowPlan::sequential("unpinned", vec![Assignment::new(AgentCapability::Sales, "quote?")]);
    let state = run(&engine, plan).await;

    assert_eq!(state.participating_agents, vec![AgentId::from("sales-1")]);
    assert_eq!(state.execution_history[0].agent_id, AgentId::from("sales-1"));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_parks_running_workflows() {
    let slow = Arc::new(ScriptedAgent::answering("x").with_delay(Duration::from_secs(1)));
    let registry = registry(&[("slow", AgentCapability::Sales, &slow)]);
    let engine = engine(registry, Arc::new(InMemoryStateStore::default()), EngineConfig::default());

    let id = engine
        .start(WorkflowPlan::sequential(
            "two",
            vec![ask(AgentCapability::Sales, "slow"), ask(AgentCapability::Sales, "slow")],
        ))
        .await
        .unwrap();

    let stuck = engine.shutdown(Duration::from_secs(30)).await;
    assert!(stuck.is_empty());
    assert_eq!(engine.get_status(id).await.unwrap().status, WorkflowStatus::Paused);
}

#[tokio::test]
async fn test_abandoned_running_workflow_can_be_cancelled() {
    let sales = agent("quote");
    let registry = registry(&[("sales-1", AgentCapability::Sales, &sales)]);
    let store = Arc::new(InMemoryStateStore::default());
    let abandoned = store_abandoned(
        &store,
        WorkflowPlan::sequential("left behind", vec![ask(AgentCapability::Sales, "sales-1")]),
    )
    .await;
    let id = abandoned.workflow_id;

    // A fresh engine, as after a restart
    let engine = engine(registry, store.clone(), EngineConfig::default());
    assert_eq!(engine.get_status(id).await.unwrap().status, WorkflowStatus::Running);

    engine.cancel(id).await.unwrap();

    let state = store.get(id).await.unwrap().unwrap();
    assert_eq!(state.status, WorkflowStatus::Cancelled);
    assert_eq!(state.version, 3);
    assert_eq!(state.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(state.execution_history.len(), 1);
    let step = &state.execution_history[0];
    assert_eq!(step.status, StepStatus::Cancelled);
    assert!(step.ended_at.is_some());
    assert_eq!(sales.calls(), 0);
    assert_eq!(engine.tracked_workflows(), 0);
}

#[tokio::test]
async fn test_abandoned_running_workflow_resumes_its_current_stage() {
    let (sales, manager) = (agent("quote"), agent("approved"));
    let registry = registry(&[
        ("sales-1", AgentCapability::Sales, &sales),
        ("manager-1", AgentCapability::Manager, &manager),
    ]);
    let store = Arc::new(InMemoryStateStore::default());
    let plan = WorkflowPlan::sequential(
        "quote then approve",
        vec![ask(AgentCapability::Sales, "sales-1"), ask(AgentCapability::Manager, "manager-1")],
    );
    let id = store_abandoned(&store, plan).await.workflow_id;
    let engine = engine(registry, store.clone(), EngineConfig::default());

    engine.resume(id).await.unwrap();
    let state = engine.wait(id).await.unwrap();

    assert_eq!(state.status, WorkflowStatus::Completed);
    let statuses: Vec<StepStatus> = state.execution_history.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![StepStatus::Cancelled, StepStatus::Success, StepStatus::Success]
    );
    assert_eq!(sales.calls(), 1);
    assert_eq!(manager.calls(), 1);
    assert_eq!(state.result.unwrap().output, Value::String("approved".to_string()));

    let versions: Vec<u64> = store.history(id).await.unwrap().iter().map(|s| s.version).collect();
    let expected: Vec<u64> = (1..=state.version).collect();
    assert_eq!(versions, expected);
}

#[tokio::test]
async fn test_abandoned_running_workflow_can_be_parked() {
    let sales = agent("quote");
    let registry = registry(&[("sales-1", AgentCapability::Sales, &sales)]);
    let store = Arc::new(InMemoryStateStore::default());
    let id = store_abandoned(
        &store,
        WorkflowPlan::sequential("left behind", vec![ask(AgentCapability::Sales, "sales-1")]),
    )
    .await
    .workflow_id;
    let engine = engine(registry, store.clone(), EngineConfig::default());

    engine.pause(id).await.unwrap();
    let parked = store.get(id).await.unwrap().unwrap();
    assert_eq!(parked.status, WorkflowStatus::Paused);
    assert_eq!(parked.execution_history[0].status, StepStatus::Cancelled);
    assert_eq!(sales.calls(), 0);

    engine.resume(id).await.unwrap();
    assert_eq!(engine.wait(id).await.unwrap().status, WorkflowStatus::Completed);
    assert_eq!(sales.calls(), 1);
}

#[tokio::test]
async fn test_conflict_is_recorded_on_step_answered_by_alternate() {
    let unsure = Arc::new(ScriptedAgent::answering("Plan A is 40/month").with_confidence(0.3));
    let backup = Arc::new(ScriptedAgent::answering("Plan A is 40/month").with_confidence(0.9));
    let manager = Arc::new(ScriptedAgent::answering("Plan A is 45/month").with_confidence(0.7));
    let registry = registry(&[
        ("sales-1", AgentCapability::Sales, &unsure),
        ("sales-2", AgentCapability::Sales, &backup),
        ("manager-1", AgentCapability::Manager, &manager),
    ]);
    let engine = engine(registry, Arc::new(InMemoryStateStore::default()), EngineConfig::default());

    let plan = WorkflowPlan::parallel(
        "price check",
        vec![
            Assignment::new(AgentCapability::Sales, "price").with_agent("sales-1"),
            Assignment::new(AgentCapability::Manager, "price").with_agent("manager-1"),
        ],
    );
    let state = run(&engine, plan).await;

    assert_eq!(state.status, WorkflowStatus::Completed);
    let conflicts = &state.stage_outcomes[0].conflicts;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(
        conflicts[0].agents,
        vec![AgentId::from("sales-2"), AgentId::from("manager-1")]
    );

    let sales_step = state
        .execution_history
        .iter()
        .find(|s| s.agent_id.as_str() == "sales-1")
        .unwrap();
    assert_eq!(sales_step.retry_count, 1);
    assert_eq!(sales_step.metadata["answered_by"], "sales-2");

    for step in &state.execution_history {
        let recorded = step.metadata["conflicts"].as_array().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0]["question"], "price");
    }
    assert_eq!(unsure.calls(), 1);
    assert_eq!(backup.calls(), 1);
}

#[tokio::test]
async fn test_finished_workflows_are_served_from_the_store() {
    let sales = agent("quote");
    let registry = registry(&[("sales-1", AgentCapability::Sales, &sales)]);
    let engine = engine(registry, Arc::new(InMemoryStateStore::default()), EngineConfig::default());

    let mut ids = Vec::new();
    for i in 0..50 {
        let plan = WorkflowPlan::sequential(format!("request {}", i), vec![ask(AgentCapability::Sales, "sales-1")]);
        ids.push(run(&engine, plan).await.workflow_id);
    }
    assert_eq!(engine.tracked_workflows(), 0);

    let state = engine.get_status(ids[0]).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Completed);
    assert_eq!(engine.wait(ids[49]).await.unwrap().status, WorkflowStatus::Completed);
    assert_eq!(engine.summary(ids[10]).await.unwrap().steps_dispatched, 1);
    // Reads do not bring finished workflows back into memory
    assert_eq!(engine.tracked_workflows(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_takes_precedence_over_stage_deadline() {
    let stuck = Arc::new(ScriptedAgent::answering("late").with_delay(Duration::from_secs(120)).stubborn());
    let registry = registry(&[("stuck", AgentCapability::FieldService, &stuck)]);
    let engine = engine(registry, Arc::new(InMemoryStateStore::default()), EngineConfig::default());
    let mut events = engine.subscribe();

    let plan = WorkflowPlan::parallel("slow", vec![ask(AgentCapability::FieldService, "stuck")])
        .with_phase_timeout(Duration::from_secs(2))
        .with_step_timeout(Duration::from_secs(600));
    let id = engine.start(plan).await.unwrap();
    wait_for_dispatch(&mut events).await;

    let before = tokio::time::Instant::now();
    engine.cancel(id).await.unwrap();
    // The stage deadline fired inside the cancel grace period
    assert!(before.elapsed() < Duration::from_secs(5));

    let state = engine.get_status(id).await.unwrap();
    assert_eq!(state.status, WorkflowStatus::Cancelled);
    let step = &state.execution_history[0];
    assert_eq!(step.status, StepStatus::Cancelled);
    assert_eq!(step.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
}

// Workflow runtime state
// The persisted, versioned record of one workflow run

//! # Workflow State
//!
//! [`WorkflowState`] is the only record the engine needs to continue a run.
//! It embeds the accepted plan, the append-only execution history, every
//! agent output referenced by a step, and the output carried into the next
//! stage. A paused workflow can therefore be resumed from a store snapshot
//! alone.
//!
//! ## State Machine
//!
//! ```text
//! PENDING → RUNNING ⇄ PAUSED
//!              ↓         ↓
//!   COMPLETED | FAILED | CANCELLED
//! ```
//!
//! Terminal states accept no further transitions.
//!
//! ## Stages and Steps
//!
//! An [`ExecutionStep`] is one dispatched agent invocation. A *stage* is one
//! phase of the plan; its aggregate status (quorum, partial success) is kept
//! in [`StageOutcome`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::agent::{AgentId, AgentResponse};
use super::plan::{Topology, WorkflowPlan};
use crate::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, to: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Failed)
                | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowStatus::Pending => "PENDING",
            WorkflowStatus::Running => "RUNNING",
            WorkflowStatus::Paused => "PAUSED",
            WorkflowStatus::Completed => "COMPLETED",
            WorkflowStatus::Failed => "FAILED",
            WorkflowStatus::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Status of a step, or of a stage in aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    SuccessPartial,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::SuccessPartial)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    IntentRouting,
    AgentUnavailable,
    ModelProvider,
    ModelUnavailable,
    Timeout,
    AggregationConflict,
    Persistence,
    Cancelled,
    QuorumNotMet,
    Agent,
    Internal,
}

/// Structured error persisted on steps and workflows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
    pub recoverable: bool,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            recoverable,
        }
    }
}

/// One dispatched agent invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub step_id: Uuid,
    pub agent_id: AgentId,
    pub assignment_id: String,
    /// Index of the stage that dispatched this step
    pub phase: usize,
    pub phase_name: String,
    /// Where the input came from: `request` or `stage-<n>`
    pub input_ref: String,
    /// Key into [`WorkflowState::outputs`] once the step succeeded
    pub output_ref: Option<String>,
    pub status: StepStatus,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<StepError>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    ByConfidence,
    ByPriority,
    Unresolved,
}

/// Audit record of differing answers to one sub-question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub question: String,
    pub agents: Vec<AgentId>,
    pub confidences: Vec<f64>,
    pub resolution: ConflictResolution,
    pub selected: Option<AgentId>,
}

/// Aggregate outcome of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub index: usize,
    pub name: String,
    pub status: StepStatus,
    pub total: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    /// Merged output handed to the next stage
    pub output: Value,
    pub conflicts: Vec<ConflictRecord>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Final payload of a terminal workflow
///
/// Failed and cancelled workflows still carry whatever stages completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub outcome: StepStatus,
    pub output: Value,
    pub stage_outputs: Vec<Value>,
    pub conflicts: Vec<ConflictRecord>,
    pub limitations: Vec<String>,
}

/// Counters derived from the execution history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub workflow_id: Uuid,
    pub status: WorkflowStatus,
    pub steps_dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub success_rate: f64,
    pub total_retries: u32,
    pub elapsed_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: Uuid,
    pub status: WorkflowStatus,
    pub topology: Topology,
    /// Index of the next stage to run
    pub current_step: usize,
    pub total_steps: usize,
    /// Registration order fixed at plan acceptance; also the merge order
    pub participating_agents: Vec<AgentId>,
    pub execution_history: Vec<ExecutionStep>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub plan: WorkflowPlan,
    pub outputs: BTreeMap<String, AgentResponse>,
    pub stage_outcomes: Vec<StageOutcome>,
    /// Output of the last finished stage, input of the next
    pub carry: Value,
    pub result: Option<WorkflowResult>,
    pub error: Option<StepError>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    /// Create a PENDING state for an accepted plan
    pub fn new(plan: WorkflowPlan) -> Self {
        let now = Utc::now();
        let mut participating_agents: Vec<AgentId> = Vec::new();
        for assignment in plan.phases.iter().flat_map(|p| p.assignments.iter()) {
            if let Some(agent_id) = &assignment.agent_id {
                if !participating_agents.contains(agent_id) {
                    participating_agents.push(agent_id.clone());
                }
            }
        }

        Self {
            workflow_id: Uuid::new_v4(),
            status: WorkflowStatus::Pending,
            topology: plan.topology,
            current_step: 0,
            total_steps: plan.phases.len(),
            participating_agents,
            execution_history: vec![],
            version: 0,
            created_at: now,
            updated_at: now,
            plan,
            outputs: BTreeMap::new(),
            stage_outcomes: vec![],
            carry: Value::Null,
            result: None,
            error: None,
            cancel_requested_at: None,
        }
    }

    /// Move to `to`, enforcing the state machine
    pub fn transition(&mut self, to: WorkflowStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(OrchestratorError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn step(&self, step_id: Uuid) -> Option<&ExecutionStep> {
        self.execution_history.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: Uuid) -> Option<&mut ExecutionStep> {
        self.execution_history.iter_mut().find(|s| s.step_id == step_id)
    }

    /// Response produced by a step, if it succeeded
    pub fn output_of(&self, step: &ExecutionStep) -> Option<&AgentResponse> {
        step.output_ref.as_ref().and_then(|r| self.outputs.get(r))
    }

    /// Position of an agent in the merge order
    pub fn merge_rank(&self, agent_id: &AgentId) -> usize {
        self.participating_agents
            .iter()
            .position(|a| a == agent_id)
            .unwrap_or(usize::MAX)
    }

    pub fn summary(&self) -> ExecutionSummary {
        let count = |status: StepStatus| {
            self.execution_history
                .iter()
                .filter(|s| s.status == status)
                .count()
        };
        let succeeded = count(StepStatus::Success) + count(StepStatus::SuccessPartial);
        let dispatched = self.execution_history.len();

        ExecutionSummary {
            workflow_id: self.workflow_id,
            status: self.status,
            steps_dispatched: dispatched,
            succeeded,
            failed: count(StepStatus::Failed),
            cancelled: count(StepStatus::Cancelled),
            success_rate: if dispatched == 0 {
                0.0
            } else {
                succeeded as f64 / dispatched as f64
            },
            total_retries: self.execution_history.iter().map(|s| s.retry_count).sum(),
            elapsed_ms: (self.updated_at - self.created_at).num_milliseconds(),
        }
    }
}

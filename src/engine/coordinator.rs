// Agent Coordinator
// Decomposes tasks into phased plans and resolves multi-agent answers

//! # Agent Coordinator
//!
//! ## Planning
//!
//! [`AgentCoordinator::plan_for`] turns a classified request into a plan:
//!
//! - single agent: one-step Sequential plan
//! - ManagementDecision / CollaborationRequired: Hierarchical plan from [`AgentCoordinator::coordinate`]
//! - otherwise: Parallel plan over every confident suggestion
//!
//! `coordinate` decomposes a [`Task`] into sub-tasks (explicit, or the
//! template for its [`TaskKind`]) and groups them into phases by dependency
//! level. Cycles are rejected here, before anything runs.
//!
//! ## Aggregation
//!
//! Responses to the same question that disagree are resolved by:
//!
//! 1. strictly higher confidence (beyond `epsilon`)
//! 2. higher static agent priority
//! 3. otherwise unresolved: every tied answer is kept and annotated
//!
//! Every disagreement yields a [`ConflictRecord`], resolved or not.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::agents::AgentRegistry;
use crate::engine::validation::{ResultValidator, Verdict};
use crate::models::{
    dependency_levels, AgentCapability, AgentId, AgentInput, AgentResponse, Assignment, ConflictRecord,
    ConflictResolution, IntentResult, IntentType, Phase, SubTask, Task, TaskKind, TaskPriority, UserRequest,
    WorkflowPlan,
};
use crate::{OrchestratorError, Result};

/// Slack added to epsilon comparisons so gaps sitting on the boundary count as ties
pub(crate) const TIE_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Confidence gap treated as a tie
    pub epsilon: f64,
    /// Suggestions above this join a Parallel plan
    pub collaboration_threshold: f64,
    /// Quorum for plans that do not set one
    pub default_quorum: f64,
    pub validation: ResultValidator,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.05,
            collaboration_threshold: 0.6,
            default_quorum: 1.0,
            validation: ResultValidator::default(),
        }
    }
}

/// Outcome of aggregating the answers to one question
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// All answers agree
    Agreed(AgentResponse),
    /// Answers disagreed and one was selected
    Resolved { response: AgentResponse, conflict: ConflictRecord },
    /// Tied answers that neither confidence nor priority separates
    Unresolved { tied: Vec<AgentResponse>, conflict: ConflictRecord },
}

impl Resolution {
    pub fn selected(&self) -> Option<&AgentResponse> {
        match self {
            Resolution::Agreed(response) | Resolution::Resolved { response, .. } => Some(response),
            Resolution::Unresolved { .. } => None,
        }
    }

    pub fn conflict(&self) -> Option<&ConflictRecord> {
        match self {
            Resolution::Agreed(_) => None,
            Resolution::Resolved { conflict, .. } | Resolution::Unresolved { conflict, .. } => Some(conflict),
        }
    }

    /// Error annotation carried by an unresolved result
    pub fn error(&self) -> Option<OrchestratorError> {
        match self {
            Resolution::Unresolved { conflict, .. } => Some(OrchestratorError::AggregationConflict {
                question: conflict.question.clone(),
                agents: conflict.agents.iter().map(|a| a.to_string()).collect(),
            }),
            _ => None,
        }
    }

    /// Value merged into the stage output
    pub fn to_value(&self) -> Value {
        match self {
            Resolution::Agreed(response) | Resolution::Resolved { response, .. } => {
                Value::String(response.content.clone())
            }
            Resolution::Unresolved { tied, .. } => json!({
                "unresolved": true,
                "error": self.error().map(|e| e.to_string()),
                "candidates": tied
                    .iter()
                    .map(|r| json!({
                        "agent_id": r.agent_id,
                        "content": r.content,
                        "confidence": r.confidence,
                    }))
                    .collect::<Vec<_>>(),
            }),
        }
    }
}

/// Aggregated output of one stage
#[derive(Debug, Clone, Default)]
pub struct StageAggregate {
    pub output: Value,
    pub conflicts: Vec<ConflictRecord>,
}

pub struct AgentCoordinator {
    config: CoordinatorConfig,
    registry: Arc<AgentRegistry>,
}

impl AgentCoordinator {
    pub fn new(registry: Arc<AgentRegistry>, config: CoordinatorConfig) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Build a plan for a classified request
    pub fn plan_for(&self, request: &UserRequest, intent: &IntentResult) -> Result<WorkflowPlan> {
        let top = intent.top_agent().ok_or_else(|| {
            OrchestratorError::AgentUnavailable(format!("no agent can serve intent {}", intent.intent_type))
        })?;

        let plan = if !intent.requires_collaboration {
            WorkflowPlan::sequential(
                request.content.clone(),
                vec![Assignment::new(top.capability, request.content.clone()).with_agent(top.agent_id.clone())],
            )
        } else if matches!(
            intent.intent_type,
            IntentType::ManagementDecision | IntentType::CollaborationRequired
        ) {
            let kind = match intent.intent_type {
                IntentType::ManagementDecision => TaskKind::SalesProcess,
                _ => TaskKind::CustomerInquiry,
            };
            let mut task = Task::new(request.content.clone(), kind);
            task.task_id = request.request_id;
            self.coordinate(&task)?
        } else {
            let assignments: Vec<Assignment> = intent
                .suggested_agents
                .iter()
                .enumerate()
                .filter(|(i, s)| *i == 0 || s.confidence > self.config.collaboration_threshold)
                .map(|(_, s)| Assignment::new(s.capability, request.content.clone()).with_agent(s.agent_id.clone()))
                .collect();
            WorkflowPlan::parallel(request.content.clone(), assignments).with_quorum(self.config.default_quorum)
        };

        let mut plan = plan.with_task_id(request.request_id).with_context(request.context.clone());
        plan.normalize()?;
        info!(
            request_id = %request.request_id,
            topology = %plan.topology,
            phases = plan.phases.len(),
            assignments = plan.assignment_count(),
            "Plan built"
        );
        Ok(plan)
    }

    /// Decompose a task into a Hierarchical plan
    pub fn coordinate(&self, task: &Task) -> Result<WorkflowPlan> {
        let phases = self.decompose(task)?;
        let mut plan = WorkflowPlan::hierarchical(task.description.clone(), phases)
            .with_task_id(task.task_id)
            .with_quorum(task.quorum.unwrap_or(self.config.default_quorum))
            .with_context(task.context.clone());
        plan.normalize()?;
        Ok(plan)
    }

    /// Group sub-tasks into phases by dependency level
    pub fn decompose(&self, task: &Task) -> Result<Vec<Phase>> {
        let subtasks = if task.subtasks.is_empty() {
            template(task.kind)
        } else {
            task.subtasks.clone()
        };

        let nodes: Vec<(String, Vec<String>)> = subtasks
            .iter()
            .map(|s| (s.id.clone(), s.depends_on.clone()))
            .collect();
        let levels = dependency_levels(&nodes).map_err(OrchestratorError::InvalidPlan)?;

        let mut phases: Vec<Phase> = Vec::with_capacity(levels.len());
        for (level, members) in levels.into_iter().enumerate() {
            let mut members: Vec<&SubTask> = members.into_iter().map(|i| &subtasks[i]).collect();
            // Stable: equal priorities keep declaration order
            members.sort_by(|a, b| b.priority.cmp(&a.priority));

            let assignments = members
                .iter()
                .map(|s| {
                    let mut assignment = Assignment::new(s.capability, s.instruction.clone()).with_question(s.name.clone());
                    assignment.priority = s.priority;
                    if let Some(agent) = self.registry.primary(s.capability) {
                        assignment = assignment.with_agent(agent.agent_id.clone());
                    }
                    if s.optional {
                        assignment = assignment.optional();
                    }
                    assignment
                })
                .collect();

            let mut phase = Phase::new(format!("phase-{}", level + 1), assignments);
            if let Some(previous) = phases.last() {
                phase.depends_on = vec![previous.name.clone()];
            }
            phases.push(phase);
        }

        debug!(task_id = %task.task_id, phases = phases.len(), "Task decomposed");
        Ok(phases)
    }

    /// Resolve the answers given to one question
    ///
    /// Returns `None` for an empty slice.
    pub fn aggregate(&self, question: &str, responses: &[AgentResponse]) -> Option<Resolution> {
        let first = responses.first()?;

        let mut ranked: Vec<&AgentResponse> = responses.iter().collect();
        ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let best = ranked[0];

        if responses.iter().all(|r| same_content(r, first)) {
            return Some(Resolution::Agreed(best.clone()));
        }

        let mut record = ConflictRecord {
            question: question.to_string(),
            agents: responses.iter().map(|r| r.agent_id.clone()).collect(),
            confidences: responses.iter().map(|r| r.confidence).collect(),
            resolution: ConflictResolution::ByConfidence,
            selected: None,
        };

        let near: Vec<&AgentResponse> = ranked
            .iter()
            .copied()
            .take_while(|r| best.confidence - r.confidence <= self.config.epsilon + TIE_TOLERANCE)
            .collect();

        let resolution = if near.iter().all(|r| same_content(r, best)) {
            record.selected = Some(best.agent_id.clone());
            Resolution::Resolved {
                response: best.clone(),
                conflict: record,
            }
        } else {
            let top_priority = near
                .iter()
                .map(|r| self.registry.priority_of(&r.agent_id))
                .max()
                .unwrap_or(0);
            let leaders: Vec<&AgentResponse> = near
                .into_iter()
                .filter(|r| self.registry.priority_of(&r.agent_id) == top_priority)
                .collect();

            if leaders.iter().all(|r| same_content(r, leaders[0])) {
                record.resolution = ConflictResolution::ByPriority;
                record.selected = Some(leaders[0].agent_id.clone());
                Resolution::Resolved {
                    response: leaders[0].clone(),
                    conflict: record,
                }
            } else {
                record.resolution = ConflictResolution::Unresolved;
                Resolution::Unresolved {
                    tied: leaders.into_iter().cloned().collect(),
                    conflict: record,
                }
            }
        };

        if let Some(conflict) = resolution.conflict() {
            warn!(
                question,
                agents = ?conflict.agents,
                resolution = ?conflict.resolution,
                selected = ?conflict.selected,
                "Aggregation conflict recorded"
            );
        }
        Some(resolution)
    }

    /// Merge the successful answers of one stage
    ///
    /// `answers` must already be in merge order. A single question yields its
    /// resolved value directly; several questions yield an object keyed by
    /// question.
    pub fn aggregate_stage(&self, answers: &[(String, AgentResponse)]) -> StageAggregate {
        let mut questions: Vec<&str> = Vec::new();
        for (question, _) in answers {
            if !questions.contains(&question.as_str()) {
                questions.push(question);
            }
        }

        let mut aggregate = StageAggregate::default();

        let mut merged = serde_json::Map::new();
        for question in &questions {
            let responses: Vec<AgentResponse> = answers
                .iter()
                .filter(|(q, _)| q.as_str() == *question)
                .map(|(_, r)| r.clone())
                .collect();
            if let Some(resolution) = self.aggregate(question, &responses) {
                if let Some(conflict) = resolution.conflict() {
                    aggregate.conflicts.push(conflict.clone());
                }
                merged.insert(question.to_string(), resolution.to_value());
            }
        }

        aggregate.output = match questions.len() {
            0 => Value::Null,
            1 => merged.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null),
            _ => Value::Object(merged),
        };
        aggregate
    }

    /// Invoke an agent and gate its answer through the validator
    ///
    /// Low-confidence answers are re-run on an alternate agent of the same
    /// capability while the retry budget lasts. Returns the accepted (or
    /// degraded) response and the number of re-runs.
    pub async fn invoke_validated(
        &self,
        agent_id: &AgentId,
        capability: AgentCapability,
        mut input: AgentInput,
        cancel: CancellationToken,
    ) -> Result<(AgentResponse, u32)> {
        let validator = &self.config.validation;
        let mut current = agent_id.clone();
        let mut best: Option<AgentResponse> = None;
        let mut attempt = 0u32;

        loop {
            input.attempt = attempt;
            let response = match self.registry.invoke(&current, input.clone(), cancel.clone()).await {
                Ok(response) => response,
                Err(e) => match best.take() {
                    // A failed re-run still leaves the earlier answer
                    Some(previous) if !matches!(e, OrchestratorError::Cancelled(_)) => {
                        debug!(agent_id = %current, "Re-run failed: {}", e);
                        return Ok((validator.degrade(previous, attempt), attempt));
                    }
                    _ => return Err(e),
                },
            };

            match validator.validate(&response, attempt) {
                Verdict::Accept => return Ok((response, attempt)),
                verdict => {
                    if best.as_ref().map_or(true, |b| response.confidence > b.confidence) {
                        best = Some(response);
                    }
                    if verdict == Verdict::Degrade {
                        break;
                    }
                }
            }

            if let Some(alternate) = self.registry.alternate(capability, &current) {
                current = alternate.agent_id.clone();
            }
            attempt += 1;
            debug!(agent_id = %current, attempt, "Low confidence, re-running");
        }

        let degraded = best.ok_or_else(|| OrchestratorError::Agent {
            agent_id: current.to_string(),
            message: "no response to degrade".to_string(),
        })?;
        warn!(agent_id = %degraded.agent_id, confidence = degraded.confidence, "Answer kept below confidence floor");
        Ok((validator.degrade(degraded, attempt + 1), attempt))
    }
}

fn same_content(a: &AgentResponse, b: &AgentResponse) -> bool {
    a.content.trim() == b.content.trim()
}

/// Default sub-tasks for a task kind
fn template(kind: TaskKind) -> Vec<SubTask> {
    use AgentCapability::*;

    match kind {
        TaskKind::CustomerInquiry => vec![
            SubTask::new("triage", CustomerSupport, "Summarize the customer's need and any account constraints")
                .with_priority(TaskPriority::High),
            SubTask::new("offer", Sales, "Recommend products or plans that address the need").depends_on(&["triage"]),
            SubTask::new("service", FieldService, "Assess whether on-site or technical work is required")
                .depends_on(&["triage"])
                .optional(),
            SubTask::new("review", Manager, "Review the proposed resolution and approve next steps")
                .depends_on(&["offer", "service"]),
        ],
        TaskKind::SalesProcess => vec![
            SubTask::new("qualify", Sales, "Qualify the opportunity and draft an offer"),
            SubTask::new("approve", Manager, "Approve or adjust the offer").depends_on(&["qualify"]),
        ],
        TaskKind::TechnicalSupport => vec![
            SubTask::new("diagnose", FieldService, "Diagnose the technical issue").with_priority(TaskPriority::High),
            SubTask::new("assist", CustomerSupport, "Guide the customer through immediate workarounds"),
            SubTask::new("review", Manager, "Confirm the service plan and any compensation")
                .depends_on(&["diagnose", "assist"]),
        ],
        TaskKind::General => vec![SubTask::new("answer", CustomerSupport, "Answer the request")],
    }
}

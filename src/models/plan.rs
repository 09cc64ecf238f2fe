// Task and plan definitions
// A plan is an ordered list of phases, each a set of agent assignments

//! # Plans
//!
//! Every topology is expressed with the same shape:
//!
//! - **Sequential**: one phase per step, each phase holding one assignment
//! - **Parallel**: a single phase holding every assignment
//! - **Hierarchical**: several phases, each holding one or more assignments
//!
//! Phases may declare dependencies on other phases. [`WorkflowPlan::normalize`]
//! orders them topologically and rejects cycles before anything executes.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::agent::{AgentCapability, AgentId};
use crate::{OrchestratorError, Result};

/// Execution shape of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    Sequential,
    Parallel,
    Hierarchical,
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Topology::Sequential => "sequential",
            Topology::Parallel => "parallel",
            Topology::Hierarchical => "hierarchical",
        };
        f.write_str(name)
    }
}

/// Sub-task priority, used to order work inside a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Urgent = 4,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

/// Decomposition template selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    CustomerInquiry,
    SalesProcess,
    TechnicalSupport,
    General,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub id: String,
    pub name: String,
    pub capability: AgentCapability,
    pub instruction: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub optional: bool,
}

impl SubTask {
    pub fn new(id: impl Into<String>, capability: AgentCapability, instruction: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            capability,
            instruction: instruction.into(),
            priority: TaskPriority::Normal,
            depends_on: vec![],
            optional: false,
        }
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|id| id.to_string()).collect();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// A unit of work handed to the coordinator for decomposition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub description: String,
    pub kind: TaskKind,
    /// Explicit sub-tasks; when empty the template for `kind` is used
    #[serde(default)]
    pub subtasks: Vec<SubTask>,
    #[serde(default)]
    pub quorum: Option<f64>,
    #[serde(default)]
    pub context: Value,
}

impl Task {
    pub fn new(description: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            description: description.into(),
            kind,
            subtasks: vec![],
            quorum: None,
            context: Value::Null,
        }
    }

    pub fn with_subtasks(mut self, subtasks: Vec<SubTask>) -> Self {
        self.subtasks = subtasks;
        self
    }

    pub fn with_quorum(mut self, quorum: f64) -> Self {
        self.quorum = Some(quorum);
        self
    }
}

/// One agent invocation slot inside a phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub assignment_id: String,
    pub capability: AgentCapability,
    /// Pinned agent; filled in from the registry when the plan is accepted
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    /// Sub-question answered; assignments sharing a question are compared for conflicts
    pub question: String,
    pub instruction: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub priority: TaskPriority,
}

impl Assignment {
    pub fn new(capability: AgentCapability, instruction: impl Into<String>) -> Self {
        let instruction = instruction.into();
        Self {
            assignment_id: Uuid::new_v4().to_string(),
            capability,
            agent_id: None,
            question: instruction.clone(),
            instruction,
            optional: false,
            priority: TaskPriority::Normal,
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<AgentId>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_question(mut self, question: impl Into<String>) -> Self {
        self.question = question.into();
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub assignments: Vec<Assignment>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl Phase {
    pub fn new(name: impl Into<String>, assignments: Vec<Assignment>) -> Self {
        Self {
            name: name.into(),
            assignments,
            depends_on: vec![],
        }
    }

    pub fn depends_on(mut self, names: &[&str]) -> Self {
        self.depends_on = names.iter().map(|n| n.to_string()).collect();
        self
    }
}

/// An executable plan accepted by the workflow engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPlan {
    pub plan_id: Uuid,
    pub task_id: Uuid,
    pub description: String,
    pub topology: Topology,
    pub phases: Vec<Phase>,
    /// Fraction of a multi-assignment phase that must succeed; 1.0 means all
    pub quorum: f64,
    #[serde(default)]
    pub max_concurrent_tasks: Option<usize>,
    #[serde(default)]
    pub step_timeout_ms: Option<u64>,
    #[serde(default)]
    pub phase_timeout_ms: Option<u64>,
    #[serde(default)]
    pub context: Value,
}

impl WorkflowPlan {
    fn with_phases(description: String, topology: Topology, phases: Vec<Phase>) -> Self {
        Self {
            plan_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            description,
            topology,
            phases,
            quorum: 1.0,
            max_concurrent_tasks: None,
            step_timeout_ms: None,
            phase_timeout_ms: None,
            context: Value::Null,
        }
    }

    /// Steps run in list order, each receiving the previous output
    pub fn sequential(description: impl Into<String>, steps: Vec<Assignment>) -> Self {
        let phases = steps
            .into_iter()
            .enumerate()
            .map(|(i, step)| Phase::new(format!("step-{}", i + 1), vec![step]))
            .collect();
        Self::with_phases(description.into(), Topology::Sequential, phases)
    }

    /// All assignments dispatched together in one phase
    pub fn parallel(description: impl Into<String>, assignments: Vec<Assignment>) -> Self {
        Self::with_phases(
            description.into(),
            Topology::Parallel,
            vec![Phase::new("parallel", assignments)],
        )
    }

    pub fn hierarchical(description: impl Into<String>, phases: Vec<Phase>) -> Self {
        Self::with_phases(description.into(), Topology::Hierarchical, phases)
    }

    pub fn with_task_id(mut self, task_id: Uuid) -> Self {
        self.task_id = task_id;
        self
    }

    pub fn with_quorum(mut self, quorum: f64) -> Self {
        self.quorum = quorum;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = Some(max);
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn assignment_count(&self) -> usize {
        self.phases.iter().map(|p| p.assignments.len()).sum()
    }

    /// Validate the plan and order its phases by dependency
    ///
    /// Rejects empty plans, empty phases, a quorum outside (0, 1], shapes
    /// that do not match the topology, unknown dependencies and cycles.
    pub fn normalize(&mut self) -> Result<()> {
        if self.phases.is_empty() {
            return Err(OrchestratorError::InvalidPlan("plan has no phases".to_string()));
        }
        if !(self.quorum > 0.0 && self.quorum <= 1.0) {
            return Err(OrchestratorError::InvalidPlan(format!(
                "quorum must be in (0, 1], got {}",
                self.quorum
            )));
        }
        if self.max_concurrent_tasks == Some(0) {
            return Err(OrchestratorError::InvalidPlan(
                "max_concurrent_tasks must be positive".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for phase in &self.phases {
            if phase.assignments.is_empty() {
                return Err(OrchestratorError::InvalidPlan(format!(
                    "phase '{}' has no assignments",
                    phase.name
                )));
            }
            if !names.insert(phase.name.as_str()) {
                return Err(OrchestratorError::InvalidPlan(format!(
                    "duplicate phase name '{}'",
                    phase.name
                )));
            }
        }

        match self.topology {
            Topology::Sequential if self.phases.iter().any(|p| p.assignments.len() != 1) => {
                return Err(OrchestratorError::InvalidPlan(
                    "sequential plans take exactly one assignment per step".to_string(),
                ));
            }
            Topology::Parallel if self.phases.len() != 1 => {
                return Err(OrchestratorError::InvalidPlan(
                    "parallel plans take a single phase".to_string(),
                ));
            }
            _ => {}
        }

        let nodes: Vec<(String, Vec<String>)> = self
            .phases
            .iter()
            .map(|p| (p.name.clone(), p.depends_on.clone()))
            .collect();
        let order: Vec<usize> = dependency_levels(&nodes)
            .map_err(OrchestratorError::InvalidPlan)?
            .into_iter()
            .flatten()
            .collect();

        let mut slots: Vec<Option<Phase>> = self.phases.drain(..).map(Some).collect();
        self.phases = order.into_iter().filter_map(|i| slots[i].take()).collect();
        Ok(())
    }
}

/// Group nodes into dependency levels (Kahn's algorithm)
///
/// Level 0 holds nodes without dependencies, level `n` holds nodes whose
/// dependencies all sit in earlier levels. Declaration order is kept inside
/// a level. Returns an error naming the offending nodes on unknown
/// dependencies or cycles.
pub fn dependency_levels(nodes: &[(String, Vec<String>)]) -> std::result::Result<Vec<Vec<usize>>, String> {
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (id.as_str(), i))
        .collect();

    let mut indegree = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![vec![]; nodes.len()];
    for (i, (id, deps)) in nodes.iter().enumerate() {
        for dep in deps {
            let Some(&d) = index.get(dep.as_str()) else {
                return Err(format!("'{}' depends on unknown '{}'", id, dep));
            };
            indegree[i] += 1;
            dependents[d].push(i);
        }
    }

    let mut levels = Vec::new();
    let mut current: Vec<usize> = (0..nodes.len()).filter(|&i| indegree[i] == 0).collect();
    let mut placed = 0;
    while !current.is_empty() {
        placed += current.len();
        let mut next = Vec::new();
        for &node in &current {
            for &dependent in &dependents[node] {
                indegree[dependent] -= 1;
                if indegree[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        next.sort_unstable();
        levels.push(current);
        current = next;
    }

    if placed < nodes.len() {
        let cyclic: Vec<&str> = (0..nodes.len())
            .filter(|&i| indegree[i] > 0)
            .map(|i| nodes[i].0.as_str())
            .collect();
        return Err(format!("dependency cycle among {:?}", cyclic));
    }
    Ok(levels)
}

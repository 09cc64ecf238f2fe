// Event system for workflow monitoring

//! # Event System
//!
//! The workflow engine publishes a [`WorkflowEvent`] for every status change,
//! step dispatch and completion, stage outcome, recorded conflict and
//! persistence retry. Subscribers get an in-process stream for dashboards
//! and tests; nothing in the engine depends on anyone listening.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::models::{AgentId, ConflictRecord, StepStatus, WorkflowStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    StatusChanged {
        workflow_id: Uuid,
        from: WorkflowStatus,
        to: WorkflowStatus,
        version: u64,
        at: DateTime<Utc>,
    },
    StepDispatched {
        workflow_id: Uuid,
        step_id: Uuid,
        agent_id: AgentId,
        phase: usize,
        at: DateTime<Utc>,
    },
    StepFinished {
        workflow_id: Uuid,
        step_id: Uuid,
        agent_id: AgentId,
        status: StepStatus,
        retry_count: u32,
        at: DateTime<Utc>,
    },
    StageFinished {
        workflow_id: Uuid,
        phase: usize,
        status: StepStatus,
        succeeded: usize,
        total: usize,
        at: DateTime<Utc>,
    },
    ConflictRecorded {
        workflow_id: Uuid,
        phase: usize,
        conflict: ConflictRecord,
    },
    PersistenceRetry {
        workflow_id: Uuid,
        version: u64,
        attempt: u32,
        error: String,
    },
}

impl WorkflowEvent {
    pub fn workflow_id(&self) -> Uuid {
        match self {
            WorkflowEvent::StatusChanged { workflow_id, .. }
            | WorkflowEvent::StepDispatched { workflow_id, .. }
            | WorkflowEvent::StepFinished { workflow_id, .. }
            | WorkflowEvent::StageFinished { workflow_id, .. }
            | WorkflowEvent::ConflictRecorded { workflow_id, .. }
            | WorkflowEvent::PersistenceRetry { workflow_id, .. } => *workflow_id,
        }
    }
}

/// Broadcast bus for workflow events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to current subscribers; events are dropped when nobody listens
    pub fn publish(&self, event: WorkflowEvent) {
        trace!(workflow_id = %event.workflow_id(), ?event, "Workflow event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }
}

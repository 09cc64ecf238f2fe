// State store abstraction for the workflow engine
// Versioned snapshots of WorkflowState with optimistic concurrency

//! # State Store Layer
//!
//! The engine persists a new [`WorkflowState`] snapshot after every step and
//! status transition. The store is the resumability boundary: a paused
//! workflow is continued from `get()` alone.
//!
//! ## Versioning Contract
//!
//! `put(id, version, state)` succeeds only when the stored version is
//! `version - 1` (or the workflow is absent and `version == 1`). Anything
//! else is a [`OrchestratorError::VersionConflict`], which signals a second
//! writer and is never retried. Transient backend failures are reported as
//! [`OrchestratorError::Persistence`] and are retried by the engine.
//!
//! ## Retention
//!
//! The engine never deletes state. [`StateStore::cleanup_terminal`] is the
//! hook for an external retention policy.
//!
//! ## Rust Learning Notes:
//!
//! ### Async Traits
//! `#[async_trait]` lets the trait expose `async fn`s while remaining usable
//! as `Arc<dyn StateStore>`.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::models::WorkflowState;
use crate::{OrchestratorError, Result};

/// Storage contract the engine requires from a persistence backend
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// Write `state` as `version`, failing with `VersionConflict` on a stale write
    async fn put(&self, workflow_id: Uuid, version: u64, state: &WorkflowState) -> Result<()>;

    /// Latest snapshot, `None` when the workflow is unknown
    async fn get(&self, workflow_id: Uuid) -> Result<Option<WorkflowState>>;

    /// Latest snapshot of every workflow
    async fn list(&self) -> Result<Vec<WorkflowState>>;

    /// Every retained snapshot of one workflow, oldest first
    async fn history(&self, workflow_id: Uuid) -> Result<Vec<WorkflowState>>;

    /// Remove terminal workflows last updated more than `max_age` ago
    async fn cleanup_terminal(&self, max_age: Duration) -> Result<usize>;
}

/// In-memory store for development, tests and single-process deployments
///
/// Keeps up to `history_limit` snapshots per workflow.
pub struct InMemoryStateStore {
    states: RwLock<HashMap<Uuid, Vec<WorkflowState>>>,
    history_limit: usize,
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new(100)
    }
}

impl InMemoryStateStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            history_limit: history_limit.max(1),
        }
    }
}

#[async_trait::async_trait]
impl StateStore for InMemoryStateStore {
    async fn put(&self, workflow_id: Uuid, version: u64, state: &WorkflowState) -> Result<()> {
        let mut states = self.states.write().await;
        let current = states
            .get(&workflow_id)
            .and_then(|versions| versions.last())
            .map_or(0, |s| s.version);

        if version != current + 1 {
            return Err(OrchestratorError::VersionConflict {
                workflow_id: workflow_id.to_string(),
                expected: current + 1,
                found: version,
            });
        }

        let versions = states.entry(workflow_id).or_default();
        versions.push(state.clone());
        if versions.len() > self.history_limit {
            let excess = versions.len() - self.history_limit;
            versions.drain(..excess);
        }
        debug!(%workflow_id, version, status = %state.status, "Snapshot stored");
        Ok(())
    }

    async fn get(&self, workflow_id: Uuid) -> Result<Option<WorkflowState>> {
        let states = self.states.read().await;
        Ok(states.get(&workflow_id).and_then(|v| v.last().cloned()))
    }

    async fn list(&self) -> Result<Vec<WorkflowState>> {
        let states = self.states.read().await;
        Ok(states.values().filter_map(|v| v.last().cloned()).collect())
    }

    async fn history(&self, workflow_id: Uuid) -> Result<Vec<WorkflowState>> {
        let states = self.states.read().await;
        Ok(states.get(&workflow_id).cloned().unwrap_or_default())
    }

    async fn cleanup_terminal(&self, max_age: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age)
                .map_err(|e| OrchestratorError::Config(e.to_string()))?;

        let mut states = self.states.write().await;
        let before = states.len();
        states.retain(|_, versions| match versions.last() {
            Some(latest) => !(latest.status.is_terminal() && latest.updated_at < cutoff),
            None => false,
        });
        Ok(before - states.len())
    }
}

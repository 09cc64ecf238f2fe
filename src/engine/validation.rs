// Result validation for agent responses

//! Confidence gate applied to every agent response before it is used.
//!
//! A response below the floor triggers a re-run while the retry budget
//! lasts. Once the budget is spent the best response is kept and annotated
//! with `limitations`; validation never fails a workflow.

use serde::{Deserialize, Serialize};

use crate::models::AgentResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    /// Ask an alternate agent or provider for another answer
    Retry,
    /// Keep the best answer, annotated with its limitations
    Degrade,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultValidator {
    pub confidence_floor: f64,
    /// Re-runs allowed per assignment
    pub retry_budget: u32,
}

impl Default for ResultValidator {
    fn default() -> Self {
        Self {
            confidence_floor: 0.6,
            retry_budget: 1,
        }
    }
}

impl ResultValidator {
    pub fn new(confidence_floor: f64, retry_budget: u32) -> Self {
        Self {
            confidence_floor: confidence_floor.clamp(0.0, 1.0),
            retry_budget,
        }
    }

    /// Judge a response produced on re-run number `attempt` (0 for the first run)
    pub fn validate(&self, response: &AgentResponse, attempt: u32) -> Verdict {
        if response.confidence >= self.confidence_floor && !response.content.trim().is_empty() {
            Verdict::Accept
        } else if attempt < self.retry_budget {
            Verdict::Retry
        } else {
            Verdict::Degrade
        }
    }

    /// Annotate a response accepted below the floor
    pub fn degrade(&self, mut response: AgentResponse, attempts: u32) -> AgentResponse {
        let note = if response.content.trim().is_empty() {
            format!("empty answer after {} attempt(s)", attempts)
        } else {
            format!(
                "confidence {:.2} below floor {:.2} after {} attempt(s)",
                response.confidence, self.confidence_floor, attempts
            )
        };
        response.limitations = Some(note);
        response
    }
}

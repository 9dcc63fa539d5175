//! Completion reports

use serde::Serialize;

use sl_core::time::Timestamp;
use sl_core::{Error, Result, RunId};
use sl_dag::NodeState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

/// One failed substep, with the first diagnostic seen for it
#[derive(Debug, Clone, Serialize)]
pub struct FailureInfo {
    pub step: String,
    pub index: usize,
    pub diagnostic: String,
}

/// Per-node summary
#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    pub node: String,
    pub state: NodeState,
    pub groups: usize,
    /// Groups satisfied from the signature store
    pub skipped: usize,
    pub failed: usize,
}

/// Structured result of one `execute` call
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub run_id: RunId,
    pub workflow: String,
    pub status: RunStatus,
    pub steps: Vec<StepSummary>,
    /// Every failed substep, reported together once siblings settled
    pub failures: Vec<FailureInfo>,
    /// Targets that stayed unresolved because of upstream failure
    pub unresolved: Vec<String>,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub elapsed_ms: u64,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Number of nodes that ran (or were skipped via signatures) successfully
    pub fn completed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.state == NodeState::Succeeded)
            .count()
    }

    /// Convert a failed run into the error of its first failure
    pub fn into_result(self) -> Result<ExecutionReport> {
        if self.is_success() {
            return Ok(self);
        }
        match self.failures.first() {
            Some(f) => Err(Error::SubstepFailed {
                step: f.step.clone(),
                index: f.index,
                diagnostic: f.diagnostic.clone(),
            }),
            None => Err(Error::Cancelled),
        }
    }
}

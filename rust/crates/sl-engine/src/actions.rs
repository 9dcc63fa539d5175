//! Action back-ends
//!
//! Shell actions are executed by an `ActionBackend` collaborator. The engine
//! hands the backend fully expanded action text; a nonzero exit is a
//! substep-level failure, an io error while spawning is an engine error.

use async_trait::async_trait;
use tracing::{debug, instrument};

use sl_core::Result;

/// Result of running one action
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Ok,
    Failed { diagnostic: String },
}

#[async_trait]
pub trait ActionBackend: Send + Sync {
    /// Run expanded shell text to completion
    async fn run_shell(&self, script: &str) -> Result<ActionOutcome>;
}

/// Default backend: `sh -e -c <script>`
#[derive(Debug, Default, Clone)]
pub struct ShellBackend;

impl ShellBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ActionBackend for ShellBackend {
    #[instrument(skip_all)]
    async fn run_shell(&self, script: &str) -> Result<ActionOutcome> {
        debug!(script, "Running shell action");
        let output = tokio::process::Command::new("sh")
            .arg("-e")
            .arg("-c")
            .arg(script)
            .output()
            .await?;

        if output.status.success() {
            return Ok(ActionOutcome::Ok);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr
            .lines()
            .rev()
            .take(5)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ActionOutcome::Failed {
            diagnostic: format!("{}: {}", output.status, tail.trim()),
        })
    }
}

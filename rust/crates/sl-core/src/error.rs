//! Error types for Sluice

/// Result type alias using the Sluice Error
pub type Result<T> = std::result::Result<T, Error>;

/// Sluice error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // ==========================================================================
    // Static errors (detectable before any action runs)
    // ==========================================================================
    #[error("parse error: {message}")]
    Parse { message: String },

    #[error("unknown target: no rule or step produces '{target}'")]
    UnknownTarget { target: String },

    #[error("cyclic dependency: {path}")]
    CyclicDependency { path: String },

    #[error("duplicate output: '{output}' declared by more than one substep of '{step}'")]
    DuplicateOutput { output: String, step: String },

    #[error("validation error in step '{step}': {message}")]
    Validation { step: String, message: String },

    // ==========================================================================
    // Execution errors
    // ==========================================================================
    #[error("substep {index} of step '{step}' failed: {diagnostic}")]
    SubstepFailed {
        step: String,
        index: usize,
        diagnostic: String,
    },

    #[error("signature store corrupt: {0}")]
    SignatureCorrupt(String),

    #[error("step '{step}' timed out after {after_ms}ms")]
    Timeout { step: String, after_ms: u64 },

    #[error("execution cancelled")]
    Cancelled,

    #[error("workspace locked by another process: {holder}")]
    WorkspaceLocked { holder: String },

    // ==========================================================================
    // Ambient errors
    // ==========================================================================
    #[error("expression error: {0}")]
    Eval(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Short code for reports and logs
    pub fn code(&self) -> &'static str {
        match self {
            Error::Parse { .. } => "PARSE_ERROR",
            Error::UnknownTarget { .. } => "UNKNOWN_TARGET",
            Error::CyclicDependency { .. } => "CYCLIC_DEPENDENCY",
            Error::DuplicateOutput { .. } => "DUPLICATE_OUTPUT",
            Error::Validation { .. } => "VALIDATION_ERROR",
            Error::SubstepFailed { .. } => "SUBSTEP_FAILED",
            Error::SignatureCorrupt(_) => "SIGNATURE_CORRUPT",
            Error::Timeout { .. } => "TIMEOUT",
            Error::Cancelled => "CANCELLED",
            Error::WorkspaceLocked { .. } => "WORKSPACE_LOCKED",
            Error::Eval(_) => "EVAL_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Whether the error is surfaced before any action runs
    pub fn is_static(&self) -> bool {
        matches!(
            self,
            Error::Parse { .. }
                | Error::UnknownTarget { .. }
                | Error::CyclicDependency { .. }
                | Error::DuplicateOutput { .. }
                | Error::Validation { .. }
        )
    }

    pub fn unknown_target(target: impl std::fmt::Display) -> Self {
        Error::UnknownTarget {
            target: target.to_string(),
        }
    }

    pub fn validation(step: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            step: step.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_errors() {
        assert!(Error::unknown_target("a.txt").is_static());
        assert!(Error::CyclicDependency {
            path: "a -> b -> a".into()
        }
        .is_static());
        assert!(!Error::Cancelled.is_static());
        assert!(!Error::SubstepFailed {
            step: "build".into(),
            index: 2,
            diagnostic: "exit 1".into()
        }
        .is_static());
    }

    #[test]
    fn test_error_codes() {
        let err = Error::DuplicateOutput {
            output: "out.txt".into(),
            step: "align".into(),
        };
        assert_eq!(err.code(), "DUPLICATE_OUTPUT");
        assert!(err.to_string().contains("out.txt"));
    }
}

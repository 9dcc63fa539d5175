//! Run configuration for the Sluice engine
//!
//! Every engine call receives an explicit `Config`; there is no global
//! run-mode state.

use serde::Deserialize;
use std::path::PathBuf;

/// How the signature store treats candidate substeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigMode {
    /// Consult recorded signatures and skip matching substeps
    #[default]
    Default,
    /// Always re-execute, ignoring recorded signatures
    Force,
    /// Execute without consulting or writing signatures
    Ignore,
    /// Record signatures for existing outputs without running actions
    Build,
    /// Fail on any substep whose signature does not match
    Assert,
}

impl std::str::FromStr for SigMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(SigMode::Default),
            "force" => Ok(SigMode::Force),
            "ignore" => Ok(SigMode::Ignore),
            "build" => Ok(SigMode::Build),
            "assert" => Ok(SigMode::Assert),
            other => Err(crate::Error::Config(format!(
                "unknown signature mode '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for SigMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SigMode::Default => "default",
            SigMode::Force => "force",
            SigMode::Ignore => "ignore",
            SigMode::Build => "build",
            SigMode::Assert => "assert",
        };
        write!(f, "{}", s)
    }
}

/// Main run configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Number of concurrent workers
    #[serde(default = "default_jobs")]
    pub jobs: usize,

    /// Signature mode for the whole run
    #[serde(default)]
    pub sig_mode: SigMode,

    /// Touch declared outputs instead of running actions
    #[serde(default)]
    pub dry_run: bool,

    /// Directory holding the signature journal, lock file and execution log
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,

    /// Files larger than this use a size+mtime digest instead of content
    #[serde(default = "default_max_digest_size")]
    pub max_digest_size: u64,

    /// Capacity of the ready-substep queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Optional per-substep wall-clock limit in milliseconds
    #[serde(default)]
    pub substep_timeout_ms: Option<u64>,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            sig_mode: SigMode::Default,
            dry_run: false,
            workspace_dir: default_workspace_dir(),
            max_digest_size: default_max_digest_size(),
            queue_capacity: default_queue_capacity(),
            substep_timeout_ms: None,
            log: LogConfig::default(),
        }
    }
}

// Default value functions
fn default_jobs() -> usize {
    4
}
fn default_workspace_dir() -> PathBuf {
    PathBuf::from(".sluice")
}
fn default_max_digest_size() -> u64 {
    16 * 1024 * 1024
}
fn default_queue_capacity() -> usize {
    256
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Load configuration from the environment
    pub fn load() -> Result<Self, config::ConfigError> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let builder = config::Config::builder()
            .set_default("jobs", default_jobs() as i64)?
            // Environment with SLUICE_ prefix (SLUICE_JOBS, SLUICE_SIG_MODE, ...)
            .add_source(
                config::Environment::with_prefix("SLUICE")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Clamp jobs to at least one worker
    pub fn effective_jobs(&self) -> usize {
        self.jobs.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.jobs, 4);
        assert_eq!(cfg.sig_mode, SigMode::Default);
        assert!(!cfg.dry_run);
        assert_eq!(cfg.workspace_dir, PathBuf::from(".sluice"));
    }

    #[test]
    fn test_sig_mode_parse() {
        assert_eq!("force".parse::<SigMode>().unwrap(), SigMode::Force);
        assert_eq!("build".parse::<SigMode>().unwrap(), SigMode::Build);
        assert!("never".parse::<SigMode>().is_err());
    }

    #[test]
    fn test_effective_jobs_never_zero() {
        let cfg = Config {
            jobs: 0,
            ..Config::default()
        };
        assert_eq!(cfg.effective_jobs(), 1);
    }
}

//! Sluice execution engine
//!
//! The scheduler/executor core: expands steps into substep groups, maintains
//! the execution DAG as dependencies resolve, dispatches runnable substeps to
//! a bounded worker pool and consults the signature store to skip work whose
//! inputs and actions have not changed.

pub mod actions;
pub mod eval;
pub mod executor;
pub mod expander;
pub mod report;
pub mod worker;

pub use actions::{ActionBackend, ActionOutcome, ShellBackend};
pub use eval::{Env, Evaluator, SimpleEvaluator};
pub use executor::Executor;
pub use expander::{expand_step, SubstepGroup, TermInputs};
pub use report::{ExecutionReport, FailureInfo, RunStatus, StepSummary};

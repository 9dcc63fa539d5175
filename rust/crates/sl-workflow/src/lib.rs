//! Sluice workflow model
//!
//! The engine does not parse workflow text itself; the parser collaborator
//! supplies a `Script` as structured data (JSON deserializes directly into
//! these types). A script is a list of named steps, each with input/output/
//! depends clauses and action blocks. Forward steps are positional members of
//! a workflow sequence; auxiliary steps declare `provides` patterns and are
//! instantiated on demand by the resolver.

mod model;
mod pattern;

pub use model::{
    Action, ActionKind, DependsSpec, ForEachAxis, GroupBy, GroupWith, InputClause, OutputClause,
    OutputSpec, PairedWith, Script, SourceTerm, Step, StepRef, Workflow,
};
pub use pattern::Template;

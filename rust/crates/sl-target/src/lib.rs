//! Sluice target model
//!
//! The universe of nameable artifacts a workflow can produce or depend on:
//! plain files, labelled step outputs, step completions, shared variables and
//! executables on PATH. Identity is tag plus payload; file paths are
//! normalized at construction so two spellings of the same file compare equal.

pub mod digest;
mod paths;
mod target;

pub use digest::{digest_bytes, digest_file, FileDigest};
pub use target::{Resolution, Target, TargetEntry};

//! Sluice Core Library
//!
//! Core primitives for the Sluice workflow engine:
//! - Run IDs
//! - Error types
//! - Run configuration
//! - Time utilities

pub mod config;
pub mod error;
pub mod id;
pub mod time;

pub use config::{Config, SigMode};
pub use error::{Error, Result};
pub use id::RunId;

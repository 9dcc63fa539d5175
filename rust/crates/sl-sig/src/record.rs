//! Signature records and substep keys

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;

use sl_core::time::Timestamp;
use sl_target::FileDigest;

/// A file referenced by a signature record, with its digest at record time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedFile {
    pub path: PathBuf,
    pub digest: FileDigest,
}

/// One completed substep: key, input and output digests, action digest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub key: String,
    pub step: String,
    pub index: usize,
    pub inputs: Vec<RecordedFile>,
    pub outputs: Vec<RecordedFile>,
    pub action_digest: String,
    pub completed_at: Timestamp,
}

impl SignatureRecord {
    /// Whether the record references a path as input or output
    pub fn references(&self, path: &std::path::Path) -> bool {
        self.inputs.iter().any(|f| f.path == path) || self.outputs.iter().any(|f| f.path == path)
    }
}

/// Stable identity of a substep across runs.
///
/// The key folds in the step name, the dense substep index, the canonicalized
/// input list, the canonicalized bound variables and the normalized action
/// text; identical substeps hash identically on every run.
pub fn substep_key(
    step: &str,
    index: usize,
    inputs: &[String],
    bound: &BTreeMap<String, serde_json::Value>,
    action_text: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(step.as_bytes());
    hasher.update([0u8]);
    hasher.update(index.to_le_bytes());
    for input in inputs {
        hasher.update([0u8]);
        hasher.update(input.as_bytes());
    }
    // BTreeMap iteration is sorted, so the serialization is canonical
    for (name, value) in bound {
        hasher.update([1u8]);
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.to_string().as_bytes());
    }
    hasher.update([2u8]);
    hasher.update(normalize_action_text(action_text).as_bytes());
    hex::encode(hasher.finalize())
}

/// Digest of a substep's action text alone
pub fn action_digest(action_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_action_text(action_text).as_bytes());
    hex::encode(hasher.finalize())
}

/// Strip per-line leading/trailing whitespace so reindentation does not
/// invalidate signatures
fn normalize_action_text(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

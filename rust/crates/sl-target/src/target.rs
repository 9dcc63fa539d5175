//! Target variants and per-target operations

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

use sl_core::Result;

use crate::digest::{digest_bytes, digest_file, FileDigest};
use crate::paths;

/// Extension appended to a file replaced by a zap marker
pub const ZAP_SUFFIX: &str = "zapped";

/// A nameable artifact a workflow can produce or depend on
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    /// A file on disk, identified by normalized path
    File { path: PathBuf },
    /// A labelled output of some step's output directive
    NamedOutput { label: String },
    /// Completion of every numbered instance of a step
    StepCompletion { step: String },
    /// A shared variable made available by an upstream step
    Variable { name: String },
    /// An executable reachable through PATH
    Executable { name: String },
}

/// Outcome of checking a target against the filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Present on disk (or satisfiable right now)
    Resolved,
    /// Replaced by a zap marker; valid only with a matching signature record
    Zapped,
    /// Not present
    Missing,
}

impl Target {
    /// File target with normalized path
    pub fn file(path: impl AsRef<Path>) -> Self {
        Target::File {
            path: paths::normalize(path.as_ref()),
        }
    }

    pub fn named_output(label: impl Into<String>) -> Self {
        Target::NamedOutput {
            label: label.into(),
        }
    }

    pub fn step_completion(step: impl Into<String>) -> Self {
        Target::StepCompletion { step: step.into() }
    }

    pub fn variable(name: impl Into<String>) -> Self {
        Target::Variable { name: name.into() }
    }

    pub fn executable(name: impl Into<String>) -> Self {
        Target::Executable { name: name.into() }
    }

    /// Path of a file target
    pub fn path(&self) -> Option<&Path> {
        match self {
            Target::File { path } => Some(path),
            _ => None,
        }
    }

    /// Final path component of a file target, used for pattern matching
    pub fn basename(&self) -> Option<String> {
        self.path()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    }

    /// Marker path a zapped file target is replaced by
    pub fn zapped_path(&self) -> Option<PathBuf> {
        self.path().map(|p| {
            let mut name = p.as_os_str().to_os_string();
            name.push(".");
            name.push(ZAP_SUFFIX);
            PathBuf::from(name)
        })
    }

    /// Check the filesystem state of this target.
    ///
    /// Engine-state targets (named outputs, step completions, variables) are
    /// reported `Missing` here; the executor resolves them against run state.
    pub fn resolution(&self) -> Resolution {
        match self {
            Target::File { path } => {
                if path.exists() {
                    Resolution::Resolved
                } else if self.zapped_path().is_some_and(|z| z.exists()) {
                    Resolution::Zapped
                } else {
                    Resolution::Missing
                }
            }
            Target::Executable { name } => {
                if find_on_path(name).is_some() {
                    Resolution::Resolved
                } else {
                    Resolution::Missing
                }
            }
            _ => Resolution::Missing,
        }
    }

    /// Digest of the target's current state.
    ///
    /// File content for file targets; for the other variants the identity
    /// string is digested, which is stable across runs.
    pub fn digest(&self, max_size: u64) -> Result<FileDigest> {
        match self {
            Target::File { path } => {
                if path.exists() {
                    digest_file(path, max_size)
                } else if let Some(marker) = self.zapped_path().filter(|z| z.exists()) {
                    let info: ZapMarker = serde_json::from_slice(&std::fs::read(&marker)?)
                        .map_err(|e| {
                            sl_core::Error::SignatureCorrupt(format!(
                                "bad zap marker {}: {}",
                                marker.display(),
                                e
                            ))
                        })?;
                    Ok(info.digest)
                } else {
                    Err(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("{} does not exist", path.display()),
                    )
                    .into())
                }
            }
            other => Ok(FileDigest::Content {
                sha256: digest_bytes(other.to_string().as_bytes()),
                size: 0,
            }),
        }
    }

    /// Create a file target if absent, update its mtime otherwise
    pub fn touch(&self) -> Result<()> {
        let Some(path) = self.path() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        file.set_modified(SystemTime::now())?;
        Ok(())
    }

    /// Replace a file with a `<path>.zapped` marker recording its digest.
    ///
    /// The marker keeps the target logically resolved as long as the
    /// signature store still holds a matching record.
    pub fn zap(&self, max_size: u64) -> Result<()> {
        let Some(path) = self.path() else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let digest = digest_file(path, max_size)?;
        let marker = ZapMarker {
            path: path.to_string_lossy().into_owned(),
            digest,
        };
        let marker_path = self.zapped_path().expect("file target has a marker path");
        let payload = serde_json::to_vec(&marker)
            .map_err(|e| sl_core::Error::SignatureCorrupt(e.to_string()))?;
        std::fs::write(&marker_path, payload)?;
        std::fs::remove_file(path)?;
        debug!(path = %path.display(), "Zapped file target");
        Ok(())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::File { path } => write!(f, "{}", path.display()),
            Target::NamedOutput { label } => write!(f, "named_output({})", label),
            Target::StepCompletion { step } => write!(f, "step_completed({})", step),
            Target::Variable { name } => write!(f, "variable({})", name),
            Target::Executable { name } => write!(f, "executable({})", name),
        }
    }
}

/// Content of a zap marker file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ZapMarker {
    path: String,
    digest: FileDigest,
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// A target as it appears in a step's input list: the target itself, the
/// provenance label of the producer, and per-target attributes attached by
/// `paired_with`/`group_with`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetEntry {
    pub target: Target,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, serde_json::Value>,
}

impl TargetEntry {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            source: None,
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_source(target: Target, source: impl Into<String>) -> Self {
        Self {
            target,
            source: Some(source.into()),
            attrs: BTreeMap::new(),
        }
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.attrs.insert(name.into(), value);
    }

    pub fn attr(&self, name: &str) -> Option<&serde_json::Value> {
        self.attrs.get(name)
    }
}

impl From<Target> for TargetEntry {
    fn from(target: Target) -> Self {
        Self::new(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_identity_ignores_spelling() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "x").unwrap();
        let a = Target::file(&file);
        let b = Target::file(dir.path().join(".").join("a.txt"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_duplicates_preserved_in_ordered_containers() {
        let t = Target::file("dup.txt");
        let inputs = vec![TargetEntry::new(t.clone()), TargetEntry::new(t)];
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0].target, inputs[1].target);
    }

    #[test]
    fn test_touch_creates_and_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let t = Target::file(dir.path().join("made.txt"));
        assert_eq!(t.resolution(), Resolution::Missing);
        t.touch().unwrap();
        assert_eq!(t.resolution(), Resolution::Resolved);
    }

    #[test]
    fn test_zap_replaces_file_with_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, "payload").unwrap();
        let t = Target::file(&path);
        let before = t.digest(1 << 20).unwrap();

        t.zap(1 << 20).unwrap();
        assert!(!path.exists());
        assert_eq!(t.resolution(), Resolution::Zapped);
        // digest of a zapped target is read back from the marker
        assert_eq!(t.digest(1 << 20).unwrap(), before);
    }

    #[test]
    fn test_executable_resolution() {
        assert_eq!(Target::executable("sh").resolution(), Resolution::Resolved);
        assert_eq!(
            Target::executable("definitely-not-a-real-binary-xyz").resolution(),
            Resolution::Missing
        );
    }

    #[test]
    fn test_entry_attrs() {
        let mut e = TargetEntry::with_source(Target::file("a.txt"), "align");
        e.set_attr("_sample", serde_json::json!("s1"));
        assert_eq!(e.source.as_deref(), Some("align"));
        assert_eq!(e.attr("_sample"), Some(&serde_json::json!("s1")));
    }
}

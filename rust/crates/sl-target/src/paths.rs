//! Path normalization for file targets
//!
//! File targets compare by normalized path: absolute, symlinks resolved when
//! the file exists, `.` and `..` components folded lexically otherwise.

use std::path::{Component, Path, PathBuf};

/// Normalize a path for target identity
pub fn normalize(path: &Path) -> PathBuf {
    // canonicalize resolves symlinks but requires the file to exist
    if let Ok(real) = path.canonicalize() {
        return real;
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };

    lexical_clean(&absolute)
}

/// Fold `.` and `..` components without touching the filesystem
fn lexical_clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    cleaned.push(component.as_os_str());
                }
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

//! Advisory workspace lock
//!
//! Two independent engine processes on the same workflow coordinate through
//! an advisory lock file next to the signature journal. The lock is held for
//! the duration of a run and removed on drop.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use sl_core::{Error, Result};

const LOCK_FILE: &str = "workspace.lock";

/// Held for the lifetime of a run; the file is removed on drop
#[derive(Debug)]
pub struct WorkspaceLock {
    path: PathBuf,
}

impl WorkspaceLock {
    /// Acquire the lock, failing if another process holds it
    pub fn acquire(workspace_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(workspace_dir)?;
        let path = workspace_dir.join(LOCK_FILE);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let holder = format!("pid {}", std::process::id());
                file.write_all(holder.as_bytes())?;
                debug!(path = %path.display(), "Acquired workspace lock");
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&path)
                    .unwrap_or_else(|_| "unknown process".to_string());
                Err(Error::WorkspaceLocked { holder })
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to release workspace lock");
        }
    }
}

//! The signature store proper

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument, warn};

use sl_core::{Error, Result, SigMode};
use sl_target::{Resolution, Target};

use crate::record::SignatureRecord;

const JOURNAL_FILE: &str = "signatures.jsonl";

/// Result of consulting the store for a substep key
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Recorded and still valid; carries the recorded output paths
    Hit(Vec<PathBuf>),
    Miss,
}

#[derive(serde::Serialize, serde::Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalEntry {
    Record(SignatureRecord),
    Invalidate { keys: Vec<String> },
}

#[derive(Debug)]
struct Inner {
    index: HashMap<String, SignatureRecord>,
    journal: Option<std::fs::File>,
}

/// Shared, concurrency-safe signature store.
///
/// Workers call `lock_key` before executing a substep; the per-key lock
/// guarantees at-most-one concurrent execution per substep key.
#[derive(Debug)]
pub struct SignatureStore {
    mode: SigMode,
    max_digest_size: u64,
    inner: Mutex<Inner>,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SignatureStore {
    /// Open the store under a workspace directory, replaying the journal
    #[instrument(skip_all, fields(dir = %workspace_dir.display(), mode = %mode))]
    pub fn open(workspace_dir: &Path, mode: SigMode, max_digest_size: u64) -> Result<Self> {
        std::fs::create_dir_all(workspace_dir)?;
        let path = workspace_dir.join(JOURNAL_FILE);
        let index = Self::replay(&path)?;
        debug!(records = index.len(), "Loaded signature journal");

        let journal = if mode == SigMode::Ignore {
            None
        } else {
            Some(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)?,
            )
        };

        Ok(Self {
            mode,
            max_digest_size,
            inner: Mutex::new(Inner { index, journal }),
            key_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Remove all persisted signatures under a workspace directory
    pub fn clean(workspace_dir: &Path) -> Result<usize> {
        let path = workspace_dir.join(JOURNAL_FILE);
        if !path.exists() {
            return Ok(0);
        }
        let count = Self::replay(&path)?.len();
        std::fs::remove_file(&path)?;
        Ok(count)
    }

    fn replay(path: &Path) -> Result<HashMap<String, SignatureRecord>> {
        let mut index = HashMap::new();
        if !path.exists() {
            return Ok(index);
        }
        let text = std::fs::read_to_string(path)?;
        let lines: Vec<&str> = text.lines().collect();
        for (n, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(line) {
                Ok(JournalEntry::Record(record)) => {
                    index.insert(record.key.clone(), record);
                }
                Ok(JournalEntry::Invalidate { keys }) => {
                    for key in keys {
                        index.remove(&key);
                    }
                }
                Err(e) if n + 1 == lines.len() => {
                    // a crash mid-record tears only the final line
                    warn!(line = n + 1, error = %e, "Discarding torn journal line");
                }
                Err(e) => {
                    return Err(Error::SignatureCorrupt(format!(
                        "{} line {}: {}",
                        path.display(),
                        n + 1,
                        e
                    )));
                }
            }
        }
        Ok(index)
    }

    pub fn mode(&self) -> SigMode {
        self.mode
    }

    /// Serialize executions of one substep key
    pub async fn lock_key(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.key_locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Consult the store for a substep key.
    ///
    /// A hit requires every recorded input digest to match the file currently
    /// on disk (zap markers carry the digest of the file they replaced) and
    /// every recorded output to still exist.
    #[instrument(skip(self))]
    pub async fn lookup(&self, key: &str) -> Lookup {
        if matches!(self.mode, SigMode::Force | SigMode::Ignore) {
            return Lookup::Miss;
        }
        let inner = self.inner.lock().await;
        let Some(record) = inner.index.get(key) else {
            return Lookup::Miss;
        };
        for input in &record.inputs {
            let current = Target::file(&input.path).digest(self.max_digest_size);
            match current {
                Ok(digest) if digest == input.digest => {}
                _ => {
                    debug!(key, input = %input.path.display(), "Input digest mismatch");
                    return Lookup::Miss;
                }
            }
        }
        for output in &record.outputs {
            if Target::file(&output.path).resolution() == Resolution::Missing {
                debug!(key, output = %output.path.display(), "Recorded output missing");
                return Lookup::Miss;
            }
        }
        Lookup::Hit(record.outputs.iter().map(|f| f.path.clone()).collect())
    }

    /// Append a completed-substep record; atomic at line granularity
    #[instrument(skip(self, record), fields(key = %record.key, step = %record.step))]
    pub async fn record(&self, record: SignatureRecord) -> Result<()> {
        if self.mode == SigMode::Ignore {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        Self::append(&mut inner, JournalEntry::Record(record.clone()))?;
        inner.index.insert(record.key.clone(), record);
        Ok(())
    }

    /// Drop every record referencing any of the listed targets
    #[instrument(skip_all, fields(targets = targets.len()))]
    pub async fn invalidate(&self, targets: &[Target]) -> Result<usize> {
        let paths: Vec<&Path> = targets.iter().filter_map(|t| t.path()).collect();
        let mut inner = self.inner.lock().await;
        let stale: Vec<String> = inner
            .index
            .values()
            .filter(|r| paths.iter().any(|p| r.references(p)))
            .map(|r| r.key.clone())
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }
        for key in &stale {
            inner.index.remove(key);
        }
        let count = stale.len();
        Self::append(&mut inner, JournalEntry::Invalidate { keys: stale })?;
        debug!(count, "Invalidated signature records");
        Ok(count)
    }

    /// Number of live records
    pub async fn len(&self) -> usize {
        self.inner.lock().await.index.len()
    }

    fn append(inner: &mut Inner, entry: JournalEntry) -> Result<()> {
        let Some(journal) = inner.journal.as_mut() else {
            return Ok(());
        };
        let mut line = serde_json::to_string(&entry)
            .map_err(|e| Error::SignatureCorrupt(e.to_string()))?;
        line.push('\n');
        journal.write_all(line.as_bytes())?;
        journal.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{action_digest, RecordedFile};
    use sl_core::time::Timestamp;

    const LIMIT: u64 = 1 << 20;

    fn recorded(path: &Path) -> RecordedFile {
        RecordedFile {
            path: Target::file(path).path().unwrap().to_path_buf(),
            digest: Target::file(path).digest(LIMIT).unwrap(),
        }
    }

    fn make_record(key: &str, input: &Path, output: &Path) -> SignatureRecord {
        SignatureRecord {
            key: key.to_string(),
            step: "s".to_string(),
            index: 0,
            inputs: vec![recorded(input)],
            outputs: vec![recorded(output)],
            action_digest: action_digest("cp in out"),
            completed_at: Timestamp::now(),
        }
    }

    #[tokio::test]
    async fn test_record_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        let output = dir.path().join("out.txt");
        std::fs::write(&input, "in").unwrap();
        std::fs::write(&output, "out").unwrap();

        let store = SignatureStore::open(dir.path(), SigMode::Default, LIMIT).unwrap();
        store.record(make_record("k1", &input, &output)).await.unwrap();

        match store.lookup("k1").await {
            Lookup::Hit(outputs) => assert_eq!(outputs.len(), 1),
            Lookup::Miss => panic!("expected hit"),
        }
    }

    #[tokio::test]
    async fn test_changed_input_invalidates_hit() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        let output = dir.path().join("out.txt");
        std::fs::write(&input, "v1").unwrap();
        std::fs::write(&output, "out").unwrap();

        let store = SignatureStore::open(dir.path(), SigMode::Default, LIMIT).unwrap();
        store.record(make_record("k1", &input, &output)).await.unwrap();

        std::fs::write(&input, "v2").unwrap();
        assert_eq!(store.lookup("k1").await, Lookup::Miss);
    }

    #[tokio::test]
    async fn test_missing_output_invalidates_hit() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        let output = dir.path().join("out.txt");
        std::fs::write(&input, "in").unwrap();
        std::fs::write(&output, "out").unwrap();

        let store = SignatureStore::open(dir.path(), SigMode::Default, LIMIT).unwrap();
        store.record(make_record("k1", &input, &output)).await.unwrap();

        std::fs::remove_file(&output).unwrap();
        assert_eq!(store.lookup("k1").await, Lookup::Miss);
    }

    #[tokio::test]
    async fn test_zapped_output_still_hits() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        let output = dir.path().join("out.txt");
        std::fs::write(&input, "in").unwrap();
        std::fs::write(&output, "out").unwrap();

        let store = SignatureStore::open(dir.path(), SigMode::Default, LIMIT).unwrap();
        store.record(make_record("k1", &input, &output)).await.unwrap();

        Target::file(&output).zap(LIMIT).unwrap();
        assert!(matches!(store.lookup("k1").await, Lookup::Hit(_)));
    }

    #[tokio::test]
    async fn test_force_mode_always_misses() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        let output = dir.path().join("out.txt");
        std::fs::write(&input, "in").unwrap();
        std::fs::write(&output, "out").unwrap();

        let store = SignatureStore::open(dir.path(), SigMode::Force, LIMIT).unwrap();
        store.record(make_record("k1", &input, &output)).await.unwrap();
        assert_eq!(store.lookup("k1").await, Lookup::Miss);

        // a later default-mode run sees the record written under force
        drop(store);
        let store = SignatureStore::open(dir.path(), SigMode::Default, LIMIT).unwrap();
        assert!(matches!(store.lookup("k1").await, Lookup::Hit(_)));
    }

    #[tokio::test]
    async fn test_ignore_mode_never_records() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        let output = dir.path().join("out.txt");
        std::fs::write(&input, "in").unwrap();
        std::fs::write(&output, "out").unwrap();

        let store = SignatureStore::open(dir.path(), SigMode::Ignore, LIMIT).unwrap();
        store.record(make_record("k1", &input, &output)).await.unwrap();
        drop(store);

        let store = SignatureStore::open(dir.path(), SigMode::Default, LIMIT).unwrap();
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_invalidate_by_target() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        let output = dir.path().join("out.txt");
        std::fs::write(&input, "in").unwrap();
        std::fs::write(&output, "out").unwrap();

        let store = SignatureStore::open(dir.path(), SigMode::Default, LIMIT).unwrap();
        store.record(make_record("k1", &input, &output)).await.unwrap();

        let removed = store.invalidate(&[Target::file(&output)]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.lookup("k1").await, Lookup::Miss);

        // invalidation survives reopen
        drop(store);
        let store = SignatureStore::open(dir.path(), SigMode::Default, LIMIT).unwrap();
        assert_eq!(store.lookup("k1").await, Lookup::Miss);
    }

    #[tokio::test]
    async fn test_torn_final_line_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        let output = dir.path().join("out.txt");
        std::fs::write(&input, "in").unwrap();
        std::fs::write(&output, "out").unwrap();

        let store = SignatureStore::open(dir.path(), SigMode::Default, LIMIT).unwrap();
        store.record(make_record("k1", &input, &output)).await.unwrap();
        drop(store);

        // simulate a crash mid-append
        let journal = dir.path().join(JOURNAL_FILE);
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&journal)
            .unwrap();
        file.write_all(b"{\"op\":\"record\",\"key\":\"k2").unwrap();
        drop(file);

        let store = SignatureStore::open(dir.path(), SigMode::Default, LIMIT).unwrap();
        assert_eq!(store.len().await, 1);
        assert!(matches!(store.lookup("k1").await, Lookup::Hit(_)));
    }

    #[tokio::test]
    async fn test_corrupt_interior_line_fails() {
        let dir = tempfile::tempdir().unwrap();
        let journal = dir.path().join(JOURNAL_FILE);
        std::fs::write(&journal, "not json at all\n{\"op\":\"invalidate\",\"keys\":[]}\n").unwrap();

        let err = SignatureStore::open(dir.path(), SigMode::Default, LIMIT).unwrap_err();
        assert_eq!(err.code(), "SIGNATURE_CORRUPT");
    }

    #[tokio::test]
    async fn test_per_key_lock_excludes() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(SignatureStore::open(dir.path(), SigMode::Default, LIMIT).unwrap());

        let guard = store.lock_key("k").await;
        // another worker cannot take the same key, but can take a different one
        let other = store.clone();
        let busy = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            other.lock_key("k"),
        )
        .await;
        assert!(busy.is_err());
        let _free = store.lock_key("other").await;
        drop(guard);
        let now_free =
            tokio::time::timeout(std::time::Duration::from_millis(50), store.lock_key("k")).await;
        assert!(now_free.is_ok());
    }
}

//! Content digests for file targets
//!
//! Files up to the configured size limit are digested by content (SHA-256);
//! larger files fall back to a size+mtime digest so huge intermediates do not
//! dominate signature checks.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::UNIX_EPOCH;

use sl_core::Result;

/// Digest of a file's current on-disk state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileDigest {
    /// SHA-256 of the full content
    Content { sha256: String, size: u64 },
    /// Size and mtime only, for files above the digest size limit
    Quick { size: u64, mtime_ms: i64 },
}

/// Digest an in-memory byte slice
pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Digest a file, by content up to `max_size` bytes, size+mtime above
pub fn digest_file(path: &Path, max_size: u64) -> Result<FileDigest> {
    let meta = std::fs::metadata(path)?;
    let size = meta.len();

    if size > max_size {
        let mtime_ms = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        return Ok(FileDigest::Quick { size, mtime_ms });
    }

    let mut hasher = Sha256::new();
    let mut file = File::open(path)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(FileDigest::Content {
        sha256: hex::encode(hasher.finalize()),
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_digest_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();

        let d1 = digest_file(&path, 1024).unwrap();
        let d2 = digest_file(&path, 1024).unwrap();
        assert_eq!(d1, d2);
        assert!(matches!(d1, FileDigest::Content { size: 5, .. }));
    }

    #[test]
    fn test_content_digest_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();
        let before = digest_file(&path, 1024).unwrap();
        std::fs::write(&path, b"world").unwrap();
        let after = digest_file(&path, 1024).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_large_file_uses_quick_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, vec![0u8; 128]).unwrap();

        let d = digest_file(&path, 64).unwrap();
        assert!(matches!(d, FileDigest::Quick { size: 128, .. }));
    }

    #[test]
    fn test_digest_bytes_matches_known_vector() {
        // sha256("")
        assert_eq!(
            digest_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}

//! Content-addressed store of unpacked bottles.
//!
//! Each entry is a directory named after the bottle's SHA-256. Entries are
//! created under an exclusive file lock so concurrent processes unpack a
//! given bottle at most once.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use walkdir::WalkDir;

use crate::extract::extract_tarball;
use pb_core::Error;

#[derive(Debug, Clone)]
pub struct Store {
    store_dir: PathBuf,
    locks_dir: PathBuf,
}

impl Store {
    pub fn new(root: &Path) -> io::Result<Self> {
        let store_dir = root.join("store");
        let locks_dir = root.join("locks");

        fs::create_dir_all(&store_dir)?;
        fs::create_dir_all(&locks_dir)?;

        Ok(Self {
            store_dir,
            locks_dir,
        })
    }

    pub fn entry_path(&self, store_key: &str) -> PathBuf {
        self.store_dir.join(store_key)
    }

    pub fn has_entry(&self, store_key: &str) -> bool {
        self.entry_path(store_key).is_dir()
    }

    fn lock(&self, store_key: &str) -> Result<File, Error> {
        let lock_path = self.locks_dir.join(format!("{store_key}.lock"));
        let lock_file = File::create(&lock_path)
            .map_err(|e| Error::store(format!("failed to create lock file: {e}")))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| Error::store(format!("failed to acquire lock: {e}")))?;
        Ok(lock_file)
    }

    /// Unpack `blob_path` into the entry for `store_key` unless it already exists.
    pub fn ensure_entry(&self, store_key: &str, blob_path: &Path) -> Result<PathBuf, Error> {
        let entry_path = self.entry_path(store_key);
        if entry_path.exists() {
            return Ok(entry_path);
        }

        let _lock = self.lock(store_key)?;

        // Another process may have finished while we waited on the lock
        if entry_path.exists() {
            return Ok(entry_path);
        }

        let staging = tempfile::Builder::new()
            .prefix(&format!(".{store_key}.tmp."))
            .tempdir_in(&self.store_dir)
            .map_err(|e| Error::store(format!("failed to create staging directory: {e}")))?;

        extract_tarball(blob_path, staging.path())?;

        fs::rename(staging.path(), &entry_path)
            .map_err(|e| Error::store(format!("failed to publish store entry {store_key}: {e}")))?;

        Ok(entry_path)
    }

    /// Remove an entry; returns the bytes freed. Callers check references first.
    pub fn remove_entry(&self, store_key: &str) -> Result<u64, Error> {
        let entry_path = self.entry_path(store_key);
        if !entry_path.exists() {
            return Ok(0);
        }

        let lock = self.lock(store_key)?;
        let size = dir_size(&entry_path);
        if entry_path.exists() {
            fs::remove_dir_all(&entry_path)
                .map_err(|e| Error::store(format!("failed to remove store entry: {e}")))?;
        }

        drop(lock);
        let _ = fs::remove_file(self.locks_dir.join(format!("{store_key}.lock")));

        Ok(size)
    }
}

/// Total size of the regular files under `path`.
pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::gzip_tarball;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn blob(tmp: &TempDir, content: &[u8]) -> PathBuf {
        let path = tmp.path().join("test.tar.gz");
        fs::write(&path, gzip_tarball(&[("test.txt", content)])).unwrap();
        path
    }

    #[test]
    fn second_call_is_noop() {
        let tmp = TempDir::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let blob_path = blob(&tmp, b"hello world");

        let first = store.ensure_entry("abc123", &blob_path).unwrap();
        assert!(first.join("test.txt").exists());
        fs::write(first.join("marker.txt"), "original").unwrap();

        let second = store.ensure_entry("abc123", &blob_path).unwrap();
        assert_eq!(first, second);
        assert!(second.join("marker.txt").exists());
    }

    #[test]
    fn concurrent_calls_unpack_once() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let blob_path = blob(&tmp, b"concurrent test");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let blob = blob_path.clone();
                thread::spawn(move || store.ensure_entry("concurrent", &blob))
            })
            .collect();

        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let content =
            fs::read_to_string(store.entry_path("concurrent").join("test.txt")).unwrap();
        assert_eq!(content, "concurrent test");

        let leftovers = fs::read_dir(tmp.path().join("store"))
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn failed_extraction_leaves_no_entry() {
        let tmp = TempDir::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let bad = tmp.path().join("bad.tar.gz");
        fs::write(&bad, [0x1F, 0x8B, 0x00, 0x00]).unwrap();

        assert!(store.ensure_entry("broken", &bad).is_err());
        assert!(!store.has_entry("broken"));
        assert_eq!(fs::read_dir(tmp.path().join("store")).unwrap().count(), 0);
    }

    #[test]
    fn remove_entry_reports_bytes() {
        let tmp = TempDir::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        let blob_path = blob(&tmp, b"twelve bytes");

        store.ensure_entry("sized", &blob_path).unwrap();
        assert_eq!(store.remove_entry("sized").unwrap(), 12);
        assert!(!store.has_entry("sized"));
        assert_eq!(store.remove_entry("sized").unwrap(), 0);
    }
}

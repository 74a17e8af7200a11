//! Downloaded artifacts, addressed by their SHA-256.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use pb_core::Error;

static WRITE_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct BlobCache {
    blobs_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl BlobCache {
    pub fn new(cache_root: &Path) -> io::Result<Self> {
        let blobs_dir = cache_root.join("blobs");
        let tmp_dir = cache_root.join("tmp");

        fs::create_dir_all(&blobs_dir)?;
        fs::create_dir_all(&tmp_dir)?;

        Ok(Self { blobs_dir, tmp_dir })
    }

    pub fn blob_path(&self, sha256: &str) -> PathBuf {
        self.blobs_dir.join(format!("{sha256}.blob"))
    }

    pub fn has_blob(&self, sha256: &str) -> bool {
        self.blob_path(sha256).is_file()
    }

    /// Returns the number of bytes freed, zero if the blob wasn't cached.
    pub fn remove_blob(&self, sha256: &str) -> io::Result<u64> {
        let path = self.blob_path(sha256);
        match fs::metadata(&path) {
            Ok(meta) => {
                fs::remove_file(&path)?;
                Ok(meta.len())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub fn start_write(&self, sha256: &str) -> io::Result<BlobWriter> {
        let final_path = self.blob_path(sha256);
        // Concurrent downloads of the same digest each get their own temp file
        let seq = WRITE_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp_path = self
            .tmp_dir
            .join(format!("{sha256}.{}.{seq}.part", std::process::id()));

        let file = fs::File::create(&tmp_path)?;

        Ok(BlobWriter {
            file,
            tmp_path,
            final_path,
            committed: false,
        })
    }
}

pub struct BlobWriter {
    file: fs::File,
    tmp_path: PathBuf,
    final_path: PathBuf,
    committed: bool,
}

impl BlobWriter {
    pub fn commit(mut self) -> Result<PathBuf, Error> {
        self.file
            .flush()
            .map_err(|e| Error::store(format!("failed to flush blob: {e}")))?;

        // A racing download of the same digest may have landed first
        if self.final_path.exists() {
            let _ = fs::remove_file(&self.tmp_path);
            self.committed = true;
            return Ok(self.final_path.clone());
        }

        match fs::rename(&self.tmp_path, &self.final_path) {
            Ok(()) => {}
            Err(_) if self.final_path.exists() => {
                let _ = fs::remove_file(&self.tmp_path);
            }
            Err(e) => {
                return Err(Error::store(format!(
                    "failed to move blob into {}: {e}",
                    self.final_path.display()
                )));
            }
        }

        self.committed = true;
        Ok(self.final_path.clone())
    }
}

impl Write for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if !self.committed && self.tmp_path.exists() {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

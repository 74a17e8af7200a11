//! The Cellar: one directory per installed version of each formula.
//!
//! ```text
//! Cellar/<name>/<version>/
//!     bin/...
//!     .resources/<resource>     auxiliary artifacts
//!     INSTALL_RECEIPT.json
//! ```

use std::fs;
use std::io;
#[cfg(unix)]
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use pb_core::{Error, Version};

use crate::store::dir_size;

pub const RECEIPT_FILE: &str = "INSTALL_RECEIPT.json";
const RESOURCES_DIR: &str = ".resources";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReceipt {
    pub name: String,
    pub version: String,
    pub store_key: String,
    /// Resource name -> sha256 of the cached artifact.
    #[serde(default)]
    pub resources: Vec<(String, String)>,
    pub installed_at: DateTime<Utc>,
    pub explicit: bool,
}

#[derive(Debug, Clone)]
pub struct Cellar {
    root: PathBuf,
}

impl Cellar {
    pub fn new(root: &Path) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn keg_path(&self, name: &str, version: &str) -> PathBuf {
        self.root.join(name).join(version)
    }

    pub fn has_keg(&self, name: &str, version: &str) -> bool {
        self.keg_path(name, version).is_dir()
    }

    /// Installed versions of `name`, oldest first.
    pub fn installed_versions(&self, name: &str) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.root.join(name)) else {
            return Vec::new();
        };

        let mut versions: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|v| !v.starts_with('.'))
            .collect();
        versions.sort_by_key(|v| Version::parse(v));
        versions
    }

    /// Check that new kegs can be created under the Cellar.
    pub fn probe_writable(&self) -> Result<(), Error> {
        tempfile::Builder::new()
            .prefix(".probe")
            .tempfile_in(&self.root)
            .map(drop)
            .map_err(|e| Error::store(format!("{} is not writable: {e}", self.root.display())))
    }

    /// Copy `<entry>/<name>/<bottle_version>` into the keg for `version`.
    ///
    /// The copy is staged beside the keg and renamed into place, so a failure
    /// never leaves a half-populated keg.
    pub fn materialize(
        &self,
        name: &str,
        version: &str,
        bottle_version: &str,
        entry: &Path,
    ) -> Result<PathBuf, Error> {
        let keg = self.keg_path(name, version);
        if keg.exists() {
            return Ok(keg);
        }

        let source = entry.join(name).join(bottle_version);
        if !source.is_dir() {
            return Err(Error::store(format!(
                "bottle for {name} has no {name}/{bottle_version} directory"
            )));
        }

        let parent = self.root.join(name);
        fs::create_dir_all(&parent)
            .map_err(|e| Error::store(format!("failed to create {}: {e}", parent.display())))?;

        let staging = tempfile::Builder::new()
            .prefix(&format!(".{version}.tmp."))
            .tempdir_in(&parent)
            .map_err(|e| Error::store(format!("failed to stage keg for {name}: {e}")))?;

        copy_tree(&source, staging.path())?;

        fs::rename(staging.path(), &keg)
            .map_err(|e| Error::store(format!("failed to publish keg {}: {e}", keg.display())))?;

        Ok(keg)
    }

    /// Copy an auxiliary artifact into `<keg>/.resources/<resource>`.
    pub fn stage_resource(&self, keg: &Path, resource: &str, blob: &Path) -> Result<PathBuf, Error> {
        let dir = keg.join(RESOURCES_DIR);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::store(format!("failed to create {}: {e}", dir.display())))?;

        let dest = dir.join(resource);
        fs::copy(blob, &dest)
            .map_err(|e| Error::store(format!("failed to stage resource {resource}: {e}")))?;
        Ok(dest)
    }

    /// Remove a keg and its formula directory if it becomes empty.
    /// Returns the bytes freed.
    pub fn remove_keg(&self, name: &str, version: &str) -> Result<u64, Error> {
        let keg = self.keg_path(name, version);
        if !keg.exists() {
            return Ok(0);
        }

        let size = dir_size(&keg);
        fs::remove_dir_all(&keg)
            .map_err(|e| Error::store(format!("failed to remove {}: {e}", keg.display())))?;

        // Only succeeds when empty
        let _ = fs::remove_dir(self.root.join(name));

        Ok(size)
    }

    pub fn write_receipt(&self, keg: &Path, receipt: &InstallReceipt) -> Result<(), Error> {
        let json = serde_json::to_vec_pretty(receipt)
            .map_err(|e| Error::store(format!("failed to encode receipt: {e}")))?;
        fs::write(keg.join(RECEIPT_FILE), json)
            .map_err(|e| Error::store(format!("failed to write receipt: {e}")))
    }

    pub fn read_receipt(&self, name: &str, version: &str) -> Option<InstallReceipt> {
        let bytes = fs::read(self.keg_path(name, version).join(RECEIPT_FILE)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

fn copy_tree(source: &Path, dest: &Path) -> Result<(), Error> {
    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(|e| Error::store(format!("failed to walk bottle: {e}")))?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| Error::store(e.to_string()))?;
        let target = dest.join(rel);
        let fail = |e: io::Error| Error::store(format!("failed to copy {}: {e}", rel.display()));

        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(fail)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path()).map_err(fail)?;
            #[cfg(unix)]
            symlink(&link, &target).map_err(fail)?;
            #[cfg(not(unix))]
            fs::copy(entry.path().parent().unwrap_or(source).join(&link), &target)
                .map(drop)
                .map_err(fail)?;
        } else {
            fs::copy(entry.path(), &target).map_err(fail)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_entry(tmp: &TempDir, name: &str, version: &str) -> PathBuf {
        let entry = tmp.path().join("entry");
        let bin = entry.join(name).join(version).join("bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join(name), b"#!/bin/sh\necho hi\n").unwrap();
        entry
    }

    #[test]
    fn materialize_copies_bottle_contents() {
        let tmp = TempDir::new().unwrap();
        let cellar = Cellar::new(&tmp.path().join("Cellar")).unwrap();
        let entry = fake_entry(&tmp, "jq", "1.7.1");

        let keg = cellar.materialize("jq", "1.7.1", "1.7.1", &entry).unwrap();

        assert_eq!(keg, cellar.keg_path("jq", "1.7.1"));
        assert!(keg.join("bin/jq").exists());
        assert!(entry.join("jq/1.7.1/bin/jq").exists(), "store entry untouched");
    }

    #[test]
    fn materialize_rejects_mismatched_layout() {
        let tmp = TempDir::new().unwrap();
        let cellar = Cellar::new(&tmp.path().join("Cellar")).unwrap();
        let entry = fake_entry(&tmp, "jq", "1.7.0");

        let err = cellar.materialize("jq", "1.7.1", "1.7.1", &entry).unwrap_err();
        assert!(matches!(err, Error::StoreCorruption { .. }));
        assert!(!cellar.has_keg("jq", "1.7.1"));
    }

    #[test]
    fn installed_versions_sorted_by_version() {
        let tmp = TempDir::new().unwrap();
        let cellar = Cellar::new(tmp.path()).unwrap();
        for v in ["1.10.0", "1.9.0", "1.9.0_1"] {
            fs::create_dir_all(cellar.keg_path("foo", v)).unwrap();
        }
        fs::create_dir_all(cellar.root().join("foo/.2.0.tmp.abc")).unwrap();

        assert_eq!(
            cellar.installed_versions("foo"),
            vec!["1.9.0", "1.9.0_1", "1.10.0"]
        );
        assert!(cellar.installed_versions("bar").is_empty());
    }

    #[test]
    fn remove_keg_drops_empty_formula_dir() {
        let tmp = TempDir::new().unwrap();
        let cellar = Cellar::new(tmp.path()).unwrap();
        let keg = cellar.keg_path("foo", "1.0");
        fs::create_dir_all(&keg).unwrap();
        fs::write(keg.join("file"), [0u8; 10]).unwrap();

        assert_eq!(cellar.remove_keg("foo", "1.0").unwrap(), 10);
        assert!(!cellar.root().join("foo").exists());
        assert_eq!(cellar.remove_keg("foo", "1.0").unwrap(), 0);
    }

    #[test]
    fn receipt_survives_a_round_trip() {
        let tmp = TempDir::new().unwrap();
        let cellar = Cellar::new(tmp.path()).unwrap();
        let keg = cellar.keg_path("foo", "1.0");
        fs::create_dir_all(&keg).unwrap();

        let receipt = InstallReceipt {
            name: "foo".to_string(),
            version: "1.0".to_string(),
            store_key: "abc".to_string(),
            resources: vec![("completions".to_string(), "def".to_string())],
            installed_at: Utc::now(),
            explicit: true,
        };
        cellar.write_receipt(&keg, &receipt).unwrap();

        assert_eq!(cellar.read_receipt("foo", "1.0"), Some(receipt));
        assert_eq!(cellar.read_receipt("foo", "2.0"), None);
    }

    #[test]
    fn stage_resource_copies_into_hidden_dir() {
        let tmp = TempDir::new().unwrap();
        let cellar = Cellar::new(&tmp.path().join("Cellar")).unwrap();
        let keg = cellar.keg_path("foo", "1.0");
        fs::create_dir_all(&keg).unwrap();
        let blob = tmp.path().join("blob");
        fs::write(&blob, b"resource").unwrap();

        let staged = cellar.stage_resource(&keg, "completions", &blob).unwrap();
        assert_eq!(staged, keg.join(".resources/completions"));
        assert_eq!(fs::read(staged).unwrap(), b"resource");
    }

    #[test]
    fn probe_writable_succeeds_on_fresh_cellar() {
        let tmp = TempDir::new().unwrap();
        let cellar = Cellar::new(tmp.path()).unwrap();
        cellar.probe_writable().unwrap();
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }
}

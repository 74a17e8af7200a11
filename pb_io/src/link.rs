use std::fs;
#[cfg(unix)]
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use pb_core::Error;

/// Exposes kegs in the prefix: `opt/<name>` for every keg, plus `bin/*`
/// for formulae that aren't keg-only.
#[derive(Debug, Clone)]
pub struct Linker {
    bin_dir: PathBuf,
    opt_dir: PathBuf,
}

impl Linker {
    pub fn new(prefix: &Path) -> std::io::Result<Self> {
        let bin_dir = prefix.join("bin");
        let opt_dir = prefix.join("opt");
        fs::create_dir_all(&bin_dir)?;
        fs::create_dir_all(&opt_dir)?;
        Ok(Self { bin_dir, opt_dir })
    }

    pub fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }

    pub fn opt_link(&self, name: &str) -> PathBuf {
        self.opt_dir.join(name)
    }

    /// Link `keg`. Links owned by another version of the same formula are
    /// replaced; anything else in the way is a `LinkConflict`, checked
    /// before any link is touched.
    pub fn link_keg(&self, name: &str, keg: &Path, keg_only: bool) -> Result<Vec<PathBuf>, Error> {
        let formula_dir = keg.parent().unwrap_or(keg);

        let mut plan = vec![(self.opt_link(name), keg.to_path_buf())];
        if !keg_only {
            for exe in executables(keg)? {
                if let Some(file_name) = exe.file_name() {
                    plan.push((self.bin_dir.join(file_name), exe.clone()));
                }
            }
        }

        for (link, _) in &plan {
            if let Some(existing) = read_link(link)? {
                if !existing.starts_with(formula_dir) {
                    return Err(Error::LinkConflict { path: link.clone() });
                }
            } else if link.exists() {
                return Err(Error::LinkConflict { path: link.clone() });
            }
        }

        let mut created = Vec::with_capacity(plan.len());
        for (link, target) in plan {
            if read_link(&link)?.is_some() {
                fs::remove_file(&link).map_err(|e| {
                    Error::store(format!("failed to replace {}: {e}", link.display()))
                })?;
            }
            make_symlink(&target, &link)?;
            created.push(link);
        }

        Ok(created)
    }

    /// Remove links that point into `keg`. Returns the removed paths.
    pub fn unlink_keg(&self, name: &str, keg: &Path) -> Result<Vec<PathBuf>, Error> {
        let mut candidates = vec![self.opt_link(name)];
        if let Ok(entries) = fs::read_dir(&self.bin_dir) {
            candidates.extend(entries.filter_map(Result::ok).map(|e| e.path()));
        }

        let mut removed = Vec::new();
        for link in candidates {
            if let Some(target) = read_link(&link)?
                && target.starts_with(keg)
            {
                fs::remove_file(&link).map_err(|e| {
                    Error::store(format!("failed to unlink {}: {e}", link.display()))
                })?;
                removed.push(link);
            }
        }
        Ok(removed)
    }

    pub fn is_linked(&self, name: &str, keg: &Path) -> bool {
        matches!(read_link(&self.opt_link(name)), Ok(Some(target)) if target == keg)
    }
}

fn executables(keg: &Path) -> Result<Vec<PathBuf>, Error> {
    let bin = keg.join("bin");
    let Ok(entries) = fs::read_dir(&bin) else {
        return Ok(Vec::new());
    };
    let mut out: Vec<PathBuf> = entries
        .map(|e| e.map(|e| e.path()))
        .collect::<Result<_, _>>()
        .map_err(|e| Error::store(format!("failed to list {}: {e}", bin.display())))?;
    out.sort();
    Ok(out)
}

fn read_link(path: &Path) -> Result<Option<PathBuf>, Error> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => fs::read_link(path)
            .map(Some)
            .map_err(|e| Error::store(format!("failed to read {}: {e}", path.display()))),
        _ => Ok(None),
    }
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> Result<(), Error> {
    symlink(target, link)
        .map_err(|e| Error::store(format!("failed to link {}: {e}", link.display())))
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, link: &Path) -> Result<(), Error> {
    Err(Error::store(format!(
        "symlinks are not supported on this platform: {}",
        link.display()
    )))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn keg(tmp: &TempDir, name: &str, version: &str) -> PathBuf {
        let keg = tmp.path().join("Cellar").join(name).join(version);
        fs::create_dir_all(keg.join("bin")).unwrap();
        fs::write(keg.join("bin").join(name), b"bin").unwrap();
        keg
    }

    #[test]
    fn links_opt_and_bin() {
        let tmp = TempDir::new().unwrap();
        let linker = Linker::new(tmp.path()).unwrap();
        let keg = keg(&tmp, "jq", "1.7.1");

        let created = linker.link_keg("jq", &keg, false).unwrap();

        assert_eq!(created.len(), 2);
        assert!(linker.is_linked("jq", &keg));
        assert_eq!(
            fs::read_link(linker.bin_dir().join("jq")).unwrap(),
            keg.join("bin/jq")
        );
    }

    #[test]
    fn keg_only_gets_opt_link_only() {
        let tmp = TempDir::new().unwrap();
        let linker = Linker::new(tmp.path()).unwrap();
        let keg = keg(&tmp, "openssl", "3.3.0");

        linker.link_keg("openssl", &keg, true).unwrap();

        assert!(linker.is_linked("openssl", &keg));
        assert!(!linker.bin_dir().join("openssl").exists());
    }

    #[test]
    fn relinking_replaces_older_version() {
        let tmp = TempDir::new().unwrap();
        let linker = Linker::new(tmp.path()).unwrap();
        let old = keg(&tmp, "jq", "1.7.0");
        let new = keg(&tmp, "jq", "1.7.1");

        linker.link_keg("jq", &old, false).unwrap();
        linker.link_keg("jq", &new, false).unwrap();

        assert!(linker.is_linked("jq", &new));
        assert_eq!(
            fs::read_link(linker.bin_dir().join("jq")).unwrap(),
            new.join("bin/jq")
        );
    }

    #[test]
    fn foreign_file_is_a_conflict() {
        let tmp = TempDir::new().unwrap();
        let linker = Linker::new(tmp.path()).unwrap();
        let keg = keg(&tmp, "jq", "1.7.1");
        fs::write(linker.bin_dir().join("jq"), b"someone else").unwrap();

        let err = linker.link_keg("jq", &keg, false).unwrap_err();
        assert_eq!(
            err,
            Error::LinkConflict {
                path: linker.bin_dir().join("jq")
            }
        );
        assert!(!linker.is_linked("jq", &keg), "nothing linked on conflict");
    }

    #[test]
    fn unlink_only_touches_own_links() {
        let tmp = TempDir::new().unwrap();
        let linker = Linker::new(tmp.path()).unwrap();
        let jq = keg(&tmp, "jq", "1.7.1");
        let yq = keg(&tmp, "yq", "4.0");
        linker.link_keg("jq", &jq, false).unwrap();
        linker.link_keg("yq", &yq, false).unwrap();

        let removed = linker.unlink_keg("jq", &jq).unwrap();

        assert_eq!(removed.len(), 2);
        assert!(!linker.is_linked("jq", &jq));
        assert!(linker.is_linked("yq", &yq));
        assert!(fs::symlink_metadata(linker.bin_dir().join("yq")).is_ok());
    }
}

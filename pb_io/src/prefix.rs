//! Everything that lives on disk for one installation.
//!
//! ```text
//! <root>/cache/        downloaded artifacts (BlobCache)
//! <root>/store/        unpacked bottles by sha256 (Store)
//! <root>/db/pb.sqlite3 install records
//! <prefix>/Cellar/     kegs
//! <prefix>/bin, opt/   links
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use pb_core::Error;

use crate::blob::BlobCache;
use crate::cellar::Cellar;
use crate::db::Database;
use crate::link::Linker;
use crate::store::Store;

pub struct Prefix {
    pub blob_cache: BlobCache,
    pub store: Store,
    pub cellar: Cellar,
    pub linker: Linker,
    db: Mutex<Database>,
    root: PathBuf,
    prefix: PathBuf,
}

fn setup_err(what: &str) -> impl Fn(io::Error) -> Error + '_ {
    move |e| Error::store(format!("failed to create {what}: {e}"))
}

impl Prefix {
    pub fn open(root: &Path, prefix: &Path) -> Result<Self, Error> {
        if !root.exists() {
            fs::create_dir_all(root).map_err(|e| {
                if e.kind() == io::ErrorKind::PermissionDenied {
                    Error::store(format!(
                        "cannot create root directory '{}': permission denied.\n\n\
                        Create it with:\n  sudo mkdir -p {0} && sudo chown $USER {0}",
                        root.display()
                    ))
                } else {
                    Error::store(format!(
                        "failed to create root directory '{}': {e}",
                        root.display()
                    ))
                }
            })?;
        }

        fs::create_dir_all(root.join("db")).map_err(setup_err("db directory"))?;

        let blob_cache = BlobCache::new(&root.join("cache")).map_err(setup_err("blob cache"))?;
        let store = Store::new(root).map_err(setup_err("store"))?;
        let cellar = Cellar::new(&prefix.join("Cellar")).map_err(setup_err("cellar"))?;
        let linker = Linker::new(prefix).map_err(setup_err("link directories"))?;
        let db = Database::open(&root.join("db/pb.sqlite3"))?;

        Ok(Self {
            blob_cache,
            store,
            cellar,
            linker,
            db: Mutex::new(db),
            root: root.to_path_buf(),
            prefix: prefix.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// Run `f` with exclusive access to the install database.
    ///
    /// The lock is synchronous; never call this across an `.await`.
    pub fn with_db<R>(&self, f: impl FnOnce(&mut Database) -> Result<R, Error>) -> Result<R, Error> {
        let mut db = self
            .db
            .lock()
            .map_err(|_| Error::store("install database lock poisoned"))?;
        f(&mut db)
    }

    /// Version recorded for `name`, if it is installed.
    pub fn installed_version(&self, name: &str) -> Result<Option<String>, Error> {
        self.with_db(|db| Ok(db.get_installed(name)?.map(|keg| keg.version)))
    }
}

//! Per-formula cleanup run right after a formula is installed or upgraded.

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use pb_core::{Error, Formula, Version};

use crate::cellar::InstallReceipt;
use crate::prefix::Prefix;
use crate::progress::{InstallProgress, Reporter};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub name: String,
    /// Versions removed, or that would be removed in a dry run.
    pub removed_kegs: Vec<String>,
    pub bytes_freed: u64,
    pub dry_run: bool,
}

impl CleanupReport {
    pub fn empty(name: &str, dry_run: bool) -> Self {
        Self {
            name: name.to_string(),
            dry_run,
            ..Self::default()
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Cleanup: Send + Sync {
    /// Remove on-disk state for `formula` left stale by the install that just
    /// finished. A dry run reports the same set without touching anything;
    /// `verbose` adds a detail event per keg.
    async fn clean_after_install(
        &self,
        formula: &Formula,
        dry_run: bool,
        verbose: bool,
    ) -> Result<CleanupReport, Error>;
}

/// Removes older kegs of one formula plus the store entries and cached blobs
/// nothing else references.
pub struct KegCleaner {
    prefix: Arc<Prefix>,
    reporter: Reporter,
    skip: bool,
}

impl KegCleaner {
    pub fn new(prefix: Arc<Prefix>, reporter: Reporter) -> Self {
        Self {
            prefix,
            reporter,
            skip: false,
        }
    }

    /// Turn every call into a no-op (`POURBREW_NO_INSTALL_CLEANUP`).
    pub fn skip(mut self, skip: bool) -> Self {
        self.skip = skip;
        self
    }

    /// Kegs strictly older than `survivor`, oldest first.
    fn stale_kegs(&self, name: &str, survivor: &str) -> Vec<String> {
        let survivor = Version::parse(survivor);
        self.prefix
            .cellar
            .installed_versions(name)
            .into_iter()
            .filter(|v| Version::parse(v) < survivor)
            .collect()
    }

    fn remove_keg(
        &self,
        name: &str,
        version: &str,
        keep: Option<&InstallReceipt>,
    ) -> Result<u64, Error> {
        let prefix = &self.prefix;
        let keg = prefix.cellar.keg_path(name, version);
        let receipt = prefix.cellar.read_receipt(name, version);

        let unlinked = prefix.linker.unlink_keg(name, &keg)?;
        if !unlinked.is_empty() {
            debug!(name, version, links = unlinked.len(), "unlinked stale keg");
        }

        let mut freed = prefix.cellar.remove_keg(name, version)?;

        let Some(receipt) = receipt else {
            return Ok(freed);
        };

        let referenced = prefix.with_db(|db| db.is_store_key_referenced(&receipt.store_key))?;
        if !referenced {
            freed += prefix.store.remove_entry(&receipt.store_key)?;
            freed += remove_blob(prefix, &receipt.store_key)?;
        }

        for (_, sha) in &receipt.resources {
            let still_used = keep.is_some_and(|k| k.resources.iter().any(|(_, s)| s == sha));
            if !still_used {
                freed += remove_blob(prefix, sha)?;
            }
        }

        Ok(freed)
    }
}

fn remove_blob(prefix: &Prefix, sha256: &str) -> Result<u64, Error> {
    prefix
        .blob_cache
        .remove_blob(sha256)
        .map_err(|e| Error::store(format!("failed to remove cached blob {sha256}: {e}")))
}

#[async_trait]
impl Cleanup for KegCleaner {
    async fn clean_after_install(
        &self,
        formula: &Formula,
        dry_run: bool,
        verbose: bool,
    ) -> Result<CleanupReport, Error> {
        let name = formula.name.as_str();
        let mut report = CleanupReport::empty(name, dry_run);
        if self.skip {
            debug!(name, "install cleanup disabled");
            return Ok(report);
        }

        // A dry run never recorded the new version, so the target survives
        let target = formula.effective_version();
        let survivor = if dry_run {
            target
        } else {
            self.prefix.installed_version(name)?.unwrap_or(target)
        };

        let stale = self.stale_kegs(name, &survivor);
        if stale.is_empty() {
            return Ok(report);
        }

        let keep = self.prefix.cellar.read_receipt(name, &survivor);
        for version in stale {
            let keg = self.prefix.cellar.keg_path(name, &version);
            if !dry_run {
                report.bytes_freed += self.remove_keg(name, &version, keep.as_ref())?;
            }
            if verbose {
                let verb = if dry_run { "would remove" } else { "removed" };
                self.reporter.report(InstallProgress::Detail {
                    name: name.to_string(),
                    message: format!("{verb} {}", keg.display()),
                });
            }
            report.removed_kegs.push(version);
        }

        info!(
            name,
            removed = ?report.removed_kegs,
            bytes_freed = report.bytes_freed,
            dry_run,
            "cleaned up old kegs"
        );
        self.reporter.report(InstallProgress::CleanupCompleted {
            name: name.to_string(),
            removed: report.removed_kegs.clone(),
            bytes_freed: report.bytes_freed,
            dry_run,
        });

        Ok(report)
    }
}

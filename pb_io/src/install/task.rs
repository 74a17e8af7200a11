//! Install tasks: one formula moving through prepare, enqueue and apply.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use pb_core::{Error, Formula, Lifecycle, SelectedBottle, TaskState, Version, select_bottle};

use crate::cellar::InstallReceipt;
use crate::download::{Artifact, ArtifactKind, DownloadRequest, PendingDownload, QueueHandle};
use crate::prefix::Prefix;
use crate::progress::{InstallProgress, Reporter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Installed {
        name: String,
        version: String,
    },
    Upgraded {
        name: String,
        from: String,
        to: String,
    },
    WouldUpgrade {
        name: String,
        from: String,
        to: String,
    },
    Skipped {
        name: String,
        reason: String,
    },
}

impl ApplyOutcome {
    pub fn name(&self) -> &str {
        match self {
            ApplyOutcome::Installed { name, .. }
            | ApplyOutcome::Upgraded { name, .. }
            | ApplyOutcome::WouldUpgrade { name, .. }
            | ApplyOutcome::Skipped { name, .. } => name,
        }
    }

    /// Whether the prefix changed.
    pub fn is_change(&self) -> bool {
        matches!(
            self,
            ApplyOutcome::Installed { .. } | ApplyOutcome::Upgraded { .. }
        )
    }
}

/// How the consumer will apply a task once it is yielded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    Install { allow_upgrade: bool },
    Upgrade { dry_run: bool, verbose: bool },
}

impl ApplyMode {
    pub fn dry_run(self) -> bool {
        matches!(self, ApplyMode::Upgrade { dry_run: true, .. })
    }

    pub fn verbose(self) -> bool {
        matches!(self, ApplyMode::Upgrade { verbose: true, .. })
    }
}

/// A unit of work driven by the fetch coordinator.
///
/// The coordinator calls `assign_queue`, `prelude_fetch`, `prelude` and
/// `fetch` in that order, then hands the task to its consumer, which calls
/// exactly one of `install` or `upgrade` and, if cleanup succeeds,
/// `mark_cleaned`.
#[async_trait]
pub trait InstallTask: Send {
    fn formula(&self) -> &Formula;

    fn state(&self) -> TaskState;

    /// Announce how the task will be applied, before it is fetched. Tasks
    /// may use it to skip downloads whose result would never be used.
    fn set_apply_mode(&mut self, _mode: ApplyMode) {}

    /// Attach the batch's download queue. Fails while the task still holds
    /// a handle to a queue that is open.
    fn assign_queue(&mut self, queue: QueueHandle) -> Result<(), Error>;

    /// Decide which artifacts are needed.
    async fn prelude_fetch(&mut self) -> Result<(), Error>;

    /// Pre-flight checks.
    async fn prelude(&mut self) -> Result<(), Error>;

    /// Enqueue artifact retrieval. Returns once the queue has accepted the
    /// work, without waiting for it to finish.
    async fn fetch(&mut self) -> Result<(), Error>;

    async fn install(&mut self, allow_upgrade: bool) -> Result<ApplyOutcome, Error>;

    async fn upgrade(&mut self, dry_run: bool, verbose: bool) -> Result<ApplyOutcome, Error>;

    fn mark_cleaned(&mut self) -> Result<(), Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Disposition {
    Fresh,
    Replace(String),
    Current,
}

/// Installs one formula from its bottle.
pub struct BottleTask {
    formula: Formula,
    explicit: bool,
    prefix: Arc<Prefix>,
    reporter: Reporter,
    queue: Option<QueueHandle>,
    bottle: Option<SelectedBottle>,
    requests: Vec<DownloadRequest>,
    disposition: Disposition,
    pending: Vec<PendingDownload>,
    mode: Option<ApplyMode>,
    lifecycle: Lifecycle,
}

impl BottleTask {
    pub fn new(formula: Formula, explicit: bool, prefix: Arc<Prefix>, reporter: Reporter) -> Self {
        Self {
            formula,
            explicit,
            prefix,
            reporter,
            queue: None,
            bottle: None,
            requests: Vec::new(),
            disposition: Disposition::Fresh,
            pending: Vec::new(),
            mode: None,
            lifecycle: Lifecycle::new(),
        }
    }

    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    fn name(&self) -> &str {
        &self.formula.name
    }

    /// Whether applying in the announced mode can change the prefix. With
    /// no mode announced, assume it can.
    fn needs_artifacts(&self) -> bool {
        match (&self.disposition, self.mode) {
            (Disposition::Current, _) => false,
            (_, None) => true,
            (Disposition::Fresh, Some(ApplyMode::Install { .. })) => true,
            (Disposition::Fresh, Some(ApplyMode::Upgrade { .. })) => false,
            (Disposition::Replace(_), Some(ApplyMode::Install { allow_upgrade })) => allow_upgrade,
            (Disposition::Replace(_), Some(ApplyMode::Upgrade { dry_run, .. })) => !dry_run,
        }
    }

    fn preflight_failed(&self, reason: impl Into<String>) -> Error {
        Error::PreflightFailed {
            name: self.formula.name.clone(),
            reason: reason.into(),
        }
    }

    fn skip(&mut self, reason: String) -> Result<ApplyOutcome, Error> {
        self.reporter.report(InstallProgress::Skipped {
            name: self.formula.name.clone(),
            reason: reason.clone(),
        });
        self.lifecycle
            .advance(&self.formula.name, TaskState::Enqueued, TaskState::Applied)?;
        Ok(ApplyOutcome::Skipped {
            name: self.formula.name.clone(),
            reason,
        })
    }

    /// Wait for every artifact, then put the new keg in place and record it.
    async fn apply(&mut self, replacing: Option<&str>, verbose: bool) -> Result<String, Error> {
        let name = self.formula.name.clone();
        let version = self.formula.effective_version();

        self.reporter.report(InstallProgress::InstallStarted {
            name: name.clone(),
            version: version.clone(),
        });

        let mut artifacts = Vec::with_capacity(self.pending.len());
        for pending in self.pending.drain(..) {
            artifacts.push(pending.wait().await?);
        }

        let (bottles, resources): (Vec<Artifact>, Vec<Artifact>) = artifacts
            .into_iter()
            .partition(|a| a.request.kind == ArtifactKind::Bottle);
        let bottle = bottles
            .into_iter()
            .next()
            .ok_or_else(|| Error::store(format!("no bottle was downloaded for {name}")))?;

        let prefix = &self.prefix;
        let store_key = bottle.request.sha256.clone();
        let entry = match bottle.poured {
            Some(entry) => entry,
            None => prefix.store.ensure_entry(&store_key, &bottle.blob_path)?,
        };

        let keg = prefix.cellar.materialize(&name, &version, &version, &entry)?;

        let mut staged = Vec::with_capacity(resources.len());
        for resource in resources {
            let path = prefix
                .cellar
                .stage_resource(&keg, &resource.request.artifact, &resource.blob_path)?;
            if verbose {
                self.reporter.report(InstallProgress::Detail {
                    name: name.clone(),
                    message: format!("staged {}", path.display()),
                });
            }
            staged.push((resource.request.artifact, resource.request.sha256));
        }

        if let Some(old) = replacing {
            let old_keg = prefix.cellar.keg_path(&name, old);
            let removed = prefix.linker.unlink_keg(&name, &old_keg)?;
            debug!(name = %name, from = old, links = removed.len(), "unlinked previous keg");
        }

        let linked = prefix.linker.link_keg(&name, &keg, self.formula.keg_only)?;
        if verbose {
            for link in &linked {
                self.reporter.report(InstallProgress::Detail {
                    name: name.clone(),
                    message: format!("linked {}", link.display()),
                });
            }
        }

        prefix.cellar.write_receipt(
            &keg,
            &InstallReceipt {
                name: name.clone(),
                version: version.clone(),
                store_key: store_key.clone(),
                resources: staged,
                installed_at: Utc::now(),
                explicit: self.explicit,
            },
        )?;

        prefix.with_db(|db| {
            let tx = db.transaction()?;
            tx.record_install(&name, &version, &store_key, self.explicit)?;
            tx.commit()
        })?;

        info!(name = %name, version = %version, keg = %keg.display(), "installed");
        Ok(version)
    }
}

#[async_trait]
impl InstallTask for BottleTask {
    fn formula(&self) -> &Formula {
        &self.formula
    }

    fn state(&self) -> TaskState {
        self.lifecycle.state()
    }

    fn set_apply_mode(&mut self, mode: ApplyMode) {
        self.mode = Some(mode);
    }

    fn assign_queue(&mut self, queue: QueueHandle) -> Result<(), Error> {
        if self.queue.as_ref().is_some_and(|q| !q.is_closed()) {
            return Err(Error::QueueAlreadyAssigned {
                name: self.formula.name.clone(),
            });
        }
        self.queue = Some(queue);
        Ok(())
    }

    async fn prelude_fetch(&mut self) -> Result<(), Error> {
        self.lifecycle.require(self.name(), TaskState::Unassigned)?;
        if self.queue.is_none() {
            return Err(Error::QueueClosed {
                name: self.formula.name.clone(),
            });
        }

        let bottle = select_bottle(&self.formula)?;
        let name = &self.formula.name;

        let mut requests = vec![DownloadRequest {
            formula: name.clone(),
            artifact: name.clone(),
            url: bottle.url.clone(),
            sha256: bottle.sha256.clone(),
            kind: ArtifactKind::Bottle,
        }];
        requests.extend(self.formula.resources.iter().map(|r| DownloadRequest {
            formula: name.clone(),
            artifact: r.name.clone(),
            url: r.url.clone(),
            sha256: r.sha256.clone(),
            kind: ArtifactKind::Resource,
        }));

        debug!(name = %name, tag = %bottle.tag, artifacts = requests.len(), "resolved artifacts");
        self.bottle = Some(bottle);
        self.requests = requests;
        Ok(())
    }

    async fn prelude(&mut self) -> Result<(), Error> {
        self.lifecycle.require(self.name(), TaskState::Unassigned)?;
        if self.bottle.is_none() {
            return Err(self.preflight_failed("artifacts were not resolved"));
        }

        for other in &self.formula.conflicts_with {
            if self.prefix.installed_version(other)?.is_some() {
                return Err(self.preflight_failed(format!(
                    "conflicts with installed formula '{other}'\n  hint: uninstall '{other}' first"
                )));
            }
        }

        self.prefix
            .cellar
            .probe_writable()
            .map_err(|e| self.preflight_failed(e.to_string()))?;

        let target = self.formula.effective_version();
        self.disposition = match self.prefix.installed_version(self.name())? {
            None => Disposition::Fresh,
            Some(installed) if Version::parse(&installed) < Version::parse(&target) => {
                Disposition::Replace(installed)
            }
            Some(_) => Disposition::Current,
        };

        self.lifecycle
            .advance(&self.formula.name, TaskState::Unassigned, TaskState::Prepared)
    }

    async fn fetch(&mut self) -> Result<(), Error> {
        self.lifecycle.require(self.name(), TaskState::Prepared)?;

        if self.needs_artifacts() {
            let queue = self.queue.as_ref().ok_or_else(|| Error::QueueClosed {
                name: self.formula.name.clone(),
            })?;
            for request in &self.requests {
                self.pending.push(queue.enqueue(request.clone()).await?);
            }
        }

        self.lifecycle
            .advance(&self.formula.name, TaskState::Prepared, TaskState::Enqueued)
    }

    async fn install(&mut self, allow_upgrade: bool) -> Result<ApplyOutcome, Error> {
        self.lifecycle.require(self.name(), TaskState::Enqueued)?;
        let target = self.formula.effective_version();

        let outcome = match self.disposition.clone() {
            Disposition::Current => {
                return self.skip(format!("{target} is already installed"));
            }
            Disposition::Replace(installed) if !allow_upgrade => {
                return self.skip(format!(
                    "{installed} is installed and upgrades are disabled\n  hint: run 'pb upgrade {}'",
                    self.formula.name
                ));
            }
            Disposition::Replace(installed) => {
                let to = self.apply(Some(&installed), false).await?;
                ApplyOutcome::Upgraded {
                    name: self.formula.name.clone(),
                    from: installed,
                    to,
                }
            }
            Disposition::Fresh => {
                let version = self.apply(None, false).await?;
                ApplyOutcome::Installed {
                    name: self.formula.name.clone(),
                    version,
                }
            }
        };

        self.report_applied(&outcome);
        self.lifecycle
            .advance(&self.formula.name, TaskState::Enqueued, TaskState::Applied)?;
        Ok(outcome)
    }

    async fn upgrade(&mut self, dry_run: bool, verbose: bool) -> Result<ApplyOutcome, Error> {
        self.lifecycle.require(self.name(), TaskState::Enqueued)?;
        let target = self.formula.effective_version();

        let outcome = match self.disposition.clone() {
            Disposition::Fresh => {
                return Err(Error::NotInstalled {
                    name: self.formula.name.clone(),
                });
            }
            Disposition::Current => {
                return self.skip(format!("{target} is already up to date"));
            }
            Disposition::Replace(installed) if dry_run => {
                self.reporter.report(InstallProgress::WouldUpgrade {
                    name: self.formula.name.clone(),
                    from: installed.clone(),
                    to: target.clone(),
                });
                ApplyOutcome::WouldUpgrade {
                    name: self.formula.name.clone(),
                    from: installed,
                    to: target,
                }
            }
            Disposition::Replace(installed) => {
                let to = self.apply(Some(&installed), verbose).await?;
                let outcome = ApplyOutcome::Upgraded {
                    name: self.formula.name.clone(),
                    from: installed,
                    to,
                };
                self.report_applied(&outcome);
                outcome
            }
        };

        self.lifecycle
            .advance(&self.formula.name, TaskState::Enqueued, TaskState::Applied)?;
        Ok(outcome)
    }

    fn mark_cleaned(&mut self) -> Result<(), Error> {
        self.lifecycle
            .advance(&self.formula.name, TaskState::Applied, TaskState::Cleaned)
    }
}

impl BottleTask {
    fn report_applied(&self, outcome: &ApplyOutcome) {
        let event = match outcome {
            ApplyOutcome::Installed { name, version } => InstallProgress::InstallCompleted {
                name: name.clone(),
                version: version.clone(),
            },
            ApplyOutcome::Upgraded { name, from, to } => InstallProgress::UpgradeCompleted {
                name: name.clone(),
                from: from.clone(),
                to: to.clone(),
            },
            _ => return,
        };
        self.reporter.report(event);
    }
}

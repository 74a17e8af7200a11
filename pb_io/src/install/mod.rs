//! Installer module for pourbrew
//!
//! This module drives batches of install tasks. It is organized into
//! focused submodules:
//!
//! - `task` - The install task contract and the bottle-backed task
//! - `fetch` - The fetch coordinator over a shared download queue
//! - `planner` - Turning formula names into ordered task batches
//!
//! [`Installer`] layers the install and upgrade coordinators on top of
//! [`Fetcher`]: each yielded task is applied and then cleaned before the
//! next one is yielded, while downloads for later tasks continue in the
//! background.

mod fetch;
mod planner;
mod task;

use std::sync::Arc;

use tracing::warn;

use pb_core::{Error, InstallConfig};

use crate::cleanup::{Cleanup, CleanupReport, KegCleaner};
use crate::download::{HttpRetriever, QueueStats, Retriever};
use crate::prefix::Prefix;
use crate::progress::Reporter;
use crate::traits::HttpClient;

// Re-export public types
pub use fetch::Fetcher;
pub use planner::Planner;
pub use task::{ApplyMode, ApplyOutcome, BottleTask, InstallTask};

/// Result of an install or upgrade batch
#[derive(Debug, Default)]
pub struct BatchReport {
    /// One outcome per task, in batch order
    pub outcomes: Vec<ApplyOutcome>,
    /// Cleanups that succeeded
    pub cleanups: Vec<CleanupReport>,
    /// Formulae whose cleanup failed after a successful apply
    pub cleanup_failures: Vec<(String, Error)>,
    pub queue: QueueStats,
}

pub struct Installer {
    config: InstallConfig,
    fetcher: Fetcher,
    cleaner: Arc<dyn Cleanup>,
}

impl Installer {
    pub fn new(
        config: InstallConfig,
        retriever: Arc<dyn Retriever>,
        cleaner: Arc<dyn Cleanup>,
        reporter: Reporter,
    ) -> Self {
        let fetcher = Fetcher::new(retriever, config.download_concurrency, reporter);
        Self {
            config,
            fetcher,
            cleaner,
        }
    }

    /// An installer that downloads over `http` into `prefix` and cleans
    /// old kegs after each install.
    pub fn for_prefix(
        config: InstallConfig,
        prefix: Arc<Prefix>,
        http: Arc<dyn HttpClient>,
        reporter: Reporter,
    ) -> Self {
        let retriever = HttpRetriever::new(http, prefix.clone(), reporter.clone());
        let cleaner = KegCleaner::new(prefix, reporter.clone()).skip(config.no_install_cleanup);
        Self::new(config, Arc::new(retriever), Arc::new(cleaner), reporter)
    }

    /// Install every task, cleaning up after each one before the next is
    /// yielded.
    pub async fn install_all<T: InstallTask>(&self, tasks: &mut [T]) -> Result<BatchReport, Error> {
        let allow_upgrade = !self.config.no_install_upgrade;
        self.run(tasks, ApplyMode::Install { allow_upgrade }).await
    }

    /// Upgrade every task. `dry_run` and `verbose` reach both the upgrade
    /// and the cleanup of each task.
    pub async fn upgrade_all<T: InstallTask>(
        &self,
        tasks: &mut [T],
        dry_run: bool,
        verbose: bool,
    ) -> Result<BatchReport, Error> {
        self.run(tasks, ApplyMode::Upgrade { dry_run, verbose }).await
    }

    async fn run<T: InstallTask>(
        &self,
        tasks: &mut [T],
        mode: ApplyMode,
    ) -> Result<BatchReport, Error> {
        let mut report = BatchReport::default();
        for task in tasks.iter_mut() {
            task.set_apply_mode(mode);
        }

        let queue = self
            .fetcher
            .fetch(tasks, async |task: &mut T| -> Result<(), Error> {
                let outcome = match mode {
                    ApplyMode::Install { allow_upgrade } => task.install(allow_upgrade).await?,
                    ApplyMode::Upgrade { dry_run, verbose } => {
                        task.upgrade(dry_run, verbose).await?
                    }
                };
                report.outcomes.push(outcome);

                let name = task.formula().name.clone();
                match self
                    .cleaner
                    .clean_after_install(task.formula(), mode.dry_run(), mode.verbose())
                    .await
                {
                    Ok(cleanup) => {
                        task.mark_cleaned()?;
                        report.cleanups.push(cleanup);
                    }
                    Err(e) => {
                        warn!(name = %name, error = %e, "cleanup failed; continuing");
                        report.cleanup_failures.push((name, e));
                    }
                }
                Ok(())
            })
            .await?;

        report.queue = queue;
        Ok(report)
    }
}

//! Install planning
//!
//! This module handles:
//! - Fetching a formula closure from the API
//! - Ordering it dependencies-first
//! - Finding outdated installs and building upgrade batches

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::{info, warn};

use pb_core::{Error, Formula, OutdatedPackage, Version, resolve_batch, select_bottle};

use crate::api::ApiClient;
use crate::db::InstalledKeg;
use crate::prefix::Prefix;
use crate::progress::Reporter;

use super::BottleTask;

pub struct Planner {
    api: ApiClient,
    prefix: Arc<Prefix>,
    reporter: Reporter,
}

impl Planner {
    pub fn new(api: ApiClient, prefix: Arc<Prefix>, reporter: Reporter) -> Self {
        Self {
            api,
            prefix,
            reporter,
        }
    }

    /// Tasks for `names` and their dependencies, dependencies first.
    ///
    /// Dependencies that are already installed and current are left out;
    /// the requested formulae are always included.
    pub async fn plan_install(&self, names: &[String]) -> Result<Vec<BottleTask>, Error> {
        let formulas = self.fetch_closure(names).await?;
        let ordered = resolve_batch(names, &formulas)?;

        let mut tasks = Vec::with_capacity(ordered.len());
        for name in ordered {
            let Some(formula) = formulas.get(&name).cloned() else {
                continue;
            };
            let explicit = names.contains(&name);

            if !explicit {
                if self.is_current(&formula)? {
                    continue;
                }
                if let Err(Error::UnsupportedBottle { .. }) = select_bottle(&formula) {
                    warn!(name = %name, "skipping dependency with no bottle for this platform");
                    continue;
                }
            }

            tasks.push(self.task(formula, explicit));
        }

        Ok(tasks)
    }

    /// Installed formulae with a newer version available, sorted by name.
    /// An empty `names` checks everything installed.
    pub async fn outdated(&self, names: &[String]) -> Result<Vec<OutdatedPackage>, Error> {
        Ok(self
            .outdated_formulas(names)
            .await?
            .into_iter()
            .map(|(package, _, _)| package)
            .collect())
    }

    /// Upgrade tasks for every outdated formula in `names` (everything when
    /// empty), dependencies first.
    pub async fn plan_upgrade(&self, names: &[String]) -> Result<Vec<BottleTask>, Error> {
        let outdated = self.outdated_formulas(names).await?;

        let roots: Vec<String> = outdated.iter().map(|(p, _, _)| p.name.clone()).collect();
        let mut explicit = HashSet::new();
        let mut formulas = BTreeMap::new();
        for (package, formula, keg) in outdated {
            if keg.explicit {
                explicit.insert(package.name.clone());
            }
            formulas.insert(package.name, formula);
        }

        let ordered = resolve_batch(&roots, &formulas)?;
        Ok(ordered
            .into_iter()
            .filter_map(|name| {
                let formula = formulas.remove(&name)?;
                Some(self.task(formula, explicit.contains(&name)))
            })
            .collect())
    }

    fn task(&self, formula: Formula, explicit: bool) -> BottleTask {
        BottleTask::new(formula, explicit, self.prefix.clone(), self.reporter.clone())
    }

    fn is_current(&self, formula: &Formula) -> Result<bool, Error> {
        let Some(installed) = self.prefix.installed_version(&formula.name)? else {
            return Ok(false);
        };
        Ok(!Version::parse(&installed).is_older_than(&Version::parse(&formula.effective_version())))
    }

    async fn outdated_formulas(
        &self,
        names: &[String],
    ) -> Result<Vec<(OutdatedPackage, Formula, InstalledKeg)>, Error> {
        let installed = self.prefix.with_db(|db| db.list_installed())?;

        let to_check: Vec<InstalledKeg> = if names.is_empty() {
            installed
        } else {
            let mut by_name: BTreeMap<String, InstalledKeg> = installed
                .into_iter()
                .map(|keg| (keg.name.clone(), keg))
                .collect();
            names
                .iter()
                .map(|name| {
                    by_name
                        .remove(name)
                        .ok_or_else(|| Error::NotInstalled { name: name.clone() })
                })
                .collect::<Result<_, _>>()?
        };

        // Fetch all formulas from API in parallel
        let futures: Vec<_> = to_check
            .iter()
            .map(|keg| self.api.get_formula(&keg.name))
            .collect();
        let results = futures::future::join_all(futures).await;

        let mut outdated = Vec::new();
        for (keg, result) in to_check.into_iter().zip(results) {
            match result {
                Ok(formula) => {
                    let available = formula.effective_version();
                    if Version::parse(&keg.version).is_older_than(&Version::parse(&available)) {
                        outdated.push((
                            OutdatedPackage {
                                name: keg.name.clone(),
                                installed_version: keg.version.clone(),
                                available_version: available,
                            },
                            formula,
                            keg,
                        ));
                    }
                }
                Err(Error::MissingFormula { .. }) => {
                    info!(name = %keg.name, "installed formula no longer exists upstream");
                }
                Err(e) => {
                    warn!(name = %keg.name, error = %e, "failed to check for updates");
                }
            }
        }

        outdated.sort_by(|a, b| a.0.name.cmp(&b.0.name));
        Ok(outdated)
    }

    /// Fetch `roots` and all their dependencies in parallel batches.
    async fn fetch_closure(&self, roots: &[String]) -> Result<BTreeMap<String, Formula>, Error> {
        let mut formulas = BTreeMap::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut to_fetch: Vec<String> = roots.to_vec();

        while !to_fetch.is_empty() {
            let batch: Vec<String> = to_fetch
                .drain(..)
                .filter(|n| seen.insert(n.clone()))
                .collect();
            if batch.is_empty() {
                break;
            }

            let futures: Vec<_> = batch.iter().map(|n| self.api.get_formula(n)).collect();
            let results = futures::future::join_all(futures).await;

            for (name, result) in batch.into_iter().zip(results) {
                match result {
                    Ok(formula) => {
                        for dep in &formula.dependencies {
                            if !seen.contains(dep) && !to_fetch.contains(dep) {
                                to_fetch.push(dep.clone());
                            }
                        }
                        formulas.insert(name, formula);
                    }
                    Err(Error::MissingFormula { .. }) if !roots.contains(&name) => {
                        warn!(name = %name, "skipping dependency (formula not found)");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(formulas)
    }
}

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Formula {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub versions: Versions,
    /// Formula revision; bumps the installed version to `{stable}_{revision}`.
    #[serde(default)]
    pub revision: u32,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Formulae that cannot be installed alongside this one.
    #[serde(default)]
    pub conflicts_with: Vec<String>,
    #[serde(default)]
    pub keg_only: bool,
    #[serde(default)]
    pub bottle: Bottle,
    /// Auxiliary artifacts downloaded next to the bottle.
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl Formula {
    /// The installed version string: stable version plus revision, if any.
    pub fn pkg_version(&self) -> String {
        if self.revision > 0 {
            format!("{}_{}", self.versions.stable, self.revision)
        } else {
            self.versions.stable.clone()
        }
    }

    /// Returns the effective version including rebuild suffix if applicable.
    /// Bottles with rebuild > 0 lay their files out under `{version}_{rebuild}`.
    pub fn effective_version(&self) -> String {
        let rebuild = self.bottle.stable.rebuild;
        if rebuild > 0 {
            format!("{}_{}", self.versions.stable, rebuild)
        } else {
            self.pkg_version()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Versions {
    #[serde(default)]
    pub stable: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Bottle {
    #[serde(default)]
    pub stable: BottleStable,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BottleStable {
    #[serde(default)]
    pub files: BTreeMap<String, BottleFile>,
    #[serde(default)]
    pub rebuild: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BottleFile {
    pub url: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    pub url: String,
    pub sha256: String,
}

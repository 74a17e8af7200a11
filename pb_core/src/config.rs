//! Install settings read from the environment.
//!
//! | variable                         | default | meaning                                   |
//! |----------------------------------|---------|-------------------------------------------|
//! | `POURBREW_DOWNLOAD_CONCURRENCY`  | `auto`  | max simultaneous downloads (`auto` = 2 x CPUs) |
//! | `POURBREW_NO_INSTALL_UPGRADE`    | off     | `install` leaves outdated kegs alone      |
//! | `POURBREW_NO_INSTALL_CLEANUP`    | off     | skip removal of old kegs after install    |

use std::num::NonZeroUsize;

use crate::Error;

pub const DOWNLOAD_CONCURRENCY_VAR: &str = "POURBREW_DOWNLOAD_CONCURRENCY";
pub const NO_INSTALL_UPGRADE_VAR: &str = "POURBREW_NO_INSTALL_UPGRADE";
pub const NO_INSTALL_CLEANUP_VAR: &str = "POURBREW_NO_INSTALL_CLEANUP";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallConfig {
    pub download_concurrency: usize,
    pub no_install_upgrade: bool,
    pub no_install_cleanup: bool,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            download_concurrency: auto_concurrency(),
            no_install_upgrade: false,
            no_install_cleanup: false,
        }
    }
}

impl InstallConfig {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut config = Self::default();

        if let Some(raw) = lookup(DOWNLOAD_CONCURRENCY_VAR) {
            config.download_concurrency = parse_concurrency(DOWNLOAD_CONCURRENCY_VAR, &raw)?;
        }
        if let Some(raw) = lookup(NO_INSTALL_UPGRADE_VAR) {
            config.no_install_upgrade = parse_flag(NO_INSTALL_UPGRADE_VAR, &raw)?;
        }
        if let Some(raw) = lookup(NO_INSTALL_CLEANUP_VAR) {
            config.no_install_cleanup = parse_flag(NO_INSTALL_CLEANUP_VAR, &raw)?;
        }

        Ok(config)
    }

    /// Apply a command-line override on top of whatever the environment said.
    pub fn with_download_concurrency(mut self, value: Option<usize>) -> Result<Self, Error> {
        if let Some(n) = value {
            if n == 0 {
                return Err(Error::InvalidConfig {
                    key: "--concurrency".to_string(),
                    value: n.to_string(),
                });
            }
            self.download_concurrency = n;
        }
        Ok(self)
    }
}

fn auto_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(4)
        * 2
}

fn parse_concurrency(key: &str, raw: &str) -> Result<usize, Error> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("auto") {
        return Ok(auto_concurrency());
    }
    match trimmed.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::InvalidConfig {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, Error> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidConfig {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}

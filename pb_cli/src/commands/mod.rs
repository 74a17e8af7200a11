//! Command implementations for the pourbrew CLI.
//!
//! Each submodule handles a specific command or group of related commands.

pub mod install;
pub mod upgrade;

use std::sync::Arc;

use pb_core::InstallConfig;
use pb_io::{ApiClient, Installer, Planner, Prefix, Reporter, ReqwestHttpClient};

/// Everything a command needs to plan and run a batch.
pub struct Context {
    pub prefix: Arc<Prefix>,
    pub api: ApiClient,
    pub config: InstallConfig,
}

impl Context {
    pub fn planner(&self, reporter: Reporter) -> Planner {
        Planner::new(self.api.clone(), self.prefix.clone(), reporter)
    }

    pub fn installer(&self, reporter: Reporter) -> Installer {
        Installer::for_prefix(
            self.config.clone(),
            self.prefix.clone(),
            Arc::new(ReqwestHttpClient::new()),
            reporter,
        )
    }
}

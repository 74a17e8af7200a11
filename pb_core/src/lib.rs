pub mod bottle;
pub mod config;
pub mod errors;
pub mod formula;
pub mod resolve;
pub mod task;
pub mod version;

pub use bottle::{SelectedBottle, platform_tags, select_bottle};
pub use config::InstallConfig;
pub use errors::Error;
pub use formula::{Formula, Resource};
pub use resolve::resolve_batch;
pub use task::{Lifecycle, TaskState};
pub use version::{OutdatedPackage, Version};

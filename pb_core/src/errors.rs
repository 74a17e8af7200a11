use std::path::PathBuf;

use thiserror::Error;

use crate::task::TaskState;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error(
        "no compatible bottle for formula '{name}' on this platform{}\n  hint: this formula cannot be poured here",
        render_available(.available_tags)
    )]
    UnsupportedBottle {
        name: String,
        available_tags: Vec<String>,
    },

    #[error(
        "checksum verification failed for '{name}'\n  expected: {expected}\n  got:      {actual}\n  hint: this may indicate a corrupted download or CDN issue; try again"
    )]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error(
        "cannot link '{}' (already exists and is not owned by this formula)\n  hint: remove the existing file or unlink the formula that owns it",
        .path.display()
    )]
    LinkConflict { path: PathBuf },

    #[error("store corruption detected: {message}\n  hint: remove the affected entry and try again")]
    StoreCorruption { message: String },

    #[error("network error: {message}\n  hint: check your internet connection and try again")]
    NetworkFailure { message: String },

    #[error("formula '{name}' not found\n  hint: check the spelling of the formula name")]
    MissingFormula { name: String },

    #[error(
        "dependency cycle detected: {}\n  hint: this is likely a formula bug; please report it upstream",
        .cycle.join(" -> ")
    )]
    DependencyCycle { cycle: Vec<String> },

    #[error("formula '{name}' is not installed\n  hint: run 'pb install {name}' to install it")]
    NotInstalled { name: String },

    #[error("cannot install '{name}': {reason}")]
    PreflightFailed { name: String, reason: String },

    #[error("download queue is closed; cannot enqueue artifacts for '{name}'")]
    QueueClosed { name: String },

    #[error("'{name}' is still attached to an open download queue")]
    QueueAlreadyAssigned { name: String },

    #[error("'{name}' is {actual}, expected {expected}")]
    InvalidTaskState {
        name: String,
        expected: TaskState,
        actual: TaskState,
    },

    #[error("invalid value '{value}' for {key}\n  hint: unset {key} to use the default")]
    InvalidConfig { key: String, value: String },
}

fn render_available(tags: &[String]) -> String {
    if tags.is_empty() {
        String::new()
    } else {
        format!(" (available for: {})", tags.join(", "))
    }
}

impl Error {
    pub fn store(message: impl Into<String>) -> Self {
        Error::StoreCorruption {
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Error::NetworkFailure {
            message: message.into(),
        }
    }

    /// Network failures are the only errors worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NetworkFailure { .. })
    }
}

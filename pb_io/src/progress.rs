use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallProgress {
    /// Header for a task whose artifacts have just been enqueued.
    Fetching { name: String },
    DownloadStarted { name: String, artifact: String },
    DownloadCompleted {
        name: String,
        artifact: String,
        bytes: u64,
        cached: bool,
    },
    Poured { name: String },
    InstallStarted { name: String, version: String },
    InstallCompleted { name: String, version: String },
    UpgradeCompleted {
        name: String,
        from: String,
        to: String,
    },
    WouldUpgrade {
        name: String,
        from: String,
        to: String,
    },
    Skipped { name: String, reason: String },
    /// Extra lines shown in verbose mode.
    Detail { name: String, message: String },
    CleanupCompleted {
        name: String,
        removed: Vec<String>,
        bytes_freed: u64,
        dry_run: bool,
    },
}

impl InstallProgress {
    pub fn name(&self) -> &str {
        match self {
            InstallProgress::Fetching { name }
            | InstallProgress::DownloadStarted { name, .. }
            | InstallProgress::DownloadCompleted { name, .. }
            | InstallProgress::Poured { name }
            | InstallProgress::InstallStarted { name, .. }
            | InstallProgress::InstallCompleted { name, .. }
            | InstallProgress::UpgradeCompleted { name, .. }
            | InstallProgress::WouldUpgrade { name, .. }
            | InstallProgress::Skipped { name, .. }
            | InstallProgress::Detail { name, .. }
            | InstallProgress::CleanupCompleted { name, .. } => name,
        }
    }
}

pub type ProgressCallback = Box<dyn Fn(InstallProgress) + Send + Sync>;

/// Cheap-to-clone handle that forwards events to an optional callback.
#[derive(Clone, Default)]
pub struct Reporter {
    callback: Option<Arc<ProgressCallback>>,
}

impl Reporter {
    pub fn new(callback: Option<Arc<ProgressCallback>>) -> Self {
        Self { callback }
    }

    pub fn silent() -> Self {
        Self::default()
    }

    pub fn report(&self, event: InstallProgress) {
        tracing::debug!(name = event.name(), event = ?event, "progress");
        if let Some(cb) = &self.callback {
            cb(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn reporter_forwards_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: Arc<ProgressCallback> =
            Arc::new(Box::new(move |event| sink.lock().unwrap().push(event)));

        let reporter = Reporter::new(Some(callback));
        reporter.clone().report(InstallProgress::Fetching {
            name: "jq".to_string(),
        });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].name(), "jq");
    }

    #[test]
    fn silent_reporter_is_a_noop() {
        Reporter::silent().report(InstallProgress::Poured {
            name: "jq".to_string(),
        });
    }
}

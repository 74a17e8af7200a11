pub mod api;
pub mod blob;
pub mod cellar;
pub mod cleanup;
pub mod db;
pub mod download;
pub mod extract;
pub mod install;
pub mod link;
pub mod prefix;
pub mod progress;
pub mod store;
pub mod traits;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use api::ApiClient;
pub use blob::BlobCache;
pub use cellar::{Cellar, InstallReceipt};
pub use cleanup::{Cleanup, CleanupReport, KegCleaner};
pub use db::{Database, InstalledKeg};
pub use download::{
    Artifact, ArtifactKind, DownloadQueue, DownloadRequest, HttpRetriever, PendingDownload,
    QueueHandle, QueueOptions, QueueStats, Retriever,
};
pub use extract::extract_tarball;
pub use install::{
    ApplyMode, ApplyOutcome, BatchReport, BottleTask, Fetcher, InstallTask, Installer, Planner,
};
pub use link::Linker;
pub use prefix::Prefix;
pub use progress::{InstallProgress, ProgressCallback, Reporter};
pub use store::Store;
pub use traits::{HttpClient, HttpResponse, ReqwestHttpClient};

//! The fetch coordinator: prepares tasks one by one over a single shared
//! download queue and yields each to a consumer as soon as its downloads
//! are enqueued.

use std::sync::Arc;

use tracing::debug;

use pb_core::Error;

use crate::download::{DownloadQueue, QueueOptions, QueueStats, Retriever};
use crate::progress::{InstallProgress, Reporter};

use super::InstallTask;

pub struct Fetcher {
    retriever: Arc<dyn Retriever>,
    concurrency: usize,
    reporter: Reporter,
}

impl Fetcher {
    pub fn new(retriever: Arc<dyn Retriever>, concurrency: usize, reporter: Reporter) -> Self {
        Self {
            retriever,
            concurrency,
            reporter,
        }
    }

    /// Prepare each task in order and hand it to `consumer`.
    ///
    /// Task `i` reaches the consumer before task `i + 1` is touched, while
    /// the queue keeps downloading in the background. The first error from
    /// a hook or from the consumer stops the batch. The queue is shut down
    /// exactly once whatever happens, before this returns.
    pub async fn fetch<T, F>(&self, tasks: &mut [T], mut consumer: F) -> Result<QueueStats, Error>
    where
        T: InstallTask,
        F: AsyncFnMut(&mut T) -> Result<(), Error>,
    {
        let queue = DownloadQueue::new(
            QueueOptions {
                concurrency: self.concurrency,
                pour: true,
            },
            self.retriever.clone(),
        );
        let handle = queue.handle();

        let outcome = async {
            for task in tasks.iter_mut() {
                task.assign_queue(handle.clone())?;
                task.prelude_fetch().await?;
                task.prelude().await?;
                task.fetch().await?;

                self.reporter.report(InstallProgress::Fetching {
                    name: task.formula().name.clone(),
                });

                consumer(task).await?;
            }
            Ok::<(), Error>(())
        }
        .await;

        let stats = queue.shutdown().await;
        debug!(?stats, ok = outcome.is_ok(), "fetch batch finished");

        outcome.map(|()| stats)
    }
}

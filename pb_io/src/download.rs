//! The shared download queue.
//!
//! One [`DownloadQueue`] serves a whole batch. Tasks receive non-owning
//! [`QueueHandle`]s and enqueue their artifacts as they are prepared; a
//! dispatcher runs at most `concurrency` retrievals at a time and, in pour
//! mode, unpacks finished bottles into the store before handing them back.
//!
//! Admission goes through a bounded channel, so a producer that outruns the
//! workers waits in [`QueueHandle::enqueue`] instead of piling up work.
//! Only the owner can [`DownloadQueue::shutdown`] the queue, which closes
//! admission and drains everything already admitted.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use sha2::{Digest, Sha256};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, warn};

use pb_core::Error;

use crate::prefix::Prefix;
use crate::progress::{InstallProgress, Reporter};
use crate::traits::HttpClient;

/// Admission slots per concurrent worker.
const ADMISSION_FACTOR: usize = 2;
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub concurrency: usize,
    /// Unpack bottles into the store as part of the download.
    pub pour: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Bottle,
    Resource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub formula: String,
    /// Display name: the formula for its bottle, the resource name otherwise.
    pub artifact: String,
    pub url: String,
    pub sha256: String,
    pub kind: ArtifactKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub request: DownloadRequest,
    pub blob_path: PathBuf,
    /// Store entry, set when the queue poured the bottle.
    pub poured: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueStats {
    fn record(&mut self, finished: Result<bool, JoinError>) {
        match finished {
            Ok(true) => self.completed += 1,
            Ok(false) => self.failed += 1,
            Err(e) => {
                warn!(error = %e, "download worker panicked");
                self.failed += 1;
            }
        }
    }
}

/// Fetches one artifact and, for bottles, unpacks it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(&self, request: &DownloadRequest) -> Result<PathBuf, Error>;

    /// Blocking; the queue runs it off the async workers.
    fn pour(&self, request: &DownloadRequest, blob: &Path) -> Result<PathBuf, Error>;
}

type Reply = oneshot::Sender<Result<Artifact, Error>>;
type Job = (DownloadRequest, Reply);

struct Shared {
    admission: Mutex<Option<mpsc::Sender<Job>>>,
}

impl Shared {
    fn sender(&self) -> Option<mpsc::Sender<Job>> {
        self.admission
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct DownloadQueue {
    shared: Arc<Shared>,
    dispatcher: JoinHandle<QueueStats>,
}

impl DownloadQueue {
    /// Must be called from within a tokio runtime.
    pub fn new(options: QueueOptions, retriever: Arc<dyn Retriever>) -> Self {
        let concurrency = options.concurrency.max(1);
        let (tx, rx) = mpsc::channel(concurrency * ADMISSION_FACTOR);
        let dispatcher = tokio::spawn(dispatch(rx, retriever, concurrency, options.pour));

        debug!(concurrency, pour = options.pour, "download queue started");

        Self {
            shared: Arc::new(Shared {
                admission: Mutex::new(Some(tx)),
            }),
            dispatcher,
        }
    }

    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Close admission and wait for every admitted download to finish.
    pub async fn shutdown(self) -> QueueStats {
        let DownloadQueue { shared, dispatcher } = self;
        shared
            .admission
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(shared);

        match dispatcher.await {
            Ok(stats) => {
                debug!(?stats, "download queue drained");
                stats
            }
            Err(e) => {
                warn!(error = %e, "download dispatcher failed");
                QueueStats::default()
            }
        }
    }
}

/// Enqueue-only view of a [`DownloadQueue`]. Holding one never keeps the
/// queue open.
#[derive(Clone)]
pub struct QueueHandle {
    shared: Weak<Shared>,
}

impl QueueHandle {
    pub fn is_closed(&self) -> bool {
        self.shared
            .upgrade()
            .is_none_or(|shared| shared.sender().is_none())
    }

    /// Admit `request`, waiting for a slot if the queue is saturated.
    pub async fn enqueue(&self, request: DownloadRequest) -> Result<PendingDownload, Error> {
        let name = request.formula.clone();
        let closed = || Error::QueueClosed { name: name.clone() };

        let sender = self
            .shared
            .upgrade()
            .and_then(|shared| shared.sender())
            .ok_or_else(closed)?;

        let artifact = request.artifact.clone();
        let (reply, rx) = oneshot::channel();
        sender
            .send((request, reply))
            .await
            .map_err(|_| closed())?;

        Ok(PendingDownload {
            formula: name.clone(),
            artifact,
            rx,
        })
    }
}

#[derive(Debug)]
pub struct PendingDownload {
    formula: String,
    artifact: String,
    rx: oneshot::Receiver<Result<Artifact, Error>>,
}

impl PendingDownload {
    pub fn artifact(&self) -> &str {
        &self.artifact
    }

    pub async fn wait(self) -> Result<Artifact, Error> {
        self.rx.await.map_err(|_| Error::QueueClosed {
            name: self.formula,
        })?
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<Job>,
    retriever: Arc<dyn Retriever>,
    concurrency: usize,
    pour: bool,
) -> QueueStats {
    let permits = Arc::new(Semaphore::new(concurrency));
    let mut workers = JoinSet::new();
    let mut stats = QueueStats::default();

    while let Some((request, reply)) = rx.recv().await {
        stats.enqueued += 1;

        while let Some(finished) = workers.try_join_next() {
            stats.record(finished);
        }

        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let retriever = retriever.clone();
        workers.spawn(async move {
            let _permit = permit;
            let outcome = run_job(retriever, request, pour).await;
            if let Err(e) = &outcome {
                debug!(error = %e, "download failed");
            }
            let ok = outcome.is_ok();
            // Receiver may have been dropped; the artifact is cached either way
            let _ = reply.send(outcome);
            ok
        });
    }

    while let Some(finished) = workers.join_next().await {
        stats.record(finished);
    }

    stats
}

async fn run_job(
    retriever: Arc<dyn Retriever>,
    request: DownloadRequest,
    pour: bool,
) -> Result<Artifact, Error> {
    let blob_path = retriever.retrieve(&request).await?;

    let poured = if pour && request.kind == ArtifactKind::Bottle {
        let (r, req, blob) = (retriever.clone(), request.clone(), blob_path.clone());
        let entry = tokio::task::spawn_blocking(move || r.pour(&req, &blob))
            .await
            .map_err(|e| Error::store(format!("pour of {} aborted: {e}", request.formula)))??;
        Some(entry)
    } else {
        None
    };

    Ok(Artifact {
        request,
        blob_path,
        poured,
    })
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Downloads over HTTP into the blob cache and pours into the store.
pub struct HttpRetriever {
    http: Arc<dyn HttpClient>,
    prefix: Arc<Prefix>,
    reporter: Reporter,
}

impl HttpRetriever {
    pub fn new(http: Arc<dyn HttpClient>, prefix: Arc<Prefix>, reporter: Reporter) -> Self {
        Self {
            http,
            prefix,
            reporter,
        }
    }

    async fn fetch_once(&self, request: &DownloadRequest) -> Result<Vec<u8>, Error> {
        let response = self.http.get(&request.url).await?;
        if !response.is_success() {
            return Err(Error::network(format!(
                "HTTP {} downloading {}",
                response.status, request.url
            )));
        }
        Ok(response.body)
    }
}

#[async_trait]
impl Retriever for HttpRetriever {
    async fn retrieve(&self, request: &DownloadRequest) -> Result<PathBuf, Error> {
        let cache = &self.prefix.blob_cache;

        if cache.has_blob(&request.sha256) {
            let path = cache.blob_path(&request.sha256);
            let bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            self.reporter.report(InstallProgress::DownloadCompleted {
                name: request.formula.clone(),
                artifact: request.artifact.clone(),
                bytes,
                cached: true,
            });
            return Ok(path);
        }

        self.reporter.report(InstallProgress::DownloadStarted {
            name: request.formula.clone(),
            artifact: request.artifact.clone(),
        });

        let mut attempt = 1;
        let body = loop {
            match self.fetch_once(request).await {
                Ok(body) => break body,
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    warn!(url = %request.url, attempt, error = %e, "download failed, retrying");
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        let actual = sha256_hex(&body);
        if !actual.eq_ignore_ascii_case(&request.sha256) {
            return Err(Error::ChecksumMismatch {
                name: request.artifact.clone(),
                expected: request.sha256.clone(),
                actual,
            });
        }

        let mut writer = cache
            .start_write(&request.sha256)
            .map_err(|e| Error::store(format!("failed to open blob for writing: {e}")))?;
        writer
            .write_all(&body)
            .map_err(|e| Error::store(format!("failed to write blob: {e}")))?;
        let path = writer.commit()?;

        self.reporter.report(InstallProgress::DownloadCompleted {
            name: request.formula.clone(),
            artifact: request.artifact.clone(),
            bytes: body.len() as u64,
            cached: false,
        });

        Ok(path)
    }

    fn pour(&self, request: &DownloadRequest, blob: &Path) -> Result<PathBuf, Error> {
        let entry = self.prefix.store.ensure_entry(&request.sha256, blob)?;
        self.reporter.report(InstallProgress::Poured {
            name: request.formula.clone(),
        });
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::bottle_tarball;
    use crate::traits::ReqwestHttpClient;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(formula: &str, kind: ArtifactKind) -> DownloadRequest {
        DownloadRequest {
            formula: formula.to_string(),
            artifact: formula.to_string(),
            url: format!("https://example.com/{formula}"),
            sha256: format!("sha-{formula}"),
            kind,
        }
    }

    fn options(concurrency: usize, pour: bool) -> QueueOptions {
        QueueOptions { concurrency, pour }
    }

    /// Sleeps a little per retrieval and remembers the peak concurrency.
    #[derive(Default)]
    struct SlowRetriever {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Retriever for SlowRetriever {
        async fn retrieve(&self, request: &DownloadRequest) -> Result<PathBuf, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(PathBuf::from(format!("/blobs/{}", request.sha256)))
        }

        fn pour(&self, _request: &DownloadRequest, blob: &Path) -> Result<PathBuf, Error> {
            Ok(blob.with_extension("poured"))
        }
    }

    #[tokio::test]
    async fn delivers_every_enqueued_artifact() {
        let mut mock = MockRetriever::new();
        mock.expect_retrieve()
            .times(3)
            .returning(|req| Ok(PathBuf::from(format!("/blobs/{}", req.sha256))));

        let queue = DownloadQueue::new(options(4, false), Arc::new(mock));
        let handle = queue.handle();

        let mut pending = Vec::new();
        for name in ["a", "b", "c"] {
            pending.push(
                handle
                    .enqueue(request(name, ArtifactKind::Bottle))
                    .await
                    .unwrap(),
            );
        }

        for (p, name) in pending.into_iter().zip(["a", "b", "c"]) {
            let artifact = p.wait().await.unwrap();
            assert_eq!(artifact.request.formula, name);
            assert_eq!(artifact.blob_path, PathBuf::from(format!("/blobs/sha-{name}")));
            assert_eq!(artifact.poured, None);
        }

        let stats = queue.shutdown().await;
        assert_eq!(
            stats,
            QueueStats {
                enqueued: 3,
                completed: 3,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn never_exceeds_concurrency() {
        let retriever = Arc::new(SlowRetriever::default());
        let queue = DownloadQueue::new(options(2, false), retriever.clone());
        let handle = queue.handle();

        let mut pending = Vec::new();
        for i in 0..8 {
            pending.push(
                handle
                    .enqueue(request(&format!("pkg{i}"), ArtifactKind::Bottle))
                    .await
                    .unwrap(),
            );
        }
        for p in pending {
            p.wait().await.unwrap();
        }

        let stats = queue.shutdown().await;
        assert_eq!(stats.completed, 8);
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 8);
        assert!(retriever.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn pours_bottles_but_not_resources() {
        let mut mock = MockRetriever::new();
        mock.expect_retrieve()
            .times(2)
            .returning(|req| Ok(PathBuf::from(format!("/blobs/{}", req.sha256))));
        mock.expect_pour()
            .times(1)
            .withf(|req, _| req.kind == ArtifactKind::Bottle)
            .returning(|_, _| Ok(PathBuf::from("/store/entry")));

        let queue = DownloadQueue::new(options(2, true), Arc::new(mock));
        let handle = queue.handle();

        let bottle = handle
            .enqueue(request("jq", ArtifactKind::Bottle))
            .await
            .unwrap();
        let mut resource_req = request("jq", ArtifactKind::Resource);
        resource_req.artifact = "completions".to_string();
        resource_req.sha256 = "sha-completions".to_string();
        let resource = handle.enqueue(resource_req).await.unwrap();
        assert_eq!(resource.artifact(), "completions");

        assert_eq!(
            bottle.wait().await.unwrap().poured,
            Some(PathBuf::from("/store/entry"))
        );
        assert_eq!(resource.wait().await.unwrap().poured, None);

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_rejected() {
        let queue = DownloadQueue::new(options(1, false), Arc::new(SlowRetriever::default()));
        let handle = queue.handle();
        assert!(!handle.is_closed());

        let stats = queue.shutdown().await;
        assert_eq!(stats, QueueStats::default());
        assert!(handle.is_closed());

        let err = handle
            .enqueue(request("late", ArtifactKind::Bottle))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Error::QueueClosed {
                name: "late".to_string()
            }
        );
    }

    #[tokio::test]
    async fn failures_reach_the_waiter() {
        let mut mock = MockRetriever::new();
        mock.expect_retrieve()
            .returning(|_| Err(Error::network("connection reset")));

        let queue = DownloadQueue::new(options(1, true), Arc::new(mock));
        let pending = queue
            .handle()
            .enqueue(request("jq", ArtifactKind::Bottle))
            .await
            .unwrap();

        let err = pending.wait().await.unwrap_err();
        assert!(err.is_transient());

        let stats = queue.shutdown().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 0);
    }

    #[tokio::test]
    async fn shutdown_drains_admitted_work() {
        let retriever = Arc::new(SlowRetriever::default());
        let queue = DownloadQueue::new(options(1, false), retriever.clone());
        let handle = queue.handle();

        let mut pending = Vec::new();
        for i in 0..3 {
            pending.push(
                handle
                    .enqueue(request(&format!("pkg{i}"), ArtifactKind::Bottle))
                    .await
                    .unwrap(),
            );
        }

        // Nothing awaited yet: shutdown itself must finish the work
        let stats = queue.shutdown().await;
        assert_eq!(stats.enqueued, 3);
        assert_eq!(stats.completed, 3);

        for p in pending {
            p.wait().await.unwrap();
        }
    }

    #[tokio::test]
    async fn saturated_queue_applies_backpressure() {
        let retriever = Arc::new(SlowRetriever::default());
        let queue = DownloadQueue::new(options(1, false), retriever.clone());
        let handle = queue.handle();

        // 1 running + 1 waiting on a permit + 2 admission slots
        let mut pending = Vec::new();
        for i in 0..4 {
            pending.push(
                handle
                    .enqueue(request(&format!("pkg{i}"), ArtifactKind::Bottle))
                    .await
                    .unwrap(),
            );
        }

        let blocked = tokio::time::timeout(
            Duration::from_millis(5),
            handle.enqueue(request("overflow", ArtifactKind::Bottle)),
        )
        .await;
        assert!(blocked.is_err(), "fifth enqueue should wait for a slot");

        for p in pending {
            p.wait().await.unwrap();
        }
        queue.shutdown().await;
    }

    fn http_request(server: &MockServer, body: &[u8]) -> DownloadRequest {
        DownloadRequest {
            formula: "jq".to_string(),
            artifact: "jq".to_string(),
            url: format!("{}/bottles/jq.tar.gz", server.uri()),
            sha256: sha256_hex(body),
            kind: ArtifactKind::Bottle,
        }
    }

    fn http_retriever(tmp: &TempDir) -> HttpRetriever {
        let prefix =
            Prefix::open(&tmp.path().join("root"), &tmp.path().join("prefix")).unwrap();
        HttpRetriever::new(
            Arc::new(ReqwestHttpClient::new()),
            Arc::new(prefix),
            Reporter::silent(),
        )
    }

    #[tokio::test]
    async fn http_retriever_downloads_verifies_and_pours() {
        let server = MockServer::start().await;
        let body = bottle_tarball("jq", "1.7.1");
        Mock::given(method("GET"))
            .and(path("/bottles/jq.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let retriever = http_retriever(&tmp);
        let req = http_request(&server, &body);

        let blob = retriever.retrieve(&req).await.unwrap();
        assert_eq!(std::fs::read(&blob).unwrap(), body);

        // Second call is served from the cache
        assert_eq!(retriever.retrieve(&req).await.unwrap(), blob);

        let entry = retriever.pour(&req, &blob).unwrap();
        assert!(entry.join("jq/1.7.1/bin/jq").exists());
    }

    #[tokio::test]
    async fn http_retriever_rejects_checksum_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bottles/jq.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let retriever = http_retriever(&tmp);
        let req = http_request(&server, b"original");

        let err = retriever.retrieve(&req).await.unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert!(!tmp.path().join("root/cache/blobs").read_dir().unwrap().any(|_| true));
    }

    #[tokio::test]
    async fn http_retriever_retries_server_errors() {
        let server = MockServer::start().await;
        let body = b"payload".to_vec();
        Mock::given(method("GET"))
            .and(path("/bottles/jq.tar.gz"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bottles/jq.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let retriever = http_retriever(&tmp);

        let blob = retriever
            .retrieve(&http_request(&server, &body))
            .await
            .unwrap();
        assert_eq!(std::fs::read(blob).unwrap(), body);
    }

    #[tokio::test]
    async fn http_retriever_gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bottles/jq.tar.gz"))
            .respond_with(ResponseTemplate::new(500))
            .expect(u64::from(MAX_ATTEMPTS))
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let retriever = http_retriever(&tmp);

        let err = retriever
            .retrieve(&http_request(&server, b"never"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}

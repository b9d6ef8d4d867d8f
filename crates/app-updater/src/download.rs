//! Resumable, cancellable artifact downloader.
//!
//! Bytes stream into `<staging>/<digest-prefix>-<file>.part` while a digest
//! is computed over them. The temporary file is renamed to its final name only after
//! [`IntegrityVerifier`] accepts the size, digest and signature, so a
//! partial or tampered file is never mistaken for a finished artifact.
//!
//! One downloader owns at most one session at a time. Starting a download
//! for the URL already in flight returns the existing handle; any other URL
//! is rejected with [`DownloadError::AlreadyDownloading`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DownloadError, IntegrityError, UpdateError};
use crate::feed::ArtifactDescriptor;
use crate::http::{HttpRequest, HttpTransport};
use crate::verify::{compute_file_digest, ComputedDigest, DigestAccumulator, IntegrityVerifier};

/// Default per-chunk timeout in seconds.
const DEFAULT_CHUNK_TIMEOUT_SECS: u64 = 60;

/// Buffer size for re-hashing a partial file before resuming.
const REHASH_BUFFER_SIZE: usize = 8192;

/// Suffix of in-progress downloads in the staging directory.
const PARTIAL_SUFFIX: &str = ".part";

/// Hex digits of the expected digest that prefix a partial file name.
const PARTIAL_DIGEST_PREFIX: usize = 16;

/// What to do with a partial file left by an interrupted download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumeStrategy {
    /// Continue with a byte-range request
    Range,
    /// Discard partial data and fetch from the first byte
    #[default]
    Restart,
}

/// Configuration for the downloader.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Directory owned by the downloader for partial and verified files.
    pub staging_dir: PathBuf,
    /// Maximum wait for any single chunk.
    pub chunk_timeout: Duration,
    pub resume: ResumeStrategy,
}

impl DownloaderConfig {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            chunk_timeout: Duration::from_secs(DEFAULT_CHUNK_TIMEOUT_SECS),
            resume: ResumeStrategy::default(),
        }
    }

    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    pub fn with_resume(mut self, resume: ResumeStrategy) -> Self {
        self.resume = resume;
        self
    }
}

/// Progress callback type for download progress reporting.
pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// Download progress information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes on disk so far, including resumed bytes.
    pub bytes_written: u64,
    /// Total bytes, when the feed or server declared it.
    pub total: Option<u64>,
}

impl DownloadProgress {
    pub fn new(bytes_written: u64, total: Option<u64>) -> Self {
        Self {
            bytes_written,
            total,
        }
    }

    /// Progress as a percentage (0.0 to 100.0), if the total is known.
    pub fn percentage(&self) -> Option<f64> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some((self.bytes_written as f64 / total as f64) * 100.0),
        }
    }
}

impl std::fmt::Display for DownloadProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.total, self.percentage()) {
            (Some(total), Some(pct)) => {
                write!(f, "{}/{} bytes ({:.1}%)", self.bytes_written, total, pct)
            }
            _ => write!(f, "{} bytes", self.bytes_written),
        }
    }
}

/// An artifact that passed integrity verification and sits at its final path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedArtifact {
    pub path: PathBuf,
    pub descriptor: ArtifactDescriptor,
    pub digest: ComputedDigest,
    pub size: u64,
}

type Outcome = Option<Result<VerifiedArtifact, UpdateError>>;

/// Handle to an in-flight or finished download. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DownloadHandle {
    id: u64,
    url: String,
    cancel: CancellationToken,
    outcome: watch::Receiver<Outcome>,
}

impl DownloadHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Request cancellation. The session removes its temporary file.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Wait for the session to finish.
    ///
    /// Every clone of the handle observes the same outcome.
    pub async fn wait(&self) -> Result<VerifiedArtifact, UpdateError> {
        let mut outcome = self.outcome.clone();
        let result = match outcome.wait_for(Option::is_some).await {
            Ok(done) => match &*done {
                Some(result) => result.clone(),
                None => Err(aborted()),
            },
            Err(_) => Err(aborted()),
        };
        result
    }
}

fn aborted() -> UpdateError {
    DownloadError::Network {
        message: "download task ended without a result".to_string(),
        bytes_written: 0,
    }
    .into()
}

/// Streams artifacts into the staging directory.
pub struct ArtifactDownloader {
    transport: Arc<dyn HttpTransport>,
    verifier: IntegrityVerifier,
    config: DownloaderConfig,
    active: Mutex<Option<DownloadHandle>>,
    next_id: AtomicU64,
}

impl ArtifactDownloader {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        verifier: IntegrityVerifier,
        config: DownloaderConfig,
    ) -> Self {
        Self {
            transport,
            verifier,
            config,
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    /// Final path a verified artifact for `descriptor` is promoted to.
    pub fn final_path(&self, descriptor: &ArtifactDescriptor) -> PathBuf {
        self.config.staging_dir.join(descriptor.file_name())
    }

    /// Temporary path bytes are written to while downloading.
    ///
    /// Keyed by the expected digest, so a release that reuses a file name
    /// never resumes on top of another release's bytes.
    pub fn partial_path(&self, descriptor: &ArtifactDescriptor) -> PathBuf {
        let digest = descriptor.digest.to_hex();
        let prefix = &digest[..digest.len().min(PARTIAL_DIGEST_PREFIX)];
        self.config.staging_dir.join(format!(
            "{prefix}-{}{PARTIAL_SUFFIX}",
            descriptor.file_name()
        ))
    }

    /// The handle of the session still running, if any.
    pub fn active(&self) -> Option<DownloadHandle> {
        self.lock_active()
            .as_ref()
            .filter(|handle| !handle.is_finished())
            .cloned()
    }

    /// Start streaming `descriptor` on a background task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_download(
        &self,
        descriptor: ArtifactDescriptor,
        progress: Option<ProgressCallback>,
    ) -> Result<DownloadHandle, DownloadError> {
        let mut active = self.lock_active();

        if let Some(current) = active.as_ref().filter(|h| !h.is_finished()) {
            if current.url == descriptor.url {
                debug!(url = %descriptor.url, id = current.id, "Coalescing download request");
                return Ok(current.clone());
            }
            warn!(active = %current.url, requested = %descriptor.url, "Download already in progress");
            return Err(DownloadError::AlreadyDownloading {
                url: current.url.clone(),
            });
        }

        let (tx, rx) = watch::channel(None);
        let handle = DownloadHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            url: descriptor.url.clone(),
            cancel: CancellationToken::new(),
            outcome: rx,
        };

        let session = DownloadSession {
            temp_path: self.partial_path(&descriptor),
            final_path: self.final_path(&descriptor),
            staging_dir: self.config.staging_dir.clone(),
            artifact: descriptor,
            transport: Arc::clone(&self.transport),
            verifier: self.verifier.clone(),
            chunk_timeout: self.config.chunk_timeout,
            resume: self.config.resume,
            cancel: handle.cancel.clone(),
            progress,
            bytes_written: 0,
        };

        info!(
            id = handle.id,
            url = %session.artifact.url,
            path = %session.temp_path.display(),
            "Starting download"
        );

        tokio::spawn(async move {
            let result = session.run().await;
            let _ = tx.send(Some(result));
        });

        *active = Some(handle.clone());
        Ok(handle)
    }

    /// Cancel the download identified by `handle`.
    pub fn cancel(&self, handle: &DownloadHandle) {
        info!(id = handle.id, "Cancelling download");
        handle.cancel();
    }

    /// Cancel whatever is running. Returns false if nothing was.
    pub fn cancel_active(&self) -> bool {
        match self.active() {
            Some(handle) => {
                self.cancel(&handle);
                true
            }
            None => false,
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<DownloadHandle>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// State of one download, owned by its background task.
struct DownloadSession {
    artifact: ArtifactDescriptor,
    staging_dir: PathBuf,
    temp_path: PathBuf,
    final_path: PathBuf,
    transport: Arc<dyn HttpTransport>,
    verifier: IntegrityVerifier,
    chunk_timeout: Duration,
    resume: ResumeStrategy,
    cancel: CancellationToken,
    progress: Option<ProgressCallback>,
    bytes_written: u64,
}

impl DownloadSession {
    async fn run(mut self) -> Result<VerifiedArtifact, UpdateError> {
        if let Some(artifact) = self.reuse_promoted().await {
            return Ok(artifact);
        }

        let mut digest = DigestAccumulator::new(self.artifact.digest.algorithm);

        let result = self.stream_to_disk(&mut digest).await;
        let result = match result {
            Ok(()) => self.verify_and_promote(digest).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(artifact) => {
                info!(path = %artifact.path.display(), size = artifact.size, "Download verified");
            }
            Err(e) => {
                if self.should_discard(e) {
                    remove_quietly(&self.temp_path).await;
                }
                if e.is_cancelled() {
                    info!(url = %self.artifact.url, bytes_written = self.bytes_written, "Download cancelled");
                } else {
                    warn!(url = %self.artifact.url, error = %e, "Download failed");
                }
            }
        }
        result
    }

    /// A file promoted by an earlier session that still verifies is reused
    /// without touching the network.
    async fn reuse_promoted(&self) -> Option<VerifiedArtifact> {
        let size = fs::metadata(&self.final_path).await.ok()?.len();
        let path = self.final_path.clone();
        let algorithm = self.artifact.digest.algorithm;
        let computed = tokio::task::spawn_blocking(move || compute_file_digest(&path, algorithm))
            .await
            .ok()?
            .ok()?;

        match self.verifier.verify(
            &self.artifact.digest,
            self.artifact.size,
            self.artifact.signature.as_deref(),
            &computed,
            size,
        ) {
            Ok(()) => {
                info!(path = %self.final_path.display(), "Verified artifact already staged");
                Some(VerifiedArtifact {
                    path: self.final_path.clone(),
                    descriptor: self.artifact.clone(),
                    digest: computed,
                    size,
                })
            }
            Err(e) => {
                debug!(path = %self.final_path.display(), error = %e, "Staged file is stale, downloading again");
                None
            }
        }
    }

    /// Partial data survives only for retryable failures under range resume.
    fn should_discard(&self, error: &UpdateError) -> bool {
        match error {
            UpdateError::Download(e) => {
                e.is_cancelled() || self.resume == ResumeStrategy::Restart || !e.is_retryable()
            }
            _ => true,
        }
    }

    async fn stream_to_disk(&mut self, digest: &mut DigestAccumulator) -> Result<(), UpdateError> {
        fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| DownloadError::io(&self.staging_dir, e))?;

        self.discard_stale_partials().await;
        let offset = self.prepare_partial(digest).await?;
        if offset > 0 && Some(offset) == self.artifact.size {
            debug!(path = %self.temp_path.display(), "Partial file already complete");
            return Ok(());
        }

        let mut request = HttpRequest::get(self.artifact.url.clone());
        if offset > 0 {
            request = request.with_range_start(offset);
        }

        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(self.cancelled()),
            response = tokio::time::timeout(self.chunk_timeout, self.transport.get(request)) => {
                match response {
                    Err(_) => return Err(DownloadError::Timeout { bytes_written: self.bytes_written }.into()),
                    Ok(Err(e)) => return Err(self.network(e.to_string())),
                    Ok(Ok(response)) => response,
                }
            }
        };

        if !response.is_success() {
            return Err(DownloadError::HttpStatus {
                status: response.status,
                bytes_written: self.bytes_written,
            }
            .into());
        }

        let append = offset > 0 && response.is_partial();
        if offset > 0 && !append {
            warn!(url = %self.artifact.url, "Server ignored range request, restarting download");
            *digest = DigestAccumulator::new(self.artifact.digest.algorithm);
            self.bytes_written = 0;
        }

        let total = self
            .artifact
            .size
            .or_else(|| response.content_length.map(|len| len + self.bytes_written));

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&self.temp_path)
            .await
            .map_err(|e| DownloadError::io(&self.temp_path, e))?;

        self.report_progress(total);

        let mut body = response.body;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled()),
                next = tokio::time::timeout(self.chunk_timeout, body.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    return Err(DownloadError::Timeout {
                        bytes_written: self.bytes_written,
                    }
                    .into())
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(self.network(e.to_string())),
                Ok(Some(Ok(chunk))) => chunk,
            };

            let written = self.bytes_written + chunk.len() as u64;
            if let Some(expected) = self.artifact.size {
                if written > expected {
                    return Err(IntegrityError::SizeMismatch {
                        expected,
                        actual: written,
                    }
                    .into());
                }
            }

            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadError::io(&self.temp_path, e))?;
            digest.update(&chunk);
            self.bytes_written = written;
            self.report_progress(total);
        }

        file.flush()
            .await
            .map_err(|e| DownloadError::io(&self.temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| DownloadError::io(&self.temp_path, e))?;

        if let Some(expected) = self.artifact.size {
            if self.bytes_written < expected {
                return Err(DownloadError::Incomplete {
                    bytes_written: self.bytes_written,
                    expected,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Remove partials of the same file written for a different digest.
    async fn discard_stale_partials(&self) {
        let suffix = format!("-{}{PARTIAL_SUFFIX}", self.artifact.file_name());
        let mut entries = match fs::read_dir(&self.staging_dir).await {
            Ok(entries) => entries,
            Err(_) => return,
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path == self.temp_path {
                continue;
            }
            let stale = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_suffix(suffix.as_str()))
                .map_or(false, |prefix| {
                    prefix.len() == PARTIAL_DIGEST_PREFIX
                        && prefix.bytes().all(|b| b.is_ascii_hexdigit())
                });
            if stale {
                debug!(path = %path.display(), "Discarding partial from another release");
                remove_quietly(&path).await;
            }
        }
    }

    /// Returns the offset to resume from, re-hashing any kept partial bytes.
    async fn prepare_partial(&mut self, digest: &mut DigestAccumulator) -> Result<u64, UpdateError> {
        let existing = match fs::metadata(&self.temp_path).await {
            Ok(meta) => meta.len(),
            Err(_) => return Ok(0),
        };

        let resumable = self.resume == ResumeStrategy::Range
            && existing > 0
            && self.artifact.size.map_or(true, |size| existing <= size);

        if !resumable {
            if existing > 0 {
                debug!(path = %self.temp_path.display(), existing, "Discarding partial download");
            }
            remove_quietly(&self.temp_path).await;
            return Ok(0);
        }

        let mut file = fs::File::open(&self.temp_path)
            .await
            .map_err(|e| DownloadError::io(&self.temp_path, e))?;
        let mut buffer = vec![0u8; REHASH_BUFFER_SIZE];
        let mut read_total = 0u64;
        loop {
            let n = file
                .read(&mut buffer)
                .await
                .map_err(|e| DownloadError::io(&self.temp_path, e))?;
            if n == 0 {
                break;
            }
            digest.update(&buffer[..n]);
            read_total += n as u64;
        }

        info!(path = %self.temp_path.display(), offset = read_total, "Resuming download");
        self.bytes_written = read_total;
        Ok(read_total)
    }

    async fn verify_and_promote(
        &self,
        digest: DigestAccumulator,
    ) -> Result<VerifiedArtifact, UpdateError> {
        let computed = digest.finalize();
        self.verifier.verify(
            &self.artifact.digest,
            self.artifact.size,
            self.artifact.signature.as_deref(),
            &computed,
            self.bytes_written,
        )?;

        if fs::metadata(&self.final_path).await.is_ok() {
            fs::remove_file(&self.final_path)
                .await
                .map_err(|e| DownloadError::io(&self.final_path, e))?;
        }
        fs::rename(&self.temp_path, &self.final_path)
            .await
            .map_err(|e| DownloadError::io(&self.final_path, e))?;

        Ok(VerifiedArtifact {
            path: self.final_path.clone(),
            descriptor: self.artifact.clone(),
            digest: computed,
            size: self.bytes_written,
        })
    }

    fn report_progress(&self, total: Option<u64>) {
        if let Some(callback) = &self.progress {
            callback(DownloadProgress::new(self.bytes_written, total));
        }
    }

    fn cancelled(&self) -> UpdateError {
        DownloadError::Cancelled {
            bytes_written: self.bytes_written,
        }
        .into()
    }

    fn network(&self, message: String) -> UpdateError {
        DownloadError::Network {
            message,
            bytes_written: self.bytes_written,
        }
        .into()
    }
}

async fn remove_quietly(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed temporary file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temporary file"),
    }
}

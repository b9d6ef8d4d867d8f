//! Update manager - orchestrates the complete update flow.
//!
//! The UpdateManager combines all update components:
//! - FeedParser for decoding the channel feed
//! - UpdateEligibilityPolicy for choosing the target release
//! - ArtifactDownloader for verified, cancellable downloads
//! - PlatformInstallStrategy and HandoffExecutor for the install step
//!
//! A full cycle emits, in order: `checking-for-update`, then
//! `update-available` or `update-not-available`, then any number of
//! `download-progress`, then `update-downloaded`. Any failure emits `error`
//! and returns the manager to [`ClientState::Idle`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, error, info, warn};

use crate::config::UpdateConfig;
use crate::download::{ArtifactDownloader, DownloadHandle, DownloaderConfig, ProgressCallback};
use crate::eligibility::{UpdateCheckResult, UpdateEligibilityPolicy};
use crate::error::{ConfigError, DownloadError, FeedError, UpdateError, UsageError};
use crate::events::{DownloadedUpdate, EventBus, SubscriptionId, UpdateInfo, UpdaterEvent};
use crate::feed::{FeedParser, ReleaseManifestEntry};
use crate::http::{HttpRequest, HttpTransport, ReqwestTransport, TransportError};
use crate::install::{strategy_for, HandoffExecutor, InstallHandoff, PlatformInstallStrategy, ProcessExecutor};
use crate::platform::HostPlatform;
use crate::rollout::{load_or_create_install_id, RolloutBucket};
use crate::verify::IntegrityVerifier;
use crate::version::AppVersion;

/// Current state of the update manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    /// Idle, no update in progress
    #[default]
    Idle,
    /// Fetching and evaluating the feed
    Checking,
    /// A check selected an update that has not been downloaded
    UpdateAvailable,
    /// Streaming the selected artifact
    Downloading,
    /// The artifact is verified and staged
    Downloaded,
    /// The install handoff has been started
    Installing,
    /// A failure is being reported; the manager returns to `Idle` right after
    Error,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::UpdateAvailable => "update-available",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Installing => "installing",
            Self::Error => "error",
        })
    }
}

type CheckFuture = Shared<BoxFuture<'static, Result<UpdateCheckResult, UpdateError>>>;

#[derive(Default)]
struct Machine {
    state: ClientState,
    in_flight_check: Option<CheckFuture>,
    /// Entry selected by the last successful check
    accepted: Option<ReleaseManifestEntry>,
    download_requested: bool,
    download: Option<DownloadHandle>,
    downloaded: Option<DownloadedUpdate>,
}

struct Inner {
    config: UpdateConfig,
    current_version: AppVersion,
    host: HostPlatform,
    transport: Arc<dyn HttpTransport>,
    parser: FeedParser,
    policy: UpdateEligibilityPolicy,
    downloader: ArtifactDownloader,
    strategy: Box<dyn PlatformInstallStrategy>,
    executor: Arc<dyn HandoffExecutor>,
    events: Arc<EventBus>,
    machine: Mutex<Machine>,
}

/// Main update manager that orchestrates the complete update flow.
///
/// Cheap to clone; clones share state.
///
/// # Example
///
/// ```ignore
/// use app_updater::config::UpdateConfig;
/// use app_updater::manager::UpdateManager;
///
/// let config = UpdateConfig::load_from_file("app-update.yml".as_ref())?;
/// let manager = UpdateManager::builder(config, "1.2.0".parse()?).build()?;
///
/// manager.subscribe(|event| println!("{}", event.name()));
/// if manager.check_for_updates().await?.is_update_available {
///     let downloaded = manager.download_update().await?;
///     println!("staged {}", downloaded.artifact.path.display());
///     manager.quit_and_install().await?;
/// }
/// ```
#[derive(Clone)]
pub struct UpdateManager {
    inner: Arc<Inner>,
}

impl UpdateManager {
    pub fn builder(config: UpdateConfig, current_version: AppVersion) -> UpdateManagerBuilder {
        UpdateManagerBuilder::new(config, current_version)
    }

    /// Get the current state of the update manager.
    pub fn state(&self) -> ClientState {
        self.machine().state
    }

    /// Get the current version.
    pub fn current_version(&self) -> &AppVersion {
        &self.inner.current_version
    }

    /// Get the configuration.
    pub fn config(&self) -> &UpdateConfig {
        &self.inner.config
    }

    pub fn host(&self) -> &HostPlatform {
        &self.inner.host
    }

    pub fn policy(&self) -> &UpdateEligibilityPolicy {
        &self.inner.policy
    }

    /// The verified download waiting for install, if any.
    pub fn downloaded_update(&self) -> Option<DownloadedUpdate> {
        self.machine().downloaded.clone()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&UpdaterEvent) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Fetch the feed and decide whether an update is available.
    ///
    /// Calls made while a check is running share its result.
    ///
    /// # Errors
    ///
    /// - [`UsageError::InvalidState`] while downloading or installing
    /// - any feed failure, also reported through the `error` event
    pub async fn check_for_updates(&self) -> Result<UpdateCheckResult, UpdateError> {
        let check = {
            let mut machine = self.machine();
            match machine.in_flight_check.clone() {
                Some(check) => {
                    debug!("Joining in-flight update check");
                    check
                }
                None => {
                    if matches!(
                        machine.state,
                        ClientState::Downloading | ClientState::Installing
                    ) {
                        return Err(UsageError::InvalidState {
                            operation: "check_for_updates",
                            state: machine.state.to_string(),
                        }
                        .into());
                    }
                    machine.state = ClientState::Checking;
                    let this = self.clone();
                    let check = async move { this.run_check().await }.boxed().shared();
                    machine.in_flight_check = Some(check.clone());
                    check
                }
            }
        };
        check.await
    }

    async fn run_check(&self) -> Result<UpdateCheckResult, UpdateError> {
        self.emit(UpdaterEvent::CheckingForUpdate);
        info!(current = %self.inner.current_version, host = %self.inner.host, "Checking for updates");

        let result = self.fetch_and_select().await;

        let mut machine = self.machine();
        machine.in_flight_check = None;

        let check = match result {
            Ok(check) => check,
            Err(e) => {
                machine.accepted = None;
                machine.download_requested = false;
                drop(machine);
                self.fail(e.clone());
                return Err(e);
            }
        };

        let event = match check.selected_entry.as_ref().and_then(UpdateInfo::from_entry) {
            Some(info) => {
                let same_as_staged = machine
                    .downloaded
                    .as_ref()
                    .map_or(false, |d| d.info.version == info.version);
                if same_as_staged {
                    machine.state = ClientState::Downloaded;
                } else {
                    machine.state = ClientState::UpdateAvailable;
                    machine.downloaded = None;
                    machine.download_requested = false;
                }
                machine.accepted = check.selected_entry.clone();
                info!(version = %info.version, "Update available");
                UpdaterEvent::UpdateAvailable(info)
            }
            None => {
                machine.state = ClientState::Idle;
                machine.accepted = None;
                machine.download_requested = false;
                machine.downloaded = None;
                info!(current = %self.inner.current_version, "No update available");
                UpdaterEvent::UpdateNotAvailable {
                    current_version: self.inner.current_version.clone(),
                }
            }
        };
        drop(machine);

        self.emit(event);
        Ok(check)
    }

    async fn fetch_and_select(&self) -> Result<UpdateCheckResult, UpdateError> {
        let inner = &self.inner;
        let url = inner
            .config
            .feed_url(inner.policy.channel(), inner.host.platform)?;
        let timeout_secs = inner.config.network.feed_timeout_secs;

        debug!(url = %url, "Fetching feed");
        let fetch = async {
            let response = inner.transport.get(HttpRequest::get(url.as_str())).await?;
            if !response.is_success() {
                return Ok::<_, TransportError>(Err(response.status));
            }
            response.bytes().await.map(Ok)
        };

        let body = match tokio::time::timeout(Duration::from_secs(timeout_secs), fetch).await {
            Err(_) => return Err(FeedError::Timeout { secs: timeout_secs }.into()),
            Ok(Err(TransportError::Timeout)) => {
                return Err(FeedError::Timeout { secs: timeout_secs }.into())
            }
            Ok(Err(e)) => return Err(FeedError::Transport(e.to_string()).into()),
            Ok(Ok(Err(status))) => {
                return Err(FeedError::HttpStatus {
                    url: url.to_string(),
                    status,
                }
                .into())
            }
            Ok(Ok(Ok(body))) => body,
        };

        let parsed = inner.parser.clone().with_base_url(url).parse(&body)?;
        Ok(inner.policy.select(&inner.current_version, &parsed.entries))
    }

    /// Download and verify the update selected by the last check.
    ///
    /// Resolves to the staged update. Its `files` list is empty for
    /// strategies that install at quit time (macOS bundles).
    ///
    /// # Errors
    ///
    /// - [`UsageError::NoUpdateAvailable`] without a successful check
    /// - [`UsageError::DownloadAlreadyRequested`] on a second call
    /// - download and integrity failures, also reported through `error`
    /// - a cancelled download, reported through `update-cancelled`
    pub async fn download_update(&self) -> Result<DownloadedUpdate, UpdateError> {
        let settle = {
            let mut machine = self.machine();
            match machine.state {
                ClientState::UpdateAvailable => {}
                ClientState::Downloading | ClientState::Downloaded if machine.download_requested => {
                    let version = machine
                        .accepted
                        .as_ref()
                        .map(|e| e.version.to_string())
                        .unwrap_or_default();
                    return Err(UsageError::DownloadAlreadyRequested(version).into());
                }
                ClientState::Idle => return Err(UsageError::NoUpdateAvailable.into()),
                state => {
                    return Err(UsageError::InvalidState {
                        operation: "download_update",
                        state: state.to_string(),
                    }
                    .into())
                }
            }

            let entry = machine
                .accepted
                .clone()
                .ok_or(UsageError::NoUpdateAvailable)?;
            let (info, artifact) = match (UpdateInfo::from_entry(&entry), entry.artifact()) {
                (Some(info), Some(artifact)) => (info, artifact.clone()),
                _ => return Err(UsageError::NoUpdateAvailable.into()),
            };

            let events = Arc::clone(&self.inner.events);
            let progress: ProgressCallback =
                Arc::new(move |p| events.emit(&UpdaterEvent::DownloadProgress(p)));

            // Progress listeners run on the session task and may call back
            // in; they block on this lock until the handle is recorded.
            machine.state = ClientState::Downloading;
            machine.download_requested = true;
            let handle = match self.inner.downloader.start_download(artifact, Some(progress)) {
                Ok(handle) => handle,
                Err(e) => {
                    machine.state = ClientState::UpdateAvailable;
                    machine.download_requested = false;
                    drop(machine);
                    let e = UpdateError::from(e);
                    self.fail(e.clone());
                    return Err(e);
                }
            };
            machine.download = Some(handle.clone());

            info!(version = %info.version, url = %info.artifact_url, "Downloading update");
            let this = self.clone();
            tokio::spawn(async move { this.settle_download(info, handle).await })
        };

        match settle.await {
            Ok(result) => result,
            Err(e) => Err(DownloadError::Network {
                message: format!("download task failed: {e}"),
                bytes_written: 0,
            }
            .into()),
        }
    }

    /// Move out of `Downloading` once the session ends.
    ///
    /// Runs on its own task so the transition happens even if the caller
    /// of [`download_update`](Self::download_update) stops waiting.
    async fn settle_download(
        &self,
        info: UpdateInfo,
        handle: DownloadHandle,
    ) -> Result<DownloadedUpdate, UpdateError> {
        let result = handle.wait().await;

        let mut machine = self.machine();
        machine.download = None;

        match result {
            Ok(artifact) => {
                let downloaded = DownloadedUpdate {
                    files: self.inner.strategy.downloaded_files(&artifact),
                    info,
                    artifact,
                };
                machine.state = ClientState::Downloaded;
                machine.downloaded = Some(downloaded.clone());
                drop(machine);

                info!(
                    version = %downloaded.info.version,
                    path = %downloaded.artifact.path.display(),
                    "Update downloaded"
                );
                self.emit(UpdaterEvent::UpdateDownloaded(downloaded.clone()));
                Ok(downloaded)
            }
            Err(e) if e.is_cancelled() => {
                machine.state = ClientState::Idle;
                machine.accepted = None;
                machine.download_requested = false;
                drop(machine);

                info!(version = %info.version, "Update download cancelled");
                self.emit(UpdaterEvent::UpdateCancelled(info));
                Err(e)
            }
            Err(e) => {
                machine.accepted = None;
                machine.download_requested = false;
                drop(machine);
                self.fail(e.clone());
                Err(e)
            }
        }
    }

    /// Cancel the running download.
    ///
    /// The download task removes its temporary file and the manager returns
    /// to `Idle` with an `update-cancelled` event.
    pub fn cancel_download(&self) -> Result<(), UsageError> {
        let machine = self.machine();
        match (&machine.state, &machine.download) {
            (ClientState::Downloading, Some(handle)) => {
                self.inner.downloader.cancel(handle);
                Ok(())
            }
            _ => Err(UsageError::NoActiveDownload),
        }
    }

    /// Hand the verified download to the platform installer.
    ///
    /// On success the manager stays in `Installing`; the host is expected
    /// to quit.
    pub async fn quit_and_install(&self) -> Result<InstallHandoff, UpdateError> {
        let downloaded = {
            let mut machine = self.machine();
            let downloaded = match (&machine.state, &machine.downloaded) {
                (ClientState::Downloaded, Some(downloaded)) => downloaded.clone(),
                _ => return Err(UsageError::NothingDownloaded.into()),
            };
            machine.state = ClientState::Installing;
            downloaded
        };

        let result = async {
            let handoff = self
                .inner
                .strategy
                .prepare_install(&downloaded.artifact)
                .await?;
            self.inner.executor.execute(&handoff).await?;
            Ok::<_, UpdateError>(handoff)
        }
        .await;

        match result {
            Ok(handoff) => {
                info!(
                    version = %downloaded.info.version,
                    strategy = %self.inner.strategy.variant(),
                    action = ?handoff.action,
                    "Install handoff started"
                );
                Ok(handoff)
            }
            Err(e) => {
                {
                    let mut machine = self.machine();
                    machine.downloaded = None;
                    machine.accepted = None;
                    machine.download_requested = false;
                }
                self.fail(e.clone());
                Err(e)
            }
        }
    }

    /// Report `error` and return to `Idle`.
    fn fail(&self, e: UpdateError) {
        error!(kind = ?e.kind(), retryable = e.is_retryable(), error = %e, "Update cycle failed");
        self.machine().state = ClientState::Error;
        self.emit(UpdaterEvent::Error(e));
        self.machine().state = ClientState::Idle;
    }

    fn emit(&self, event: UpdaterEvent) {
        self.inner.events.emit(&event);
    }

    fn machine(&self) -> MutexGuard<'_, Machine> {
        self.inner
            .machine
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for UpdateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateManager")
            .field("current_version", &self.inner.current_version)
            .field("host", &self.inner.host)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Builds an [`UpdateManager`] with injectable collaborators.
///
/// Anything not supplied is derived from the config and the running host.
pub struct UpdateManagerBuilder {
    config: UpdateConfig,
    current_version: AppVersion,
    host: Option<HostPlatform>,
    transport: Option<Arc<dyn HttpTransport>>,
    strategy: Option<Box<dyn PlatformInstallStrategy>>,
    executor: Option<Arc<dyn HandoffExecutor>>,
    rollout_bucket: Option<RolloutBucket>,
}

impl UpdateManagerBuilder {
    pub fn new(config: UpdateConfig, current_version: AppVersion) -> Self {
        Self {
            config,
            current_version,
            host: None,
            transport: None,
            strategy: None,
            executor: None,
            rollout_bucket: None,
        }
    }

    pub fn with_host(mut self, host: HostPlatform) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_strategy(mut self, strategy: Box<dyn PlatformInstallStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn HandoffExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Use a fixed bucket instead of the persisted install id.
    pub fn with_rollout_bucket(mut self, bucket: RolloutBucket) -> Self {
        self.rollout_bucket = Some(bucket);
        self
    }

    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the config is invalid, a publisher key
    /// cannot be parsed, the install id cannot be persisted, or the HTTP
    /// client cannot be created.
    pub fn build(self) -> Result<UpdateManager, UpdateError> {
        let config = self.config;
        config.validate()?;

        let host = self.host.unwrap_or_else(HostPlatform::current);

        let verifier = IntegrityVerifier::with_publisher_keys(config.parse_publisher_keys()?);
        if !verifier.requires_signature() {
            debug!("No publisher keys configured, artifacts are digest-checked only");
        }

        let rollout_bucket = match self.rollout_bucket {
            Some(bucket) => bucket,
            None => {
                let id = load_or_create_install_id(&config.install_id_path())?;
                RolloutBucket::from_install_id(&id)
            }
        };

        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                ReqwestTransport::new(&config.network.user_agent())
                    .map_err(|e| ConfigError::Invalid(format!("http client: {e}")))?,
            ),
        };

        let strategy = self
            .strategy
            .unwrap_or_else(|| strategy_for(&host, &config.install.to_options()));
        let executor = self.executor.unwrap_or_else(|| Arc::new(ProcessExecutor));

        let downloader = ArtifactDownloader::new(
            Arc::clone(&transport),
            verifier,
            DownloaderConfig::new(config.staging_dir())
                .with_chunk_timeout(Duration::from_secs(config.network.chunk_timeout_secs))
                .with_resume(config.network.resume),
        );

        let parser =
            FeedParser::new(host).with_prefer_differential(config.install.prefer_differential);

        let policy = UpdateEligibilityPolicy::new(config.channel.clone())
            .with_allow_prerelease(config.allow_prerelease)
            .with_allow_downgrade(config.allow_downgrade)
            .with_rollout_bucket(rollout_bucket);

        if config.allow_downgrade {
            warn!("Downgrades are allowed by configuration");
        }
        info!(
            version = %self.current_version,
            channel = %config.channel,
            host = %host,
            strategy = %strategy.variant(),
            bucket = %rollout_bucket,
            "Update manager ready"
        );

        Ok(UpdateManager {
            inner: Arc::new(Inner {
                config,
                current_version: self.current_version,
                host,
                transport,
                parser,
                policy,
                downloader,
                strategy,
                executor,
                events: Arc::new(EventBus::new()),
                machine: Mutex::new(Machine::default()),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::ResumeStrategy;
    use crate::error::{DownloadError, ErrorKind};
    use crate::http::{MemoryResponse, MemoryTransport};
    use crate::install::InstallAction;
    use crate::platform::{Arch, Platform};
    use crate::verify::{DigestAccumulator, DigestAlgorithm};
    use async_trait::async_trait;
    use tempfile::TempDir;

    const BASE: &str = "https://updates.example.com/app";
    const FEED_URL: &str = "https://updates.example.com/app/latest.yml";
    const ARTIFACT_URL: &str = "https://updates.example.com/app/App-Setup-1.3.0.exe";

    #[derive(Default)]
    struct RecordingExecutor {
        executed: Mutex<Vec<InstallHandoff>>,
    }

    #[async_trait]
    impl HandoffExecutor for RecordingExecutor {
        async fn execute(&self, handoff: &InstallHandoff) -> Result<(), crate::error::InstallError> {
            self.executed.lock().unwrap().push(handoff.clone());
            Ok(())
        }
    }

    fn sha512_hex(data: &[u8]) -> String {
        let mut acc = DigestAccumulator::new(DigestAlgorithm::Sha512);
        acc.update(data);
        acc.finalize().to_hex()
    }

    fn feed(version: &str, body: &[u8]) -> String {
        format!(
            "version: {version}\npath: App-Setup-{version}.exe\nsha512: {}\nreleaseDate: '2024-05-01T10:00:00Z'\n",
            sha512_hex(body)
        )
    }

    struct Fixture {
        _dir: TempDir,
        transport: MemoryTransport,
        executor: Arc<RecordingExecutor>,
        manager: UpdateManager,
        events: Arc<Mutex<Vec<&'static str>>>,
    }

    fn fixture(current: &str, resume: ResumeStrategy) -> Fixture {
        let dir = TempDir::new().unwrap();
        let transport = MemoryTransport::new();
        let executor = Arc::new(RecordingExecutor::default());

        let mut config = UpdateConfig::generic(BASE);
        config.staging_dir = Some(dir.path().join("pending"));
        config.network.resume = resume;

        let manager = UpdateManager::builder(config, AppVersion::parse(current).unwrap())
            .with_host(HostPlatform::new(Platform::Win, Arch::X64))
            .with_transport(Arc::new(transport.clone()))
            .with_executor(executor.clone())
            .with_rollout_bucket(RolloutBucket::new(42).unwrap())
            .build()
            .unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        manager.subscribe(move |event| {
            if !matches!(event, UpdaterEvent::DownloadProgress(_)) {
                sink.lock().unwrap().push(event.name());
            }
        });

        Fixture {
            _dir: dir,
            transport,
            executor,
            manager,
            events,
        }
    }

    #[tokio::test]
    async fn test_full_cycle_state_transitions() {
        let f = fixture("1.2.0", ResumeStrategy::Restart);
        let body = b"installer bytes".to_vec();
        f.transport.insert(FEED_URL, MemoryResponse::ok(feed("1.3.0", &body)));
        f.transport.insert(ARTIFACT_URL, MemoryResponse::ok(body.clone()));

        assert_eq!(f.manager.state(), ClientState::Idle);
        let check = f.manager.check_for_updates().await.unwrap();
        assert!(check.is_update_available);
        assert_eq!(f.manager.state(), ClientState::UpdateAvailable);

        let downloaded = f.manager.download_update().await.unwrap();
        assert_eq!(f.manager.state(), ClientState::Downloaded);
        assert_eq!(downloaded.files, vec![downloaded.artifact.path.clone()]);
        assert_eq!(std::fs::read(&downloaded.artifact.path).unwrap(), body);

        let handoff = f.manager.quit_and_install().await.unwrap();
        assert_eq!(handoff.action, InstallAction::RunInstaller);
        assert_eq!(f.manager.state(), ClientState::Installing);
        assert_eq!(f.executor.executed.lock().unwrap().len(), 1);

        assert_eq!(
            *f.events.lock().unwrap(),
            vec!["checking-for-update", "update-available", "update-downloaded"]
        );
    }

    #[tokio::test]
    async fn test_usage_errors_fail_fast() {
        let f = fixture("1.2.0", ResumeStrategy::Restart);
        let body = b"bytes".to_vec();
        f.transport.insert(FEED_URL, MemoryResponse::ok(feed("1.3.0", &body)));
        f.transport.insert(ARTIFACT_URL, MemoryResponse::ok(body));

        let err = f.manager.download_update().await.unwrap_err();
        assert!(matches!(err, UpdateError::Usage(UsageError::NoUpdateAvailable)));
        assert!(matches!(
            f.manager.quit_and_install().await,
            Err(UpdateError::Usage(UsageError::NothingDownloaded))
        ));
        assert_eq!(f.manager.cancel_download(), Err(UsageError::NoActiveDownload));
        assert!(f.events.lock().unwrap().is_empty());

        f.manager.check_for_updates().await.unwrap();
        f.manager.download_update().await.unwrap();
        let err = f.manager.download_update().await.unwrap_err();
        assert!(matches!(
            err,
            UpdateError::Usage(UsageError::DownloadAlreadyRequested(ref v)) if v == "1.3.0"
        ));
        assert_eq!(f.manager.state(), ClientState::Downloaded);
    }

    #[tokio::test]
    async fn test_concurrent_checks_coalesce() {
        let f = fixture("1.2.0", ResumeStrategy::Restart);
        f.transport.insert(
            FEED_URL,
            MemoryResponse::ok(feed("1.3.0", b"x")).with_chunk_delay(Duration::from_millis(20)),
        );

        let (a, b) = tokio::join!(f.manager.check_for_updates(), f.manager.check_for_updates());
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(f.transport.request_count(FEED_URL), 1);
        assert_eq!(
            *f.events.lock().unwrap(),
            vec!["checking-for-update", "update-available"]
        );
    }

    #[tokio::test]
    async fn test_feed_failure_returns_to_idle() {
        let f = fixture("1.2.0", ResumeStrategy::Restart);
        f.transport.insert(FEED_URL, MemoryResponse::status(503));

        let observed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&observed);
        let observer = f.manager.clone();
        f.manager.subscribe(move |event| {
            if let UpdaterEvent::Error(_) = event {
                *sink.lock().unwrap() = Some(observer.state());
            }
        });

        let err = f.manager.check_for_updates().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Feed);
        assert!(err.is_retryable());
        assert_eq!(*observed.lock().unwrap(), Some(ClientState::Error));
        assert_eq!(f.manager.state(), ClientState::Idle);
        assert_eq!(*f.events.lock().unwrap(), vec!["checking-for-update", "error"]);

        f.transport.insert(FEED_URL, MemoryResponse::ok(feed("1.3.0", b"x")));
        assert!(f.manager.check_for_updates().await.unwrap().is_update_available);
    }

    #[tokio::test]
    async fn test_malformed_feed_is_error_event() {
        let f = fixture("1.2.0", ResumeStrategy::Restart);
        f.transport.insert(FEED_URL, MemoryResponse::ok(&b"{ not: [valid"[..]));

        let err = f.manager.check_for_updates().await.unwrap_err();
        assert!(matches!(err, UpdateError::Feed(FeedError::Malformed(_))));
        assert_eq!(f.manager.state(), ClientState::Idle);
    }

    #[tokio::test]
    async fn test_download_failure_requires_new_check() {
        let f = fixture("1.2.0", ResumeStrategy::Range);
        let body = vec![9u8; 2048];
        f.transport.insert(FEED_URL, MemoryResponse::ok(feed("1.3.0", &body)));
        f.transport.insert(
            ARTIFACT_URL,
            MemoryResponse::ok(body.clone())
                .with_chunk_size(512)
                .with_range_support()
                .failing_once_after(1024),
        );

        f.manager.check_for_updates().await.unwrap();
        let err = f.manager.download_update().await.unwrap_err();
        assert!(matches!(
            err,
            UpdateError::Download(DownloadError::Network { bytes_written: 1024, .. })
        ));
        assert_eq!(f.manager.state(), ClientState::Idle);
        assert!(matches!(
            f.manager.download_update().await,
            Err(UpdateError::Usage(UsageError::NoUpdateAvailable))
        ));

        f.manager.check_for_updates().await.unwrap();
        let downloaded = f.manager.download_update().await.unwrap();
        assert_eq!(std::fs::read(&downloaded.artifact.path).unwrap(), body);
        assert_eq!(f.transport.requests().last().unwrap().range_start, Some(1024));
    }

    fn slow_release(f: &Fixture) {
        let body = vec![3u8; 16 * 1024];
        f.transport.insert(FEED_URL, MemoryResponse::ok(feed("1.3.0", &body)));
        f.transport.insert(
            ARTIFACT_URL,
            MemoryResponse::ok(body)
                .with_chunk_size(256)
                .with_chunk_delay(Duration::from_millis(10)),
        );
    }

    async fn wait_for_state(manager: &UpdateManager, state: ClientState) {
        for _ in 0..200 {
            if manager.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.state(), state);
    }

    #[tokio::test]
    async fn test_abandoned_download_can_still_be_cancelled() {
        let f = fixture("1.2.0", ResumeStrategy::Restart);
        slow_release(&f);
        f.manager.check_for_updates().await.unwrap();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), f.manager.download_update()).await;
        assert!(abandoned.is_err());
        assert_eq!(f.manager.state(), ClientState::Downloading);

        f.manager.cancel_download().unwrap();
        wait_for_state(&f.manager, ClientState::Idle).await;
        assert_eq!(
            *f.events.lock().unwrap(),
            vec!["checking-for-update", "update-available", "update-cancelled"]
        );
        assert!(f.manager.check_for_updates().await.unwrap().is_update_available);
    }

    #[tokio::test]
    async fn test_abandoned_download_still_completes() {
        let f = fixture("1.2.0", ResumeStrategy::Restart);
        slow_release(&f);
        f.manager.check_for_updates().await.unwrap();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), f.manager.download_update()).await;
        assert!(abandoned.is_err());

        wait_for_state(&f.manager, ClientState::Downloaded).await;
        assert!(f.manager.downloaded_update().is_some());
        assert_eq!(f.events.lock().unwrap().last(), Some(&"update-downloaded"));
        assert!(f.manager.quit_and_install().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_progress_listener_observes_downloading() {
        let f = fixture("1.2.0", ResumeStrategy::Restart);
        slow_release(&f);
        f.manager.check_for_updates().await.unwrap();

        let first_progress = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&first_progress);
        let observer = f.manager.clone();
        f.manager.subscribe(move |event| {
            if let UpdaterEvent::DownloadProgress(_) = event {
                let mut first = sink.lock().unwrap();
                if first.is_none() {
                    *first = Some((observer.state(), observer.cancel_download()));
                }
            }
        });

        let err = f.manager.download_update().await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(
            *first_progress.lock().unwrap(),
            Some((ClientState::Downloading, Ok(())))
        );
        assert_eq!(f.manager.state(), ClientState::Idle);
    }

    #[tokio::test]
    async fn test_recheck_keeps_staged_download() {
        let f = fixture("1.2.0", ResumeStrategy::Restart);
        let body = b"bytes".to_vec();
        f.transport.insert(FEED_URL, MemoryResponse::ok(feed("1.3.0", &body)));
        f.transport.insert(ARTIFACT_URL, MemoryResponse::ok(body));

        f.manager.check_for_updates().await.unwrap();
        f.manager.download_update().await.unwrap();
        f.manager.check_for_updates().await.unwrap();

        assert_eq!(f.manager.state(), ClientState::Downloaded);
        assert!(f.manager.downloaded_update().is_some());
        assert_eq!(f.transport.request_count(ARTIFACT_URL), 1);
    }

    #[test]
    fn test_build_rejects_bad_publisher_key() {
        let dir = TempDir::new().unwrap();
        let mut config = UpdateConfig::generic(BASE);
        config.staging_dir = Some(dir.path().to_path_buf());
        config.publisher_keys = vec!["ed25519:nope".to_string()];

        let result = UpdateManager::builder(config, AppVersion::new(1, 0, 0))
            .with_transport(Arc::new(MemoryTransport::new()))
            .build();
        assert!(matches!(result, Err(UpdateError::Config(_))));
    }

    #[test]
    fn test_build_persists_install_id() {
        let dir = TempDir::new().unwrap();
        let mut config = UpdateConfig::generic(BASE);
        config.staging_dir = Some(dir.path().to_path_buf());

        let build = || {
            UpdateManager::builder(config.clone(), AppVersion::new(1, 0, 0))
                .with_transport(Arc::new(MemoryTransport::new()))
                .build()
                .unwrap()
        };
        let first = build().policy().rollout_bucket();
        let second = build().policy().rollout_bucket();
        assert!(first.is_some());
        assert_eq!(first, second);
        assert!(dir.path().join(".updater-id").exists());
    }
}

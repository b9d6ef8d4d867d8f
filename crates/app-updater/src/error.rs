//! Error types for the update system.
//!
//! Each stage of the update cycle has its own error family so the host can
//! tell a network hiccup apart from a tampered payload. [`UpdateError`]
//! wraps them all and is what the `error` event carries.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Errors fetching or decoding the release feed.
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    /// Feed request returned a non-success HTTP status
    #[error("feed request to {url} failed with status {status}")]
    HttpStatus { url: String, status: u16 },

    /// Transport-level failure while fetching the feed
    #[error("feed transport error: {0}")]
    Transport(String),

    /// Feed fetch exceeded the configured timeout
    #[error("feed fetch timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The document is not valid YAML/JSON or has an unexpected shape
    #[error("malformed feed: {0}")]
    Malformed(String),

    /// The feed listed entries but none of them were usable
    #[error("feed contains no valid entries ({skipped} skipped)")]
    NoValidEntries { skipped: usize },

    /// The feed URL could not be built or parsed
    #[error("invalid feed url: {0}")]
    InvalidUrl(String),
}

/// Entry-scoped problems found while reading an otherwise valid feed.
///
/// These never fail a whole check; the offending entry is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EligibilityError {
    /// Version string is not `major.minor.patch[-pre][+build]`
    #[error("invalid version {value:?}: {reason}")]
    InvalidVersion { value: String, reason: String },

    /// A required field is absent
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// The digest is not `algorithm:value` with a supported algorithm
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Platform name not recognised
    #[error("unknown platform {0:?}")]
    UnknownPlatform(String),

    /// Artifact descriptor has the wrong structure
    #[error("malformed artifact: {0}")]
    MalformedArtifact(String),

    /// Signature is not valid base64
    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),

    /// Staging percentage outside 0..=100
    #[error("staging percentage {0} out of range")]
    InvalidStaging(u64),
}

/// Errors while streaming an artifact to disk.
#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    /// Another artifact is already being downloaded by this client
    #[error("a download of {url} is already in progress")]
    AlreadyDownloading { url: String },

    /// Artifact request returned a non-success HTTP status
    #[error("download failed with status {status} after {bytes_written} bytes")]
    HttpStatus { status: u16, bytes_written: u64 },

    /// Transport failure mid-stream
    #[error("network error after {bytes_written} bytes: {message}")]
    Network { message: String, bytes_written: u64 },

    /// A single chunk did not arrive within the chunk timeout
    #[error("download timed out after {bytes_written} bytes")]
    Timeout { bytes_written: u64 },

    /// The stream ended before the declared size was reached
    #[error("download incomplete: {bytes_written} of {expected} bytes")]
    Incomplete { bytes_written: u64, expected: u64 },

    /// The download was cancelled by the caller
    #[error("download cancelled after {bytes_written} bytes")]
    Cancelled { bytes_written: u64 },

    /// Local filesystem failure in the staging directory
    #[error("staging I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },
}

impl DownloadError {
    /// Bytes that reached disk before the failure.
    pub fn bytes_written(&self) -> u64 {
        match self {
            Self::HttpStatus { bytes_written, .. }
            | Self::Network { bytes_written, .. }
            | Self::Timeout { bytes_written }
            | Self::Incomplete { bytes_written, .. }
            | Self::Cancelled { bytes_written } => *bytes_written,
            Self::AlreadyDownloading { .. } | Self::Io { .. } => 0,
        }
    }

    /// Whether retrying the same download might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::Incomplete { .. } => true,
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::AlreadyDownloading { .. } | Self::Cancelled { .. } | Self::Io { .. } => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }
}

/// The downloaded bytes cannot be trusted. Fatal for that artifact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    /// Computed digest differs from the feed-declared digest
    #[error("{algorithm} digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        algorithm: String,
        expected: String,
        actual: String,
    },

    /// More bytes arrived than the feed declared
    #[error("size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Publisher signature does not verify against any trusted key
    #[error("artifact signature verification failed: {0}")]
    SignatureInvalid(String),

    /// Publisher keys are configured but the artifact is unsigned
    #[error("artifact is not signed but publisher keys are configured")]
    SignatureMissing,
}

/// Platform handoff failures. Never retried automatically.
#[derive(Debug, Clone, Error)]
pub enum InstallError {
    /// The verified artifact kind cannot be installed by this strategy
    #[error("{strategy} cannot install a {kind} artifact")]
    UnsupportedArtifact { strategy: String, kind: String },

    /// The verified artifact disappeared before install
    #[error("verified artifact missing: {0}")]
    ArtifactMissing(PathBuf),

    /// Launching the installer failed
    #[error("failed to launch installer {program}: {message}")]
    LaunchFailed { program: PathBuf, message: String },
}

/// The lifecycle API was called out of order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    /// `download_update` before a check reported an available update
    #[error("no update is available; call check_for_updates first")]
    NoUpdateAvailable,

    /// `download_update` called twice for the same accepted update
    #[error("download already requested for version {0}")]
    DownloadAlreadyRequested(String),

    /// `quit_and_install` without a verified download
    #[error("no verified update has been downloaded")]
    NothingDownloaded,

    /// Operation not permitted in the current state
    #[error("operation `{operation}` not allowed while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// `cancel_download` with nothing in flight
    #[error("no download in progress")]
    NoActiveDownload,
}

/// Errors loading the local update configuration.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Config file could not be read or written
    #[error("config I/O error at {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// Config file content could not be decoded
    #[error("config parse error: {0}")]
    Parse(String),

    /// A value is present but unusable
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Discriminator for [`UpdateError`], convenient for matching in hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Feed,
    Eligibility,
    Download,
    Integrity,
    Install,
    Usage,
    Config,
}

/// Any failure surfaced by the update client.
#[derive(Debug, Clone, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Eligibility(#[from] EligibilityError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl UpdateError {
    /// Which error family this is.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Feed(_) => ErrorKind::Feed,
            Self::Eligibility(_) => ErrorKind::Eligibility,
            Self::Download(_) => ErrorKind::Download,
            Self::Integrity(_) => ErrorKind::Integrity,
            Self::Install(_) => ErrorKind::Install,
            Self::Usage(_) => ErrorKind::Usage,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether the host may reasonably retry the failed operation.
    ///
    /// Integrity failures are never retryable: the payload may be tampered.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Feed(FeedError::Transport(_))
            | Self::Feed(FeedError::Timeout { .. })
            | Self::Feed(FeedError::HttpStatus { .. }) => true,
            Self::Download(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// True if this is a cancelled download rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Download(e) if e.is_cancelled())
    }
}

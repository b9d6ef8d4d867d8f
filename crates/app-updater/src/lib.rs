//! # app-updater
//!
//! Auto-update client for desktop applications.
//!
//! This crate handles:
//! - Parsing the release feed published for a channel and platform
//! - Choosing the release to install (channel, prerelease, downgrade,
//!   staged rollout)
//! - Streaming the artifact to a staging directory with cancellation and
//!   optional resume
//! - Digest, size, and optional Ed25519 signature verification before the
//!   artifact is promoted
//! - Handing the verified artifact to a platform install strategy
//!
//! ## Security
//!
//! Nothing downloaded is executed or moved into place before it matches the
//! digest and size declared by the feed. Partial files never carry the final
//! file name. When publisher keys are configured, every artifact must also
//! carry a valid signature.

pub mod channel;
pub mod config;
pub mod download;
pub mod eligibility;
pub mod error;
pub mod events;
pub mod feed;
pub mod http;
pub mod install;
pub mod manager;
pub mod platform;
#[cfg(test)]
mod proptests;
pub mod rollout;
pub mod verify;
pub mod version;

// Re-export main types for convenience
pub use channel::ReleaseChannel;
pub use config::{InstallConfig, NetworkConfig, ProviderConfig, UpdateConfig};
pub use download::{
    ArtifactDownloader, DownloadHandle, DownloadProgress, DownloaderConfig, ProgressCallback,
    ResumeStrategy, VerifiedArtifact,
};
pub use eligibility::{UpdateCheckResult, UpdateEligibilityPolicy};
pub use error::{
    ConfigError, DownloadError, EligibilityError, ErrorKind, FeedError, InstallError,
    IntegrityError, UpdateError, UsageError,
};
pub use events::{DownloadedUpdate, EventBus, SubscriptionId, UpdateInfo, UpdaterEvent};
pub use feed::{ArtifactDescriptor, ArtifactKind, FeedParser, ParsedFeed, ReleaseManifestEntry};
pub use http::{HttpRequest, HttpResponse, HttpTransport, MemoryResponse, MemoryTransport, ReqwestTransport};
pub use install::{
    strategy_for, GenericArchiveStrategy, HandoffExecutor, InstallAction, InstallHandoff,
    InstallOptions, MacBundleStrategy, PlatformInstallStrategy, ProcessExecutor, StrategyVariant,
    WindowsInstallerStrategy,
};
pub use manager::{ClientState, UpdateManager, UpdateManagerBuilder};
pub use platform::{Arch, HostPlatform, Platform};
pub use rollout::RolloutBucket;
pub use verify::{ComputedDigest, DigestAlgorithm, ExpectedDigest, IntegrityVerifier};
pub use version::AppVersion;

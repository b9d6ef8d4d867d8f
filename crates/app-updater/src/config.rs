//! Configuration structures for the update client.
//!
//! The config is read once when the client is built, usually from the
//! `app-update.yml` written next to the application by its packager. TOML
//! and JSON files are accepted too, chosen by extension.

use std::path::{Path, PathBuf};

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::channel::ReleaseChannel;
use crate::download::ResumeStrategy;
use crate::error::{ConfigError, FeedError};
use crate::install::InstallOptions;
use crate::platform::Platform;
use crate::verify::parse_publisher_key;

/// File name of the persisted install id inside the staging directory.
const INSTALL_ID_FILE: &str = ".updater-id";

/// Main update configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Where the feed is published
    #[serde(flatten)]
    pub provider: ProviderConfig,

    /// Release channel (stable, beta, alpha, or custom)
    #[serde(default)]
    pub channel: ReleaseChannel,

    /// Consider prerelease builds regardless of channel
    #[serde(default, alias = "allowPrerelease")]
    pub allow_prerelease: bool,

    /// Accept versions older than the running one
    #[serde(default, alias = "allowDowngrade")]
    pub allow_downgrade: bool,

    /// Directory for partial and verified downloads
    #[serde(default, alias = "stagingDir", skip_serializing_if = "Option::is_none")]
    pub staging_dir: Option<PathBuf>,

    /// File holding the per-install rollout id
    #[serde(default, alias = "installIdPath", skip_serializing_if = "Option::is_none")]
    pub install_id_path: Option<PathBuf>,

    /// Trusted publisher keys, `ed25519:<hex|base64>`
    #[serde(default, alias = "publisherKeys")]
    pub publisher_keys: Vec<String>,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Install handoff configuration
    #[serde(default)]
    pub install: InstallConfig,
}

impl UpdateConfig {
    /// Config for a generic provider serving feeds under `url`.
    pub fn generic(url: impl Into<String>) -> Self {
        Self {
            provider: ProviderConfig::Generic {
                url: url.into(),
                use_channel_file: true,
            },
            channel: ReleaseChannel::default(),
            allow_prerelease: false,
            allow_downgrade: false,
            network: NetworkConfig::default(),
            install: InstallConfig::default(),
            staging_dir: None,
            install_id_path: None,
            publisher_keys: Vec::new(),
        }
    }

    /// Load configuration from a YAML, TOML or JSON file.
    ///
    /// The format follows the extension; anything else is read as YAML.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let config: Self = match ConfigFormat::of(path) {
            ConfigFormat::Toml => {
                toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            ConfigFormat::Json => {
                serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            ConfigFormat::Yaml => {
                serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration, format chosen by extension.
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let io_error = |e: std::io::Error| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }

        let content = match ConfigFormat::of(path) {
            ConfigFormat::Toml => {
                toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            ConfigFormat::Json => serde_json::to_string_pretty(self)
                .map_err(|e| ConfigError::Parse(e.to_string()))?,
            ConfigFormat::Yaml => {
                serde_yaml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
        };
        std::fs::write(path, content).map_err(io_error)
    }

    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.provider {
            ProviderConfig::Generic { url, .. } => {
                Url::parse(url)
                    .map_err(|e| ConfigError::Invalid(format!("generic provider url {url:?}: {e}")))?;
            }
            ProviderConfig::Github { owner, repo, .. } => {
                if owner.trim().is_empty() || repo.trim().is_empty() {
                    return Err(ConfigError::Invalid(
                        "github provider requires owner and repo".to_string(),
                    ));
                }
            }
        }
        if self.network.feed_timeout_secs == 0 || self.network.chunk_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".to_string()));
        }
        self.parse_publisher_keys().map(|_| ())
    }

    /// Parse publisher keys into Ed25519 verifying keys.
    pub fn parse_publisher_keys(&self) -> Result<Vec<VerifyingKey>, ConfigError> {
        self.publisher_keys
            .iter()
            .map(|key| parse_publisher_key(key))
            .collect()
    }

    /// Get the staging directory, using the default if not specified.
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(dirs_default_staging_dir)
    }

    pub fn install_id_path(&self) -> PathBuf {
        self.install_id_path
            .clone()
            .unwrap_or_else(|| self.staging_dir().join(INSTALL_ID_FILE))
    }

    /// Feed URL for `channel` on `platform`.
    pub fn feed_url(&self, channel: &ReleaseChannel, platform: Platform) -> Result<Url, FeedError> {
        self.provider.feed_url(channel, platform)
    }
}

enum ConfigFormat {
    Yaml,
    Toml,
    Json,
}

impl ConfigFormat {
    fn of(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("toml") => Self::Toml,
            Some("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

/// Feed hosting provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// Any static HTTP(S) server
    Generic {
        url: String,
        /// Append the channel feed file name to `url`
        #[serde(default = "default_true", alias = "useChannelFile")]
        use_channel_file: bool,
    },
    /// Release assets of a GitHub repository
    Github {
        owner: String,
        repo: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
    },
}

impl ProviderConfig {
    /// Feed URL for `channel` on `platform`.
    ///
    /// Channel feed files are `latest.yml`, `beta.yml`, `alpha.yml` or
    /// `<custom>.yml`, with a `-mac` or `-linux` suffix off Windows.
    pub fn feed_url(&self, channel: &ReleaseChannel, platform: Platform) -> Result<Url, FeedError> {
        let file = format!("{}{}.yml", channel.feed_file_stem(), platform.feed_suffix());

        match self {
            Self::Generic {
                url,
                use_channel_file,
            } => {
                let base = Url::parse(url).map_err(|e| FeedError::InvalidUrl(format!("{url}: {e}")))?;
                if !use_channel_file {
                    return Ok(base);
                }
                let base = if base.path().ends_with('/') {
                    base
                } else {
                    let with_slash = format!("{}/", base.as_str());
                    Url::parse(&with_slash).map_err(|e| FeedError::InvalidUrl(e.to_string()))?
                };
                base.join(&file)
                    .map_err(|e| FeedError::InvalidUrl(format!("{file}: {e}")))
            }
            Self::Github { owner, repo, host } => {
                let host = host.as_deref().unwrap_or("github.com");
                let url = format!("https://{host}/{owner}/{repo}/releases/latest/download/{file}");
                Url::parse(&url).map_err(|e| FeedError::InvalidUrl(format!("{url}: {e}")))
            }
        }
    }
}

/// Network configuration for feed fetches and downloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Whole feed fetch timeout in seconds
    #[serde(default = "default_feed_timeout")]
    pub feed_timeout_secs: u64,

    /// Timeout for each download chunk in seconds
    #[serde(default = "default_chunk_timeout")]
    pub chunk_timeout_secs: u64,

    /// How interrupted downloads continue
    #[serde(default)]
    pub resume: ResumeStrategy,

    /// User agent override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            feed_timeout_secs: default_feed_timeout(),
            chunk_timeout_secs: default_chunk_timeout(),
            resume: ResumeStrategy::default(),
            user_agent: None,
        }
    }
}

impl NetworkConfig {
    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| format!("app-updater/{}", env!("CARGO_PKG_VERSION")))
    }
}

/// Install handoff configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Run installers without UI
    #[serde(default)]
    pub silent: bool,

    /// Request elevation for the handoff
    #[serde(default)]
    pub elevate: bool,

    /// Prefer differential patches when the feed offers them
    #[serde(default)]
    pub prefer_differential: bool,

    /// Target for bundle and archive installs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_dir: Option<PathBuf>,
}

impl InstallConfig {
    pub fn to_options(&self) -> InstallOptions {
        InstallOptions {
            silent: self.silent,
            elevate: self.elevate,
            install_dir: self.install_dir.clone(),
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_feed_timeout() -> u64 {
    30
}

fn default_chunk_timeout() -> u64 {
    60
}

/// Get the default staging directory.
fn dirs_default_staging_dir() -> PathBuf {
    // Use platform-appropriate cache directory
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("LOCALAPPDATA") {
            return PathBuf::from(appdata).join("app-updater").join("pending");
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Caches")
                .join("app-updater")
                .join("pending");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(cache_home) = std::env::var("XDG_CACHE_HOME") {
            return PathBuf::from(cache_home).join("app-updater").join("pending");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".cache")
                .join("app-updater")
                .join("pending");
        }
    }

    // Fallback
    std::env::temp_dir().join("app-updater").join("pending")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_yaml_app_update_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app-update.yml");
        std::fs::write(
            &path,
            "provider: generic\nurl: https://example.com/downloads\nchannel: beta\nupdaterCacheDirName: test-updater\n",
        )
        .unwrap();

        let config = UpdateConfig::load_from_file(&path).unwrap();
        assert_eq!(config.channel, ReleaseChannel::Beta);
        assert_eq!(
            config.provider,
            ProviderConfig::Generic {
                url: "https://example.com/downloads".to_string(),
                use_channel_file: true
            }
        );
        assert_eq!(config.network, NetworkConfig::default());
        assert_eq!(config.network.resume, ResumeStrategy::Restart);
    }

    #[test]
    fn test_load_toml_and_json() {
        let dir = TempDir::new().unwrap();

        let toml_path = dir.path().join("update.toml");
        std::fs::write(
            &toml_path,
            "provider = \"github\"\nowner = \"acme\"\nrepo = \"app\"\nallow_prerelease = true\n\n[network]\nresume = \"range\"\nchunk_timeout_secs = 5\n",
        )
        .unwrap();
        let config = UpdateConfig::load_from_file(&toml_path).unwrap();
        assert!(config.allow_prerelease);
        assert_eq!(config.network.resume, ResumeStrategy::Range);
        assert_eq!(config.network.chunk_timeout_secs, 5);
        assert_eq!(config.network.feed_timeout_secs, 30);

        let json_path = dir.path().join("update.json");
        std::fs::write(
            &json_path,
            r#"{"provider":"generic","url":"https://e.com/","allowDowngrade":true,"install":{"silent":true}}"#,
        )
        .unwrap();
        let config = UpdateConfig::load_from_file(&json_path).unwrap();
        assert!(config.allow_downgrade);
        assert!(config.install.silent);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app-update.yml");

        std::fs::write(&path, "provider: generic\nurl: not a url\n").unwrap();
        assert!(matches!(
            UpdateConfig::load_from_file(&path),
            Err(ConfigError::Invalid(_))
        ));

        std::fs::write(&path, "provider: ftp\nurl: ftp://e.com\n").unwrap();
        assert!(matches!(
            UpdateConfig::load_from_file(&path),
            Err(ConfigError::Parse(_))
        ));

        std::fs::write(
            &path,
            "provider: generic\nurl: https://e.com\npublisher_keys: [\"ed25519:00\"]\n",
        )
        .unwrap();
        assert!(UpdateConfig::load_from_file(&path).is_err());

        assert!(matches!(
            UpdateConfig::load_from_file(&dir.path().join("missing.yml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let mut config = UpdateConfig::generic("https://e.com/updates");
        config.channel = ReleaseChannel::Custom("nightly".to_string());
        config.staging_dir = Some(dir.path().join("staging"));

        for name in ["app-update.yml", "app-update.toml", "app-update.json"] {
            let path = dir.path().join(name);
            config.save_to_file(&path).unwrap();
            let loaded = UpdateConfig::load_from_file(&path).unwrap();
            assert_eq!(loaded.provider, config.provider);
            assert_eq!(loaded.channel, config.channel);
            assert_eq!(loaded.staging_dir, config.staging_dir);
        }
    }

    #[test]
    fn test_generic_feed_urls() {
        let config = UpdateConfig::generic("https://e.com/downloads");
        let url = |channel: ReleaseChannel, platform| {
            config.feed_url(&channel, platform).unwrap().to_string()
        };

        assert_eq!(url(ReleaseChannel::Stable, Platform::Win), "https://e.com/downloads/latest.yml");
        assert_eq!(url(ReleaseChannel::Beta, Platform::Mac), "https://e.com/downloads/beta-mac.yml");
        assert_eq!(
            url(ReleaseChannel::Custom("nightly".to_string()), Platform::LinuxGeneric),
            "https://e.com/downloads/nightly-linux.yml"
        );

        let verbatim = ProviderConfig::Generic {
            url: "https://e.com/feed.json".to_string(),
            use_channel_file: false,
        };
        assert_eq!(
            verbatim
                .feed_url(&ReleaseChannel::Beta, Platform::Win)
                .unwrap()
                .as_str(),
            "https://e.com/feed.json"
        );
    }

    #[test]
    fn test_github_feed_url() {
        let provider = ProviderConfig::Github {
            owner: "acme".to_string(),
            repo: "app".to_string(),
            host: None,
        };
        assert_eq!(
            provider
                .feed_url(&ReleaseChannel::Stable, Platform::Mac)
                .unwrap()
                .as_str(),
            "https://github.com/acme/app/releases/latest/download/latest-mac.yml"
        );
    }

    #[test]
    fn test_default_paths() {
        let mut config = UpdateConfig::generic("https://e.com");
        config.staging_dir = Some(PathBuf::from("/tmp/staging"));
        assert_eq!(config.install_id_path(), PathBuf::from("/tmp/staging/.updater-id"));
        assert!(config.network.user_agent().starts_with("app-updater/"));
    }
}

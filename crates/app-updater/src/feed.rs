//! Release feed decoding.
//!
//! A feed is a human-editable YAML or JSON document listing releases. The
//! parser is deliberately lenient:
//! - unknown fields are ignored
//! - an entry missing its version, artifact URL or digest is dropped with a
//!   warning instead of failing the whole feed
//! - entries with no artifact for the host platform are excluded
//!
//! Three document shapes are accepted: a bare list of entries, a mapping
//! with a `releases` list, or a single entry at the top level.

use std::cmp::Reverse;

use base64::Engine;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_yaml::Value;
use tracing::{debug, warn};
use url::Url;

use crate::channel::ReleaseChannel;
use crate::error::{EligibilityError, FeedError};
use crate::platform::{Arch, HostPlatform, Platform};
use crate::verify::ExpectedDigest;
use crate::version::AppVersion;

/// What a downloadable artifact is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Full installer executable (Windows)
    Installer,
    /// Differential patch against the installed version (Windows)
    Differential,
    /// Application bundle archive swapped in at quit time (macOS)
    Bundle,
    /// Generic archive unpacked over the install directory
    Archive,
}

impl ArtifactKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "installer" | "nsis" | "msi" => Some(Self::Installer),
            "differential" | "delta" | "patch" => Some(Self::Differential),
            "bundle" | "app" => Some(Self::Bundle),
            "archive" | "zip" | "tarball" | "appimage" => Some(Self::Archive),
            _ => None,
        }
    }

    /// Guess the kind from the file name when the feed does not say.
    fn infer(platform: Platform, url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        let path = lower.split(['?', '#']).next().unwrap_or(&lower);
        if path.ends_with(".patch") || path.ends_with(".delta") || path.ends_with(".blockmap") {
            return Self::Differential;
        }
        match platform {
            Platform::Win if path.ends_with(".zip") || path.ends_with(".7z") => Self::Archive,
            Platform::Win => Self::Installer,
            Platform::Mac => Self::Bundle,
            Platform::LinuxGeneric => Self::Archive,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Installer => "installer",
            Self::Differential => "differential",
            Self::Bundle => "bundle",
            Self::Archive => "archive",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One downloadable file of a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub platform: Platform,
    /// `None` means the artifact does not declare an architecture
    pub arch: Option<Arch>,
    /// Absolute URL (relative feed URLs are resolved against the feed)
    pub url: String,
    /// Declared size in bytes, if the feed provides one
    pub size: Option<u64>,
    pub digest: ExpectedDigest,
    /// Opaque publisher signature over the digest bytes
    pub signature: Option<Vec<u8>>,
    pub kind: ArtifactKind,
}

impl ArtifactDescriptor {
    /// Last path segment of the URL, used to name the staged file.
    pub fn file_name(&self) -> String {
        let path = self.url.split(['?', '#']).next().unwrap_or(&self.url);
        path.rsplit('/')
            .find(|segment| !segment.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| "artifact.bin".to_string())
    }

    fn matches_host(&self, host: &HostPlatform) -> bool {
        self.platform == host.platform
            && match self.arch {
                None | Some(Arch::Universal) => true,
                Some(arch) => arch == host.arch,
            }
    }
}

/// One release listed in a feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseManifestEntry {
    pub version: AppVersion,
    pub channel: ReleaseChannel,
    pub release_date: Option<DateTime<Utc>>,
    /// Host-applicable artifacts, best match first
    pub artifacts: Vec<ArtifactDescriptor>,
    /// Percentage of installs (0..=100) this release is rolled out to
    pub staging_percentage: Option<u8>,
    pub release_name: Option<String>,
    pub release_notes: Option<String>,
}

impl ReleaseManifestEntry {
    /// The artifact selected for the host platform.
    ///
    /// Entries produced by [`FeedParser`] always have at least one.
    pub fn artifact(&self) -> Option<&ArtifactDescriptor> {
        self.artifacts.first()
    }
}

/// Why an entry was left out of a parsed feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The entry is malformed
    Invalid(EligibilityError),
    /// The entry decoded but has an unexpected structure
    Malformed(String),
    /// The entry is valid but ships nothing for this host
    NotApplicable,
}

/// An entry the parser dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    /// Zero-based position of the entry in the document
    pub index: usize,
    pub reason: SkipReason,
}

/// Result of parsing a feed document.
#[derive(Debug, Clone, Default)]
pub struct ParsedFeed {
    /// Valid entries with a host artifact, in document order
    pub entries: Vec<ReleaseManifestEntry>,
    pub skipped: Vec<SkippedEntry>,
}

/// Decodes feed documents for one host platform.
#[derive(Debug, Clone)]
pub struct FeedParser {
    host: HostPlatform,
    base_url: Option<Url>,
    prefer_differential: bool,
}

impl FeedParser {
    pub fn new(host: HostPlatform) -> Self {
        Self {
            host,
            base_url: None,
            prefer_differential: false,
        }
    }

    /// Resolve relative artifact URLs against the feed's own URL.
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    /// Rank differential patches ahead of full installers.
    pub fn with_prefer_differential(mut self, prefer: bool) -> Self {
        self.prefer_differential = prefer;
        self
    }

    pub fn host(&self) -> &HostPlatform {
        &self.host
    }

    /// Parse raw feed bytes.
    ///
    /// # Errors
    ///
    /// - [`FeedError::Malformed`] if the document is not YAML/JSON or has an
    ///   unrecognised top-level shape
    /// - [`FeedError::NoValidEntries`] if the feed lists entries and every
    ///   one of them is invalid
    pub fn parse(&self, data: &[u8]) -> Result<ParsedFeed, FeedError> {
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(ParsedFeed::default());
        }
        let document: Value =
            serde_yaml::from_slice(data).map_err(|e| FeedError::Malformed(e.to_string()))?;

        let raw_entries = Self::entries_of(document)?;
        let total = raw_entries.len();
        let mut parsed = ParsedFeed::default();
        let mut invalid = 0usize;

        for (index, raw) in raw_entries.into_iter().enumerate() {
            match self.parse_entry(raw) {
                Ok(Some(entry)) => parsed.entries.push(entry),
                Ok(None) => {
                    debug!(index, host = %self.host, "Feed entry has no artifact for this host");
                    parsed.skipped.push(SkippedEntry {
                        index,
                        reason: SkipReason::NotApplicable,
                    });
                }
                Err(reason) => {
                    warn!(index, reason = ?reason, "Dropping invalid feed entry");
                    invalid += 1;
                    parsed.skipped.push(SkippedEntry { index, reason });
                }
            }
        }

        if total > 0 && invalid == total {
            return Err(FeedError::NoValidEntries { skipped: invalid });
        }

        debug!(
            entries = parsed.entries.len(),
            skipped = parsed.skipped.len(),
            "Feed parsed"
        );
        Ok(parsed)
    }

    fn entries_of(document: Value) -> Result<Vec<Value>, FeedError> {
        match document {
            Value::Null => Ok(Vec::new()),
            Value::Sequence(entries) => Ok(entries),
            Value::Mapping(mut map) => {
                if let Some(releases) = map.remove("releases") {
                    match releases {
                        Value::Sequence(entries) => Ok(entries),
                        Value::Null => Ok(Vec::new()),
                        _ => Err(FeedError::Malformed("`releases` must be a list".to_string())),
                    }
                } else if map.contains_key("version") {
                    Ok(vec![Value::Mapping(map)])
                } else {
                    Err(FeedError::Malformed(
                        "expected a list of releases, a `releases` key, or a single release"
                            .to_string(),
                    ))
                }
            }
            _ => Err(FeedError::Malformed(
                "feed root must be a list or a mapping".to_string(),
            )),
        }
    }

    /// `Ok(None)` means valid but not applicable to this host.
    fn parse_entry(&self, raw: Value) -> Result<Option<ReleaseManifestEntry>, SkipReason> {
        let raw: RawEntry =
            serde_yaml::from_value(raw).map_err(|e| SkipReason::Malformed(e.to_string()))?;

        let version_str = raw
            .version
            .as_deref()
            .ok_or(SkipReason::Invalid(EligibilityError::MissingField("version")))?;
        let version = AppVersion::parse(version_str).map_err(SkipReason::Invalid)?;

        let channel = raw
            .channel
            .as_deref()
            .map(ReleaseChannel::from_name)
            .unwrap_or_else(|| ReleaseChannel::from_version(&version));

        let staging_percentage = match raw.staging_percentage {
            None => None,
            Some(p) if p <= 100 => Some(p as u8),
            Some(p) => return Err(SkipReason::Invalid(EligibilityError::InvalidStaging(p))),
        };

        let release_date = raw.release_date.as_deref().and_then(parse_release_date);

        let mut artifacts = Vec::new();
        let mut first_error = None;

        let mut raw_artifacts = raw.artifacts.unwrap_or_default();
        if let Some(path) = raw.path.clone() {
            raw_artifacts.push(Value::Mapping(
                [
                    (Value::from("url"), Value::from(path)),
                    (
                        Value::from("sha512"),
                        raw.sha512.clone().map(Value::from).unwrap_or(Value::Null),
                    ),
                ]
                .into_iter()
                .collect(),
            ));
        }

        for raw_artifact in raw_artifacts {
            match self.parse_artifact(raw_artifact) {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => {
                    debug!(version = %version, error = %e, "Skipping malformed artifact");
                    first_error.get_or_insert(e);
                }
            }
        }

        if artifacts.is_empty() {
            return Err(SkipReason::Invalid(
                first_error.unwrap_or(EligibilityError::MissingField("url")),
            ));
        }

        artifacts.retain(|a| a.matches_host(&self.host));
        if artifacts.is_empty() {
            return Ok(None);
        }
        self.rank_artifacts(&mut artifacts);

        Ok(Some(ReleaseManifestEntry {
            version,
            channel,
            release_date,
            artifacts,
            staging_percentage,
            release_name: raw.release_name,
            release_notes: raw.release_notes,
        }))
    }

    fn parse_artifact(&self, raw: Value) -> Result<ArtifactDescriptor, EligibilityError> {
        let raw: RawArtifact = serde_yaml::from_value(raw)
            .map_err(|e| EligibilityError::MalformedArtifact(e.to_string()))?;

        let url = raw
            .url
            .filter(|u| !u.trim().is_empty())
            .ok_or(EligibilityError::MissingField("url"))?;

        let digest = match (raw.digest, raw.sha512, raw.sha256) {
            (Some(RawDigest::Prefixed(s)), _, _) => ExpectedDigest::parse(&s)?,
            (Some(RawDigest::Parts { algorithm, value }), _, _) => {
                ExpectedDigest::from_parts(&algorithm, &value)?
            }
            (None, Some(v), _) => ExpectedDigest::from_parts("sha512", &v)?,
            (None, None, Some(v)) => ExpectedDigest::from_parts("sha256", &v)?,
            (None, None, None) => return Err(EligibilityError::MissingField("digest")),
        };

        // Artifacts without a platform come from per-platform feed files.
        let platform = match raw.platform.as_deref() {
            None => self.host.platform,
            Some(name) => Platform::from_name(name)
                .ok_or_else(|| EligibilityError::UnknownPlatform(name.to_string()))?,
        };

        let arch = raw.arch.as_deref().and_then(Arch::from_name);

        let kind = raw
            .kind
            .as_deref()
            .and_then(ArtifactKind::from_name)
            .unwrap_or_else(|| ArtifactKind::infer(platform, &url));

        let signature = match raw.signature {
            None => None,
            Some(encoded) => Some(
                base64::engine::general_purpose::STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| EligibilityError::InvalidSignature(e.to_string()))?,
            ),
        };

        Ok(ArtifactDescriptor {
            platform,
            arch,
            url: self.resolve_url(&url),
            size: raw.size,
            digest,
            signature,
            kind,
        })
    }

    fn resolve_url(&self, url: &str) -> String {
        if Url::parse(url).is_ok() {
            return url.to_string();
        }
        match &self.base_url {
            Some(base) => base
                .join(url)
                .map(|u| u.to_string())
                .unwrap_or_else(|_| url.to_string()),
            None => url.to_string(),
        }
    }

    /// Order host artifacts so the first is the deterministic pick.
    fn rank_artifacts(&self, artifacts: &mut [ArtifactDescriptor]) {
        let host_arch = self.host.arch;
        let prefer_differential = self.prefer_differential;
        artifacts.sort_by_key(|a| {
            let arch_rank = match a.arch {
                Some(arch) if arch == host_arch => 0u8,
                Some(_) => 1,
                None => 2,
            };
            let kind_rank = match (a.kind, prefer_differential) {
                (ArtifactKind::Differential, true) => 0u8,
                (ArtifactKind::Differential, false) => 2,
                _ => 1,
            };
            (kind_rank, arch_rank, Reverse(a.size.is_some()))
        });
    }
}

fn parse_release_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    warn!(release_date = raw, "Ignoring unparseable release date");
    None
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default, deserialize_with = "de_scalar_string")]
    version: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default, alias = "releaseDate")]
    release_date: Option<String>,
    #[serde(default, alias = "stagingPercentage")]
    staging_percentage: Option<u64>,
    #[serde(default, alias = "files")]
    artifacts: Option<Vec<Value>>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    sha512: Option<String>,
    #[serde(default, alias = "releaseName")]
    release_name: Option<String>,
    #[serde(default, alias = "releaseNotes")]
    release_notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawArtifact {
    #[serde(default, alias = "os")]
    platform: Option<String>,
    #[serde(default)]
    arch: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    digest: Option<RawDigest>,
    #[serde(default)]
    sha512: Option<String>,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDigest {
    Prefixed(String),
    Parts { algorithm: String, value: String },
}

/// Versions like `2.0` may arrive as YAML numbers; keep them as text so
/// version parsing reports them properly.
fn de_scalar_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(other) => {
            return Err(serde::de::Error::custom(format!(
                "version must be a string, got {other:?}"
            )))
        }
    })
}

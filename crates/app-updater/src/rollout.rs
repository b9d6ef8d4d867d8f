//! Staged rollout identity.
//!
//! Each install carries a random UUID persisted next to the staging
//! directory. Its bucket (0..=99) is derived from the UUID bytes, so a host
//! sees the same staged-rollout decision on every check until the feed
//! changes.

use std::fmt;
use std::path::Path;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ConfigError;

/// Sticky per-install rollout bucket in `0..=99`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RolloutBucket(u8);

impl RolloutBucket {
    /// Returns `None` for values above 99.
    pub fn new(value: u8) -> Option<Self> {
        (value < 100).then_some(Self(value))
    }

    /// Derive the bucket from an install id.
    pub fn from_install_id(id: &Uuid) -> Self {
        let bytes = id.as_bytes();
        let tail = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        Self((tail % 100) as u8)
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    /// Whether a release staged at `percentage` is open to this install.
    ///
    /// A percentage of 0 means the rollout is halted.
    pub fn admits(&self, percentage: u8) -> bool {
        percentage > 0 && self.0 <= percentage
    }
}

impl fmt::Display for RolloutBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read the install id from `path`, creating it on first use.
///
/// A corrupt id file is replaced with a fresh id.
pub fn load_or_create_install_id(path: &Path) -> Result<Uuid, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => match Uuid::parse_str(content.trim()) {
            Ok(id) => {
                debug!(path = %path.display(), "Loaded install id");
                return Ok(id);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Install id corrupt, regenerating"),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
        }
    }

    let id = Uuid::new_v4();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
            path: parent.to_path_buf(),
            message: e.to_string(),
        })?;
    }
    std::fs::write(path, id.to_string()).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    info!(path = %path.display(), "Created install id");
    Ok(id)
}

//! Update eligibility policy.
//!
//! Picks at most one release from a parsed feed for this install. The
//! staged-rollout gate depends only on the feed and the install's sticky
//! [`RolloutBucket`], so repeated checks against an unchanged feed always
//! reach the same decision.

use std::cmp::Ordering;

use tracing::{debug, info};

use crate::channel::ReleaseChannel;
use crate::feed::ReleaseManifestEntry;
use crate::rollout::RolloutBucket;
use crate::version::AppVersion;

/// Outcome of one eligibility decision.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateCheckResult {
    pub selected_entry: Option<ReleaseManifestEntry>,
    pub is_update_available: bool,
}

impl UpdateCheckResult {
    pub fn available(entry: ReleaseManifestEntry) -> Self {
        Self {
            selected_entry: Some(entry),
            is_update_available: true,
        }
    }

    pub fn not_available() -> Self {
        Self {
            selected_entry: None,
            is_update_available: false,
        }
    }
}

/// Channel, downgrade and staged-rollout rules for one install.
#[derive(Debug, Clone, Default)]
pub struct UpdateEligibilityPolicy {
    channel: ReleaseChannel,
    allow_prerelease: bool,
    allow_downgrade: bool,
    rollout_bucket: Option<RolloutBucket>,
}

impl UpdateEligibilityPolicy {
    pub fn new(channel: ReleaseChannel) -> Self {
        Self {
            channel,
            ..Self::default()
        }
    }

    /// Consider prerelease builds of every maturity.
    pub fn with_allow_prerelease(mut self, allow: bool) -> Self {
        self.allow_prerelease = allow;
        self
    }

    /// Accept any version other than the current one, older included.
    pub fn with_allow_downgrade(mut self, allow: bool) -> Self {
        self.allow_downgrade = allow;
        self
    }

    pub fn with_rollout_bucket(mut self, bucket: RolloutBucket) -> Self {
        self.rollout_bucket = Some(bucket);
        self
    }

    pub fn channel(&self) -> &ReleaseChannel {
        &self.channel
    }

    pub fn rollout_bucket(&self) -> Option<RolloutBucket> {
        self.rollout_bucket
    }

    /// The channel actually used for filtering.
    ///
    /// `allow_prerelease` widens the built-in channels to alpha. Custom
    /// channels are left alone.
    pub fn effective_channel(&self) -> ReleaseChannel {
        match &self.channel {
            ReleaseChannel::Stable | ReleaseChannel::Beta if self.allow_prerelease => {
                ReleaseChannel::Alpha
            }
            other => other.clone(),
        }
    }

    /// Select the update target for `current` from host-applicable entries.
    ///
    /// Entries are sorted here; feed order carries no meaning.
    pub fn select(
        &self,
        current: &AppVersion,
        entries: &[ReleaseManifestEntry],
    ) -> UpdateCheckResult {
        let channel = self.effective_channel();

        let mut candidates: Vec<&ReleaseManifestEntry> = entries
            .iter()
            .filter(|entry| channel.accepts(&entry.channel))
            .filter(|entry| {
                if self.allow_downgrade {
                    entry.version != *current
                } else {
                    entry.version.is_newer_than(current)
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.version
                .cmp(&a.version)
                .then_with(|| compare_release_dates(b, a))
        });

        debug!(
            current = %current,
            channel = %channel,
            candidates = candidates.len(),
            "Evaluating update candidates"
        );

        for entry in candidates {
            if self.passes_staging_gate(entry) {
                info!(current = %current, version = %entry.version, "Update selected");
                return UpdateCheckResult::available(entry.clone());
            }
        }

        debug!(current = %current, "No eligible update");
        UpdateCheckResult::not_available()
    }

    fn passes_staging_gate(&self, entry: &ReleaseManifestEntry) -> bool {
        let percentage = match entry.staging_percentage {
            None | Some(100) => return true,
            Some(p) => p,
        };

        let admitted = self
            .rollout_bucket
            .map(|bucket| bucket.admits(percentage))
            .unwrap_or(false);

        if !admitted {
            debug!(
                version = %entry.version,
                staging_percentage = percentage,
                bucket = ?self.rollout_bucket.map(|b| b.value()),
                "Release held back by staged rollout"
            );
        }
        admitted
    }
}

/// Later release dates sort greater; a missing date sorts before any date.
fn compare_release_dates(a: &ReleaseManifestEntry, b: &ReleaseManifestEntry) -> Ordering {
    a.release_date.cmp(&b.release_date)
}

//! Lifecycle events and their subscribers.
//!
//! Events are delivered synchronously, in emission order, to every listener
//! subscribed at the time of emission. A listener may subscribe or
//! unsubscribe from inside a callback; the change applies from the next
//! event.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::channel::ReleaseChannel;
use crate::download::{DownloadProgress, VerifiedArtifact};
use crate::error::UpdateError;
use crate::feed::ReleaseManifestEntry;
use crate::version::AppVersion;

/// Host-facing description of an available release.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateInfo {
    pub version: AppVersion,
    pub channel: ReleaseChannel,
    pub release_date: Option<DateTime<Utc>>,
    pub release_name: Option<String>,
    pub release_notes: Option<String>,
    pub staging_percentage: Option<u8>,
    /// URL of the artifact that will be downloaded
    pub artifact_url: String,
    pub artifact_size: Option<u64>,
}

impl UpdateInfo {
    /// Build from a selected entry. `None` if it has no host artifact.
    pub fn from_entry(entry: &ReleaseManifestEntry) -> Option<Self> {
        let artifact = entry.artifact()?;
        Some(Self {
            version: entry.version.clone(),
            channel: entry.channel.clone(),
            release_date: entry.release_date,
            release_name: entry.release_name.clone(),
            release_notes: entry.release_notes.clone(),
            staging_percentage: entry.staging_percentage,
            artifact_url: artifact.url.clone(),
            artifact_size: artifact.size,
        })
    }
}

/// A finished, verified download.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedUpdate {
    pub info: UpdateInfo,
    /// Files reported by the install strategy; empty for macOS bundles
    pub files: Vec<PathBuf>,
    pub artifact: VerifiedArtifact,
}

/// Everything the client reports to the host.
#[derive(Debug, Clone)]
pub enum UpdaterEvent {
    CheckingForUpdate,
    UpdateAvailable(UpdateInfo),
    UpdateNotAvailable { current_version: AppVersion },
    DownloadProgress(DownloadProgress),
    UpdateDownloaded(DownloadedUpdate),
    /// A download was cancelled by the host. Not an error.
    UpdateCancelled(UpdateInfo),
    Error(UpdateError),
}

impl UpdaterEvent {
    /// Stable event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CheckingForUpdate => "checking-for-update",
            Self::UpdateAvailable(_) => "update-available",
            Self::UpdateNotAvailable { .. } => "update-not-available",
            Self::DownloadProgress(_) => "download-progress",
            Self::UpdateDownloaded(_) => "update-downloaded",
            Self::UpdateCancelled(_) => "update-cancelled",
            Self::Error(_) => "error",
        }
    }
}

/// Listener callback type.
pub type Listener = Arc<dyn Fn(&UpdaterEvent) + Send + Sync>;

/// Token returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Ordered, synchronous publish/subscribe for [`UpdaterEvent`]s.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<(SubscriptionId, Listener)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&UpdaterEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Deliver `event` to current listeners in subscription order.
    pub fn emit(&self, event: &UpdaterEvent) {
        let snapshot: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        trace!(event = event.name(), listeners = snapshot.len(), "Emitting event");
        for listener in snapshot {
            listener(event);
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<(SubscriptionId, Listener)>> {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(bus: &EventBus) -> (SubscriptionId, Arc<Mutex<Vec<&'static str>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = bus.subscribe(move |event| sink.lock().unwrap().push(event.name()));
        (id, seen)
    }

    #[test]
    fn test_events_delivered_in_order() {
        let bus = EventBus::new();
        let (_, seen) = recorder(&bus);

        bus.emit(&UpdaterEvent::CheckingForUpdate);
        bus.emit(&UpdaterEvent::UpdateNotAvailable {
            current_version: AppVersion::new(1, 0, 0),
        });
        bus.emit(&UpdaterEvent::DownloadProgress(DownloadProgress::new(1, None)));

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["checking-for-update", "update-not-available", "download-progress"]
        );
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let (first, first_seen) = recorder(&bus);
        let (_, second_seen) = recorder(&bus);
        assert_eq!(bus.listener_count(), 2);

        assert!(bus.unsubscribe(first));
        assert!(!bus.unsubscribe(first));
        bus.emit(&UpdaterEvent::CheckingForUpdate);

        assert!(first_seen.lock().unwrap().is_empty());
        assert_eq!(second_seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_subscribe_from_listener_does_not_deadlock() {
        let bus = Arc::new(EventBus::new());
        let inner = Arc::clone(&bus);
        bus.subscribe(move |_| {
            inner.subscribe(|_| {});
        });

        bus.emit(&UpdaterEvent::CheckingForUpdate);
        assert_eq!(bus.listener_count(), 2);
    }
}

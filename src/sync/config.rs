use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Floor for the poll interval (prevents runaway polling)
pub const MIN_POLL_INTERVAL_MS: u64 = 500;

/// Default poll cadence while polling is active
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;

/// Default quiet period before a scheduled push fires
pub const DEFAULT_DEBOUNCE_MS: u64 = 750;

/// Default cadence for keep-alive pings
pub const DEFAULT_KEEPALIVE_SECS: u64 = 240;

/// Delay before the deferred keep-alive probe that follows a transient
/// failure (the remote may be cold-starting)
pub(crate) const KEEPALIVE_NUDGE_SECS: u64 = 15;

/// Default bound on conflict-driven push retries
pub const DEFAULT_CONFLICT_RETRY_LIMIT: u32 = 3;

/// Default pause between conflict retries
pub const DEFAULT_CONFLICT_BACKOFF_MS: u64 = 100;

/// Per-request budget; a hung connection must not block future ticks
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 5;

/// Sync configuration for one client instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Base URL of the sync server (e.g., "https://sync.example.com")
    pub server_url: String,
    /// Poll interval in milliseconds (floored at [`MIN_POLL_INTERVAL_MS`])
    pub poll_interval_ms: u64,
    /// Debounce window for scheduled pushes, in milliseconds
    pub debounce_ms: u64,
    /// Keep-alive ping cadence in seconds; None disables keep-alive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keepalive_secs: Option<u64>,
    /// Maximum conflict-driven push retries before giving up
    pub conflict_retry_limit: u32,
    /// Fixed backoff between conflict retries, in milliseconds
    pub conflict_backoff_ms: u64,
    /// Request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            keepalive_secs: Some(DEFAULT_KEEPALIVE_SECS),
            conflict_retry_limit: DEFAULT_CONFLICT_RETRY_LIMIT,
            conflict_backoff_ms: DEFAULT_CONFLICT_BACKOFF_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn conflict_backoff(&self) -> Duration {
        Duration::from_millis(self.conflict_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn keepalive(&self) -> Option<Duration> {
        self.keepalive_secs.map(Duration::from_secs)
    }
}

/// Current sync state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// No credential configured; sync is inert
    Disabled,
    /// Ready; nothing in flight
    Idle,
    /// A pull is in flight
    Pulling,
    /// A push is in flight
    Pushing,
    /// Last operation failed
    Error,
    /// Remote unreachable (connect failure or timeout)
    Offline,
}

/// Sync status surfaced to callers and the status callback
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Current sync state
    pub state: SyncState,
    /// Last server-confirmed version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_version: Option<u64>,
    /// Last successful pull or push
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
    /// Error message if state is Error or Offline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Whether a debounced push is armed
    pub pending_push: bool,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            state: SyncState::Disabled,
            last_synced_version: None,
            last_success: None,
            last_error: None,
            pending_push: false,
        }
    }
}

/// Options for [`pull_latest`](crate::sync::SyncManager::pull_latest)
#[derive(Debug, Clone, Copy, Default)]
pub struct PullOptions {
    /// Skip reconciliation when the remote version matches the last synced
    /// version (idle polling avoids redundant re-renders)
    pub skip_if_unchanged: bool,
}

/// Options for [`push_state`](crate::sync::SyncManager::push_state)
#[derive(Debug, Clone, Copy, Default)]
pub struct PushOptions {
    /// Push even when nothing changed since the last sync
    pub force: bool,
    /// Conflict retries already consumed (callers normally leave this 0)
    pub retry_count: u32,
}

/// Outcome of a pull attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullOutcome {
    /// A remote document was applied to local state
    pub applied: bool,
    /// The remote has no document yet (first-time user)
    pub not_found: bool,
    /// Nothing was done (unchanged, stale remote, guard held, or disabled)
    pub skipped: bool,
    /// Error message for transient/unauthorized failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PullOutcome {
    pub fn applied() -> Self {
        Self {
            applied: true,
            ..Self::default()
        }
    }

    pub fn not_found() -> Self {
        Self {
            not_found: true,
            ..Self::default()
        }
    }

    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

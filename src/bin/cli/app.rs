use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use taskdeck_lib::session::Session;
use taskdeck_lib::store::{FileKeyValueStore, KeyValueStore};
use taskdeck_lib::sync::{SyncConfig, SyncManager};

/// Shared state for CLI commands: the profile's local store, its live
/// session, and a sync manager resumed from the profile's saved tracker.
pub struct App {
    pub server: String,
    pub profile: String,
    pub session: Arc<Session>,
    pub manager: Arc<SyncManager>,
    store: Arc<FileKeyValueStore>,
}

impl App {
    /// Initialize from the default data directory.
    pub fn open(server: &str, profile: &str) -> Result<Self> {
        let store = Arc::new(
            FileKeyValueStore::open_default().context("Failed to open profile store")?,
        );
        let session = Arc::new(Session::open(store.clone(), profile));

        let token = store
            .get(&auth_key(profile))
            .context("Failed to read stored credentials")?;
        let config = SyncConfig {
            server_url: server.trim_end_matches('/').to_string(),
            ..SyncConfig::default()
        };
        let manager = SyncManager::new(session.clone(), config, token.as_deref());

        // Each CLI run is a fresh process; restore the synced-version
        // tracker so pushes stay conditional across invocations.
        if let Ok(Some(raw)) = store.get(&synced_key(profile)) {
            if let Ok(version) = raw.parse::<u64>() {
                manager.resume_from(version);
            }
        }

        Ok(Self {
            server: server.trim_end_matches('/').to_string(),
            profile: profile.to_string(),
            session,
            manager,
            store,
        })
    }

    pub fn require_login(&self) -> Result<()> {
        if !self.manager.enabled() {
            bail!(
                "Not logged in (run `taskdeck-cli login <email>` first, profile '{}')",
                self.profile
            );
        }
        Ok(())
    }

    pub fn stored_token(&self) -> Option<String> {
        self.store.get(&auth_key(&self.profile)).ok().flatten()
    }

    pub fn save_token(&self, token: &str) -> Result<()> {
        self.store
            .set(&auth_key(&self.profile), token)
            .context("Failed to store credentials")
    }

    pub fn clear_credentials(&self) -> Result<()> {
        self.store
            .remove(&auth_key(&self.profile))
            .context("Failed to clear credentials")?;
        self.store
            .remove(&synced_key(&self.profile))
            .context("Failed to clear sync tracker")?;
        Ok(())
    }

    /// Persist the synced-version tracker for the next invocation.
    pub fn save_sync_tracker(&self) {
        if let Some(version) = self.manager.last_synced_version() {
            if let Err(e) = self
                .store
                .set(&synced_key(&self.profile), &version.to_string())
            {
                log::warn!("Failed to persist sync tracker: {}", e);
            }
        }
    }

    /// Plain HTTP client for the auth endpoints (used before a token exists).
    pub fn http(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")
    }
}

fn auth_key(profile: &str) -> String {
    format!("auth.{}", profile)
}

fn synced_key(profile: &str) -> String {
    format!("synced.{}", profile)
}

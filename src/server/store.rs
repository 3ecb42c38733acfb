//! Server-side persistence: per-user state documents plus the account and
//! token tables, behind async traits so tests can swap in memory-backed
//! stores.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::state::{DocumentMeta, StateDocument};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version conflict: stored document is at v{current_version}")]
    Conflict { current_version: u64 },

    #[error("Data directory not found")]
    DataDirNotFound,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Per-user document storage with compare-and-set writes.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load a user's stored document; None when they have never pushed.
    async fn load(&self, user: &str) -> Result<Option<StateDocument>>;

    /// Store a user's document, guarded by an optimistic precondition.
    ///
    /// `expected_version` of None writes unconditionally (the first seed
    /// from a device that has never synced). Otherwise the write is
    /// rejected with [`StoreError::Conflict`] when the stored version has
    /// already moved past the expectation. Accepted writes are stamped so
    /// the stored version never goes backwards: at least one past whatever
    /// was stored before. The stamped meta is returned for the client to
    /// adopt.
    async fn save(
        &self,
        user: &str,
        state: StateDocument,
        expected_version: Option<u64>,
    ) -> Result<DocumentMeta>;
}

/// Account and bearer-token records.
#[async_trait]
pub trait AuthStore: Send + Sync {
    async fn load_user(&self, email: &str) -> Result<Option<UserRecord>>;
    async fn save_user(&self, user: &UserRecord) -> Result<()>;
    async fn list_tokens(&self) -> Result<Vec<TokenRecord>>;
    async fn save_token(&self, token: &TokenRecord) -> Result<()>;
    async fn revoke_token(&self, digest: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub email: String,
    /// PHC-formatted argon2 hash.
    pub password_hash: String,
    pub created_at: i64,
}

/// Issued bearer token. Only the SHA-256 digest of the token is stored;
/// the raw value exists client-side only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub digest: String,
    pub email: String,
    pub created_at: i64,
}

/// Shared compare-and-set gate: reject stale writers, stamp accepted ones.
fn check_and_stamp(
    stored_version: Option<u64>,
    expected_version: Option<u64>,
    incoming: &mut StateDocument,
) -> Result<()> {
    if let Some(stored) = stored_version {
        if expected_version.is_some_and(|expected| stored > expected) {
            return Err(StoreError::Conflict {
                current_version: stored,
            });
        }
        incoming.meta.version = incoming.meta.version.max(stored + 1);
    }
    Ok(())
}

// ===== File-backed stores =====

/// Documents as one JSON file per user under `<base>/states/`.
pub struct FileStateStore {
    base_path: PathBuf,
    // Serializes the read-check-write cycle; handlers run concurrently.
    write_lock: Mutex<()>,
}

impl FileStateStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            base_path,
            write_lock: Mutex::new(()),
        }
    }

    /// Create the storage directories.
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(self.states_dir())?;
        Ok(())
    }

    fn states_dir(&self) -> PathBuf {
        self.base_path.join("states")
    }

    fn state_path(&self, user: &str) -> PathBuf {
        self.states_dir().join(user_file_name(user))
    }

    fn read_document(&self, user: &str) -> Result<Option<StateDocument>> {
        match fs::read_to_string(self.state_path(user)) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, user: &str) -> Result<Option<StateDocument>> {
        let _guard = self.write_lock.lock().unwrap();
        self.read_document(user)
    }

    async fn save(
        &self,
        user: &str,
        mut state: StateDocument,
        expected_version: Option<u64>,
    ) -> Result<DocumentMeta> {
        let _guard = self.write_lock.lock().unwrap();
        let stored_version = self.read_document(user)?.map(|doc| doc.meta.version);
        check_and_stamp(stored_version, expected_version, &mut state)?;
        let content = serde_json::to_string_pretty(&state)?;
        fs::write(self.state_path(user), content)?;
        Ok(state.meta)
    }
}

/// Accounts in `<base>/users.json`, tokens in `<base>/tokens.json`.
pub struct FileAuthStore {
    base_path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileAuthStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            base_path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path)?;
        Ok(())
    }

    fn users_path(&self) -> PathBuf {
        self.base_path.join("users.json")
    }

    fn tokens_path(&self) -> PathBuf {
        self.base_path.join("tokens.json")
    }

    fn read_users(&self) -> Result<HashMap<String, UserRecord>> {
        read_json_or_default(&self.users_path())
    }

    fn read_tokens(&self) -> Result<Vec<TokenRecord>> {
        read_json_or_default(&self.tokens_path())
    }
}

#[async_trait]
impl AuthStore for FileAuthStore {
    async fn load_user(&self, email: &str) -> Result<Option<UserRecord>> {
        let _guard = self.write_lock.lock().unwrap();
        Ok(self.read_users()?.remove(email))
    }

    async fn save_user(&self, user: &UserRecord) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut users = self.read_users()?;
        users.insert(user.email.clone(), user.clone());
        let content = serde_json::to_string_pretty(&users)?;
        fs::write(self.users_path(), content)?;
        Ok(())
    }

    async fn list_tokens(&self) -> Result<Vec<TokenRecord>> {
        let _guard = self.write_lock.lock().unwrap();
        self.read_tokens()
    }

    async fn save_token(&self, token: &TokenRecord) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut tokens = self.read_tokens()?;
        tokens.push(token.clone());
        let content = serde_json::to_string_pretty(&tokens)?;
        fs::write(self.tokens_path(), content)?;
        Ok(())
    }

    async fn revoke_token(&self, digest: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut tokens = self.read_tokens()?;
        tokens.retain(|t| t.digest != digest);
        let content = serde_json::to_string_pretty(&tokens)?;
        fs::write(self.tokens_path(), content)?;
        Ok(())
    }
}

fn read_json_or_default<T>(path: &PathBuf) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    match fs::read_to_string(path) {
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Filename for a user's document: a readable sanitized prefix plus a short
/// digest so distinct emails can never collide after sanitization.
fn user_file_name(user: &str) -> String {
    let safe: String = user
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let digest = Sha256::digest(user.as_bytes());
    format!("{}-{}.json", safe, hex::encode(&digest[..4]))
}

// ===== In-memory stores (tests, ephemeral deployments) =====

#[derive(Default)]
pub struct MemoryStateStore {
    docs: Mutex<HashMap<String, StateDocument>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, user: &str) -> Result<Option<StateDocument>> {
        Ok(self.docs.lock().unwrap().get(user).cloned())
    }

    async fn save(
        &self,
        user: &str,
        mut state: StateDocument,
        expected_version: Option<u64>,
    ) -> Result<DocumentMeta> {
        let mut docs = self.docs.lock().unwrap();
        let stored_version = docs.get(user).map(|doc| doc.meta.version);
        check_and_stamp(stored_version, expected_version, &mut state)?;
        let meta = state.meta.clone();
        docs.insert(user.to_string(), state);
        Ok(meta)
    }
}

#[derive(Default)]
pub struct MemoryAuthStore {
    users: Mutex<HashMap<String, UserRecord>>,
    tokens: Mutex<Vec<TokenRecord>>,
}

impl MemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthStore for MemoryAuthStore {
    async fn load_user(&self, email: &str) -> Result<Option<UserRecord>> {
        Ok(self.users.lock().unwrap().get(email).cloned())
    }

    async fn save_user(&self, user: &UserRecord) -> Result<()> {
        self.users
            .lock()
            .unwrap()
            .insert(user.email.clone(), user.clone());
        Ok(())
    }

    async fn list_tokens(&self) -> Result<Vec<TokenRecord>> {
        Ok(self.tokens.lock().unwrap().clone())
    }

    async fn save_token(&self, token: &TokenRecord) -> Result<()> {
        self.tokens.lock().unwrap().push(token.clone());
        Ok(())
    }

    async fn revoke_token(&self, digest: &str) -> Result<()> {
        self.tokens.lock().unwrap().retain(|t| t.digest != digest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn doc_at_version(version: u64) -> StateDocument {
        let mut doc = StateDocument::default_state();
        doc.meta.version = version;
        doc
    }

    #[tokio::test]
    async fn test_unconditional_save_keeps_incoming_version() {
        let store = MemoryStateStore::new();
        let meta = store.save("a@x.com", doc_at_version(0), None).await.unwrap();
        assert_eq!(meta.version, 0);
        assert_eq!(store.load("a@x.com").await.unwrap().unwrap().meta.version, 0);
    }

    #[tokio::test]
    async fn test_save_rejects_stale_expectation() {
        let store = MemoryStateStore::new();
        store.save("a@x.com", doc_at_version(3), None).await.unwrap();

        let err = store
            .save("a@x.com", doc_at_version(2), Some(2))
            .await
            .unwrap_err();
        match err {
            StoreError::Conflict { current_version } => assert_eq!(current_version, 3),
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_accepted_save_never_reuses_a_version() {
        let store = MemoryStateStore::new();
        store.save("a@x.com", doc_at_version(3), None).await.unwrap();

        // Matching expectation with an equal incoming version still moves
        // the stored version forward.
        let meta = store
            .save("a@x.com", doc_at_version(3), Some(3))
            .await
            .unwrap();
        assert_eq!(meta.version, 4);

        // An unconditional overwrite is stamped past the stored version too.
        let meta = store.save("a@x.com", doc_at_version(0), None).await.unwrap();
        assert_eq!(meta.version, 5);
    }

    #[tokio::test]
    async fn test_file_store_roundtrip_and_cas() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path().to_path_buf());
        store.init().unwrap();

        assert!(store.load("a@x.com").await.unwrap().is_none());
        store.save("a@x.com", doc_at_version(1), None).await.unwrap();
        let loaded = store.load("a@x.com").await.unwrap().unwrap();
        assert_eq!(loaded.meta.version, 1);

        let err = store
            .save("a@x.com", doc_at_version(1), Some(0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { current_version: 1 }));
    }

    #[tokio::test]
    async fn test_file_auth_store_tokens() {
        let dir = TempDir::new().unwrap();
        let store = FileAuthStore::new(dir.path().to_path_buf());
        store.init().unwrap();

        let record = TokenRecord {
            digest: "abc123".to_string(),
            email: "a@x.com".to_string(),
            created_at: 1,
        };
        store.save_token(&record).await.unwrap();
        assert_eq!(store.list_tokens().await.unwrap().len(), 1);

        store.revoke_token("abc123").await.unwrap();
        assert!(store.list_tokens().await.unwrap().is_empty());
    }

    #[test]
    fn test_user_file_name_sanitizes_but_stays_unique() {
        let a = user_file_name("user@example.com");
        let b = user_file_name("user_example.com");
        // Same sanitized prefix, different digests.
        assert!(a.starts_with("user_example.com-"));
        assert!(b.starts_with("user_example.com-"));
        assert_ne!(a, b);
        assert!(!a.contains('/'));
    }
}

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use super::{KeyValueStore, Result, StoreError};

/// File-backed key-value store: one file per key under a base directory.
pub struct FileKeyValueStore {
    base_path: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// Get the default data directory
    pub fn default_data_dir() -> Result<PathBuf> {
        dirs::data_local_dir()
            .map(|p| p.join("taskdeck"))
            .ok_or(StoreError::DataDirNotFound)
    }

    /// Open a store rooted at the default data directory.
    pub fn open_default() -> Result<Self> {
        let base = Self::default_data_dir()?.join("kv");
        fs::create_dir_all(&base)?;
        Ok(Self::new(base))
    }

    fn key_path(&self, key: &str) -> PathBuf {
        // Keys are dotted identifiers; anything else is flattened so a key
        // can never escape the base directory.
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.base_path.join(format!("{}.kv", safe))
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.key_path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        fs::create_dir_all(&self.base_path)?;
        fs::write(self.key_path(key), value)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

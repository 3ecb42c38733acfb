use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable id of the virtual root folder. Always present after normalization.
pub const ALL_FOLDER_ID: &str = "all";
/// Stable id of the virtual container for completed tasks.
pub const ARCHIVE_FOLDER_ID: &str = "archive";

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    List,
    Week,
}

impl Default for ViewMode {
    fn default() -> Self {
        Self::List
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveScreen {
    Folders,
    Tasks,
}

impl Default for ActiveScreen {
    fn default() -> Self {
        Self::Folders
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub order: f64,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_salt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hint: Option<String>,
    #[serde(default)]
    pub view_mode: ViewMode,
}

impl Folder {
    pub fn new(name: impl Into<String>, parent_id: Option<String>) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            parent_id,
            order: 0.0,
            created_at: now,
            updated_at: now,
            password_hash: None,
            password_salt: None,
            password_hint: None,
            view_mode: ViewMode::default(),
        }
    }

    /// System folders cannot be deleted or re-parented; normalization
    /// recreates them when missing.
    pub fn system(id: &str, name: &str, order: f64) -> Self {
        let now = now_ms();
        Self {
            id: id.to_string(),
            name: name.to_string(),
            parent_id: None,
            order,
            created_at: now,
            updated_at: now,
            password_hash: None,
            password_salt: None,
            password_hint: None,
            view_mode: ViewMode::default(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.id == ALL_FOLDER_ID || self.id == ARCHIVE_FOLDER_ID
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub text: String,
    pub folder_id: Option<String>,
    pub completed: bool,
    pub order: f64,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planned_for: Option<String>,
}

impl Task {
    pub fn new(text: impl Into<String>, folder_id: Option<String>) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            folder_id,
            completed: false,
            order: 0.0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            planned_for: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMeta {
    pub version: u64,
    pub updated_at: i64,
    #[serde(default)]
    pub empty_state_timestamps: HashMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_folder_id: Option<String>,
    #[serde(default)]
    pub active_screen: ActiveScreen,
}

/// The single synchronized aggregate per user. `meta.version` is the sole
/// conflict-detection key; `ui` is device-local and survives remote pulls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDocument {
    pub meta: DocumentMeta,
    pub folders: Vec<Folder>,
    pub tasks: Vec<Task>,
    pub archived_tasks: Vec<Task>,
    pub ui: UiState,
}

impl StateDocument {
    /// Fresh document for a first-time user: version 0, system folders only,
    /// no tasks, folders screen selected.
    pub fn default_state() -> Self {
        Self {
            meta: DocumentMeta {
                version: 0,
                updated_at: now_ms(),
                empty_state_timestamps: HashMap::new(),
            },
            folders: vec![
                Folder::system(ALL_FOLDER_ID, "All", 0.0),
                Folder::system(ARCHIVE_FOLDER_ID, "Archive", 1.0),
            ],
            tasks: Vec::new(),
            archived_tasks: Vec::new(),
            ui: UiState {
                selected_folder_id: Some(ALL_FOLDER_ID.to_string()),
                active_screen: ActiveScreen::Folders,
            },
        }
    }

    pub fn folder(&self, id: &str) -> Option<&Folder> {
        self.folders.iter().find(|f| f.id == id)
    }

    pub fn has_folder(&self, id: &str) -> bool {
        self.folders.iter().any(|f| f.id == id)
    }
}

//! Client-local preferences kept outside the synchronized document.
//!
//! The synced document carries whatever the last writer pushed; these
//! per-profile preferences survive remote overwrites and are re-applied
//! during reconciliation (view modes, planned dates, navigation context).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::state::{ActiveScreen, StateDocument, ViewMode};
use crate::store::KeyValueStore;

const BREADCRUMB_LIMIT: usize = 20;

/// Profile-keyed UI context blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalPrefs {
    /// Screen the user last looked at
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_screen: Option<ActiveScreen>,
    /// Folder the user last opened
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_folder_id: Option<String>,
    /// Per-folder view-mode preference, keyed by folder id
    #[serde(default)]
    pub folder_view_modes: HashMap<String, ViewMode>,
    /// Per-task planned-for override, keyed by task id (ISO date)
    #[serde(default)]
    pub planned_overrides: HashMap<String, String>,
    /// Recently visited folder ids, most recent last
    #[serde(default)]
    pub breadcrumbs: Vec<String>,
}

impl LocalPrefs {
    pub fn set_folder_view_mode(&mut self, folder_id: &str, mode: ViewMode) {
        self.folder_view_modes.insert(folder_id.to_string(), mode);
    }

    pub fn set_planned_override(&mut self, task_id: &str, date: &str) {
        self.planned_overrides
            .insert(task_id.to_string(), date.to_string());
    }

    pub fn clear_planned_override(&mut self, task_id: &str) {
        self.planned_overrides.remove(task_id);
    }

    /// Record a folder visit for navigation context.
    pub fn record_visit(&mut self, folder_id: &str) {
        self.last_folder_id = Some(folder_id.to_string());
        self.breadcrumbs.retain(|id| id != folder_id);
        self.breadcrumbs.push(folder_id.to_string());
        if self.breadcrumbs.len() > BREADCRUMB_LIMIT {
            let excess = self.breadcrumbs.len() - BREADCRUMB_LIMIT;
            self.breadcrumbs.drain(..excess);
        }
    }

    /// Copy stored preferences onto a freshly merged document. The remote's
    /// viewMode/plannedFor values are only kept for ids this profile has no
    /// opinion about.
    pub fn apply_to(&self, doc: &mut StateDocument) {
        for folder in doc.folders.iter_mut() {
            if let Some(mode) = self.folder_view_modes.get(&folder.id) {
                folder.view_mode = *mode;
            }
        }
        for task in doc.tasks.iter_mut() {
            if let Some(date) = self.planned_overrides.get(&task.id) {
                task.planned_for = Some(date.clone());
            }
        }
    }

    /// Drop entries referring to folders/tasks that no longer exist.
    /// Returns true when anything was removed.
    pub fn prune(&mut self, doc: &StateDocument) -> bool {
        let before = self.folder_view_modes.len()
            + self.planned_overrides.len()
            + self.breadcrumbs.len()
            + usize::from(self.last_folder_id.is_some());

        self.folder_view_modes.retain(|id, _| doc.has_folder(id));
        self.planned_overrides.retain(|id, _| {
            doc.tasks.iter().any(|t| &t.id == id)
                || doc.archived_tasks.iter().any(|t| &t.id == id)
        });
        self.breadcrumbs.retain(|id| doc.has_folder(id));
        if let Some(id) = &self.last_folder_id {
            if !doc.has_folder(id) {
                self.last_folder_id = None;
            }
        }

        let after = self.folder_view_modes.len()
            + self.planned_overrides.len()
            + self.breadcrumbs.len()
            + usize::from(self.last_folder_id.is_some());
        after != before
    }
}

/// Loads and saves the [`LocalPrefs`] blob for one profile through the
/// key-value capability.
pub struct PrefsStore {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl PrefsStore {
    pub fn new(store: Arc<dyn KeyValueStore>, profile: &str) -> Self {
        Self {
            store,
            key: format!("prefs.{}", profile),
        }
    }

    /// Load the blob; a missing or unreadable blob yields defaults.
    pub fn load(&self) -> LocalPrefs {
        match self.store.get(&self.key) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                log::warn!("Discarding unreadable prefs blob ({}): {}", self.key, e);
                LocalPrefs::default()
            }),
            Ok(None) => LocalPrefs::default(),
            Err(e) => {
                log::warn!("Failed to read prefs blob ({}): {}", self.key, e);
                LocalPrefs::default()
            }
        }
    }

    pub fn save(&self, prefs: &LocalPrefs) -> crate::store::Result<()> {
        let raw = serde_json::to_string(prefs).unwrap_or_else(|_| "{}".to_string());
        self.store.set(&self.key, &raw)
    }
}

//! Session controller: owns the live in-memory document for one profile.
//!
//! All local edits flow through [`Session::mutate`], which advances the
//! document version and caches the result; remote snapshots flow through
//! [`Session::apply_remote`], which merges without a version bump so a pull
//! never masquerades as a new edit. Subscribers are notified after every
//! commit, suppressed or not.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::prefs::PrefsStore;
use crate::state::{
    normalize, now_ms, repair_system_folders, ActiveScreen, Folder, StateDocument, Task, ViewMode,
    ARCHIVE_FOLDER_ID,
};
use crate::store::KeyValueStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&StateDocument) + Send + Sync>;

pub struct Session {
    store: Arc<dyn KeyValueStore>,
    cache_key: String,
    prefs: PrefsStore,
    doc: Mutex<StateDocument>,
    subscribers: Mutex<HashMap<SubscriptionId, Subscriber>>,
    next_subscription: AtomicU64,
}

impl Session {
    /// Open the session for a profile, restoring the cached document when
    /// one exists. A missing or unreadable cache yields a fresh default.
    pub fn open(store: Arc<dyn KeyValueStore>, profile: &str) -> Self {
        let cache_key = format!("state.{}", profile);
        let doc = match store.get(&cache_key) {
            Ok(Some(raw)) => match serde_json::from_str::<serde_json::Value>(&raw) {
                Ok(value) => normalize(&value),
                Err(e) => {
                    log::warn!("Discarding unreadable cached state ({}): {}", cache_key, e);
                    StateDocument::default_state()
                }
            },
            Ok(None) => StateDocument::default_state(),
            Err(e) => {
                log::warn!("Failed to read cached state ({}): {}", cache_key, e);
                StateDocument::default_state()
            }
        };
        Self {
            prefs: PrefsStore::new(store.clone(), profile),
            store,
            cache_key,
            doc: Mutex::new(doc),
            subscribers: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Deep copy of the current document (senders must not observe later
    /// in-place edits).
    pub fn snapshot(&self) -> StateDocument {
        self.doc.lock().unwrap().clone()
    }

    pub fn version(&self) -> u64 {
        self.doc.lock().unwrap().meta.version
    }

    /// Apply a local edit and commit it: version +1, updatedAt refreshed,
    /// cache written, subscribers notified.
    pub fn mutate<F>(&self, f: F)
    where
        F: FnOnce(&mut StateDocument),
    {
        let snapshot = {
            let mut doc = self.doc.lock().unwrap();
            f(&mut doc);
            doc.meta.version += 1;
            doc.meta.updated_at = now_ms();
            self.write_cache(&doc);
            doc.clone()
        };
        self.notify(&snapshot);
    }

    /// Merge a pulled remote document into the live state.
    ///
    /// Collections (`folders`, `tasks`, `archivedTasks`) are replaced
    /// wholesale; the local `ui` fields and `emptyStateTimestamps` survive
    /// per the rules below; per-profile preferences are re-applied on top.
    /// The commit is suppressed: the version stays whatever the remote
    /// carried and no push is provoked.
    pub fn apply_remote(&self, remote: StateDocument) {
        let snapshot = {
            let mut doc = self.doc.lock().unwrap();
            let mut merged = remote;
            repair_system_folders(&mut merged.folders);

            // Device-local navigation wins while it still points at a real
            // folder; the remote's selection is only a fallback.
            let remote_selected = merged.ui.selected_folder_id.take();
            merged.ui.selected_folder_id = doc
                .ui
                .selected_folder_id
                .take()
                .filter(|id| merged.folders.iter().any(|f| &f.id == id))
                .or_else(|| remote_selected.filter(|id| merged.folders.iter().any(|f| &f.id == id)));

            // The empty-state cache is advisory; the remote only replaces it
            // when it actually carries data.
            if merged.meta.empty_state_timestamps.is_empty() {
                merged.meta.empty_state_timestamps =
                    std::mem::take(&mut doc.meta.empty_state_timestamps);
            }

            let mut prefs = self.prefs.load();
            if prefs.prune(&merged) {
                if let Err(e) = self.prefs.save(&prefs) {
                    log::warn!("Failed to persist pruned prefs: {}", e);
                }
            }
            prefs.apply_to(&mut merged);

            // Keep the screen the user is on unless this profile has no
            // recorded context at all.
            if prefs.last_screen.is_some() {
                merged.ui.active_screen = doc.ui.active_screen;
            }

            log::debug!(
                "Applied remote state v{} (was v{})",
                merged.meta.version, doc.meta.version
            );
            *doc = merged;
            self.write_cache(&doc);
            doc.clone()
        };
        self.notify(&snapshot);
    }

    /// Adopt a server-confirmed version number after a successful push.
    /// The confirmation is only valid for the snapshot that was sent: if an
    /// edit or pull landed while the request was in flight, the document has
    /// moved past `pushed` and keeps its own version, so the newer content
    /// still counts as unsynced. Content is untouched either way, so
    /// subscribers are not notified.
    pub fn adopt_version(&self, pushed: u64, confirmed: u64) {
        let mut doc = self.doc.lock().unwrap();
        if doc.meta.version != pushed {
            log::debug!(
                "Not adopting v{}: document moved to v{} while v{} was in flight",
                confirmed, doc.meta.version, pushed
            );
            return;
        }
        if doc.meta.version != confirmed {
            log::debug!(
                "Adopting server-confirmed version v{} (was v{})",
                confirmed, doc.meta.version
            );
            doc.meta.version = confirmed;
            self.write_cache(&doc);
        }
    }

    /// Register a change listener. The callback runs after every commit,
    /// including suppressed ones.
    pub fn subscribe<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&StateDocument) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers.lock().unwrap().insert(id, Arc::new(f));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().unwrap().remove(&id);
    }

    fn notify(&self, doc: &StateDocument) {
        let callbacks: Vec<Subscriber> =
            self.subscribers.lock().unwrap().values().cloned().collect();
        for callback in callbacks {
            callback(doc);
        }
    }

    /// Best-effort local cache write; the in-memory document stays
    /// authoritative even when the profile store is unavailable.
    fn write_cache(&self, doc: &StateDocument) {
        let raw = match serde_json::to_string(doc) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("Failed to serialize state for cache: {}", e);
                return;
            }
        };
        if let Err(e) = self.store.set(&self.cache_key, &raw) {
            log::warn!("Failed to cache state ({}): {}", self.cache_key, e);
        }
    }

    // ===== Task and folder edits =====

    /// Add an active task; returns its id.
    pub fn add_task(&self, text: &str, folder_id: Option<&str>) -> String {
        let mut task = Task::new(text, folder_id.map(|s| s.to_string()));
        task.order = self.next_task_order(folder_id);
        let id = task.id.clone();
        self.mutate(|doc| {
            if task
                .folder_id
                .as_deref()
                .is_some_and(|fid| !doc.has_folder(fid))
            {
                task.folder_id = None;
            }
            doc.tasks.push(task);
        });
        id
    }

    /// Complete an active task, moving it into the archive. Returns false
    /// when the id is unknown.
    pub fn complete_task(&self, task_id: &str) -> bool {
        let mut found = false;
        self.mutate_if(|doc| {
            let Some(pos) = doc.tasks.iter().position(|t| t.id == task_id) else {
                return false;
            };
            let mut task = doc.tasks.remove(pos);
            let now = now_ms();
            task.completed = true;
            task.completed_at = Some(now);
            task.updated_at = now;
            doc.archived_tasks.push(task);
            found = true;
            true
        });
        found
    }

    /// Reopen an archived task, moving it back into the active list.
    pub fn reopen_task(&self, task_id: &str) -> bool {
        let mut found = false;
        self.mutate_if(|doc| {
            let Some(pos) = doc.archived_tasks.iter().position(|t| t.id == task_id) else {
                return false;
            };
            let mut task = doc.archived_tasks.remove(pos);
            task.completed = false;
            task.completed_at = None;
            task.updated_at = now_ms();
            doc.tasks.push(task);
            found = true;
            true
        });
        found
    }

    /// Create a folder under an optional parent; returns its id.
    pub fn add_folder(&self, name: &str, parent_id: Option<&str>) -> String {
        let mut folder = Folder::new(name, parent_id.map(|s| s.to_string()));
        folder.order = self.next_folder_order(parent_id);
        let id = folder.id.clone();
        self.mutate(|doc| {
            if folder
                .parent_id
                .as_deref()
                .is_some_and(|pid| !doc.has_folder(pid) || pid == ARCHIVE_FOLDER_ID)
            {
                folder.parent_id = None;
            }
            doc.folders.push(folder);
        });
        id
    }

    /// Point the UI at a folder. Device-local: records navigation context in
    /// prefs and commits the ui change without provoking a push.
    pub fn select_folder(&self, folder_id: &str) -> bool {
        let snapshot = {
            let mut doc = self.doc.lock().unwrap();
            if !doc.has_folder(folder_id) {
                return false;
            }
            doc.ui.selected_folder_id = Some(folder_id.to_string());
            doc.ui.active_screen = ActiveScreen::Tasks;
            self.write_cache(&doc);
            doc.clone()
        };
        let mut prefs = self.prefs.load();
        prefs.record_visit(folder_id);
        prefs.last_screen = Some(ActiveScreen::Tasks);
        if let Err(e) = self.prefs.save(&prefs) {
            log::warn!("Failed to persist navigation prefs: {}", e);
        }
        self.notify(&snapshot);
        true
    }

    /// Set a folder's view mode in both the document and the local
    /// preference store (the preference survives remote overwrites).
    pub fn set_view_mode(&self, folder_id: &str, mode: ViewMode) -> bool {
        if !self.doc.lock().unwrap().has_folder(folder_id) {
            return false;
        }
        let mut prefs = self.prefs.load();
        prefs.set_folder_view_mode(folder_id, mode);
        if let Err(e) = self.prefs.save(&prefs) {
            log::warn!("Failed to persist view-mode pref: {}", e);
        }
        self.mutate(|doc| {
            if let Some(folder) = doc.folders.iter_mut().find(|f| f.id == folder_id) {
                folder.view_mode = mode;
                folder.updated_at = now_ms();
            }
        });
        true
    }

    /// Plan a task for a date (`YYYY-MM-DD`), or clear the plan with None.
    /// Mirrored into the local preference store.
    pub fn set_planned_for(&self, task_id: &str, date: Option<&str>) -> bool {
        if !self
            .doc
            .lock()
            .unwrap()
            .tasks
            .iter()
            .any(|t| t.id == task_id)
        {
            return false;
        }
        let mut prefs = self.prefs.load();
        match date {
            Some(d) => prefs.set_planned_override(task_id, d),
            None => prefs.clear_planned_override(task_id),
        }
        if let Err(e) = self.prefs.save(&prefs) {
            log::warn!("Failed to persist planned-for pref: {}", e);
        }
        self.mutate(|doc| {
            if let Some(task) = doc.tasks.iter_mut().find(|t| t.id == task_id) {
                task.planned_for = date.map(|s| s.to_string());
                task.updated_at = now_ms();
            }
        });
        true
    }

    /// Like [`Session::mutate`], but the closure decides whether anything
    /// changed; nothing is committed when it returns false.
    fn mutate_if<F>(&self, f: F)
    where
        F: FnOnce(&mut StateDocument) -> bool,
    {
        let snapshot = {
            let mut doc = self.doc.lock().unwrap();
            if !f(&mut doc) {
                return;
            }
            doc.meta.version += 1;
            doc.meta.updated_at = now_ms();
            self.write_cache(&doc);
            doc.clone()
        };
        self.notify(&snapshot);
    }

    fn next_task_order(&self, folder_id: Option<&str>) -> f64 {
        let doc = self.doc.lock().unwrap();
        doc.tasks
            .iter()
            .filter(|t| t.folder_id.as_deref() == folder_id)
            .map(|t| t.order)
            .fold(0.0, f64::max)
            + 1.0
    }

    fn next_folder_order(&self, parent_id: Option<&str>) -> f64 {
        let doc = self.doc.lock().unwrap();
        doc.folders
            .iter()
            .filter(|f| f.parent_id.as_deref() == parent_id && !f.is_system())
            .map(|f| f.order)
            .fold(1.0, f64::max)
            + 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ALL_FOLDER_ID;
    use crate::store::MemoryKeyValueStore;
    use std::sync::atomic::AtomicUsize;

    fn make_session() -> Session {
        Session::open(Arc::new(MemoryKeyValueStore::new()), "test")
    }

    #[test]
    fn test_mutate_bumps_version_by_one() {
        let session = make_session();
        assert_eq!(session.version(), 0);
        session.add_task("buy milk", None);
        assert_eq!(session.version(), 1);
        session.add_task("walk dog", None);
        assert_eq!(session.version(), 2);
    }

    #[test]
    fn test_adopt_version_skips_when_document_moved() {
        let session = make_session();
        session.add_task("first", None);
        assert_eq!(session.version(), 1);

        // The confirmation for v1 arrives after a second edit landed; the
        // newer version must not be wound back.
        session.add_task("second", None);
        session.adopt_version(1, 1);
        assert_eq!(session.version(), 2);

        // Still the pushed snapshot: the server-stamped number is adopted.
        session.adopt_version(2, 3);
        assert_eq!(session.version(), 3);
    }

    #[test]
    fn test_apply_remote_keeps_remote_version() {
        let session = make_session();
        session.add_task("local edit", None);
        assert_eq!(session.version(), 1);

        let mut remote = StateDocument::default_state();
        remote.meta.version = 9;
        session.apply_remote(remote);
        assert_eq!(session.version(), 9);
    }

    #[test]
    fn test_complete_and_reopen_move_between_lists() {
        let session = make_session();
        let id = session.add_task("finish report", None);

        assert!(session.complete_task(&id));
        let doc = session.snapshot();
        assert!(doc.tasks.is_empty());
        assert_eq!(doc.archived_tasks.len(), 1);
        assert!(doc.archived_tasks[0].completed);
        assert!(doc.archived_tasks[0].completed_at.is_some());

        assert!(session.reopen_task(&id));
        let doc = session.snapshot();
        assert_eq!(doc.tasks.len(), 1);
        assert!(doc.archived_tasks.is_empty());
        assert!(!doc.tasks[0].completed);
        assert_eq!(doc.tasks[0].completed_at, None);
    }

    #[test]
    fn test_unknown_ids_do_not_commit() {
        let session = make_session();
        let before = session.version();
        assert!(!session.complete_task("ghost"));
        assert!(!session.reopen_task("ghost"));
        assert!(!session.select_folder("ghost"));
        assert!(!session.set_view_mode("ghost", ViewMode::Week));
        assert_eq!(session.version(), before);
    }

    #[test]
    fn test_subscribers_fire_on_commits_until_unsubscribed() {
        let session = make_session();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let id = session.subscribe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        session.add_task("one", None);
        session.apply_remote(StateDocument::default_state());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        session.unsubscribe(id);
        session.add_task("two", None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_apply_remote_preserves_local_selection() {
        let session = make_session();
        let folder_id = session.add_folder("Work", None);
        assert!(session.select_folder(&folder_id));

        let mut remote = session.snapshot();
        remote.meta.version = 5;
        remote.ui.selected_folder_id = Some(ALL_FOLDER_ID.to_string());
        remote.ui.active_screen = ActiveScreen::Folders;
        session.apply_remote(remote);

        let doc = session.snapshot();
        assert_eq!(doc.ui.selected_folder_id.as_deref(), Some(folder_id.as_str()));
        // Navigation context exists, so the screen stays put too.
        assert_eq!(doc.ui.active_screen, ActiveScreen::Tasks);
    }

    #[test]
    fn test_apply_remote_falls_back_when_selection_vanishes() {
        let session = make_session();
        let folder_id = session.add_folder("Work", None);
        assert!(session.select_folder(&folder_id));

        // Remote no longer has the folder; local selection is dangling.
        let mut remote = StateDocument::default_state();
        remote.meta.version = 5;
        remote.ui.selected_folder_id = Some(ARCHIVE_FOLDER_ID.to_string());
        session.apply_remote(remote);

        let doc = session.snapshot();
        assert_eq!(
            doc.ui.selected_folder_id.as_deref(),
            Some(ARCHIVE_FOLDER_ID)
        );
    }

    #[test]
    fn test_apply_remote_empty_state_timestamps_asymmetry() {
        let session = make_session();
        session.mutate(|doc| {
            doc.meta.empty_state_timestamps.insert("f1".to_string(), 111);
        });

        // Remote with an empty map: local survives.
        let mut remote = StateDocument::default_state();
        remote.meta.version = 2;
        session.apply_remote(remote);
        assert_eq!(
            session.snapshot().meta.empty_state_timestamps.get("f1"),
            Some(&111)
        );

        // Remote with data: remote wins.
        let mut remote = StateDocument::default_state();
        remote.meta.version = 3;
        remote
            .meta
            .empty_state_timestamps
            .insert("f2".to_string(), 222);
        session.apply_remote(remote);
        let merged = session.snapshot().meta.empty_state_timestamps;
        assert_eq!(merged.get("f2"), Some(&222));
        assert!(!merged.contains_key("f1"));
    }

    #[test]
    fn test_apply_remote_reapplies_local_prefs() {
        let session = make_session();
        let folder_id = session.add_folder("Work", None);
        assert!(session.set_view_mode(&folder_id, ViewMode::Week));

        // Remote still has the folder but with the default view mode.
        let mut remote = session.snapshot();
        remote.meta.version = 7;
        for folder in remote.folders.iter_mut() {
            folder.view_mode = ViewMode::List;
        }
        session.apply_remote(remote);

        let doc = session.snapshot();
        assert_eq!(doc.folder(&folder_id).unwrap().view_mode, ViewMode::Week);
    }

    #[test]
    fn test_apply_remote_repairs_system_folders() {
        let session = make_session();
        let mut remote = StateDocument::default_state();
        remote.meta.version = 4;
        remote.folders.retain(|f| f.id != ALL_FOLDER_ID);
        session.apply_remote(remote);
        assert!(session.snapshot().has_folder(ALL_FOLDER_ID));
    }

    #[test]
    fn test_session_restores_cached_document() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        {
            let session = Session::open(store.clone(), "restore");
            session.add_task("persisted", None);
        }
        let session = Session::open(store, "restore");
        assert_eq!(session.version(), 1);
        assert_eq!(session.snapshot().tasks[0].text, "persisted");
    }
}

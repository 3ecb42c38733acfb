//! Normalization of arbitrary JSON into a valid [`StateDocument`].
//!
//! Documents arrive from the network, from older clients, and from local
//! caches; any of them can be partial or malformed. `normalize` never fails:
//! wrong-typed fields fall back to defaults, numeric strings are parsed,
//! system folders are recreated, orphaned tasks are re-filed. The function is
//! idempotent, so re-normalizing an already-valid document is a no-op.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, NaiveDate};
use serde_json::Value;

use super::models::{
    now_ms, ActiveScreen, DocumentMeta, Folder, StateDocument, Task, UiState, ViewMode,
    ALL_FOLDER_ID, ARCHIVE_FOLDER_ID,
};

/// Build a structurally valid document out of any JSON value.
pub fn normalize(raw: &Value) -> StateDocument {
    let obj = raw.as_object();

    let meta = normalize_meta(obj.and_then(|o| o.get("meta")));
    let mut folders = normalize_folders(obj.and_then(|o| o.get("folders")));
    repair_system_folders(&mut folders);

    let mut seen_ids = HashSet::new();
    let tasks = normalize_tasks(
        obj.and_then(|o| o.get("tasks")),
        &folders,
        false,
        &mut seen_ids,
    );
    let archived_tasks = normalize_tasks(
        obj.and_then(|o| o.get("archivedTasks")),
        &folders,
        true,
        &mut seen_ids,
    );
    let ui = normalize_ui(obj.and_then(|o| o.get("ui")), &folders);

    StateDocument {
        meta,
        folders,
        tasks,
        archived_tasks,
        ui,
    }
}

/// Ensure the ALL and ARCHIVE system folders exist and sit at the root.
/// Idempotent; also used after reconciliation merges.
pub fn repair_system_folders(folders: &mut Vec<Folder>) {
    for folder in folders.iter_mut() {
        if folder.is_system() {
            folder.parent_id = None;
        }
    }
    if !folders.iter().any(|f| f.id == ARCHIVE_FOLDER_ID) {
        folders.insert(0, Folder::system(ARCHIVE_FOLDER_ID, "Archive", 1.0));
    }
    if !folders.iter().any(|f| f.id == ALL_FOLDER_ID) {
        folders.insert(0, Folder::system(ALL_FOLDER_ID, "All", 0.0));
    }
}

fn normalize_meta(value: Option<&Value>) -> DocumentMeta {
    let obj = value.and_then(|v| v.as_object());
    let version = coerce_version(obj.and_then(|o| o.get("version")));
    let updated_at = coerce_timestamp(obj.and_then(|o| o.get("updatedAt"))).unwrap_or_else(now_ms);

    let mut empty_state_timestamps = HashMap::new();
    if let Some(Value::Object(map)) = obj.and_then(|o| o.get("emptyStateTimestamps")) {
        for (key, val) in map {
            if let Some(ts) = coerce_timestamp(Some(val)) {
                empty_state_timestamps.insert(key.clone(), ts);
            }
        }
    }

    DocumentMeta {
        version,
        updated_at,
        empty_state_timestamps,
    }
}

fn normalize_folders(value: Option<&Value>) -> Vec<Folder> {
    let mut folders = Vec::new();
    let mut seen = HashSet::new();
    let Some(items) = value.and_then(|v| v.as_array()) else {
        return folders;
    };
    for item in items {
        let Some(obj) = item.as_object() else {
            continue;
        };
        // Records without a usable id cannot be referenced; drop them.
        let Some(id) = non_empty_string(obj.get("id")) else {
            continue;
        };
        if !seen.insert(id.clone()) {
            continue;
        }
        let now = now_ms();
        folders.push(Folder {
            id,
            name: non_empty_string(obj.get("name")).unwrap_or_else(|| "Untitled".to_string()),
            parent_id: string_value(obj.get("parentId")),
            order: coerce_order(obj.get("order")),
            created_at: coerce_timestamp(obj.get("createdAt")).unwrap_or(now),
            updated_at: coerce_timestamp(obj.get("updatedAt")).unwrap_or(now),
            password_hash: string_value(obj.get("passwordHash")),
            password_salt: string_value(obj.get("passwordSalt")),
            password_hint: string_value(obj.get("passwordHint")),
            view_mode: match obj.get("viewMode").and_then(|v| v.as_str()) {
                Some("week") => ViewMode::Week,
                _ => ViewMode::List,
            },
        });
    }
    folders
}

fn normalize_tasks(
    value: Option<&Value>,
    folders: &[Folder],
    archived: bool,
    seen_ids: &mut HashSet<String>,
) -> Vec<Task> {
    let mut tasks = Vec::new();
    let Some(items) = value.and_then(|v| v.as_array()) else {
        return tasks;
    };
    for item in items {
        let Some(obj) = item.as_object() else {
            continue;
        };
        let Some(id) = non_empty_string(obj.get("id")) else {
            continue;
        };
        let Some(text) = non_empty_string(obj.get("text")) else {
            continue;
        };
        // Ids are unique across active and archived tasks; first wins.
        if !seen_ids.insert(id.clone()) {
            continue;
        }
        let now = now_ms();
        let updated_at = coerce_timestamp(obj.get("updatedAt")).unwrap_or(now);
        // A folder reference that no longer resolves means unfiled.
        let folder_id =
            string_value(obj.get("folderId")).filter(|fid| folders.iter().any(|f| &f.id == fid));
        tasks.push(Task {
            id,
            text,
            folder_id,
            completed: archived,
            order: coerce_order(obj.get("order")),
            created_at: coerce_timestamp(obj.get("createdAt")).unwrap_or(now),
            updated_at,
            completed_at: if archived {
                Some(coerce_timestamp(obj.get("completedAt")).unwrap_or(updated_at))
            } else {
                None
            },
            planned_for: string_value(obj.get("plannedFor"))
                .and_then(|s| canonical_plan_date(&s)),
        });
    }
    tasks
}

fn normalize_ui(value: Option<&Value>, folders: &[Folder]) -> UiState {
    let obj = value.and_then(|v| v.as_object());
    // A selection pointing at a folder that no longer exists is dropped
    // rather than redirected; callers fall back to the ALL folder.
    let selected_folder_id = obj
        .and_then(|o| o.get("selectedFolderId"))
        .and_then(|v| v.as_str())
        .filter(|id| folders.iter().any(|f| &f.id == id))
        .map(|id| id.to_string());
    let active_screen = match obj.and_then(|o| o.get("activeScreen")).and_then(|v| v.as_str()) {
        Some("tasks") => ActiveScreen::Tasks,
        Some("folders") => ActiveScreen::Folders,
        _ => ActiveScreen::default(),
    };
    UiState {
        selected_folder_id,
        active_screen,
    }
}

/// Version must be a finite non-negative integer; numeric strings are
/// accepted, everything else collapses to 0.
fn coerce_version(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => {
            if let Some(u) = n.as_u64() {
                u
            } else {
                n.as_f64()
                    .filter(|f| f.is_finite() && *f >= 0.0)
                    .map(|f| f as u64)
                    .unwrap_or(0)
            }
        }
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite() && *f >= 0.0)
            .map(|f| f as u64)
            .unwrap_or(0),
        _ => 0,
    }
}

/// Epoch-ms timestamp from a number, a numeric string, or an RFC 3339 date
/// string. Returns None when nothing usable is present.
fn coerce_timestamp(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(ms) = s.parse::<i64>() {
                return Some(ms);
            }
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.timestamp_millis())
        }
        _ => None,
    }
}

/// Plan dates travel as `YYYY-MM-DD`. Parseable variants (unpadded month or
/// day) are reformatted into that shape; anything else is dropped.
fn canonical_plan_date(s: &str) -> Option<String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(|d| d.format("%Y-%m-%d").to_string())
}

fn coerce_order(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().filter(|f| f.is_finite()).unwrap_or(0.0),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .unwrap_or(0.0),
        _ => 0.0,
    }
}

fn string_value(value: Option<&Value>) -> Option<String> {
    value.and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn non_empty_string(value: Option<&Value>) -> Option<String> {
    string_value(value).filter(|s| !s.is_empty())
}

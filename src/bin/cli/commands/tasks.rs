use anyhow::{bail, Result};
use serde_json::json;

use taskdeck_lib::state::{StateDocument, Task};
use taskdeck_lib::sync::{PullOptions, PushOptions};

use crate::app::App;
use crate::OutputFormat;

pub async fn add(
    app: &App,
    text: &str,
    folder: Option<&str>,
    format: &OutputFormat,
) -> Result<()> {
    // Sync down first (when possible) so the edit lands on the latest
    // ancestor; offline the edit is only cached locally.
    if app.manager.enabled() {
        app.manager
            .pull_latest(PullOptions {
                skip_if_unchanged: true,
            })
            .await;
    }

    let folder_id = match folder {
        Some(query) => Some(resolve_folder(&app.session.snapshot(), query)?),
        None => None,
    };
    let id = app.session.add_task(text, folder_id.as_deref());

    if app.manager.enabled() {
        app.manager.push_state(PushOptions::default()).await;
        app.save_sync_tracker();
    }

    match format {
        OutputFormat::Json => println!("{}", json!({ "id": id })),
        OutputFormat::Plain => println!("Added task {}", short_id(&id)),
    }
    Ok(())
}

pub async fn done(app: &App, query: &str, format: &OutputFormat) -> Result<()> {
    if app.manager.enabled() {
        app.manager
            .pull_latest(PullOptions {
                skip_if_unchanged: true,
            })
            .await;
    }

    let doc = app.session.snapshot();
    let task = resolve_task(&doc, query)?;
    let id = task.id.clone();
    let text = task.text.clone();
    app.session.complete_task(&id);

    if app.manager.enabled() {
        app.manager.push_state(PushOptions::default()).await;
        app.save_sync_tracker();
    }

    match format {
        OutputFormat::Json => println!("{}", json!({ "id": id, "completed": true })),
        OutputFormat::Plain => println!("Completed: {}", text),
    }
    Ok(())
}

pub fn ls(app: &App, all: bool, folder: Option<&str>, format: &OutputFormat) -> Result<()> {
    let doc = app.session.snapshot();
    let folder_id = match folder {
        Some(query) => Some(resolve_folder(&doc, query)?),
        None => None,
    };

    let in_folder = |task: &Task| match &folder_id {
        Some(id) => task.folder_id.as_deref() == Some(id.as_str()),
        None => true,
    };
    let active: Vec<&Task> = doc.tasks.iter().filter(|t| in_folder(t)).collect();
    let archived: Vec<&Task> = if all {
        doc.archived_tasks.iter().filter(|t| in_folder(t)).collect()
    } else {
        Vec::new()
    };

    match format {
        OutputFormat::Json => {
            let to_json = |tasks: &[&Task]| -> Vec<serde_json::Value> {
                tasks
                    .iter()
                    .map(|t| {
                        json!({
                            "id": t.id,
                            "text": t.text,
                            "completed": t.completed,
                            "folderId": t.folder_id,
                            "plannedFor": t.planned_for,
                        })
                    })
                    .collect()
            };
            let output = json!({
                "version": doc.meta.version,
                "tasks": to_json(&active),
                "archivedTasks": to_json(&archived),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Plain => {
            if active.is_empty() && archived.is_empty() {
                println!("No tasks");
                return Ok(());
            }
            for task in &active {
                println!("[ ] {}  {}{}", short_id(&task.id), task.text, task_notes(task, &doc));
            }
            for task in &archived {
                println!("[x] {}  {}{}", short_id(&task.id), task.text, task_notes(task, &doc));
            }
        }
    }
    Ok(())
}

fn task_notes(task: &Task, doc: &StateDocument) -> String {
    let mut notes = Vec::new();
    if let Some(folder) = task.folder_id.as_deref().and_then(|id| doc.folder(id)) {
        notes.push(folder.name.clone());
    }
    if let Some(date) = &task.planned_for {
        notes.push(format!("planned {}", date));
    }
    if notes.is_empty() {
        String::new()
    } else {
        format!("  ({})", notes.join(", "))
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Find a folder by id or name: exact id, then exact name, then
/// case-insensitive name prefix. Ambiguity is an error, not a guess.
fn resolve_folder(doc: &StateDocument, query: &str) -> Result<String> {
    if doc.has_folder(query) {
        return Ok(query.to_string());
    }
    let query_lower = query.to_lowercase();
    if let Some(folder) = doc
        .folders
        .iter()
        .find(|f| f.name.to_lowercase() == query_lower)
    {
        return Ok(folder.id.clone());
    }
    let matches: Vec<_> = doc
        .folders
        .iter()
        .filter(|f| f.name.to_lowercase().starts_with(&query_lower))
        .collect();
    match matches.len() {
        0 => bail!(
            "No folder matching '{}'. Folders:\n{}",
            query,
            doc.folders
                .iter()
                .map(|f| format!("  - {} ({})", f.name, short_id(&f.id)))
                .collect::<Vec<_>>()
                .join("\n")
        ),
        1 => Ok(matches[0].id.clone()),
        _ => bail!(
            "Ambiguous folder '{}'. Matches:\n{}",
            query,
            matches
                .iter()
                .map(|f| format!("  - {}", f.name))
                .collect::<Vec<_>>()
                .join("\n")
        ),
    }
}

/// Find an active task by id prefix or text prefix.
fn resolve_task<'a>(doc: &'a StateDocument, query: &str) -> Result<&'a Task> {
    if let Some(task) = doc.tasks.iter().find(|t| t.id == query) {
        return Ok(task);
    }
    let query_lower = query.to_lowercase();
    let matches: Vec<&Task> = doc
        .tasks
        .iter()
        .filter(|t| {
            t.id.starts_with(query) || t.text.to_lowercase().starts_with(&query_lower)
        })
        .collect();
    match matches.len() {
        0 => bail!("No active task matching '{}'", query),
        1 => Ok(matches[0]),
        _ => bail!(
            "Ambiguous task '{}'. Matches:\n{}",
            query,
            matches
                .iter()
                .map(|t| format!("  - {}  {}", short_id(&t.id), t.text))
                .collect::<Vec<_>>()
                .join("\n")
        ),
    }
}

use anyhow::Result;
use serde_json::{json, Value};

use crate::app::App;
use crate::OutputFormat;

pub async fn run(app: &App, format: &OutputFormat) -> Result<()> {
    let doc = app.session.snapshot();

    // Reachability probe; None when the server cannot be reached at all.
    let health: Option<Value> = match app.http()?.get(format!("{}/health", app.server)).send().await
    {
        Ok(resp) if resp.status().is_success() => resp.json().await.ok(),
        _ => None,
    };

    match format {
        OutputFormat::Json => {
            let output = json!({
                "profile": app.profile,
                "server": app.server,
                "loggedIn": app.manager.enabled(),
                "localVersion": doc.meta.version,
                "tasks": doc.tasks.len(),
                "archivedTasks": doc.archived_tasks.len(),
                "folders": doc.folders.len(),
                "serverReachable": health.is_some(),
                "serverVersion": health.as_ref().map(|h| h["version"].clone()),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Plain => {
            println!("Profile:       {}", app.profile);
            println!("Server:        {}", app.server);
            println!(
                "Logged in:     {}",
                if app.manager.enabled() { "yes" } else { "no" }
            );
            println!("Local version: v{}", doc.meta.version);
            println!(
                "Tasks:         {} active, {} archived, {} folders",
                doc.tasks.len(),
                doc.archived_tasks.len(),
                doc.folders.len()
            );
            match health {
                Some(h) => println!(
                    "Server:        reachable (version {})",
                    h["version"].as_str().unwrap_or("?")
                ),
                None => println!("Server:        unreachable"),
            }
        }
    }
    Ok(())
}

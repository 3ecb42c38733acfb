use anyhow::{bail, Result};
use serde_json::json;

use taskdeck_lib::sync::{PullOptions, PushOptions};

use crate::app::App;
use crate::OutputFormat;

pub async fn pull(app: &App, format: &OutputFormat) -> Result<()> {
    app.require_login()?;
    let outcome = app.manager.pull_latest(PullOptions::default()).await;
    app.save_sync_tracker();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
        OutputFormat::Plain => {
            if outcome.applied {
                println!("Pulled state v{}", app.session.version());
            } else if outcome.not_found {
                println!("No remote state yet (push to seed it)");
            } else if let Some(err) = &outcome.error {
                println!("Pull failed: {}", err);
            } else {
                println!("Already up to date (v{})", app.session.version());
            }
        }
    }
    if let Some(err) = outcome.error {
        bail!("Pull failed: {}", err);
    }
    Ok(())
}

pub async fn push(app: &App, force: bool, format: &OutputFormat) -> Result<()> {
    app.require_login()?;
    let pushed = app
        .manager
        .push_state(PushOptions {
            force,
            retry_count: 0,
        })
        .await;
    app.save_sync_tracker();

    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({ "pushed": pushed, "version": app.session.version() })
        ),
        OutputFormat::Plain => {
            if pushed {
                println!("Pushed state v{}", app.session.version());
            } else {
                println!("Nothing pushed (already in sync, or the server refused)");
            }
        }
    }
    Ok(())
}

pub async fn watch(app: &App) -> Result<()> {
    app.require_login()?;
    app.manager.pull_latest(PullOptions::default()).await;

    let subscription = app.session.subscribe(|doc| {
        println!(
            "v{}: {} tasks, {} archived",
            doc.meta.version,
            doc.tasks.len(),
            doc.archived_tasks.len()
        );
    });
    app.manager.start_polling();
    println!("Watching for changes (Ctrl-C to stop)");

    tokio::signal::ctrl_c().await?;

    app.manager.stop_polling();
    app.session.unsubscribe(subscription);
    app.save_sync_tracker();
    Ok(())
}

//! taskdeck sync server.
//!
//! One versioned state document per account, stored as JSON files on disk.
//! Clients push whole documents with an optimistic version precondition and
//! poll for changes; see the `taskdeck-cli` binary for a terminal client.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use taskdeck_lib::server::store::{FileAuthStore, FileStateStore};
use taskdeck_lib::server::{start_server, AppState, AuthService, SESSION_COOKIE};
use taskdeck_lib::store::FileKeyValueStore;

#[derive(Parser, Debug)]
#[command(name = "taskdeck", about = "Sync backend for taskdeck", version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "TASKDECK_LISTEN", default_value = "127.0.0.1:8787")]
    listen: String,

    /// Directory for server data (defaults to the platform data dir)
    #[arg(long, env = "TASKDECK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Name of the session cookie set on login
    #[arg(long, env = "TASKDECK_SESSION_COOKIE", default_value = SESSION_COOKIE)]
    session_cookie: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let data_dir = match args.data_dir {
        Some(dir) => dir,
        None => FileKeyValueStore::default_data_dir()
            .context("Failed to resolve data directory")?
            .join("server"),
    };
    log::info!("Server data directory: {}", data_dir.display());

    let state_store = FileStateStore::new(data_dir.clone());
    state_store.init().context("Failed to create state storage")?;
    let auth_store = FileAuthStore::new(data_dir);
    auth_store.init().context("Failed to create auth storage")?;

    let state = Arc::new(
        AppState::new(
            Arc::new(state_store),
            AuthService::new(Arc::new(auth_store)),
        )
        .with_session_cookie(args.session_cookie),
    );

    let mut handle = start_server(&args.listen, state)
        .await
        .context("Failed to start server")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    log::info!("Shutting down");
    handle.stop();
    Ok(())
}

mod app;
mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "taskdeck-cli", about = "Terminal client for taskdeck sync", version)]
struct Cli {
    /// Sync server URL
    #[arg(
        long,
        global = true,
        env = "TASKDECK_SERVER",
        default_value = "http://127.0.0.1:8787"
    )]
    server: String,

    /// Profile name (separate local state and credentials)
    #[arg(long, global = true, default_value = "default")]
    profile: String,

    /// Output format
    #[arg(long, global = true, default_value = "plain")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Plain,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Create an account on the server and store its token
    Register {
        email: String,
        /// Password (read from stdin when omitted)
        #[arg(long)]
        password: Option<String>,
    },

    /// Log in and store the session token
    Login {
        email: String,
        /// Password (read from stdin when omitted)
        #[arg(long)]
        password: Option<String>,
    },

    /// Revoke the stored token and forget local credentials
    Logout,

    /// Show local state and server reachability
    Status,

    /// Fetch the latest remote state and merge it in
    Pull,

    /// Push local state to the server
    Push {
        /// Push even when nothing changed locally
        #[arg(long)]
        force: bool,
    },

    /// Poll for remote changes and print them as they arrive
    Watch,

    /// Add a task
    Add {
        text: String,
        /// Place in a folder (id or name, prefix match)
        #[arg(long)]
        folder: Option<String>,
    },

    /// Complete a task (prefix match on id or text)
    Done { task: String },

    /// List tasks
    Ls {
        /// Include archived tasks
        #[arg(long)]
        all: bool,
        /// Filter by folder (id or name, prefix match)
        #[arg(long)]
        folder: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let app = app::App::open(&cli.server, &cli.profile)?;

    match cli.command {
        Command::Register { email, password } => {
            commands::auth::register(&app, &email, password, &cli.format).await
        }
        Command::Login { email, password } => {
            commands::auth::login(&app, &email, password, &cli.format).await
        }
        Command::Logout => commands::auth::logout(&app, &cli.format).await,
        Command::Status => commands::status::run(&app, &cli.format).await,
        Command::Pull => commands::sync::pull(&app, &cli.format).await,
        Command::Push { force } => commands::sync::push(&app, force, &cli.format).await,
        Command::Watch => commands::sync::watch(&app).await,
        Command::Add { text, folder } => {
            commands::tasks::add(&app, &text, folder.as_deref(), &cli.format).await
        }
        Command::Done { task } => commands::tasks::done(&app, &task, &cli.format).await,
        Command::Ls { all, folder } => {
            commands::tasks::ls(&app, all, folder.as_deref(), &cli.format)
        }
    }
}

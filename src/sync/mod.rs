//! Client-side synchronization: remote HTTP client, tunables, and the
//! push/pull/poll manager.

mod client;
pub mod config;
mod manager;

pub use client::{PutStateResponse, RemoteClient, SyncError};
pub use config::{PullOptions, PullOutcome, PushOptions, SyncConfig, SyncState, SyncStatus};
pub use manager::SyncManager;

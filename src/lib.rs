//! taskdeck: a personal to-do list with versioned multi-device sync.
//!
//! Shared by the `taskdeck` server binary and the `taskdeck-cli` client.
//! `state` defines the document model and its tolerant normalizer,
//! `session` owns the live document for one profile, `sync` implements the
//! client side of the push/pull protocol, and `server` is the backend the
//! clients talk to.

pub mod prefs;
pub mod server;
pub mod session;
pub mod state;
pub mod store;
pub mod sync;

pub mod auth;
pub mod status;
pub mod sync;
pub mod tasks;

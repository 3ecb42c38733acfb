mod models;
mod normalize;

pub use models::*;
pub use normalize::{normalize, repair_system_folders};

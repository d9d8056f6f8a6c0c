pub mod cleanup_service;
pub mod database;
pub mod error_handling;
pub mod process_probe;

pub use cleanup_service::{CleanupService, CleanupStats};
pub use database::*;
pub use process_probe::OsProcessProbe;

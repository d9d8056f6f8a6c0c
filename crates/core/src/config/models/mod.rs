pub mod app_config;
pub mod database;
pub mod dispatcher_worker;
pub mod logging;
pub mod recovery;

pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use dispatcher_worker::WorkerConfig;
pub use logging::{LogFormat, LoggingConfig};
pub use recovery::{RecoveryConfig, RecoveryStrategy, RetentionConfig};

pub mod sqlite;

pub use sqlite::{BusyRetryPolicy, DatabaseManager, SqliteTaskRepository};

pub mod sqlite_task_repository;

pub use sqlite_task_repository::SqliteTaskRepository;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use taskqueue_core::{DatabaseConfig, QueueError, QueueResult};
use tracing::{debug, info};

use crate::{
    error_handling::{RepositoryErrorHelpers, RepositoryOperation},
    task_context,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 1,
    status TEXT NOT NULL DEFAULT 'PENDING',
    process_id INTEGER,
    worker_id TEXT,
    started_at DATETIME,
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL,
    completed_at DATETIME,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    error_message TEXT,
    result TEXT,
    CHECK (status IN ('PENDING', 'PROCESSING', 'COMPLETED', 'FAILED', 'CANCELLED')),
    CHECK (retry_count >= 0 AND retry_count <= max_retries)
)
"#;

const INDEXES: [&str; 3] = [
    "CREATE INDEX IF NOT EXISTS idx_tasks_process_status ON tasks(process_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_claim_order ON tasks(status, priority DESC, created_at, id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_agent_status ON tasks(agent_type, status)",
];

/// 单次操作遇到锁竞争时的退避重试策略
#[derive(Debug, Clone, Copy)]
pub struct BusyRetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl BusyRetryPolicy {
    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self {
            attempts: config.busy_retry_attempts.max(1),
            base_delay: Duration::from_millis(config.busy_retry_base_delay_ms),
        }
    }

    /// 第 `attempt` 次重试前的等待时间（从0开始），指数增长
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(10))
    }
}

impl Default for BusyRetryPolicy {
    fn default() -> Self {
        Self::from_config(&DatabaseConfig::default())
    }
}

pub struct DatabaseManager {
    pool: SqlitePool,
    retry_policy: BusyRetryPolicy,
}

impl DatabaseManager {
    /// 打开（必要时创建）数据库文件并执行迁移
    pub async fn new(config: &DatabaseConfig) -> QueueResult<Self> {
        config
            .validate()
            .map_err(|e| QueueError::config_error(e.to_string()))?;

        let connect_options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| QueueError::config_error(format!("无效的数据库URL {}: {e}", config.url)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(connect_options)
            .await
            .map_err(|e| QueueError::StoreUnavailable(format!("无法打开数据库 {}: {e}", config.url)))?;

        let manager = Self {
            pool,
            retry_policy: BusyRetryPolicy::from_config(config),
        };
        manager.migrate().await?;

        info!("数据库已就绪: {}", config.url);
        Ok(manager)
    }

    /// 单连接的内存数据库，用于测试
    pub async fn in_memory() -> QueueResult<Self> {
        let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| QueueError::config_error(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .map_err(|e| QueueError::StoreUnavailable(format!("无法打开内存数据库: {e}")))?;

        let manager = Self {
            pool,
            retry_policy: BusyRetryPolicy::default(),
        };
        manager.migrate().await?;
        Ok(manager)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn task_repository(&self) -> SqliteTaskRepository {
        SqliteTaskRepository::with_retry_policy(self.pool.clone(), self.retry_policy)
    }

    /// 幂等地创建表和索引
    pub async fn migrate(&self) -> QueueResult<()> {
        let context = task_context!(RepositoryOperation::Migrate);
        debug!("Running SQLite database migrations");

        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(&context, e))?;

        for index_sql in INDEXES {
            sqlx::query(index_sql)
                .execute(&self.pool)
                .await
                .map_err(|e| RepositoryErrorHelpers::task_database_error(&context, e))?;
        }

        debug!("Successfully completed SQLite database migrations");
        Ok(())
    }

    pub async fn health_check(&self) -> QueueResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

use thiserror::Error;

/// SQLite 主结果码：数据库文件被其他连接锁定
const SQLITE_BUSY: i64 = 5;
/// SQLite 主结果码：同一连接内的表锁冲突
const SQLITE_LOCKED: i64 = 6;

/// 任务队列错误类型定义
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("存储暂时繁忙: {0}")]
    StoreBusy(String),

    #[error("存储不可用: {0}")]
    StoreUnavailable(String),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },

    #[error("任务 {id} 无法从 {from} 转换到 {to}")]
    InvalidTransition { id: i64, from: String, to: String },

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("IO错误: {0}")]
    Io(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type QueueResult<T> = std::result::Result<T, QueueError>;

impl QueueError {
    pub fn task_not_found(id: i64) -> Self {
        Self::TaskNotFound { id }
    }

    pub fn invalid_transition(id: i64, from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            id,
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 瞬时的锁竞争，调用方可以对单次操作退避重试
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueError::StoreBusy(_) => true,
            QueueError::Database(e) => is_busy_error(e),
            _ => false,
        }
    }

    /// 进程无法继续运行的错误
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            QueueError::StoreUnavailable(_) | QueueError::Configuration(_) | QueueError::Internal(_)
        )
    }
}

/// 判断 sqlx 错误是否为 SQLite 的 BUSY/LOCKED（扩展码取低8位）
pub fn is_busy_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => db_err
            .code()
            .and_then(|code| code.parse::<i64>().ok())
            .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
            .unwrap_or(false),
        _ => false,
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        QueueError::Io(err.to_string())
    }
}

impl From<anyhow::Error> for QueueError {
    fn from(err: anyhow::Error) -> Self {
        QueueError::Internal(err.to_string())
    }
}

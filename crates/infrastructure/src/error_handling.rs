//! 仓储操作的错误上下文
//!
//! 为每次数据库操作记录操作类型与任务标识，统一转换 sqlx 错误并输出结构化日志。

use std::fmt;

use sqlx::Error as SqlxError;
use taskqueue_core::{is_busy_error, QueueError};
use tracing::{debug, error};

/// 仓储操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryOperation {
    Create,
    Read,
    Query,
    Claim,
    Complete,
    Fail,
    Cancel,
    Recover,
    Delete,
    Migrate,
}

impl fmt::Display for RepositoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryOperation::Create => write!(f, "创建"),
            RepositoryOperation::Read => write!(f, "查询"),
            RepositoryOperation::Query => write!(f, "列表查询"),
            RepositoryOperation::Claim => write!(f, "领取"),
            RepositoryOperation::Complete => write!(f, "完成"),
            RepositoryOperation::Fail => write!(f, "失败处理"),
            RepositoryOperation::Cancel => write!(f, "取消"),
            RepositoryOperation::Recover => write!(f, "恢复"),
            RepositoryOperation::Delete => write!(f, "删除"),
            RepositoryOperation::Migrate => write!(f, "迁移"),
        }
    }
}

/// 任务仓储操作的上下文信息
#[derive(Debug, Clone)]
pub struct TaskOperationContext {
    pub operation: RepositoryOperation,
    pub task_id: Option<i64>,
    pub worker_id: Option<String>,
    pub process_id: Option<u32>,
    pub additional_info: Option<String>,
}

impl TaskOperationContext {
    pub fn new(operation: RepositoryOperation) -> Self {
        Self {
            operation,
            task_id: None,
            worker_id: None,
            process_id: None,
            additional_info: None,
        }
    }

    pub fn with_task_id(mut self, task_id: i64) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_process_id(mut self, process_id: u32) -> Self {
        self.process_id = Some(process_id);
        self
    }

    pub fn with_additional_info(mut self, info: impl Into<String>) -> Self {
        self.additional_info = Some(info.into());
        self
    }

    pub fn entity_description(&self) -> String {
        match (&self.task_id, &self.worker_id) {
            (Some(id), Some(worker_id)) => format!("任务 (ID: {id}, Worker: {worker_id})"),
            (Some(id), None) => format!("任务 (ID: {id})"),
            (None, Some(worker_id)) => format!("任务 (Worker: {worker_id})"),
            (None, None) => match self.process_id {
                Some(pid) => format!("任务 (进程: {pid})"),
                None => "任务".to_string(),
            },
        }
    }
}

pub struct RepositoryErrorHelpers;

impl RepositoryErrorHelpers {
    /// 将 sqlx 错误转换为带上下文的队列错误
    ///
    /// 锁竞争转换为 `StoreBusy`，由调用方决定是否重试。
    pub fn task_database_error(context: &TaskOperationContext, error: SqlxError) -> QueueError {
        let entity_desc = context.entity_description();
        let operation_desc = context.operation;

        if is_busy_error(&error) {
            let msg = format!("{operation_desc}{entity_desc}时数据库被锁定: {error}");
            debug!(error = %error, "{}", msg);
            return QueueError::StoreBusy(msg);
        }

        let error_msg = match &error {
            SqlxError::PoolClosed => format!("{operation_desc}{entity_desc}时数据库连接池已关闭"),
            SqlxError::Io(io_error) => {
                format!("{operation_desc}{entity_desc}时发生I/O错误: {io_error}")
            }
            _ => format!("{operation_desc}{entity_desc}时发生数据库错误: {error}"),
        };

        error!(error = %error, "{}", error_msg);
        match error {
            SqlxError::PoolClosed | SqlxError::Io(_) => QueueError::StoreUnavailable(error_msg),
            other => QueueError::Database(other),
        }
    }

    /// 重试次数耗尽后的锁竞争
    pub fn busy_exhausted(context: &TaskOperationContext, attempts: u32) -> QueueError {
        let msg = format!(
            "{}{}时数据库持续繁忙，已重试{}次",
            context.operation,
            context.entity_description(),
            attempts
        );
        error!("{}", msg);
        QueueError::StoreUnavailable(msg)
    }

    pub fn log_operation_success(context: &TaskOperationContext, details: Option<&str>) {
        match details {
            Some(details) => debug!(
                "{}{}成功: {}",
                context.operation,
                context.entity_description(),
                details
            ),
            None => debug!("{}{}成功", context.operation, context.entity_description()),
        }
    }
}

#[macro_export]
macro_rules! task_context {
    ($operation:expr) => {
        $crate::error_handling::TaskOperationContext::new($operation)
    };
    ($operation:expr, task_id = $task_id:expr) => {
        $crate::error_handling::TaskOperationContext::new($operation).with_task_id($task_id)
    };
    ($operation:expr, task_id = $task_id:expr, worker_id = $worker_id:expr) => {
        $crate::error_handling::TaskOperationContext::new($operation)
            .with_task_id($task_id)
            .with_worker_id($worker_id)
    };
}

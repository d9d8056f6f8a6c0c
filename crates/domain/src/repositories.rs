//! 领域仓储抽象
//!
//! 每个写操作都是一条带前置条件的原子更新：`WHERE` 中重新校验期望的状态
//! 以及归属字段，返回值表示更新是否生效。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entities::{NewTask, Task, TaskFilter, TaskLease, TaskStatus};
use crate::value_objects::StatusCounts;
use taskqueue_core::QueueResult;

/// 任务仓储抽象
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 插入 PENDING 任务，返回新分配的 id
    async fn insert(&self, task: &NewTask) -> QueueResult<i64>;

    async fn get(&self, id: i64) -> QueueResult<Option<Task>>;

    /// 原子地领取优先级最高、创建最早的 PENDING 任务
    ///
    /// `agent_types` 为空时不过滤。
    async fn claim_next(
        &self,
        agent_types: &[String],
        process_id: u32,
        worker_id: &str,
    ) -> QueueResult<Option<Task>>;

    /// 租约仍然有效时标记 COMPLETED
    async fn complete(&self, lease: &TaskLease, result: Option<&str>) -> QueueResult<bool>;

    /// 租约仍然有效时记录失败，返回变更后的状态（PENDING 表示已重新排队）
    async fn fail(
        &self,
        lease: &TaskLease,
        error: &str,
        retryable: bool,
    ) -> QueueResult<Option<TaskStatus>>;

    /// 取消 PENDING 任务；`allow_processing` 时也可取消 PROCESSING 任务
    async fn cancel(&self, id: i64, allow_processing: bool) -> QueueResult<bool>;

    async fn cancel_pending(&self, agent_type: Option<&str>) -> QueueResult<u64>;

    async fn list(&self, filter: &TaskFilter) -> QueueResult<Vec<Task>>;

    async fn list_processing(&self) -> QueueResult<Vec<Task>>;

    /// 清除归属并重置为 PENDING，不消耗重试次数
    async fn reset_if_owned(&self, lease: &TaskLease) -> QueueResult<bool>;

    /// 以租约为条件标记 FAILED
    async fn fail_if_owned(&self, lease: &TaskLease, error: &str) -> QueueResult<bool>;

    /// 将指定进程持有的全部 PROCESSING 任务标记为 FAILED
    async fn fail_processing_for_process(&self, process_id: u32, error: &str)
        -> QueueResult<u64>;

    async fn status_counts(&self) -> QueueResult<StatusCounts>;

    async fn oldest_pending_at(&self) -> QueueResult<Option<DateTime<Utc>>>;

    async fn newest_task_at(&self) -> QueueResult<Option<DateTime<Utc>>>;

    /// 删除 `completed_at` 早于 `cutoff` 的终态任务
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> QueueResult<u64>;
}

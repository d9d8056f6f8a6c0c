use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use taskqueue_core::{QueueError, QueueResult};
use taskqueue_domain::{
    entities::{NewTask, Task, TaskFilter, TaskLease, TaskPriority, TaskStatus, TransitionOutcome, WorkerId},
    repositories::TaskRepository,
    value_objects::{QueueSnapshot, StatusCounts},
};
use tracing::{debug, info, instrument, warn};

/// 任务队列的公共接口
///
/// 所有状态变更都委托给仓储的条件更新，队列本身不持有锁也不缓存任务。
/// `process_id` 是调用方进程的标识，领取时写入任务，提交结果时用于校验归属。
#[derive(Clone)]
pub struct TaskQueue {
    repository: Arc<dyn TaskRepository>,
    process_id: u32,
}

impl TaskQueue {
    pub fn new(repository: Arc<dyn TaskRepository>) -> Self {
        Self {
            repository,
            process_id: std::process::id(),
        }
    }

    /// 以指定进程身份操作队列，测试中用于模拟其他进程
    pub fn with_process_id(mut self, process_id: u32) -> Self {
        self.process_id = process_id;
        self
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn repository(&self) -> Arc<dyn TaskRepository> {
        self.repository.clone()
    }

    /// 本进程内第 `index` 个 Worker 的标识
    pub fn worker_id(&self, index: u32) -> WorkerId {
        WorkerId::new(self.process_id, index)
    }

    pub async fn submit(
        &self,
        agent_type: &str,
        payload: &str,
        priority: TaskPriority,
        max_retries: i32,
    ) -> QueueResult<i64> {
        self.submit_task(
            NewTask::new(agent_type, payload)
                .with_priority(priority)
                .with_max_retries(max_retries),
        )
        .await
    }

    #[instrument(skip(self, task), fields(agent_type = %task.agent_type))]
    pub async fn submit_task(&self, task: NewTask) -> QueueResult<i64> {
        if task.agent_type.trim().is_empty() {
            return Err(QueueError::config_error("agent_type 不能为空"));
        }
        if task.max_retries < 0 {
            return Err(QueueError::config_error(format!(
                "max_retries 不能为负数: {}",
                task.max_retries
            )));
        }

        let id = self.repository.insert(&task).await?;
        counter!("taskqueue_tasks_submitted_total").increment(1);
        info!(
            "提交任务 {} (类型: {}, 优先级: {})",
            id, task.agent_type, task.priority
        );
        Ok(id)
    }

    /// 领取一个任务；没有可领取的任务时返回 `None`，由调用方负责退避
    pub async fn claim(
        &self,
        agent_type_filter: &[String],
        worker_id: &WorkerId,
    ) -> QueueResult<Option<Task>> {
        if worker_id.process_id != self.process_id {
            return Err(QueueError::Internal(format!(
                "Worker {} 不属于进程 {}",
                worker_id, self.process_id
            )));
        }

        let task = self
            .repository
            .claim_next(agent_type_filter, self.process_id, &worker_id.to_string())
            .await?;

        if let Some(task) = &task {
            counter!("taskqueue_tasks_claimed_total").increment(1);
            debug!(
                "Worker {} 领取任务 {} (类型: {})",
                worker_id, task.id, task.agent_type
            );
        }
        Ok(task)
    }

    /// 持有者提交成功结果
    ///
    /// 任务已被恢复、取消或关闭流程接管时返回 `OwnershipLost`，结果被丢弃。
    pub async fn complete(
        &self,
        lease: &TaskLease,
        result: Option<&str>,
    ) -> QueueResult<TransitionOutcome> {
        if lease.process_id != self.process_id {
            return Ok(self.ownership_lost(lease, "complete"));
        }

        if self.repository.complete(lease, result).await? {
            counter!("taskqueue_tasks_completed_total").increment(1);
            debug!("任务 {} 已完成", lease.task_id);
            Ok(TransitionOutcome::Applied(TaskStatus::Completed))
        } else {
            Ok(self.ownership_lost(lease, "complete"))
        }
    }

    /// 持有者报告失败；可重试且未超过重试上限时重新排队
    pub async fn fail(
        &self,
        lease: &TaskLease,
        error: &str,
        retryable: bool,
    ) -> QueueResult<TransitionOutcome> {
        if lease.process_id != self.process_id {
            return Ok(self.ownership_lost(lease, "fail"));
        }

        match self.repository.fail(lease, error, retryable).await? {
            Some(status) => {
                let retried = status == TaskStatus::Pending;
                counter!("taskqueue_tasks_failed_total", "retried" => retried.to_string())
                    .increment(1);
                if retried {
                    info!("任务 {} 执行失败，重新排队: {}", lease.task_id, error);
                } else {
                    warn!("任务 {} 执行失败: {}", lease.task_id, error);
                }
                Ok(TransitionOutcome::Applied(status))
            }
            None => Ok(self.ownership_lost(lease, "fail")),
        }
    }

    fn ownership_lost(&self, lease: &TaskLease, operation: &str) -> TransitionOutcome {
        counter!("taskqueue_tasks_ownership_lost_total").increment(1);
        warn!(
            task_id = lease.task_id,
            worker_id = %lease.worker_id,
            "Worker {} 已不再持有任务 {}，忽略 {} 请求",
            lease.worker_id,
            lease.task_id,
            operation
        );
        TransitionOutcome::OwnershipLost
    }

    /// 取消单个任务
    ///
    /// PENDING 任务总是可以取消；PROCESSING 任务需要 `force`，执行中的 Worker 不会被中断，
    /// 但它之后的提交会被拒绝。
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: i64, force: bool) -> QueueResult<()> {
        if self.repository.cancel(id, force).await? {
            info!("任务 {} 已取消", id);
            return Ok(());
        }

        match self.repository.get(id).await? {
            None => Err(QueueError::task_not_found(id)),
            Some(task) => Err(QueueError::invalid_transition(
                id,
                task.status,
                TaskStatus::Cancelled,
            )),
        }
    }

    /// 批量取消 PENDING 任务
    pub async fn cancel_all(&self, agent_type: Option<&str>) -> QueueResult<u64> {
        let cancelled = self.repository.cancel_pending(agent_type).await?;
        info!(
            "批量取消{}个待处理任务 (类型: {})",
            cancelled,
            agent_type.unwrap_or("全部")
        );
        Ok(cancelled)
    }

    pub async fn get(&self, id: i64) -> QueueResult<Option<Task>> {
        self.repository.get(id).await
    }

    pub async fn list(&self, filter: &TaskFilter) -> QueueResult<Vec<Task>> {
        self.repository.list(filter).await
    }

    pub async fn status_counts(&self) -> QueueResult<StatusCounts> {
        self.repository.status_counts().await
    }

    /// 队列全部内容的只读快照
    pub async fn snapshot(&self) -> QueueResult<QueueSnapshot> {
        let tasks = self.repository.list(&TaskFilter::default()).await?;
        let status_counts = self.repository.status_counts().await?;
        let hostname = hostname::get()
            .unwrap_or_else(|_| "unknown".into())
            .to_string_lossy()
            .to_string();

        Ok(QueueSnapshot {
            exported_at: Utc::now(),
            hostname,
            total: tasks.len() as u64,
            status_counts,
            tasks,
        })
    }

    /// 将快照以 JSON 写入文件，返回导出的任务数
    pub async fn export(&self, path: impl AsRef<Path>) -> QueueResult<u64> {
        let path = path.as_ref();
        let snapshot = self.snapshot().await?;
        let content = serde_json::to_vec_pretty(&snapshot)?;
        tokio::fs::write(path, content).await?;

        info!("导出{}个任务到 {}", snapshot.total, path.display());
        Ok(snapshot.total)
    }

    /// 删除完成时间早于 `max_age` 之前的终态任务
    pub async fn cleanup_old(&self, max_age: chrono::Duration) -> QueueResult<u64> {
        let cutoff = Utc::now() - max_age;
        let deleted = self.repository.delete_terminal_before(cutoff).await?;
        info!("删除{}个早于 {} 的终态任务", deleted, cutoff);
        Ok(deleted)
    }

    /// 将本进程持有的全部 PROCESSING 任务标记为 FAILED
    pub async fn fail_own_processing(&self, reason: &str) -> QueueResult<u64> {
        let message = format!("process terminated: {reason}");
        let failed = self
            .repository
            .fail_processing_for_process(self.process_id, &message)
            .await?;
        if failed > 0 {
            warn!("进程 {} 终止，{}个执行中的任务标记为失败", self.process_id, failed);
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::in_memory_queue;

    #[tokio::test]
    async fn test_priority_ordering() {
        let queue = in_memory_queue().await;
        let low = queue.submit("score", "l", TaskPriority::Low, 3).await.unwrap();
        let high = queue.submit("score", "h", TaskPriority::High, 3).await.unwrap();
        let normal = queue.submit("score", "n", TaskPriority::Normal, 3).await.unwrap();

        let worker = queue.worker_id(0);
        let mut claimed = Vec::new();
        while let Some(task) = queue.claim(&[], &worker).await.unwrap() {
            claimed.push(task.id);
        }
        assert_eq!(claimed, vec![high, normal, low]);
    }

    #[tokio::test]
    async fn test_retry_bound() {
        let queue = in_memory_queue().await;
        let id = queue.submit("score", "x", TaskPriority::Normal, 2).await.unwrap();
        let worker = queue.worker_id(0);

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            let task = queue.claim(&[], &worker).await.unwrap().unwrap();
            let outcome = queue
                .fail(&task.lease().unwrap(), "rate limited", true)
                .await
                .unwrap();
            outcomes.push(outcome);
        }

        assert_eq!(
            outcomes,
            vec![
                TransitionOutcome::Applied(TaskStatus::Pending),
                TransitionOutcome::Applied(TaskStatus::Pending),
                TransitionOutcome::Applied(TaskStatus::Failed),
            ]
        );
        let task = queue.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 2);
        assert!(queue.claim(&[], &worker).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_after_forced_cancel_reports_ownership_lost() {
        let queue = in_memory_queue().await;
        let id = queue.submit("score", "x", TaskPriority::Normal, 0).await.unwrap();
        let task = queue.claim(&[], &queue.worker_id(1)).await.unwrap().unwrap();

        assert!(matches!(
            queue.cancel(id, false).await,
            Err(QueueError::InvalidTransition { .. })
        ));
        queue.cancel(id, true).await.unwrap();

        let outcome = queue.complete(&task.lease().unwrap(), Some("late")).await.unwrap();
        assert_eq!(outcome, TransitionOutcome::OwnershipLost);
        assert_eq!(
            queue.get(id).await.unwrap().unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cancel_errors() {
        let queue = in_memory_queue().await;
        assert!(matches!(
            queue.cancel(99, true).await,
            Err(QueueError::TaskNotFound { id: 99 })
        ));

        let id = queue.submit("score", "x", TaskPriority::Normal, 0).await.unwrap();
        let task = queue.claim(&[], &queue.worker_id(0)).await.unwrap().unwrap();
        queue.complete(&task.lease().unwrap(), None).await.unwrap();

        let err = queue.cancel(id, true).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_lease_from_other_process_is_rejected() {
        let queue = in_memory_queue().await;
        queue.submit("score", "x", TaskPriority::Normal, 0).await.unwrap();
        let other = queue.clone().with_process_id(queue.process_id() + 1);

        let task = other.claim(&[], &other.worker_id(0)).await.unwrap().unwrap();
        let lease = task.lease().unwrap();
        assert_eq!(
            queue.complete(&lease, None).await.unwrap(),
            TransitionOutcome::OwnershipLost
        );
        assert!(other.complete(&lease, None).await.unwrap().is_applied());
    }

    #[tokio::test]
    async fn test_claim_rejects_foreign_worker_id() {
        let queue = in_memory_queue().await;
        let foreign = WorkerId::new(queue.process_id() + 1, 0);
        assert!(queue.claim(&[], &foreign).await.is_err());
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let queue = in_memory_queue().await;
        assert!(queue.submit("", "x", TaskPriority::Normal, 1).await.is_err());
        assert!(queue.submit("score", "x", TaskPriority::Normal, -1).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_all_only_touches_pending() {
        let queue = in_memory_queue().await;
        queue.submit("score", "a", TaskPriority::Normal, 0).await.unwrap();
        queue.submit("score", "b", TaskPriority::Normal, 0).await.unwrap();
        queue.submit("report", "c", TaskPriority::Normal, 0).await.unwrap();
        let running = queue.claim(&[], &queue.worker_id(0)).await.unwrap().unwrap();

        let cancelled = queue.cancel_all(None).await.unwrap();
        assert_eq!(cancelled, 2);
        assert_eq!(
            queue.get(running.id).await.unwrap().unwrap().status,
            TaskStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_export_writes_snapshot() {
        let queue = in_memory_queue().await;
        queue.submit("score", r#"{"q":"rust"}"#, TaskPriority::High, 1).await.unwrap();
        queue.submit("report", "plain text", TaskPriority::Low, 1).await.unwrap();
        queue.claim(&[], &queue.worker_id(0)).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.json");
        let exported = queue.export(&path).await.unwrap();
        assert_eq!(exported, 2);

        let content = std::fs::read_to_string(&path).unwrap();
        let snapshot: QueueSnapshot = serde_json::from_str(&content).unwrap();
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.status_counts.pending, 1);
        assert_eq!(snapshot.status_counts.processing, 1);
        assert_eq!(snapshot.tasks[0].payload, r#"{"q":"rust"}"#);
        assert!(!snapshot.hostname.is_empty());
    }

    #[tokio::test]
    async fn test_fail_own_processing_is_scoped_to_process() {
        let queue = in_memory_queue().await;
        let other = queue.clone().with_process_id(queue.process_id() + 1);
        queue.submit("score", "a", TaskPriority::Normal, 0).await.unwrap();
        queue.submit("score", "b", TaskPriority::Normal, 0).await.unwrap();
        let mine = queue.claim(&[], &queue.worker_id(0)).await.unwrap().unwrap();
        let theirs = other.claim(&[], &other.worker_id(0)).await.unwrap().unwrap();

        assert_eq!(queue.fail_own_processing("SIGTERM").await.unwrap(), 1);
        let failed = queue.get(mine.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(
            failed.error_message.as_deref(),
            Some("process terminated: SIGTERM")
        );
        assert_eq!(
            queue.get(theirs.id).await.unwrap().unwrap().status,
            TaskStatus::Processing
        );
        assert_eq!(queue.fail_own_processing("SIGTERM").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_old_keeps_recent() {
        let queue = in_memory_queue().await;
        let id = queue.submit("score", "a", TaskPriority::Normal, 0).await.unwrap();
        queue.cancel(id, false).await.unwrap();

        assert_eq!(queue.cleanup_old(chrono::Duration::hours(1)).await.unwrap(), 0);
        assert_eq!(queue.cleanup_old(chrono::Duration::seconds(-5)).await.unwrap(), 1);
        assert!(queue.get(id).await.unwrap().is_none());
    }
}

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use taskqueue_core::{QueueError, QueueResult};
use taskqueue_domain::{
    entities::{NewTask, Task, TaskFilter, TaskLease, TaskPriority, TaskStatus},
    repositories::TaskRepository,
    value_objects::StatusCounts,
};
use tracing::{debug, instrument};

use super::BusyRetryPolicy;
use crate::{
    error_handling::{RepositoryErrorHelpers, RepositoryOperation, TaskOperationContext},
    task_context,
};

const TASK_COLUMNS: &str = "id, agent_type, payload, priority, status, process_id, worker_id, \
     started_at, created_at, updated_at, completed_at, retry_count, max_retries, error_message, result";

/// 租约条件：状态、进程、Worker 与领取时间必须全部匹配，参数从 `$first` 起连续编号
fn lease_predicate(first: usize) -> String {
    format!(
        "id = ${} AND status = 'PROCESSING' AND process_id = ${} AND worker_id = ${} AND started_at = ${}",
        first,
        first + 1,
        first + 2,
        first + 3
    )
}

pub struct SqliteTaskRepository {
    pool: SqlitePool,
    retry_policy: BusyRetryPolicy,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_retry_policy(pool, BusyRetryPolicy::default())
    }

    pub fn with_retry_policy(pool: SqlitePool, retry_policy: BusyRetryPolicy) -> Self {
        Self { pool, retry_policy }
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> QueueResult<Task> {
        let priority_value: i64 = row.try_get("priority")?;
        let priority = TaskPriority::from_i64(priority_value).ok_or_else(|| {
            QueueError::Serialization(format!("无效的任务优先级: {priority_value}"))
        })?;

        let process_id = row
            .try_get::<Option<i64>, _>("process_id")?
            .map(|pid| {
                u32::try_from(pid)
                    .map_err(|_| QueueError::Serialization(format!("无效的进程ID: {pid}")))
            })
            .transpose()?;

        Ok(Task {
            id: row.try_get("id")?,
            agent_type: row.try_get("agent_type")?,
            payload: row.try_get("payload")?,
            priority,
            status: row.try_get("status")?,
            process_id,
            worker_id: row.try_get("worker_id")?,
            started_at: row.try_get("started_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            error_message: row.try_get("error_message")?,
            result: row.try_get("result")?,
        })
    }

    /// 执行单个数据库操作，锁竞争时按策略退避重试
    async fn with_busy_retry<T, F, Fut>(
        &self,
        context: &TaskOperationContext,
        mut operation: F,
    ) -> QueueResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let err = RepositoryErrorHelpers::task_database_error(context, e);
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    attempt += 1;
                    if attempt >= self.retry_policy.attempts {
                        return Err(RepositoryErrorHelpers::busy_exhausted(context, attempt));
                    }
                    let delay = self.retry_policy.delay_for(attempt - 1);
                    debug!(
                        "数据库繁忙，{:?}后第{}次重试{}",
                        delay,
                        attempt,
                        context.entity_description()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    #[instrument(skip(self, task), fields(agent_type = %task.agent_type, priority = %task.priority))]
    async fn insert(&self, task: &NewTask) -> QueueResult<i64> {
        let context = task_context!(RepositoryOperation::Create)
            .with_additional_info(format!("类型: {}", task.agent_type));
        let pool = &self.pool;
        let now = Utc::now();

        let id: i64 = self
            .with_busy_retry(&context, move || async move {
                sqlx::query_scalar(
                    r#"
                    INSERT INTO tasks (agent_type, payload, priority, status, created_at, updated_at, retry_count, max_retries)
                    VALUES ($1, $2, $3, 'PENDING', $4, $4, 0, $5)
                    RETURNING id
                    "#,
                )
                .bind(&task.agent_type)
                .bind(&task.payload)
                .bind(task.priority.as_i64())
                .bind(now)
                .bind(task.max_retries)
                .fetch_one(pool)
                .await
            })
            .await?;

        RepositoryErrorHelpers::log_operation_success(
            &context.with_task_id(id),
            Some(&format!("类型: {}", task.agent_type)),
        );
        Ok(id)
    }

    #[instrument(skip(self), fields(task_id = %id))]
    async fn get(&self, id: i64) -> QueueResult<Option<Task>> {
        let context = task_context!(RepositoryOperation::Read, task_id = id);
        let pool = &self.pool;
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
        let sql = sql.as_str();

        let row = self
            .with_busy_retry(&context, move || async move {
                sqlx::query(sql).bind(id).fetch_optional(pool).await
            })
            .await?;

        match row {
            Some(row) => Ok(Some(Self::row_to_task(&row)?)),
            None => {
                debug!("查询任务不存在: ID {}", id);
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, agent_types), fields(worker_id = %worker_id))]
    async fn claim_next(
        &self,
        agent_types: &[String],
        process_id: u32,
        worker_id: &str,
    ) -> QueueResult<Option<Task>> {
        let context = TaskOperationContext::new(RepositoryOperation::Claim)
            .with_worker_id(worker_id)
            .with_process_id(process_id);
        let pool = &self.pool;

        let type_filter = if agent_types.is_empty() {
            String::new()
        } else {
            let placeholders: Vec<String> =
                (0..agent_types.len()).map(|i| format!("${}", i + 4)).collect();
            format!("AND agent_type IN ({})", placeholders.join(", "))
        };

        // 选择与状态切换在同一条语句内完成，外层条件再次校验 PENDING
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = 'PROCESSING', process_id = $1, worker_id = $2, started_at = $3, updated_at = $3
            WHERE id = (
                SELECT id FROM tasks
                WHERE status = 'PENDING' {type_filter}
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT 1
            )
            AND status = 'PENDING'
            RETURNING {TASK_COLUMNS}
            "#
        );
        let sql = sql.as_str();

        let row = self
            .with_busy_retry(&context, move || async move {
                let mut query = sqlx::query(sql)
                    .bind(i64::from(process_id))
                    .bind(worker_id)
                    .bind(Utc::now());
                for agent_type in agent_types {
                    query = query.bind(agent_type.as_str());
                }
                query.fetch_optional(pool).await
            })
            .await?;

        match row {
            Some(row) => {
                let task = Self::row_to_task(&row)?;
                RepositoryErrorHelpers::log_operation_success(
                    &context.with_task_id(task.id),
                    Some(&format!("类型: {}, 优先级: {}", task.agent_type, task.priority)),
                );
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, lease, result), fields(task_id = %lease.task_id, worker_id = %lease.worker_id))]
    async fn complete(&self, lease: &TaskLease, result: Option<&str>) -> QueueResult<bool> {
        let context = task_context!(
            RepositoryOperation::Complete,
            task_id = lease.task_id,
            worker_id = lease.worker_id.as_str()
        );
        let pool = &self.pool;
        let sql = format!(
            "UPDATE tasks SET status = 'COMPLETED', completed_at = $1, updated_at = $1, result = $2 \
             WHERE {}",
            lease_predicate(3)
        );
        let sql = sql.as_str();

        let outcome = self
            .with_busy_retry(&context, move || async move {
                sqlx::query(sql)
                    .bind(Utc::now())
                    .bind(result)
                    .bind(lease.task_id)
                    .bind(i64::from(lease.process_id))
                    .bind(lease.worker_id.as_str())
                    .bind(lease.started_at)
                    .execute(pool)
                    .await
            })
            .await?;

        Ok(outcome.rows_affected() == 1)
    }

    #[instrument(skip(self, lease, error), fields(task_id = %lease.task_id, retryable = retryable))]
    async fn fail(
        &self,
        lease: &TaskLease,
        error: &str,
        retryable: bool,
    ) -> QueueResult<Option<TaskStatus>> {
        let context = task_context!(
            RepositoryOperation::Fail,
            task_id = lease.task_id,
            worker_id = lease.worker_id.as_str()
        );
        let pool = &self.pool;

        // SET 中的表达式都基于更新前的行，重试判断与状态写入在同一步完成
        let sql = format!(
            r#"
            UPDATE tasks
            SET status = CASE WHEN $7 AND retry_count < max_retries THEN 'PENDING' ELSE 'FAILED' END,
                retry_count = CASE WHEN $7 AND retry_count < max_retries THEN retry_count + 1 ELSE retry_count END,
                process_id = CASE WHEN $7 AND retry_count < max_retries THEN NULL ELSE process_id END,
                worker_id = CASE WHEN $7 AND retry_count < max_retries THEN NULL ELSE worker_id END,
                started_at = CASE WHEN $7 AND retry_count < max_retries THEN NULL ELSE started_at END,
                completed_at = CASE WHEN $7 AND retry_count < max_retries THEN NULL ELSE $1 END,
                error_message = $2,
                updated_at = $1
            WHERE {}
            RETURNING status
            "#,
            lease_predicate(3)
        );
        let sql = sql.as_str();

        let status: Option<TaskStatus> = self
            .with_busy_retry(&context, move || async move {
                sqlx::query_scalar(sql)
                    .bind(Utc::now())
                    .bind(error)
                    .bind(lease.task_id)
                    .bind(i64::from(lease.process_id))
                    .bind(lease.worker_id.as_str())
                    .bind(lease.started_at)
                    .bind(retryable)
                    .fetch_optional(pool)
                    .await
            })
            .await?;

        if let Some(status) = status {
            RepositoryErrorHelpers::log_operation_success(&context, Some(&format!("新状态: {status}")));
        }
        Ok(status)
    }

    #[instrument(skip(self), fields(task_id = %id))]
    async fn cancel(&self, id: i64, allow_processing: bool) -> QueueResult<bool> {
        let context = task_context!(RepositoryOperation::Cancel, task_id = id);
        let pool = &self.pool;

        let outcome = self
            .with_busy_retry(&context, move || async move {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET status = 'CANCELLED', process_id = NULL, worker_id = NULL, started_at = NULL,
                        completed_at = $1, updated_at = $1
                    WHERE id = $2 AND (status = 'PENDING' OR ($3 AND status = 'PROCESSING'))
                    "#,
                )
                .bind(Utc::now())
                .bind(id)
                .bind(allow_processing)
                .execute(pool)
                .await
            })
            .await?;

        Ok(outcome.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn cancel_pending(&self, agent_type: Option<&str>) -> QueueResult<u64> {
        let context = task_context!(RepositoryOperation::Cancel)
            .with_additional_info(format!("批量取消, 类型: {}", agent_type.unwrap_or("全部")));
        let pool = &self.pool;

        let outcome = self
            .with_busy_retry(&context, move || async move {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET status = 'CANCELLED', completed_at = $1, updated_at = $1
                    WHERE status = 'PENDING' AND ($2 IS NULL OR agent_type = $2)
                    "#,
                )
                .bind(Utc::now())
                .bind(agent_type)
                .execute(pool)
                .await
            })
            .await?;

        Ok(outcome.rows_affected())
    }

    #[instrument(skip(self, filter))]
    async fn list(&self, filter: &TaskFilter) -> QueueResult<Vec<Task>> {
        let context = task_context!(RepositoryOperation::Query);
        let pool = &self.pool;

        let rows = self
            .with_busy_retry(&context, move || async move {
                let mut builder: QueryBuilder<Sqlite> =
                    QueryBuilder::new(format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1 = 1"));
                if let Some(status) = filter.status {
                    builder.push(" AND status = ").push_bind(status);
                }
                if let Some(agent_type) = filter.agent_type.as_deref() {
                    builder.push(" AND agent_type = ").push_bind(agent_type);
                }
                builder.push(" ORDER BY id");
                match (filter.limit, filter.offset) {
                    (Some(limit), offset) => {
                        builder.push(" LIMIT ").push_bind(limit);
                        if let Some(offset) = offset {
                            builder.push(" OFFSET ").push_bind(offset);
                        }
                    }
                    (None, Some(offset)) => {
                        builder.push(" LIMIT -1 OFFSET ").push_bind(offset);
                    }
                    (None, None) => {}
                }
                builder.build().fetch_all(pool).await
            })
            .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn list_processing(&self) -> QueueResult<Vec<Task>> {
        let context = task_context!(RepositoryOperation::Query);
        let pool = &self.pool;
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'PROCESSING' ORDER BY started_at, id"
        );
        let sql = sql.as_str();

        let rows = self
            .with_busy_retry(&context, move || async move {
                sqlx::query(sql).fetch_all(pool).await
            })
            .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    #[instrument(skip(self, lease), fields(task_id = %lease.task_id, process_id = lease.process_id))]
    async fn reset_if_owned(&self, lease: &TaskLease) -> QueueResult<bool> {
        let context = task_context!(
            RepositoryOperation::Recover,
            task_id = lease.task_id,
            worker_id = lease.worker_id.as_str()
        );
        let pool = &self.pool;
        let sql = format!(
            "UPDATE tasks SET status = 'PENDING', process_id = NULL, worker_id = NULL, started_at = NULL, \
             updated_at = $1 WHERE {}",
            lease_predicate(2)
        );
        let sql = sql.as_str();

        let outcome = self
            .with_busy_retry(&context, move || async move {
                sqlx::query(sql)
                    .bind(Utc::now())
                    .bind(lease.task_id)
                    .bind(i64::from(lease.process_id))
                    .bind(lease.worker_id.as_str())
                    .bind(lease.started_at)
                    .execute(pool)
                    .await
            })
            .await?;

        Ok(outcome.rows_affected() == 1)
    }

    #[instrument(skip(self, lease, error), fields(task_id = %lease.task_id, process_id = lease.process_id))]
    async fn fail_if_owned(&self, lease: &TaskLease, error: &str) -> QueueResult<bool> {
        let context = task_context!(
            RepositoryOperation::Recover,
            task_id = lease.task_id,
            worker_id = lease.worker_id.as_str()
        );
        let pool = &self.pool;
        let sql = format!(
            "UPDATE tasks SET status = 'FAILED', error_message = $2, completed_at = $1, updated_at = $1 \
             WHERE {}",
            lease_predicate(3)
        );
        let sql = sql.as_str();

        let outcome = self
            .with_busy_retry(&context, move || async move {
                sqlx::query(sql)
                    .bind(Utc::now())
                    .bind(error)
                    .bind(lease.task_id)
                    .bind(i64::from(lease.process_id))
                    .bind(lease.worker_id.as_str())
                    .bind(lease.started_at)
                    .execute(pool)
                    .await
            })
            .await?;

        Ok(outcome.rows_affected() == 1)
    }

    #[instrument(skip(self, error))]
    async fn fail_processing_for_process(&self, process_id: u32, error: &str) -> QueueResult<u64> {
        let context = TaskOperationContext::new(RepositoryOperation::Recover).with_process_id(process_id);
        let pool = &self.pool;

        let outcome = self
            .with_busy_retry(&context, move || async move {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET status = 'FAILED', error_message = $2, completed_at = $1, updated_at = $1
                    WHERE status = 'PROCESSING' AND process_id = $3
                    "#,
                )
                .bind(Utc::now())
                .bind(error)
                .bind(i64::from(process_id))
                .execute(pool)
                .await
            })
            .await?;

        Ok(outcome.rows_affected())
    }

    async fn status_counts(&self) -> QueueResult<StatusCounts> {
        let context = task_context!(RepositoryOperation::Query);
        let pool = &self.pool;

        let rows = self
            .with_busy_retry(&context, move || async move {
                sqlx::query("SELECT status, COUNT(*) AS count FROM tasks GROUP BY status")
                    .fetch_all(pool)
                    .await
            })
            .await?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let status: TaskStatus = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            counts.add(status, count.max(0) as u64);
        }
        Ok(counts)
    }

    async fn oldest_pending_at(&self) -> QueueResult<Option<DateTime<Utc>>> {
        let context = task_context!(RepositoryOperation::Query);
        let pool = &self.pool;

        self.with_busy_retry(&context, move || async move {
            sqlx::query_scalar("SELECT MIN(created_at) FROM tasks WHERE status = 'PENDING'")
                .fetch_one(pool)
                .await
        })
        .await
    }

    async fn newest_task_at(&self) -> QueueResult<Option<DateTime<Utc>>> {
        let context = task_context!(RepositoryOperation::Query);
        let pool = &self.pool;

        self.with_busy_retry(&context, move || async move {
            sqlx::query_scalar("SELECT MAX(created_at) FROM tasks")
                .fetch_one(pool)
                .await
        })
        .await
    }

    #[instrument(skip(self), fields(cutoff = %cutoff))]
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> QueueResult<u64> {
        let context = task_context!(RepositoryOperation::Delete)
            .with_additional_info(format!("完成时间早于 {cutoff}"));
        let pool = &self.pool;

        let outcome = self
            .with_busy_retry(&context, move || async move {
                sqlx::query(
                    r#"
                    DELETE FROM tasks
                    WHERE status IN ('COMPLETED', 'FAILED', 'CANCELLED')
                      AND completed_at IS NOT NULL
                      AND completed_at < $1
                    "#,
                )
                .bind(cutoff)
                .execute(pool)
                .await
            })
            .await?;

        let deleted = outcome.rows_affected();
        RepositoryErrorHelpers::log_operation_success(&context, Some(&format!("删除{deleted}个任务")));
        Ok(deleted)
    }
}

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use taskqueue_core::{QueueError, QueueResult, RecoveryConfig, RecoveryStrategy};
use taskqueue_domain::{
    entities::Task,
    ports::ProcessProbe,
    repositories::TaskRepository,
    value_objects::{ActiveTaskSummary, QueueHealth},
};

/// 恢复服务接口
#[async_trait]
pub trait RecoveryService: Send + Sync {
    /// 回收运行时间超过 `timeout` 的 PROCESSING 任务，返回回收数量
    ///
    /// 策略必须由调用方显式给出。
    async fn recover_stuck_tasks(
        &self,
        timeout: Duration,
        strategy: RecoveryStrategy,
    ) -> QueueResult<u64>;

    /// 将所属进程已不存在的 PROCESSING 任务标记为 FAILED，返回处理数量
    async fn cleanup_dead_process_tasks(&self) -> QueueResult<u64>;

    /// 只读的健康汇总
    async fn health(&self, stuck_timeout: Duration) -> QueueResult<QueueHealth>;
}

/// 恢复服务实现
pub struct SystemRecoveryService {
    repository: Arc<dyn TaskRepository>,
    probe: Arc<dyn ProcessProbe>,
}

impl SystemRecoveryService {
    pub fn new(repository: Arc<dyn TaskRepository>, probe: Arc<dyn ProcessProbe>) -> Self {
        Self { repository, probe }
    }

    fn is_stuck(task: &Task, timeout: chrono::Duration, now: chrono::DateTime<Utc>) -> bool {
        task.running_for(now)
            .map(|running| running > timeout)
            .unwrap_or(false)
    }

    fn to_chrono(timeout: Duration) -> chrono::Duration {
        chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX)
    }

    /// 按间隔执行恢复，直到关闭标志置位
    pub async fn run_periodic(
        &self,
        config: RecoveryConfig,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> QueueResult<()> {
        let strategy = config.strategy.ok_or_else(|| {
            QueueError::config_error("定时恢复需要显式配置 recovery.strategy")
        })?;
        let timeout = Duration::from_secs(config.stuck_timeout_seconds);

        info!(
            "启动定时恢复: 间隔 {}s, 超时 {}s, 策略 {}",
            config.interval_seconds, config.stuck_timeout_seconds, strategy
        );

        let mut ticker = tokio::time::interval(Duration::from_secs(config.interval_seconds));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if config.cleanup_dead_processes {
                        if let Err(e) = self.cleanup_dead_process_tasks().await {
                            error!("清理死亡进程任务失败: {}", e);
                        }
                    }
                    if let Err(e) = self.recover_stuck_tasks(timeout, strategy).await {
                        error!("恢复卡住任务失败: {}", e);
                    }
                }
                _ = async { shutdown_rx.wait_for(|stop| *stop).await.map(|_| ()) } => {
                    info!("定时恢复收到关闭信号");
                    break;
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl RecoveryService for SystemRecoveryService {
    async fn recover_stuck_tasks(
        &self,
        timeout: Duration,
        strategy: RecoveryStrategy,
    ) -> QueueResult<u64> {
        let now = Utc::now();
        let threshold = Self::to_chrono(timeout);
        let processing = self.repository.list_processing().await?;

        let mut recovered = 0;
        for task in processing.iter().filter(|t| Self::is_stuck(t, threshold, now)) {
            let Some(lease) = task.lease() else {
                warn!("任务 {} 处于 PROCESSING 但缺少归属信息，跳过", task.id);
                continue;
            };

            let applied = match strategy {
                RecoveryStrategy::ResetToPending => self.repository.reset_if_owned(&lease).await?,
                RecoveryStrategy::MarkFailed => {
                    let message = format!(
                        "stuck: exceeded timeout of {}s (worker {})",
                        timeout.as_secs(),
                        lease.worker_id
                    );
                    self.repository.fail_if_owned(&lease, &message).await?
                }
            };

            if applied {
                recovered += 1;
                warn!(
                    "回收卡住任务 {} (Worker: {}, 策略: {})",
                    task.id, lease.worker_id, strategy
                );
            } else {
                debug!("任务 {} 在回收前已被持有者更新", task.id);
            }
        }

        if recovered > 0 {
            counter!("taskqueue_tasks_recovered_total", "kind" => format!("stuck_{strategy}"))
                .increment(recovered);
            info!("本次回收{}个卡住任务", recovered);
        }
        Ok(recovered)
    }

    async fn cleanup_dead_process_tasks(&self) -> QueueResult<u64> {
        let processing = self.repository.list_processing().await?;
        let owners: BTreeSet<u32> = processing.iter().filter_map(|t| t.process_id).collect();

        let dead: BTreeSet<u32> = owners
            .into_iter()
            .filter(|pid| !self.probe.is_alive(*pid))
            .collect();
        if dead.is_empty() {
            return Ok(0);
        }

        let mut cleaned = 0;
        for task in &processing {
            let Some(lease) = task.lease() else {
                continue;
            };
            if !dead.contains(&lease.process_id) {
                continue;
            }

            let message = format!(
                "process terminated: pid {} no longer exists",
                lease.process_id
            );
            if self.repository.fail_if_owned(&lease, &message).await? {
                cleaned += 1;
                warn!(
                    "进程 {} 已不存在，任务 {} 标记为失败",
                    lease.process_id, task.id
                );
            }
        }

        if cleaned > 0 {
            counter!("taskqueue_tasks_recovered_total", "kind" => "dead_process").increment(cleaned);
            info!("清理了{}个死亡进程遗留的任务", cleaned);
        }
        Ok(cleaned)
    }

    async fn health(&self, stuck_timeout: Duration) -> QueueResult<QueueHealth> {
        let now = Utc::now();
        let threshold = Self::to_chrono(stuck_timeout);

        let status_counts = self.repository.status_counts().await?;
        let processing = self.repository.list_processing().await?;
        let oldest_pending_at = self.repository.oldest_pending_at().await?;
        let newest_task_at = self.repository.newest_task_at().await?;

        let mut liveness: HashMap<u32, bool> = HashMap::new();
        let mut active_tasks = Vec::with_capacity(processing.len());
        for task in &processing {
            let orphaned = match task.process_id {
                Some(pid) => !*liveness
                    .entry(pid)
                    .or_insert_with(|| self.probe.is_alive(pid)),
                None => false,
            };
            let stuck = Self::is_stuck(task, threshold, now);
            active_tasks.push(ActiveTaskSummary::from_task(task, now, stuck, orphaned));
        }

        Ok(QueueHealth {
            status_counts,
            stuck_tasks: active_tasks.iter().filter(|t| t.stuck).count() as u64,
            orphaned_tasks: active_tasks.iter().filter(|t| t.orphaned).count() as u64,
            oldest_pending_at,
            newest_task_at,
            active_tasks,
            checked_at: now,
            process_id: std::process::id(),
        })
    }
}

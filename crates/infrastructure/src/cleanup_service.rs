use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use taskqueue_core::{QueueResult, RetentionConfig};
use taskqueue_domain::repositories::TaskRepository;
use tokio::time::interval;
use tracing::{error, info, warn};

/// 一次清理的统计
#[derive(Debug, Clone, Default)]
pub struct CleanupStats {
    pub deleted: u64,
    pub duration: Duration,
}

/// 终态任务保留服务
///
/// 按固定间隔删除完成时间超过保留时长的 COMPLETED / FAILED / CANCELLED 任务，
/// 非终态任务永远不会被删除。
pub struct CleanupService {
    task_repository: Arc<dyn TaskRepository>,
    config: RetentionConfig,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    cleanup_handle: Option<tokio::task::JoinHandle<()>>,
}

impl CleanupService {
    pub fn new(task_repository: Arc<dyn TaskRepository>, config: RetentionConfig) -> Self {
        Self {
            task_repository,
            config,
            shutdown_tx: None,
            cleanup_handle: None,
        }
    }

    /// 启动后台清理循环
    pub fn start(&mut self) {
        if !self.config.enabled {
            info!("保留清理服务未启用");
            return;
        }
        if self.cleanup_handle.is_some() {
            warn!("保留清理服务已在运行");
            return;
        }

        info!(
            "启动保留清理服务: 间隔 {}s, 保留 {}h",
            self.config.interval_seconds, self.config.max_age_hours
        );

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let task_repository = self.task_repository.clone();
        let config = self.config.clone();

        let handle = tokio::spawn(async move {
            let mut cleanup_interval = interval(Duration::from_secs(config.interval_seconds));

            loop {
                tokio::select! {
                    _ = cleanup_interval.tick() => {
                        if let Err(e) = Self::perform_cleanup(&task_repository, config.max_age_hours).await {
                            error!("清理过期任务失败: {}", e);
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("保留清理服务收到停止请求");
                        break;
                    }
                }
            }
        });

        self.cleanup_handle = Some(handle);
    }

    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        if let Some(handle) = self.cleanup_handle.take() {
            if let Err(e) = handle.await {
                warn!("等待保留清理服务停止时出错: {}", e);
            }
        }

        info!("保留清理服务已停止");
    }

    pub fn is_running(&self) -> bool {
        self.cleanup_handle.is_some()
    }

    /// 立即执行一次清理，不受 `enabled` 影响
    pub async fn cleanup_once(&self) -> QueueResult<CleanupStats> {
        Self::perform_cleanup(&self.task_repository, self.config.max_age_hours).await
    }

    async fn perform_cleanup(
        task_repository: &Arc<dyn TaskRepository>,
        max_age_hours: u64,
    ) -> QueueResult<CleanupStats> {
        let start_time = Instant::now();
        let max_age_hours = i64::try_from(max_age_hours).unwrap_or(i64::MAX / 3_600);
        let cutoff = Utc::now() - chrono::Duration::hours(max_age_hours);

        let deleted = task_repository.delete_terminal_before(cutoff).await?;
        let stats = CleanupStats {
            deleted,
            duration: start_time.elapsed(),
        };

        if deleted > 0 {
            info!("清理了{}个过期任务，耗时 {:?}", stats.deleted, stats.duration);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;
    use taskqueue_domain::entities::NewTask;

    #[tokio::test]
    async fn test_cleanup_once_keeps_recent_and_active_tasks() {
        let manager = DatabaseManager::in_memory().await.unwrap();
        let repository: Arc<dyn TaskRepository> = Arc::new(manager.task_repository());

        let done = repository.insert(&NewTask::new("score", "a")).await.unwrap();
        repository.insert(&NewTask::new("score", "b")).await.unwrap();
        let lease = repository
            .claim_next(&[], 7, "7-0")
            .await
            .unwrap()
            .unwrap()
            .lease()
            .unwrap();
        assert_eq!(lease.task_id, done);
        repository.complete(&lease, None).await.unwrap();

        let service = CleanupService::new(repository.clone(), RetentionConfig::default());
        let stats = service.cleanup_once().await.unwrap();
        assert_eq!(stats.deleted, 0);
        assert_eq!(repository.status_counts().await.unwrap().total(), 2);
    }

    #[tokio::test]
    async fn test_disabled_service_does_not_start() {
        let manager = DatabaseManager::in_memory().await.unwrap();
        let repository: Arc<dyn TaskRepository> = Arc::new(manager.task_repository());

        let mut service = CleanupService::new(repository, RetentionConfig::default());
        service.start();
        assert!(!service.is_running());
        service.stop().await;
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let manager = DatabaseManager::in_memory().await.unwrap();
        let repository: Arc<dyn TaskRepository> = Arc::new(manager.task_repository());
        let config = RetentionConfig {
            enabled: true,
            interval_seconds: 1,
            max_age_hours: 1,
        };

        let mut service = CleanupService::new(repository, config);
        service.start();
        assert!(service.is_running());
        service.stop().await;
        assert!(!service.is_running());
    }
}

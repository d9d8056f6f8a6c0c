use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use taskqueue_core::AppConfig;
use taskqueue_dispatcher::{SystemRecoveryService, TaskQueue};
use taskqueue_infrastructure::{CleanupService, DatabaseManager, OsProcessProbe};
use taskqueue_worker::{ExecutorRegistry, WorkerPool};

use crate::shutdown::ShutdownCoordinator;

/// 关闭后等待执行中的 Worker 退出的时间，此时它们的任务已被标记为 FAILED
const WORKER_JOIN_GRACE: Duration = Duration::from_secs(5);

/// Worker 进程
pub struct Application {
    config: AppConfig,
    manager: DatabaseManager,
    queue: TaskQueue,
    recovery: Arc<SystemRecoveryService>,
}

impl Application {
    /// 校验配置并打开任务存储；存储无法打开时返回错误，由调用方终止进程
    pub async fn new(config: AppConfig) -> Result<Self> {
        config.validate().context("配置校验失败")?;

        let manager = DatabaseManager::new(&config.database)
            .await
            .with_context(|| format!("打开任务存储失败: {}", config.database.url))?;
        let repository = Arc::new(manager.task_repository());
        let queue = TaskQueue::new(repository.clone());
        let recovery = Arc::new(SystemRecoveryService::new(
            repository,
            Arc::new(OsProcessProbe::new()),
        ));

        Ok(Self {
            config,
            manager,
            queue,
            recovery,
        })
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn recovery_service(&self) -> Arc<SystemRecoveryService> {
        self.recovery.clone()
    }

    /// 运行到收到关闭信号为止
    pub async fn run(self) -> Result<()> {
        let coordinator = ShutdownCoordinator::new(self.queue.clone());
        // 必须先于任何领取注册
        let guard = coordinator.install().context("注册关闭处理失败")?;
        let mut shutdown_rx = coordinator.subscribe();

        info!(
            "Worker进程启动: pid {}, 存储 {}",
            self.queue.process_id(),
            self.config.database.url
        );

        let pool = self.start_worker_pool(&coordinator)?;
        let recovery_handle = self.start_recovery_loop(&coordinator);

        let mut cleanup = CleanupService::new(self.queue.repository(), self.config.retention.clone());
        cleanup.start();

        // 启动期间已经收到的信号同样可见
        let _ = shutdown_rx.wait_for(|stop| *stop).await;
        info!("收到关闭信号，停止各组件");

        if let Some(pool) = pool {
            pool.join(WORKER_JOIN_GRACE).await;
        }
        if let Some(handle) = recovery_handle {
            if let Err(e) = handle.await {
                warn!("等待定时恢复退出时出错: {}", e);
            }
        }
        cleanup.stop().await;

        let finalized = guard.finalize().await;
        self.manager.close().await;

        let swept = finalized.context("关闭清扫失败，残留任务需由死亡进程清理回收")?;
        info!("关闭完成，清扫了{}个本进程任务", swept);
        Ok(())
    }

    fn start_worker_pool(&self, coordinator: &ShutdownCoordinator) -> Result<Option<WorkerPool>> {
        if !self.config.worker.enabled {
            info!("Worker未启用，仅运行恢复与保留清理");
            return Ok(None);
        }

        let registry = Arc::new(ExecutorRegistry::from_commands(&self.config.worker.agents));
        if registry.is_empty() {
            warn!("没有配置任何agent命令，Worker池不启动");
            return Ok(None);
        }

        let pool = WorkerPool::start(
            self.queue.clone(),
            registry,
            &self.config.worker,
            coordinator.subscribe(),
        )
        .context("启动Worker池失败")?;
        Ok(Some(pool))
    }

    fn start_recovery_loop(&self, coordinator: &ShutdownCoordinator) -> Option<JoinHandle<()>> {
        if !self.config.recovery.enabled {
            return None;
        }

        let recovery = self.recovery.clone();
        let config = self.config.recovery.clone();
        let shutdown_rx = coordinator.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = recovery.run_periodic(config, shutdown_rx).await {
                error!("定时恢复退出: {}", e);
            }
        }))
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use taskqueue_core::{QueueError, QueueResult};
use taskqueue_dispatcher::TaskQueue;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 清扫结果；错误以文本保存，供等待方重新构造
type SweepOutcome = Option<Result<u64, String>>;

struct CoordinatorInner {
    queue: TaskQueue,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    swept_tx: watch::Sender<SweepOutcome>,
}

/// 进程关闭协调器
///
/// 信号路径与正常退出路径共享同一个"已执行"标志，保证本进程持有的
/// PROCESSING 任务只被清扫一次。关闭标志保存在 watch 通道中，
/// 关闭之后才订阅的组件也能立即看到。必须在任何 Worker 开始领取任务之前调用 `install`。
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl ShutdownCoordinator {
    pub fn new(queue: TaskQueue) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (swept_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(CoordinatorInner {
                queue,
                started: AtomicBool::new(false),
                shutdown_tx,
                swept_tx,
            }),
        }
    }

    /// 注册 SIGINT/SIGTERM 处理并返回退出守卫
    pub fn install(&self) -> QueueResult<ShutdownGuard> {
        let listener = spawn_signal_listener(self.clone())?;
        info!("关闭协调器已安装 (进程 {})", self.inner.queue.process_id());
        Ok(ShutdownGuard {
            coordinator: self.clone(),
            listener: Some(listener),
        })
    }

    /// 订阅关闭标志
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// 执行一次关闭清扫
    ///
    /// 先置位关闭标志使 Worker 停止领取，再把本进程持有的 PROCESSING 任务标记为 FAILED。
    /// 只有第一个调用者得到 `Some(清扫数量)` 或清扫错误，之后的调用返回 `Ok(None)`。
    pub async fn run_once(&self, reason: &str) -> QueueResult<Option<u64>> {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("关闭流程已执行过，忽略: {}", reason);
            return Ok(None);
        }

        info!("开始关闭流程: {}", reason);
        self.inner.shutdown_tx.send_replace(true);
        debug!(
            "关闭标志已置位，当前订阅者 {} 个",
            self.inner.shutdown_tx.receiver_count()
        );

        match self.inner.queue.fail_own_processing(reason).await {
            Ok(swept) => {
                self.inner.swept_tx.send_replace(Some(Ok(swept)));
                info!("关闭清扫完成，{}个任务标记为失败", swept);
                Ok(Some(swept))
            }
            Err(e) => {
                error!("关闭时清扫本进程任务失败: {}", e);
                self.inner.swept_tx.send_replace(Some(Err(e.to_string())));
                Err(e)
            }
        }
    }

    /// 等待清扫完成，返回清扫数量或清扫错误
    pub async fn wait_swept(&self) -> QueueResult<u64> {
        let mut swept_rx = self.inner.swept_tx.subscribe();
        let outcome = match swept_rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        match outcome {
            Some(Ok(swept)) => Ok(swept),
            Some(Err(message)) => Err(QueueError::StoreUnavailable(message)),
            None => Ok(0),
        }
    }

    /// 正常退出路径；清扫已由信号路径触发时等待其完成
    pub async fn finalize(&self) -> QueueResult<u64> {
        match self.run_once("normal exit").await? {
            Some(swept) => Ok(swept),
            None => self.wait_swept().await,
        }
    }
}

/// 退出守卫
///
/// `finalize` 是正常退出路径；未调用 `finalize` 就被丢弃时，`Drop` 在多线程运行时上
/// 同步执行清扫作为兜底。
pub struct ShutdownGuard {
    coordinator: ShutdownCoordinator,
    listener: Option<JoinHandle<()>>,
}

impl ShutdownGuard {
    pub fn coordinator(&self) -> &ShutdownCoordinator {
        &self.coordinator
    }

    pub async fn finalize(mut self) -> QueueResult<u64> {
        let swept = self.coordinator.finalize().await;
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        swept
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        if self.coordinator.is_shutting_down() {
            return;
        }

        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                let coordinator = self.coordinator.clone();
                // 清扫错误已在 run_once 中记录
                let _ = tokio::task::block_in_place(|| {
                    handle.block_on(coordinator.run_once("exit without finalize"))
                });
            }
            _ => warn!("无法在当前运行时中执行关闭清扫，残留任务将由死亡进程清理回收"),
        }
    }
}

#[cfg(unix)]
fn spawn_signal_listener(coordinator: ShutdownCoordinator) -> QueueResult<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    // 在返回前完成注册，之后到达的信号都不会丢失
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut shutdown_rx = coordinator.subscribe();

    Ok(tokio::spawn(async move {
        let reason = tokio::select! {
            _ = interrupt.recv() => "received SIGINT",
            _ = terminate.recv() => "received SIGTERM",
            _ = shutdown_rx.wait_for(|stop| *stop) => return,
        };
        info!("收到终止信号: {}", reason);
        let _ = coordinator.run_once(reason).await;
    }))
}

#[cfg(not(unix))]
fn spawn_signal_listener(coordinator: ShutdownCoordinator) -> QueueResult<JoinHandle<()>> {
    let mut shutdown_rx = coordinator.subscribe();

    Ok(tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("安装Ctrl+C信号处理器失败: {}", e);
                    return;
                }
            }
            _ = shutdown_rx.wait_for(|stop| *stop) => return,
        }
        info!("收到Ctrl+C信号");
        let _ = coordinator.run_once("received Ctrl+C").await;
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskqueue_domain::{TaskPriority, TaskStatus};
    use taskqueue_infrastructure::DatabaseManager;

    async fn queue_with_claimed_tasks(count: usize) -> (DatabaseManager, TaskQueue, Vec<i64>) {
        let manager = DatabaseManager::in_memory().await.unwrap();
        let queue = TaskQueue::new(Arc::new(manager.task_repository()));
        let mut ids = Vec::new();
        for i in 0..count {
            queue
                .submit("report_synthesis", &i.to_string(), TaskPriority::Normal, 3)
                .await
                .unwrap();
            let worker = queue.worker_id(i as u32);
            ids.push(queue.claim(&[], &worker).await.unwrap().unwrap().id);
        }
        (manager, queue, ids)
    }

    #[tokio::test]
    async fn test_run_once_is_idempotent() {
        let (_manager, queue, ids) = queue_with_claimed_tasks(2).await;
        let coordinator = ShutdownCoordinator::new(queue.clone());

        assert_eq!(coordinator.run_once("received SIGTERM").await.unwrap(), Some(2));
        assert_eq!(coordinator.run_once("normal exit").await.unwrap(), None);

        for id in ids {
            let task = queue.get(id).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Failed);
            assert_eq!(
                task.error_message.as_deref(),
                Some("process terminated: received SIGTERM")
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_racing_paths_sweep_once() {
        let (_manager, queue, _) = queue_with_claimed_tasks(3).await;
        let coordinator = ShutdownCoordinator::new(queue.clone());

        let signal_path = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run_once("received SIGINT").await })
        };
        let exit_path = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run_once("normal exit").await })
        };

        let results = [
            signal_path.await.unwrap().unwrap(),
            exit_path.await.unwrap().unwrap(),
        ];
        assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
        assert_eq!(results.iter().flatten().sum::<u64>(), 3);
        assert_eq!(coordinator.wait_swept().await.unwrap(), 3);
        assert_eq!(queue.status_counts().await.unwrap().failed, 3);
    }

    #[tokio::test]
    async fn test_finalize_after_signal_reports_sweep() {
        let (_manager, queue, _) = queue_with_claimed_tasks(1).await;
        let coordinator = ShutdownCoordinator::new(queue);

        coordinator.run_once("received SIGTERM").await.unwrap();
        assert_eq!(coordinator.finalize().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_subscribers_see_shutdown_flag() {
        let (_manager, queue, _) = queue_with_claimed_tasks(0).await;
        let coordinator = ShutdownCoordinator::new(queue);
        let mut early_rx = coordinator.subscribe();

        assert!(!coordinator.is_shutting_down());
        assert!(!*early_rx.borrow());
        coordinator.run_once("normal exit").await.unwrap();
        assert!(coordinator.is_shutting_down());
        assert!(early_rx.wait_for(|stop| *stop).await.is_ok());

        // 关闭之后才订阅的组件同样能看到关闭标志
        let mut late_rx = coordinator.subscribe();
        assert!(*late_rx.borrow());
        assert!(late_rx.wait_for(|stop| *stop).await.is_ok());
    }

    #[tokio::test]
    async fn test_foreign_tasks_are_not_swept() {
        let manager = DatabaseManager::in_memory().await.unwrap();
        let other = TaskQueue::new(Arc::new(manager.task_repository())).with_process_id(77_777);
        let own = TaskQueue::new(Arc::new(manager.task_repository()));

        other
            .submit("citation_extraction", "x", TaskPriority::High, 0)
            .await
            .unwrap();
        let foreign = other.claim(&[], &other.worker_id(0)).await.unwrap().unwrap();

        let coordinator = ShutdownCoordinator::new(own);
        assert_eq!(coordinator.run_once("normal exit").await.unwrap(), Some(0));
        assert_eq!(
            other.get(foreign.id).await.unwrap().unwrap().status,
            TaskStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_sweep_failure_reaches_every_path() {
        let (manager, queue, _) = queue_with_claimed_tasks(1).await;
        let coordinator = ShutdownCoordinator::new(queue);
        manager.close().await;

        let result = coordinator.run_once("received SIGTERM").await;
        assert!(matches!(result, Err(QueueError::StoreUnavailable(_))));

        // 退出路径不能把失败的清扫当成"没有任务"
        let result = coordinator.finalize().await;
        assert!(matches!(result, Err(QueueError::StoreUnavailable(_))));
        assert!(coordinator.is_shutting_down());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dropped_guard_runs_sweep() {
        let (_manager, queue, ids) = queue_with_claimed_tasks(1).await;
        let coordinator = ShutdownCoordinator::new(queue.clone());

        let guard = coordinator.install().unwrap();
        drop(guard);

        assert!(coordinator.is_shutting_down());
        let task = queue.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(
            task.error_message.as_deref(),
            Some("process terminated: exit without finalize")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_guard_finalize_then_drop_does_not_sweep_twice() {
        let (_manager, queue, _) = queue_with_claimed_tasks(2).await;
        let coordinator = ShutdownCoordinator::new(queue);

        let guard = coordinator.install().unwrap();
        assert_eq!(guard.finalize().await.unwrap(), 2);
        assert_eq!(coordinator.run_once("received SIGTERM").await.unwrap(), None);
    }
}

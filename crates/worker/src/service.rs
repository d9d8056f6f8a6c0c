use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskqueue_core::{QueueError, QueueResult, WorkerConfig};
use taskqueue_dispatcher::TaskQueue;
use taskqueue_domain::{Task, TransitionOutcome, WorkerId};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agents::AgentKind;
use crate::executors::ExecutorRegistry;

/// 空轮询退避
///
/// 每次空轮询后间隔翻倍直到上限，实际睡眠时间带 ±20% 抖动，领取成功后复位。
#[derive(Debug, Clone)]
pub struct PollBackoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl PollBackoff {
    const JITTER: f64 = 0.2;

    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(
            Duration::from_millis(config.poll_interval_ms),
            Duration::from_millis(config.max_poll_interval_ms),
        )
    }

    /// 当前未加抖动的间隔
    pub fn current(&self) -> Duration {
        self.current
    }

    /// 返回本次应睡眠的时间并推进退避
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1.0 - Self::JITTER + rand::random::<f64>() * 2.0 * Self::JITTER;
        let delay = self.current.mul_f64(factor);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Worker 运行统计
#[derive(Debug, Default)]
pub struct WorkerStats {
    claimed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    ownership_lost: AtomicU64,
}

impl WorkerStats {
    pub fn claimed(&self) -> u64 {
        self.claimed.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn ownership_lost(&self) -> u64 {
        self.ownership_lost.load(Ordering::Relaxed)
    }

    fn record(&self, outcome: &TransitionOutcome, succeeded: bool) {
        match outcome {
            TransitionOutcome::Applied(_) if succeeded => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            TransitionOutcome::Applied(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            TransitionOutcome::OwnershipLost => {
                self.ownership_lost.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[derive(Clone)]
struct WorkerContext {
    queue: TaskQueue,
    registry: Arc<ExecutorRegistry>,
    filter: Arc<Vec<String>>,
    stats: Arc<WorkerStats>,
}

/// 进程内的 Worker 池
///
/// 每个 Worker 是一个独立的 tokio 任务，只通过队列的原子领取与其他 Worker
/// (包括其他进程中的) 协调。
pub struct WorkerPool {
    workers: Vec<(WorkerId, JoinHandle<()>)>,
    stats: Arc<WorkerStats>,
}

impl WorkerPool {
    /// 启动 `config.concurrency` 个轮询循环
    ///
    /// 领取过滤优先使用 `config.agent_types`，否则只领取注册表中有执行器的类型。
    /// 关闭标志在启动前已经置位时，Worker 不会领取任何任务。
    pub fn start(
        queue: TaskQueue,
        registry: Arc<ExecutorRegistry>,
        config: &WorkerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> QueueResult<Self> {
        if config.concurrency == 0 {
            return Err(QueueError::config_error("Worker并发数必须大于0"));
        }
        if registry.is_empty() {
            return Err(QueueError::config_error("没有注册任何agent执行器"));
        }

        let filter = if config.agent_types.is_empty() {
            registry.agent_types()
        } else {
            config.agent_types.clone()
        };
        let stats = Arc::new(WorkerStats::default());
        let context = WorkerContext {
            queue: queue.clone(),
            registry,
            filter: Arc::new(filter),
            stats: stats.clone(),
        };

        info!(
            "启动Worker池: 进程 {}, 并发 {}, 类型 {:?}",
            queue.process_id(),
            config.concurrency,
            context.filter
        );

        let workers = (0..config.concurrency)
            .map(|index| {
                let worker_id = queue.worker_id(index);
                let handle = tokio::spawn(run_worker(
                    context.clone(),
                    worker_id.clone(),
                    PollBackoff::from_config(config),
                    shutdown_rx.clone(),
                ));
                (worker_id, handle)
            })
            .collect();

        Ok(Self { workers, stats })
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// 等待所有 Worker 退出，超过 `grace` 仍在执行的 Worker 被中止
    ///
    /// 被中止的 Worker 持有的任务已由关闭流程标记为 FAILED。
    pub async fn join(self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        for (worker_id, mut handle) in self.workers {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!("Worker {} 已退出", worker_id),
                Ok(Err(e)) => error!("Worker {} 异常退出: {}", worker_id, e),
                Err(_) => {
                    warn!("Worker {} 未在宽限期内退出，强制中止", worker_id);
                    handle.abort();
                }
            }
        }
        info!("Worker池已停止");
    }
}

async fn run_worker(
    context: WorkerContext,
    worker_id: WorkerId,
    mut backoff: PollBackoff,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!("Worker {} 开始轮询", worker_id);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let delay = match context.queue.claim(&context.filter, &worker_id).await {
            Ok(Some(task)) => {
                backoff.reset();
                context.stats.claimed.fetch_add(1, Ordering::Relaxed);
                if *shutdown_rx.borrow() {
                    // 关闭清扫可能已经执行过，不能留下本进程持有的 PROCESSING 任务
                    release_unstarted(&context, &worker_id, &task).await;
                    break;
                }
                process_task(&context, &worker_id, task).await;
                continue;
            }
            Ok(None) => backoff.next_delay(),
            Err(e) => {
                error!("Worker {} 领取任务失败: {}", worker_id, e);
                backoff.next_delay()
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.wait_for(|stop| *stop) => break,
        }
    }

    info!("Worker {} 收到停止信号，退出轮询", worker_id);
}

async fn release_unstarted(context: &WorkerContext, worker_id: &WorkerId, task: &Task) {
    let Some(lease) = task.lease() else {
        return;
    };
    warn!("Worker {} 在关闭期间领取到任务 {}，放弃执行", worker_id, task.id);
    let message = "process terminated: shutdown before execution started";
    match context.queue.fail(&lease, message, false).await {
        Ok(outcome) => context.stats.record(&outcome, false),
        Err(e) => error!("释放任务 {} 失败: {}", task.id, e),
    }
}

async fn process_task(context: &WorkerContext, worker_id: &WorkerId, task: Task) {
    let Some(lease) = task.lease() else {
        warn!("Worker {} 领取到的任务 {} 缺少归属信息", worker_id, task.id);
        return;
    };

    let kind = AgentKind::from(task.agent_type.as_str());
    let Some(executor) = context.registry.get(&kind) else {
        let message = format!("未注册的agent类型: {kind}");
        warn!("任务 {}: {}", task.id, message);
        match context.queue.fail(&lease, &message, false).await {
            Ok(outcome) => context.stats.record(&outcome, false),
            Err(e) => error!("回报任务 {} 失败状态出错: {}", task.id, e),
        }
        return;
    };

    debug!(
        "Worker {} 执行任务 {} ({} -> {})",
        worker_id,
        task.id,
        kind,
        executor.name()
    );

    let (reported, succeeded) = match executor.execute(&task).await {
        Ok(result) => (context.queue.complete(&lease, result.as_deref()).await, true),
        Err(err) => (
            context
                .queue
                .fail(&lease, err.message(), err.is_retryable())
                .await,
            false,
        ),
    };

    match reported {
        Ok(outcome) => context.stats.record(&outcome, succeeded),
        // 任务保持 PROCESSING，由恢复流程按超时回收
        Err(e) => error!("回报任务 {} 执行结果出错: {}", task.id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let mut backoff = PollBackoff::new(Duration::from_millis(100), Duration::from_millis(500));
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(backoff.current());
            backoff.next_delay();
        }
        assert_eq!(
            seen,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );

        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_jitter_stays_within_bounds() {
        let mut backoff = PollBackoff::new(Duration::from_millis(1000), Duration::from_millis(1000));
        for _ in 0..200 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(800), "{delay:?}");
            assert!(delay <= Duration::from_millis(1200), "{delay:?}");
        }
    }

    #[test]
    fn test_backoff_max_never_below_base() {
        let backoff = PollBackoff::new(Duration::from_millis(300), Duration::from_millis(10));
        assert_eq!(backoff.max, Duration::from_millis(300));
    }
}

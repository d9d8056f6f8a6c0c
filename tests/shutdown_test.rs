use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use taskqueue::ShutdownCoordinator;
use taskqueue_core::WorkerConfig;
use taskqueue_dispatcher::TaskQueue;
use taskqueue_domain::{StatusCounts, Task, TaskFilter, TaskPriority, TaskStatus};
use taskqueue_infrastructure::DatabaseManager;
use taskqueue_worker::{AgentError, AgentExecutor, ExecutorRegistry, WorkerPool};

/// 执行时间较长的 agent，用于让任务在关闭时仍处于执行中
struct SlowExecutor {
    delay: Duration,
}

#[async_trait]
impl AgentExecutor for SlowExecutor {
    async fn execute(&self, task: &Task) -> Result<Option<String>, AgentError> {
        tokio::time::sleep(self.delay).await;
        Ok(Some(format!("synthesized {}", task.id)))
    }

    fn name(&self) -> &str {
        "slow"
    }
}

async fn wait_for<F>(queue: &TaskQueue, mut done: F)
where
    F: FnMut(&StatusCounts) -> bool,
{
    for _ in 0..500 {
        if done(&queue.status_counts().await.unwrap()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue did not reach the expected state in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_fails_in_flight_tasks_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = taskqueue_core::DatabaseConfig {
        url: format!("sqlite:{}", dir.path().join("shutdown.db").display()),
        ..Default::default()
    };
    let manager = DatabaseManager::new(&config).await.unwrap();
    let queue = TaskQueue::new(Arc::new(manager.task_repository()));

    for i in 0..3 {
        queue
            .submit("report_synthesis", &format!("section-{i}"), TaskPriority::Normal, 5)
            .await
            .unwrap();
    }

    let coordinator = ShutdownCoordinator::new(queue.clone());
    let guard = coordinator.install().unwrap();

    let mut registry = ExecutorRegistry::new();
    registry.register(
        "report_synthesis",
        Arc::new(SlowExecutor {
            delay: Duration::from_millis(300),
        }),
    );
    let worker_config = WorkerConfig {
        concurrency: 2,
        poll_interval_ms: 5,
        max_poll_interval_ms: 20,
        ..Default::default()
    };
    let pool = WorkerPool::start(
        queue.clone(),
        Arc::new(registry),
        &worker_config,
        coordinator.subscribe(),
    )
    .unwrap();
    let stats = pool.stats();

    wait_for(&queue, |c| c.processing == 2).await;

    // 信号路径与退出路径竞争，只有一方执行清扫
    let signal_path = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run_once("received SIGTERM").await })
    };
    let first = signal_path.await.unwrap().unwrap();
    assert_eq!(first, Some(2));
    assert_eq!(coordinator.run_once("normal exit").await.unwrap(), None);

    pool.join(Duration::from_secs(5)).await;
    assert_eq!(guard.finalize().await.unwrap(), 2);

    let failed = queue
        .list(&TaskFilter::default().with_status(TaskStatus::Failed))
        .await
        .unwrap();
    assert_eq!(failed.len(), 2);
    for task in &failed {
        assert_eq!(
            task.error_message.as_deref(),
            Some("process terminated: received SIGTERM")
        );
        assert_eq!(task.retry_count, 0);
        assert!(task.result.is_none());
    }

    // 执行中的 Worker 醒来后的提交被拒绝
    assert_eq!(stats.ownership_lost(), 2);
    assert_eq!(stats.completed(), 0);

    let counts = queue.status_counts().await.unwrap();
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.processing, 0);

    manager.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_signal_during_startup_keeps_late_workers_idle() {
    let manager = DatabaseManager::in_memory().await.unwrap();
    let queue = TaskQueue::new(Arc::new(manager.task_repository()));

    let coordinator = ShutdownCoordinator::new(queue.clone());
    let guard = coordinator.install().unwrap();

    // 信号在组件订阅之前到达
    assert_eq!(
        coordinator.run_once("received SIGTERM").await.unwrap(),
        Some(0)
    );

    let mut app_rx = coordinator.subscribe();
    let mut registry = ExecutorRegistry::new();
    registry.register(
        "report_synthesis",
        Arc::new(SlowExecutor {
            delay: Duration::from_millis(1),
        }),
    );
    let worker_config = WorkerConfig {
        concurrency: 2,
        poll_interval_ms: 5,
        max_poll_interval_ms: 20,
        ..Default::default()
    };
    let pool = WorkerPool::start(
        queue.clone(),
        Arc::new(registry),
        &worker_config,
        coordinator.subscribe(),
    )
    .unwrap();
    let stats = pool.stats();

    let id = queue
        .submit("report_synthesis", "after-shutdown", TaskPriority::High, 0)
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), app_rx.wait_for(|stop| *stop))
        .await
        .expect("late subscriber must observe the earlier shutdown")
        .unwrap();
    pool.join(Duration::from_secs(5)).await;

    assert_eq!(stats.claimed(), 0);
    assert_eq!(
        queue.get(id).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );
    assert_eq!(guard.finalize().await.unwrap(), 0);

    manager.close().await;
}

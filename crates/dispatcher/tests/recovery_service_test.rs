use std::sync::Arc;
use std::time::Duration;

use mockall::{mock, predicate::eq};

use taskqueue_dispatcher::{RecoveryService, SystemRecoveryService, TaskQueue};
use taskqueue_domain::{ProcessProbe, TaskPriority, TaskStatus};
use taskqueue_infrastructure::DatabaseManager;

mock! {
    pub Probe {}

    impl ProcessProbe for Probe {
        fn is_alive(&self, process_id: u32) -> bool;
    }
}

const DEAD_PID: u32 = 40_001;
const ALIVE_PID: u32 = 40_002;

fn queue_for(manager: &DatabaseManager, process_id: u32) -> TaskQueue {
    TaskQueue::new(Arc::new(manager.task_repository())).with_process_id(process_id)
}

#[tokio::test]
async fn test_cleanup_probes_each_owner_once() {
    let manager = DatabaseManager::in_memory().await.unwrap();
    let dead = queue_for(&manager, DEAD_PID);
    let alive = queue_for(&manager, ALIVE_PID);

    for i in 0..4 {
        dead.submit("relevance_scoring", &format!("{i}"), TaskPriority::Normal, 1)
            .await
            .unwrap();
    }
    dead.claim(&[], &dead.worker_id(0)).await.unwrap().unwrap();
    dead.claim(&[], &dead.worker_id(1)).await.unwrap().unwrap();
    let kept = alive.claim(&[], &alive.worker_id(0)).await.unwrap().unwrap();

    let mut probe = MockProbe::new();
    probe
        .expect_is_alive()
        .with(eq(DEAD_PID))
        .times(1)
        .return_const(false);
    probe
        .expect_is_alive()
        .with(eq(ALIVE_PID))
        .times(1)
        .return_const(true);

    let service = SystemRecoveryService::new(dead.repository(), Arc::new(probe));
    assert_eq!(service.cleanup_dead_process_tasks().await.unwrap(), 2);

    let counts = dead.status_counts().await.unwrap();
    assert_eq!(counts.failed, 2);
    assert_eq!(counts.processing, 1);
    assert_eq!(counts.pending, 1);
    assert_eq!(
        alive.get(kept.id).await.unwrap().unwrap().status,
        TaskStatus::Processing
    );
}

#[tokio::test]
async fn test_probe_not_consulted_without_processing_tasks() {
    let manager = DatabaseManager::in_memory().await.unwrap();
    let queue = queue_for(&manager, ALIVE_PID);
    queue
        .submit("report_synthesis", "x", TaskPriority::Low, 0)
        .await
        .unwrap();

    let mut probe = MockProbe::new();
    probe.expect_is_alive().never();

    let service = SystemRecoveryService::new(queue.repository(), Arc::new(probe));
    assert_eq!(service.cleanup_dead_process_tasks().await.unwrap(), 0);

    let health = service.health(Duration::from_secs(60)).await.unwrap();
    assert_eq!(health.status_counts.pending, 1);
    assert!(health.active_tasks.is_empty());
}

#[tokio::test]
async fn test_live_stuck_task_left_to_stuck_recovery() {
    let manager = DatabaseManager::in_memory().await.unwrap();
    let queue = queue_for(&manager, ALIVE_PID);
    let id = queue
        .submit("citation_extraction", "x", TaskPriority::High, 2)
        .await
        .unwrap();
    queue.claim(&[], &queue.worker_id(0)).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let mut probe = MockProbe::new();
    probe.expect_is_alive().return_const(true);
    let service = SystemRecoveryService::new(queue.repository(), Arc::new(probe));

    // 存活进程的任务即使超时也不会被死亡进程清理处理
    assert_eq!(service.cleanup_dead_process_tasks().await.unwrap(), 0);
    assert_eq!(
        queue.get(id).await.unwrap().unwrap().status,
        TaskStatus::Processing
    );

    let recovered = service
        .recover_stuck_tasks(
            Duration::ZERO,
            taskqueue_domain::RecoveryStrategy::ResetToPending,
        )
        .await
        .unwrap();
    assert_eq!(recovered, 1);
    assert_eq!(
        queue.get(id).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );
}

use std::collections::HashSet;
use std::sync::Arc;

use taskqueue_core::DatabaseConfig;
use taskqueue_domain::{NewTask, TaskFilter, TaskRepository, TaskStatus};
use taskqueue_infrastructure::DatabaseManager;

const TASK_COUNT: usize = 120;
const CLAIMERS: u32 = 12;

async fn file_backed_manager(dir: &tempfile::TempDir) -> DatabaseManager {
    let config = DatabaseConfig {
        url: format!("sqlite:{}", dir.path().join("stress.db").display()),
        max_connections: 8,
        busy_retry_attempts: 20,
        busy_retry_base_delay_ms: 5,
        ..Default::default()
    };
    DatabaseManager::new(&config).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_never_share_a_task() {
    let dir = tempfile::tempdir().unwrap();
    let manager = file_backed_manager(&dir).await;
    let repository: Arc<dyn TaskRepository> = Arc::new(manager.task_repository());

    for i in 0..TASK_COUNT {
        repository
            .insert(&NewTask::new("relevance_scoring", format!("doc-{i}")))
            .await
            .unwrap();
    }

    // 每个领取者模拟一个独立进程
    let handles: Vec<_> = (0..CLAIMERS)
        .map(|claimer| {
            let repository = repository.clone();
            tokio::spawn(async move {
                let process_id = 10_000 + claimer;
                let worker_id = format!("{process_id}-0");
                let mut claimed = Vec::new();
                while let Some(task) = repository
                    .claim_next(&[], process_id, &worker_id)
                    .await
                    .unwrap()
                {
                    assert_eq!(task.process_id, Some(process_id));
                    let lease = task.lease().unwrap();
                    assert!(repository.complete(&lease, None).await.unwrap());
                    claimed.push(task.id);
                }
                claimed
            })
        })
        .collect();

    let mut all_claims = Vec::new();
    for result in futures::future::join_all(handles).await {
        all_claims.extend(result.unwrap());
    }

    let unique: HashSet<i64> = all_claims.iter().copied().collect();
    assert_eq!(all_claims.len(), TASK_COUNT);
    assert_eq!(unique.len(), TASK_COUNT);

    let counts = repository.status_counts().await.unwrap();
    assert_eq!(counts.completed, TASK_COUNT as u64);
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.processing, 0);

    manager.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_recovery_races_with_completion() {
    let dir = tempfile::tempdir().unwrap();
    let manager = file_backed_manager(&dir).await;
    let repository: Arc<dyn TaskRepository> = Arc::new(manager.task_repository());

    for i in 0..40 {
        repository
            .insert(&NewTask::new("report_synthesis", format!("{i}")))
            .await
            .unwrap();
    }

    let mut leases = Vec::new();
    while let Some(task) = repository.claim_next(&[], 555, "555-0").await.unwrap() {
        leases.push(task.lease().unwrap());
    }
    assert_eq!(leases.len(), 40);

    // 持有者提交与恢复流程同时作用于同一批租约，每个任务只能有一方生效
    let completer = {
        let repository = repository.clone();
        let leases = leases.clone();
        tokio::spawn(async move {
            let mut applied = 0;
            for lease in &leases {
                if repository.complete(lease, None).await.unwrap() {
                    applied += 1;
                }
            }
            applied
        })
    };
    let recoverer = {
        let repository = repository.clone();
        let leases = leases.clone();
        tokio::spawn(async move {
            let mut applied = 0;
            for lease in leases.iter().rev() {
                if repository.reset_if_owned(lease).await.unwrap() {
                    applied += 1;
                }
            }
            applied
        })
    };

    let completed = completer.await.unwrap();
    let reset = recoverer.await.unwrap();
    assert_eq!(completed + reset, 40);

    let tasks = repository.list(&TaskFilter::default()).await.unwrap();
    let completed_rows = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .count();
    let pending_rows = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .count();
    assert_eq!(completed_rows, completed);
    assert_eq!(pending_rows, reset);

    manager.close().await;
}

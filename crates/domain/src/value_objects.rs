use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::{Task, TaskStatus};

/// 各状态的任务数量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::Processing => self.processing += count,
            TaskStatus::Completed => self.completed += count,
            TaskStatus::Failed => self.failed += count,
            TaskStatus::Cancelled => self.cancelled += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.cancelled
    }
}

/// 正在执行的任务在健康报告中的视图
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTaskSummary {
    pub id: i64,
    pub agent_type: String,
    pub process_id: Option<u32>,
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub running_for_seconds: i64,
    /// 运行时间超过卡住阈值
    pub stuck: bool,
    /// 所属进程已不存在
    pub orphaned: bool,
}

impl ActiveTaskSummary {
    pub fn from_task(task: &Task, now: DateTime<Utc>, stuck: bool, orphaned: bool) -> Self {
        Self {
            id: task.id,
            agent_type: task.agent_type.clone(),
            process_id: task.process_id,
            worker_id: task.worker_id.clone(),
            started_at: task.started_at,
            running_for_seconds: task
                .running_for(now)
                .map(|d| d.num_seconds())
                .unwrap_or(0),
            stuck,
            orphaned,
        }
    }
}

/// 只读的队列健康汇总
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueHealth {
    pub status_counts: StatusCounts,
    pub stuck_tasks: u64,
    pub orphaned_tasks: u64,
    pub oldest_pending_at: Option<DateTime<Utc>>,
    pub newest_task_at: Option<DateTime<Utc>>,
    pub active_tasks: Vec<ActiveTaskSummary>,
    pub checked_at: DateTime<Utc>,
    /// 生成报告的进程
    pub process_id: u32,
}

impl QueueHealth {
    pub fn is_healthy(&self) -> bool {
        self.stuck_tasks == 0 && self.orphaned_tasks == 0
    }
}

/// 导出文件的完整内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub exported_at: DateTime<Utc>,
    pub hostname: String,
    pub total: u64,
    pub status_counts: StatusCounts,
    pub tasks: Vec<Task>,
}

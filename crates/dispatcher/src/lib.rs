//! 任务队列与崩溃恢复
//!
//! `TaskQueue` 提供提交、领取、完成、失败、取消与导出；
//! `SystemRecoveryService` 负责卡住任务回收、死亡进程清理与健康汇总。

pub mod queue;
pub mod recovery_service;

#[cfg(test)]
pub mod test_utils;

pub use queue::TaskQueue;
pub use recovery_service::{RecoveryService, SystemRecoveryService};

use serde::{Deserialize, Serialize};

/// 卡住任务的恢复策略
///
/// 没有默认值：重置会让仍然存活的 Worker 与新的领取者并发执行同一任务，
/// 标记失败则放弃该任务，必须由调用方显式选择。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// 清除归属并重置为 PENDING，等待重新领取
    ResetToPending,
    /// 标记为 FAILED
    MarkFailed,
}

impl RecoveryStrategy {
    pub fn from_mark_failed(mark_as_failed: bool) -> Self {
        if mark_as_failed {
            RecoveryStrategy::MarkFailed
        } else {
            RecoveryStrategy::ResetToPending
        }
    }
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryStrategy::ResetToPending => write!(f, "reset_to_pending"),
            RecoveryStrategy::MarkFailed => write!(f, "mark_failed"),
        }
    }
}

/// 定时恢复配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    /// 超过该时长仍处于 PROCESSING 的任务视为卡住
    pub stuck_timeout_seconds: u64,
    pub strategy: Option<RecoveryStrategy>,
    pub cleanup_dead_processes: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: 60,
            stuck_timeout_seconds: 3_600,
            strategy: None,
            cleanup_dead_processes: true,
        }
    }
}

impl RecoveryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval_seconds == 0 {
            return Err(anyhow::anyhow!("恢复检测间隔必须大于0"));
        }

        if self.stuck_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("卡住任务超时时间必须大于0"));
        }

        if self.enabled && self.strategy.is_none() {
            return Err(anyhow::anyhow!(
                "启用定时恢复时必须显式配置 recovery.strategy (reset_to_pending 或 mark_failed)"
            ));
        }

        Ok(())
    }
}

/// 终态任务保留策略
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub max_age_hours: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: 3_600,
            max_age_hours: 24 * 7,
        }
    }
}

impl RetentionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval_seconds == 0 {
            return Err(anyhow::anyhow!("清理间隔必须大于0"));
        }
        if self.max_age_hours == 0 {
            return Err(anyhow::anyhow!("保留时长必须大于0"));
        }
        Ok(())
    }
}

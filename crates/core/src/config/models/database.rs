use serde::{Deserialize, Serialize};

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_seconds: u64,
    /// SQLite 等待写锁的时间
    pub busy_timeout_ms: u64,
    /// 锁竞争时单次操作的最大重试次数
    pub busy_retry_attempts: u32,
    pub busy_retry_base_delay_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:taskqueue.db".to_string(),
            max_connections: 8,
            min_connections: 1,
            connection_timeout_seconds: 30,
            busy_timeout_ms: 5_000,
            busy_retry_attempts: 5,
            busy_retry_base_delay_ms: 50,
        }
    }
}

impl DatabaseConfig {
    /// Validate database configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.url.is_empty() {
            return Err(anyhow::anyhow!("数据库URL不能为空"));
        }

        if !self.url.starts_with("sqlite:") {
            return Err(anyhow::anyhow!("数据库URL必须是SQLite格式: {}", self.url));
        }

        if self.max_connections == 0 {
            return Err(anyhow::anyhow!("最大连接数必须大于0"));
        }

        if self.min_connections > self.max_connections {
            return Err(anyhow::anyhow!("最小连接数不能大于最大连接数"));
        }

        if self.connection_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("连接超时时间必须大于0"));
        }

        if self.busy_retry_attempts == 0 {
            return Err(anyhow::anyhow!("锁竞争重试次数必须大于0"));
        }

        Ok(())
    }
}

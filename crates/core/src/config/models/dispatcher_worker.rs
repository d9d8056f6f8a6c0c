use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// 每个进程内并发的 Worker 数量
    pub concurrency: u32,
    /// 领取任务时的 agent_type 过滤，空表示不过滤
    pub agent_types: Vec<String>,
    pub poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    pub default_max_retries: i32,
    /// agent_type -> 外部命令行
    pub agents: HashMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: 2,
            agent_types: Vec::new(),
            poll_interval_ms: 500,
            max_poll_interval_ms: 10_000,
            default_max_retries: 3,
            agents: HashMap::new(),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.concurrency == 0 {
            return Err(anyhow::anyhow!("Worker并发数必须大于0"));
        }

        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("轮询间隔必须大于0"));
        }

        if self.max_poll_interval_ms < self.poll_interval_ms {
            return Err(anyhow::anyhow!("最大轮询间隔不能小于轮询间隔"));
        }

        if self.default_max_retries < 0 {
            return Err(anyhow::anyhow!("默认最大重试次数不能为负数"));
        }

        for (agent_type, command) in &self.agents {
            if agent_type.trim().is_empty() {
                return Err(anyhow::anyhow!("agent类型不能为空"));
            }
            if command.trim().is_empty() {
                return Err(anyhow::anyhow!("agent '{}' 的命令不能为空", agent_type));
            }
        }

        Ok(())
    }

    /// 实际用于领取任务的类型过滤：显式配置优先，否则使用已配置的 agents
    pub fn claim_filter(&self) -> Vec<String> {
        if !self.agent_types.is_empty() {
            return self.agent_types.clone();
        }
        let mut types: Vec<String> = self.agents.keys().cloned().collect();
        types.sort();
        types
    }
}

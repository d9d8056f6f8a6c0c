use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use taskqueue_domain::Task;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::agents::AgentKind;

/// 外部 agent 约定的"稍后重试"退出码 (EX_TEMPFAIL)
pub const RETRYABLE_EXIT_CODE: i32 = 75;

/// 任务体执行错误
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// 可以重新排队的失败，受 `max_retries` 约束
    #[error("可重试错误: {0}")]
    Retryable(String),

    /// 直接进入 FAILED
    #[error("致命错误: {0}")]
    Fatal(String),
}

impl AgentError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            AgentError::Retryable(message) | AgentError::Fatal(message) => message,
        }
    }
}

/// 任务体执行器
///
/// 负载对队列不透明，只有执行器知道如何解释它。
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// 执行一个已领取的任务，成功时返回可选的结果文本
    async fn execute(&self, task: &Task) -> Result<Option<String>, AgentError>;

    fn name(&self) -> &str;
}

/// 通过外部程序执行任务
///
/// 负载写入子进程 stdin，stdout 作为结果；退出码 75 视为可重试，其他非零退出码为致命错误。
#[derive(Debug, Clone)]
pub struct CommandAgentExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandAgentExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// 按空白拆分命令行，第一个词为程序名
    pub fn from_command_line(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl AgentExecutor for CommandAgentExecutor {
    async fn execute(&self, task: &Task) -> Result<Option<String>, AgentError> {
        let start_time = Instant::now();

        debug!(
            "执行外部agent: task_id={}, agent_type={}, command={} {:?}",
            task.id, task.agent_type, self.program, self.args
        );

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("TASKQUEUE_TASK_ID", task.id.to_string())
            .env("TASKQUEUE_AGENT_TYPE", &task.agent_type)
            .env("TASKQUEUE_RETRY_COUNT", task.retry_count.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Fatal(format!("启动命令 {} 失败: {e}", self.program)))?;

        let stdin = child.stdin.take();
        let payload = task.payload.clone().into_bytes();
        let write_payload = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&payload).await?;
                stdin.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };

        // 同时写入 stdin 与读取输出，避免双方管道都写满时互相等待
        let (write_result, output) = tokio::join!(write_payload, child.wait_with_output());
        let output =
            output.map_err(|e| AgentError::Fatal(format!("等待命令结束失败: {e}")))?;

        if let Err(e) = write_result {
            // 子进程不读 stdin 就退出时会出现 BrokenPipe
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                warn!("向任务 {} 的agent写入负载失败: {}", task.id, e);
            }
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        let elapsed_ms = start_time.elapsed().as_millis();

        if output.status.success() {
            info!(
                "外部agent执行完成: task_id={}, duration={}ms",
                task.id, elapsed_ms
            );
            return Ok((!stdout.is_empty()).then_some(stdout));
        }

        let code = output.status.code();
        let detail = if stderr.is_empty() {
            format!("命令执行失败，退出码: {code:?}")
        } else {
            format!("命令执行失败，退出码: {code:?}: {stderr}")
        };

        match code {
            Some(RETRYABLE_EXIT_CODE) => Err(AgentError::Retryable(detail)),
            _ => Err(AgentError::Fatal(detail)),
        }
    }

    fn name(&self) -> &str {
        &self.program
    }
}

/// 按 agent 种类索引的执行器注册表
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<AgentKind, Arc<dyn AgentExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 由配置中的 agent_type -> 命令行映射构建
    pub fn from_commands(commands: &HashMap<String, String>) -> Self {
        let mut registry = Self::new();
        for (agent_type, command_line) in commands {
            match CommandAgentExecutor::from_command_line(command_line) {
                Some(executor) => registry.register(agent_type.as_str(), Arc::new(executor)),
                None => warn!("agent '{}' 的命令为空，跳过注册", agent_type),
            }
        }
        registry
    }

    pub fn register(&mut self, kind: impl Into<AgentKind>, executor: Arc<dyn AgentExecutor>) {
        let kind = kind.into();
        if kind.is_known() {
            info!("注册agent执行器: {} -> {}", kind, executor.name());
        } else {
            info!("注册自定义agent执行器: {} -> {}", kind, executor.name());
        }
        self.executors.insert(kind, executor);
    }

    pub fn get(&self, kind: &AgentKind) -> Option<Arc<dyn AgentExecutor>> {
        self.executors.get(kind).cloned()
    }

    /// 已注册的 agent_type 名称，按字母排序，可直接用作领取过滤
    pub fn agent_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .executors
            .keys()
            .map(|kind| kind.as_str().to_string())
            .collect();
        types.sort();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }
}

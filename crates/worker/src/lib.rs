//! 任务执行端
//!
//! `WorkerPool` 在单个进程内运行多个轮询循环，按 `agent_type` 把领取到的任务
//! 分发给已注册的 `AgentExecutor`，并把执行结果回报给队列。

pub mod agents;
pub mod executors;
pub mod service;

pub use agents::AgentKind;
pub use executors::{AgentError, AgentExecutor, CommandAgentExecutor, ExecutorRegistry};
pub use service::{PollBackoff, WorkerPool};

//! 任务队列配置
//!
//! 加载顺序：内置默认值 → TOML 配置文件 → `TASKQUEUE_` 前缀的环境变量。
//! 每个配置段都提供 `validate()`，在启动阶段统一校验。

pub mod models;

pub use models::*;

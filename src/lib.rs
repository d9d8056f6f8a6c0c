//! 持久化任务队列的进程级组件：关闭协调与 Worker 进程装配

pub mod app;
pub mod shutdown;

pub use app::Application;
pub use shutdown::{ShutdownCoordinator, ShutdownGuard};

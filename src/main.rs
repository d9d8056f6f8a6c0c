use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use taskqueue::app::Application;
use taskqueue_core::{init_logging, AppConfig, LogFormat};

/// 任务队列 Worker 进程
#[derive(Parser, Debug)]
#[command(name = "taskqueue")]
#[command(version = "1.0.0")]
#[command(about = "持久化任务队列 Worker 进程")]
struct Args {
    /// 配置文件路径，未指定时按默认路径搜索
    #[arg(short, long)]
    config: Option<String>,

    /// 覆盖配置中的数据库URL
    #[arg(long)]
    database_url: Option<String>,

    /// 覆盖每个进程内的 Worker 数量
    #[arg(long)]
    concurrency: Option<u32>,

    /// 日志级别
    #[arg(short, long, value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: Option<String>,

    /// 日志格式
    #[arg(long)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref()).context("加载配置失败")?;
    if let Some(url) = args.database_url {
        config.database.url = url;
    }
    if let Some(concurrency) = args.concurrency {
        config.worker.concurrency = concurrency;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    init_logging(&config.logging.level, config.logging.format)?;
    info!("启动任务队列 Worker 进程 (pid {})", std::process::id());

    let app = Application::new(config).await?;
    app.run().await?;

    info!("Worker 进程已退出");
    Ok(())
}

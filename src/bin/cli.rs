use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use taskqueue_core::{init_logging, AppConfig, LogFormat, RecoveryStrategy};
use taskqueue_dispatcher::{RecoveryService, SystemRecoveryService, TaskQueue};
use taskqueue_domain::{QueueHealth, Task, TaskFilter, TaskPriority, TaskStatus};
use taskqueue_infrastructure::{DatabaseManager, OsProcessProbe};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliApp::parse();
    cli.run().await
}

/// CLI应用程序主结构
#[derive(Parser, Debug)]
#[command(name = "taskqueue-cli")]
#[command(version = "1.0.0")]
#[command(about = "持久化任务队列 - 命令行管理工具")]
#[command(long_about = "查看队列状态、提交与取消任务、回收卡住或孤儿任务、导出队列内容")]
struct CliApp {
    #[command(subcommand)]
    command: Commands,

    /// 配置文件路径
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// 覆盖配置中的数据库URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// 日志级别
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// 日志格式
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 队列健康汇总
    Status {
        /// 运行超过该分钟数的任务视为卡住
        #[arg(long, default_value = "60")]
        stuck_minutes: u64,
        /// 以JSON输出
        #[arg(long)]
        json: bool,
    },
    /// 列出任务
    List {
        /// 任务状态过滤
        #[arg(short, long)]
        status: Option<TaskStatus>,
        /// agent类型过滤
        #[arg(short, long)]
        agent_type: Option<String>,
        /// 最多显示数量
        #[arg(short, long, default_value = "50")]
        limit: i64,
    },
    /// 提交任务
    Submit {
        /// agent类型
        #[arg(short, long)]
        agent_type: String,
        /// 任务负载，原样保存
        #[arg(short, long)]
        payload: String,
        /// 优先级 (low, normal, high, critical)
        #[arg(long, default_value = "normal")]
        priority: TaskPriority,
        /// 最大重试次数，默认取配置
        #[arg(long)]
        max_retries: Option<i32>,
    },
    /// 回收卡住的任务
    Recover {
        /// 超时分钟数
        #[arg(long)]
        timeout_minutes: u64,
        /// 标记为失败而不是重置为等待
        #[arg(long)]
        mark_failed: bool,
    },
    /// 清理所属进程已退出的任务
    CleanupDead,
    /// 删除早于指定小时数的终态任务
    CleanupOld {
        #[arg(long)]
        hours: u64,
    },
    /// 取消任务；不指定ID时批量取消等待中的任务
    Cancel {
        /// 任务ID
        #[arg(long)]
        id: Option<i64>,
        /// 允许取消执行中的任务
        #[arg(long, requires = "id")]
        force: bool,
        /// 批量取消时的agent类型过滤
        #[arg(short, long, conflicts_with = "id")]
        agent_type: Option<String>,
    },
    /// 导出队列全部内容
    Export {
        /// 输出文件
        path: PathBuf,
    },
}

impl CliApp {
    async fn run(self) -> Result<()> {
        let mut config = AppConfig::load(self.config.as_deref()).context("加载配置失败")?;
        if let Some(url) = self.database_url {
            config.database.url = url;
        }
        init_logging(&self.log_level, self.log_format)?;

        let manager = DatabaseManager::new(&config.database)
            .await
            .with_context(|| format!("打开任务存储失败: {}", config.database.url))?;
        let repository = Arc::new(manager.task_repository());
        let queue = TaskQueue::new(repository.clone());
        let recovery = SystemRecoveryService::new(repository, Arc::new(OsProcessProbe::new()));

        let result = execute(self.command, &config, &queue, &recovery).await;
        manager.close().await;
        result
    }
}

async fn execute(
    command: Commands,
    config: &AppConfig,
    queue: &TaskQueue,
    recovery: &SystemRecoveryService,
) -> Result<()> {
    match command {
        Commands::Status {
            stuck_minutes,
            json,
        } => {
            let health = recovery.health(minutes(stuck_minutes)?).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&health)?);
            } else {
                print_health(&health);
            }
        }
        Commands::List {
            status,
            agent_type,
            limit,
        } => {
            let mut filter = TaskFilter::default().with_limit(limit);
            if let Some(status) = status {
                filter = filter.with_status(status);
            }
            if let Some(agent_type) = agent_type {
                filter = filter.with_agent_type(agent_type);
            }
            let tasks = queue.list(&filter).await?;
            print_tasks_table(&tasks);
        }
        Commands::Submit {
            agent_type,
            payload,
            priority,
            max_retries,
        } => {
            let max_retries = max_retries.unwrap_or(config.worker.default_max_retries);
            let id = queue
                .submit(&agent_type, &payload, priority, max_retries)
                .await?;
            println!("任务提交成功!");
            println!("任务ID: {id}");
        }
        Commands::Recover {
            timeout_minutes,
            mark_failed,
        } => {
            let strategy = RecoveryStrategy::from_mark_failed(mark_failed);
            let recovered = recovery
                .recover_stuck_tasks(minutes(timeout_minutes)?, strategy)
                .await?;
            println!("回收了{recovered}个卡住的任务 (策略: {strategy})");
        }
        Commands::CleanupDead => {
            let cleaned = recovery.cleanup_dead_process_tasks().await?;
            println!("清理了{cleaned}个死亡进程的任务");
        }
        Commands::CleanupOld { hours } => {
            let hours = i64::try_from(hours).context("小时数过大")?;
            let deleted = queue.cleanup_old(chrono::Duration::hours(hours)).await?;
            println!("删除了{deleted}个早于{hours}小时的终态任务");
        }
        Commands::Cancel {
            id,
            force,
            agent_type,
        } => match id {
            Some(id) => {
                queue.cancel(id, force).await?;
                println!("任务已取消: {id}");
            }
            None => {
                let cancelled = queue.cancel_all(agent_type.as_deref()).await?;
                println!("取消了{cancelled}个等待中的任务");
            }
        },
        Commands::Export { path } => {
            let exported = queue.export(&path).await?;
            println!("导出{}个任务到 {}", exported, path.display());
        }
    }

    Ok(())
}

fn print_health(health: &QueueHealth) {
    let counts = &health.status_counts;
    println!("队列状态概览:");
    println!("  检查时间: {}", health.checked_at.to_rfc3339());
    println!("  总任务数: {}", counts.total());
    println!("  等待中: {}", counts.pending);
    println!("  执行中: {}", counts.processing);
    println!("  已完成: {}", counts.completed);
    println!("  已失败: {}", counts.failed);
    println!("  已取消: {}", counts.cancelled);
    println!("  卡住任务: {}", health.stuck_tasks);
    println!("  孤儿任务: {}", health.orphaned_tasks);
    println!("  最早等待任务: {}", format_time(health.oldest_pending_at));
    println!("  最新任务: {}", format_time(health.newest_task_at));

    if health.active_tasks.is_empty() {
        return;
    }

    println!();
    println!(
        "{:<10} {:<22} {:<16} {:<12} {:<8}",
        "ID", "类型", "Worker", "运行秒数", "标记"
    );
    println!("{}", "-".repeat(72));
    for task in &health.active_tasks {
        let flag = match (task.orphaned, task.stuck) {
            (true, _) => "orphaned",
            (false, true) => "stuck",
            _ => "",
        };
        println!(
            "{:<10} {:<22} {:<16} {:<12} {:<8}",
            task.id,
            task.agent_type,
            task.worker_id.as_deref().unwrap_or("N/A"),
            task.running_for_seconds,
            flag
        );
    }
}

fn print_tasks_table(tasks: &[Task]) {
    println!(
        "{:<10} {:<22} {:<12} {:<10} {:<8} {:<26}",
        "ID", "类型", "状态", "优先级", "重试", "创建时间"
    );
    println!("{}", "-".repeat(92));
    for task in tasks {
        println!(
            "{:<10} {:<22} {:<12} {:<10} {:<8} {:<26}",
            task.id,
            task.agent_type,
            task.status.as_str(),
            task.priority.to_string(),
            format!("{}/{}", task.retry_count, task.max_retries),
            task.created_at.to_rfc3339()
        );
        if let Some(error) = &task.error_message {
            println!("{:>10} 错误: {}", "", error);
        }
    }
    println!("共 {} 个任务", tasks.len());
}

fn minutes(value: u64) -> Result<Duration> {
    value
        .checked_mul(60)
        .map(Duration::from_secs)
        .with_context(|| format!("分钟数过大: {value}"))
}

fn format_time(time: Option<chrono::DateTime<chrono::Utc>>) -> String {
    time.map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "N/A".to_string())
}

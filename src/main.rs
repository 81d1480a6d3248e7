use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orchestrator::{
    app::install_metrics_exporter, shutdown::wait_for_signal, AppMode, Application,
    ShutdownManager, WorkerOptions,
};
use orchestrator_core::{init_logging, AppConfig};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "orchestrator", version, about = "分布式作业编排系统")]
struct Cli {
    /// 配置文件路径（TOML），缺省时查找 config/orchestrator.toml
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// 覆盖配置中的日志级别
    #[arg(short, long, global = true, value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: Option<String>,

    /// 覆盖配置中的日志格式
    #[arg(long, global = true, value_parser = ["json", "pretty"])]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 运行集群管理器
    Cluster,
    /// 运行节点代理
    Node,
    /// 运行单个Worker
    Worker {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        job_type: String,
        #[arg(long)]
        worker_class: String,
        /// Worker参数（JSON）
        #[arg(long, default_value = "{}")]
        worker_params: String,
        #[arg(long, default_value = "0.0.0.0:8200")]
        bind: String,
    },
    /// 同一进程内运行集群管理器与节点代理
    All,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone();
    let config_str = config_path.as_ref().and_then(|p| p.to_str());
    let config = AppConfig::load(config_str).context("加载配置失败")?;

    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.observability.log_level);
    let log_format = cli
        .log_format
        .as_deref()
        .unwrap_or(&config.observability.log_format);
    init_logging(log_level, log_format)?;

    let mode = parse_app_mode(cli.command)?;
    info!("启动分布式作业编排系统，模式: {:?}", mode);
    if let Some(ref path) = config_path {
        info!("配置文件: {}", path.display());
    }

    // 子进程Worker不单独导出指标，避免与节点代理争用端口
    if config.observability.metrics_enabled && !matches!(mode, AppMode::Worker(_)) {
        install_metrics_exporter(&config.observability.metrics_bind_address)?;
    }

    let app = std::sync::Arc::new(Application::new(config, config_path));
    let shutdown_manager = ShutdownManager::new();

    let mut app_handle = {
        let app = std::sync::Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move { app.run(mode, shutdown_rx).await })
    };

    tokio::select! {
        _ = wait_for_signal() => {
            info!("收到关闭信号，开始优雅关闭...");
        }
        result = &mut app_handle => {
            // 应用提前退出，通常是启动失败
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!("应用运行失败: {:#}", e);
                    Err(e)
                }
                Err(e) => Err(anyhow::anyhow!("应用任务崩溃: {e}")),
            };
        }
    }

    shutdown_manager.shutdown().await;

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(Ok(()))) => info!("应用已优雅关闭"),
        Ok(Ok(Err(e))) => error!("应用关闭时发生错误: {:#}", e),
        Ok(Err(e)) => error!("应用任务崩溃: {}", e),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("分布式作业编排系统已退出");
    Ok(())
}

/// 解析运行模式
fn parse_app_mode(command: Commands) -> Result<AppMode> {
    Ok(match command {
        Commands::Cluster => AppMode::Cluster,
        Commands::Node => AppMode::Node,
        Commands::All => AppMode::All,
        Commands::Worker {
            name,
            job_type,
            worker_class,
            worker_params,
            bind,
        } => {
            let worker_params = serde_json::from_str(&worker_params)
                .with_context(|| format!("Worker参数不是有效的JSON: {worker_params}"))?;
            let name = match name {
                Some(name) => name,
                None => default_worker_name(&job_type),
            };
            AppMode::Worker(WorkerOptions {
                name,
                job_type,
                worker_class,
                worker_params,
                bind,
            })
        }
    })
}

fn default_worker_name(job_type: &str) -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{host}-{job_type}")
}

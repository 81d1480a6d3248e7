use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use orchestrator_api::{
    create_cluster_routes, create_node_routes, ClusterApiClient, ClusterState,
    HttpClusterReporter, HttpNodeConnector, NodeState,
};
use orchestrator_cluster::{ClusterManager, HealthMonitor};
use orchestrator_core::{
    config::{LauncherType, StoreType},
    AppConfig, BackgroundDispatcher, ClusterStore, NodeAgentApi,
};
use orchestrator_infrastructure::{
    BrokerFactory, BrokerHandle, InMemoryClusterStore, SqliteClusterStore, SqliteDatabase,
};
use orchestrator_node::{
    HeartbeatManager, InProcessLauncher, NodeAgent, SubprocessLauncher, WorkerLauncher,
};
use orchestrator_worker::{SchemaRegistry, WorkerRegistry, WorkerServer};
use tokio::{net::TcpListener, sync::broadcast};
use tracing::{error, info, warn};

/// 节点启动时向管理器注册的重试次数
const REGISTER_ATTEMPTS: u32 = 10;

/// 应用运行模式
#[derive(Debug, Clone)]
pub enum AppMode {
    /// 仅运行集群管理器
    Cluster,
    /// 仅运行节点代理
    Node,
    /// 运行单个Worker，通常由子进程启动器拉起
    Worker(WorkerOptions),
    /// 同一进程内运行管理器与节点代理
    All,
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub name: String,
    pub job_type: String,
    pub worker_class: String,
    pub worker_params: serde_json::Value,
    pub bind: String,
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    config_path: Option<PathBuf>,
}

impl Application {
    pub fn new(config: AppConfig, config_path: Option<PathBuf>) -> Self {
        Self {
            config,
            config_path,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 运行应用程序，直到收到关闭信号
    pub async fn run(&self, mode: AppMode, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", mode);
        match mode {
            AppMode::Cluster => self.run_cluster(shutdown_rx).await,
            AppMode::Node => self.run_node(shutdown_rx).await,
            AppMode::Worker(options) => self.run_worker(options, shutdown_rx).await,
            AppMode::All => {
                let node_rx = shutdown_rx.resubscribe();
                tokio::try_join!(self.run_cluster(shutdown_rx), self.run_node(node_rx))?;
                Ok(())
            }
        }
    }

    async fn create_store(&self) -> Result<(Arc<dyn ClusterStore>, Option<SqliteDatabase>)> {
        match self.config.cluster.store {
            StoreType::Memory => {
                info!("使用内存集群存储");
                Ok((Arc::new(InMemoryClusterStore::new()), None))
            }
            StoreType::Sqlite => {
                info!("使用SQLite集群存储: {}", self.config.cluster.database_url);
                let database = SqliteDatabase::connect(&self.config.cluster.database_url)
                    .await
                    .context("连接集群数据库失败")?;
                database.migrate().await.context("集群数据库迁移失败")?;
                let store = SqliteClusterStore::new(database.pool().clone());
                Ok((Arc::new(store), Some(database)))
            }
        }
    }

    /// 构建集群管理器
    pub async fn build_cluster_manager(&self) -> Result<(Arc<ClusterManager>, Option<SqliteDatabase>)> {
        let (store, database) = self.create_store().await?;
        let connector = HttpNodeConnector::new(Duration::from_secs(
            self.config.cluster.node_request_timeout_seconds,
        ))?;
        let manager = ClusterManager::new(store, Arc::new(connector), self.config.cluster.clone());
        Ok((Arc::new(manager), database))
    }

    async fn run_cluster(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let (manager, database) = self.build_cluster_manager().await?;

        let monitor_handle = {
            let monitor = HealthMonitor::new(Arc::clone(&manager));
            let monitor_rx = shutdown_rx.resubscribe();
            tokio::spawn(async move { monitor.run(monitor_rx).await })
        };

        let bind_address = &self.config.cluster.bind_address;
        let listener = TcpListener::bind(bind_address)
            .await
            .with_context(|| format!("集群管理器绑定地址失败: {bind_address}"))?;
        info!("集群管理器已启动，监听地址: {}", bind_address);

        let app = create_cluster_routes(ClusterState { manager });
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
            .context("集群管理器HTTP服务异常")?;

        if let Err(e) = monitor_handle.await {
            warn!("健康监控任务退出异常: {}", e);
        }
        if let Some(database) = database {
            database.close().await;
        }
        info!("集群管理器已停止");
        Ok(())
    }

    async fn create_broker(&self) -> Result<BrokerHandle> {
        BrokerFactory::create_with_dlq_suffix(&self.config.broker, &self.config.consumer.dlq_suffix)
            .await
            .context("创建消息代理失败")
    }

    fn create_launcher(&self, broker: &BrokerHandle) -> Result<Arc<dyn WorkerLauncher>> {
        let node = &self.config.node;
        let timeout = Duration::from_secs(node.launch_timeout_seconds);
        match node.launcher {
            LauncherType::InProcess => {
                let launcher = InProcessLauncher::new(
                    Arc::new(WorkerRegistry::with_builtin_workers()),
                    timeout,
                )
                .with_broker(
                    Arc::clone(&broker.broker),
                    self.config.consumer.clone(),
                    Arc::new(SchemaRegistry::new()),
                );
                Ok(Arc::new(launcher))
            }
            LauncherType::Subprocess => {
                let mut launcher = SubprocessLauncher::from_current_exe(timeout)?;
                if let Some(ref path) = self.config_path {
                    launcher = launcher.with_config_path(path);
                }
                Ok(Arc::new(launcher))
            }
        }
    }

    async fn register_node(&self, cluster: &ClusterApiClient) -> Result<()> {
        let node = &self.config.node;
        let mut attempt = 1;
        loop {
            match cluster
                .register_node(&node.node_url, node.port_range_start, node.port_range_end)
                .await
            {
                Ok(_) => {
                    info!("节点已注册到集群管理器: {}", cluster.base_url());
                    return Ok(());
                }
                Err(e) if attempt < REGISTER_ATTEMPTS && !e.is_client_error() => {
                    warn!("节点注册失败 (第{}次): {}", attempt, e);
                    attempt += 1;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => return Err(e).context("节点注册失败"),
            }
        }
    }

    async fn run_node(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let node = &self.config.node;
        let broker = self.create_broker().await?;
        let launcher = self.create_launcher(&broker)?;

        let cluster = ClusterApiClient::new(&node.cluster_url);
        let reporter = Arc::new(HttpClusterReporter::new(cluster.clone()));
        let agent = Arc::new(
            NodeAgent::new(
                node.clone(),
                Arc::new(WorkerRegistry::with_builtin_workers()),
                launcher,
            )
            .with_reporter(reporter.clone(), BackgroundDispatcher::pool(4)),
        );

        let listener = TcpListener::bind(&node.bind_address)
            .await
            .with_context(|| format!("节点代理绑定地址失败: {}", node.bind_address))?;
        info!(
            "节点代理已启动，监听地址: {}，对外地址: {}",
            node.bind_address, node.node_url
        );

        let app = create_node_routes(NodeState {
            agent: agent.clone(),
            node_url: node.node_url.clone(),
        });
        let server_rx = shutdown_rx.resubscribe();
        let server_handle = tokio::spawn(async move {
            let mut server_rx = server_rx;
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = server_rx.recv().await;
                })
                .await
        });

        if node.register_on_start {
            self.register_node(&cluster).await?;
        }

        let heartbeat_handle = {
            let heartbeat = HeartbeatManager::new(Arc::clone(&agent), reporter);
            let heartbeat_rx = shutdown_rx.resubscribe();
            tokio::spawn(async move { heartbeat.run(heartbeat_rx).await })
        };

        let _ = shutdown_rx.recv().await;
        info!("节点代理开始关闭，终止全部Worker");
        match agent.shutdown_all_workers().await {
            Ok(stopped) => info!("已终止 {} 个Worker", stopped.len()),
            Err(e) => error!("终止Worker失败: {}", e),
        }

        let _ = heartbeat_handle.await;
        match server_handle.await {
            Ok(Err(e)) => error!("节点代理HTTP服务异常: {}", e),
            Err(e) => error!("节点代理HTTP任务崩溃: {}", e),
            Ok(Ok(())) => {}
        }
        broker.close().await.context("关闭消息代理连接失败")?;
        info!("节点代理已停止");
        Ok(())
    }

    async fn run_worker(&self, options: WorkerOptions, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let handler = WorkerRegistry::with_builtin_workers()
            .create(&options.worker_class, &options.worker_params)?;
        let broker = self.create_broker().await?;

        let listener = WorkerServer::bind(&options.bind).await?;
        let server = WorkerServer::new(&options.name, &options.job_type, handler).with_consumer(
            Arc::clone(&broker.broker),
            self.config.consumer.clone(),
            Arc::new(SchemaRegistry::new()),
        );
        info!(
            "Worker {} 已启动: class={}, job_type={}, bind={}",
            options.name, options.worker_class, options.job_type, options.bind
        );
        server.serve(listener, shutdown_rx).await?;

        broker.close().await.context("关闭消息代理连接失败")?;
        Ok(())
    }
}

/// 启动Prometheus指标导出
pub fn install_metrics_exporter(bind_address: &str) -> Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {bind_address}"))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("启动Prometheus指标导出失败")?;
    info!("Prometheus指标导出已启动: {}", addr);
    Ok(())
}

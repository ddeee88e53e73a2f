use std::collections::BTreeSet;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use scheduler_api::{create_app, routes::AppState};
use scheduler_core::{AppConfig, SchedulerResult, ServicesConfig};
use scheduler_dispatcher::{SchedulerContext, SchedulerRegistry};
use scheduler_domain::{ArtifactService, CatalogService, ObjectService};
use scheduler_infrastructure::{
    ArtifactClient, CachedCatalog, CatalogClient, DatabaseManager, EventBus, MetricsCollector,
    ObjectClient,
};
use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info, warn};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行调度循环
    Scheduler,
    /// 仅运行API服务器
    Api,
    /// 运行所有组件
    All,
}

impl AppMode {
    pub fn runs_schedulers(&self) -> bool {
        matches!(self, AppMode::Scheduler | AppMode::All)
    }

    pub fn runs_api(&self) -> bool {
        matches!(self, AppMode::Api | AppMode::All)
    }
}

impl FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduler" => Ok(AppMode::Scheduler),
            "api" => Ok(AppMode::Api),
            "all" => Ok(AppMode::All),
            _ => Err(anyhow::anyhow!("不支持的运行模式: {s}")),
        }
    }
}

/// 外部服务客户端，测试中可替换为内存实现
pub struct ExternalServices {
    pub catalog: Arc<dyn CatalogService>,
    pub objects: Arc<dyn ObjectService>,
    pub artifacts: Arc<dyn ArtifactService>,
}

impl ExternalServices {
    pub fn from_config(config: &ServicesConfig) -> Result<Self> {
        Ok(Self {
            catalog: Arc::new(CatalogClient::new(config).context("创建插件目录客户端失败")?),
            objects: Arc::new(ObjectClient::new(config).context("创建对象存储客户端失败")?),
            artifacts: Arc::new(
                ArtifactClient::new(config).context("创建原始数据存储客户端失败")?,
            ),
        })
    }
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    database: DatabaseManager,
    catalog: Arc<CachedCatalog>,
    ctx: SchedulerContext,
    registry: Arc<SchedulerRegistry>,
}

impl Application {
    /// 创建新的应用实例
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);
        info!("连接数据库: {}", mask_database_url(&config.database.url));

        let database = DatabaseManager::new(&config.database)
            .await
            .context("连接数据库失败")?;
        let services = ExternalServices::from_config(&config.services)?;
        let metrics = if config.observability.metrics_enabled {
            MetricsCollector::install().context("创建指标收集器失败")?
        } else {
            MetricsCollector::disabled()
        };

        Self::with_parts(config, mode, database, services, metrics).await
    }

    /// 由已建立的数据库与外部服务组装应用
    pub async fn with_parts(
        config: AppConfig,
        mode: AppMode,
        database: DatabaseManager,
        services: ExternalServices,
        metrics: MetricsCollector,
    ) -> Result<Self> {
        database.migrate().await.context("运行数据库迁移失败")?;

        let catalog = Arc::new(CachedCatalog::new(
            services.catalog,
            Duration::from_secs(config.services.cache_ttl_seconds),
        ));

        let ctx = SchedulerContext {
            config: config.scheduler.clone(),
            task_repo: database.task_repository(),
            schedule_repo: database.schedule_repository(),
            queue_store: database.queue_store(),
            catalog: catalog.clone(),
            objects: services.objects,
            artifacts: services.artifacts,
            events: Arc::new(EventBus::default()),
            metrics,
        };

        Ok(Self {
            config,
            mode,
            database,
            catalog,
            ctx,
            registry: Arc::new(SchedulerRegistry::new()),
        })
    }

    pub fn registry(&self) -> &Arc<SchedulerRegistry> {
        &self.registry
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    /// 运行应用程序，直到收到关闭信号
    pub async fn run(self: Arc<Self>, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);

        // 启动时同步一次租户，失败由监控循环重试
        if let Err(e) = self.sync_organisations().await {
            warn!("初始同步租户失败: {}", e);
        }

        let mut handles = Vec::new();

        if self.mode.runs_schedulers() {
            let app = Arc::clone(&self);
            handles.push(run_periodic(
                "organisations",
                Duration::from_secs(self.config.scheduler.monitor_organisations_interval_seconds),
                shutdown_rx.resubscribe(),
                move || {
                    let app = Arc::clone(&app);
                    async move { app.sync_organisations().await }
                },
            ));
        }

        if self.ctx.metrics.is_enabled() {
            let app = Arc::clone(&self);
            handles.push(run_periodic(
                "metrics",
                Duration::from_secs(self.config.scheduler.metrics_interval_seconds),
                shutdown_rx.resubscribe(),
                move || {
                    let app = Arc::clone(&app);
                    async move { app.collect_metrics().await }
                },
            ));
        }

        let api_result = if self.mode.runs_api() {
            self.run_api(shutdown_rx.resubscribe()).await
        } else {
            let mut shutdown_rx = shutdown_rx;
            let _ = shutdown_rx.recv().await;
            Ok(())
        };

        for handle in handles {
            let _ = handle.await;
        }

        self.registry.stop_all().await;
        self.database.close().await;
        info!("所有组件已停止");
        api_result
    }

    /// 对比插件目录与已注册的租户：为新租户创建调度器，移除消失的租户
    pub async fn sync_organisations(&self) -> SchedulerResult<()> {
        let current: BTreeSet<String> = self
            .catalog
            .get_organisations()
            .await?
            .into_iter()
            .map(|org| org.id)
            .collect();
        let known = self.registry.organisations().await;

        let added: Vec<&String> = current.difference(&known).collect();
        let removed: Vec<&String> = known.difference(&current).collect();
        if added.is_empty() && removed.is_empty() {
            debug!("租户列表无变化: {} 个租户", current.len());
            return Ok(());
        }

        if !added.is_empty() {
            self.catalog.flush().await?;
        }

        for organisation in added {
            let schedulers = self.registry.add_organisation(&self.ctx, organisation).await;
            if self.mode.runs_schedulers() {
                for scheduler in &schedulers {
                    scheduler.run().await;
                }
            }
            info!("新增租户 {}，已创建 {} 个调度器", organisation, schedulers.len());
        }

        // 单个调度器停用失败不影响其余调度器，返回第一个错误
        let mut first_error = None;
        for organisation in removed {
            for scheduler in self.registry.remove_organisation(organisation).await {
                if let Err(e) = scheduler.disable().await {
                    error!("停用调度器 {} 失败: {}", scheduler.id(), e);
                    first_error.get_or_insert(e);
                }
            }
            self.ctx.events.remove_organisation(organisation).await;
            info!("租户 {} 已移除，其调度器已停用", organisation);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 刷新队列长度与任务状态计数
    pub async fn collect_metrics(&self) -> SchedulerResult<()> {
        for scheduler in self.registry.list().await {
            let size = scheduler.base().queue().qsize().await?;
            self.ctx.metrics.record_queue_size(scheduler.id(), size);

            let counts = self.ctx.task_repo.status_counts(Some(scheduler.id())).await?;
            self.ctx.metrics.record_task_counts(scheduler.id(), &counts);
        }
        Ok(())
    }

    fn api_state(&self) -> AppState {
        AppState {
            registry: Arc::clone(&self.registry),
            task_repo: self.ctx.task_repo.clone(),
            schedule_repo: self.ctx.schedule_repo.clone(),
            events: self.ctx.events.clone(),
            metrics: self.ctx.metrics.clone(),
            database: Some(self.database.clone()),
            default_schedule_interval: self.ctx.default_interval(),
        }
    }

    /// 运行API服务器；关闭时先优雅停止，超时后强制终止
    async fn run_api(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let bind_address = &self.config.api.bind_address;
        let app = create_app(self.api_state(), &self.config.api);

        let listener = TcpListener::bind(bind_address)
            .await
            .with_context(|| format!("绑定地址失败: {bind_address}"))?;
        info!("API服务器启动在 http://{}", bind_address);

        let (stop_tx, mut stop_rx) = broadcast::channel::<()>(1);
        let mut server_handle = tokio::spawn(async move {
            let shutdown = async move {
                let _ = stop_rx.recv().await;
            };
            if let Err(e) = axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("API服务器运行失败: {}", e);
            }
        });

        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("API服务器收到关闭信号");
            }
            _ = &mut server_handle => {
                warn!("API服务器意外退出");
                return Ok(());
            }
        }

        let _ = stop_tx.send(());
        if tokio::time::timeout(self.ctx.stop_timeout(), &mut server_handle)
            .await
            .is_err()
        {
            warn!("API服务器关闭超时，强制终止");
            server_handle.abort();
        }

        info!("API服务器已停止");
        Ok(())
    }
}

/// 周期执行任务直到收到关闭信号，单次失败只记录日志
fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = SchedulerResult<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = job().await {
                        error!("周期任务 {} 执行失败: {}", name, e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("周期任务 {} 收到关闭信号", name);
                    break;
                }
            }
        }
    })
}

/// 屏蔽数据库URL中的敏感信息
fn mask_database_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let mut masked = url.to_string();
            masked.replace_range(colon_pos + 1..at_pos, "***");
            return masked;
        }
    }
    url.to_string()
}

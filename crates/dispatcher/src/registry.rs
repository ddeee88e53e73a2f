//! 调度器注册表：按 id 与租户索引所有运行中的调度器

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use scheduler_core::{SchedulerError, SchedulerResult};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::kinds::SchedulerKind;
use crate::post_process_scheduler::PostProcessScheduler;
use crate::report_scheduler::ReportScheduler;
use crate::scan_scheduler::ScanScheduler;
use crate::scheduler::SchedulerContext;

#[derive(Debug, Default)]
pub struct SchedulerRegistry {
    schedulers: RwLock<HashMap<String, SchedulerKind>>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为租户创建扫描、后处理、报告三个调度器并注册，返回新建的调度器
    pub async fn add_organisation(
        self: &Arc<Self>,
        ctx: &SchedulerContext,
        organisation: &str,
    ) -> Vec<SchedulerKind> {
        let kinds = vec![
            SchedulerKind::Scan(Arc::new(ScanScheduler::new(
                ctx.clone(),
                organisation,
                Arc::downgrade(self),
            ))),
            SchedulerKind::PostProcess(Arc::new(PostProcessScheduler::new(
                ctx.clone(),
                organisation,
            ))),
            SchedulerKind::Report(Arc::new(ReportScheduler::new(ctx.clone(), organisation))),
        ];

        for kind in &kinds {
            self.add(kind.clone()).await;
        }
        info!("已为租户 {} 注册 {} 个调度器", organisation, kinds.len());
        kinds
    }

    pub async fn add(&self, kind: SchedulerKind) {
        debug!("注册调度器: {}", kind.id());
        self.schedulers
            .write()
            .await
            .insert(kind.id().to_string(), kind);
    }

    pub async fn remove(&self, scheduler_id: &str) -> Option<SchedulerKind> {
        self.schedulers.write().await.remove(scheduler_id)
    }

    /// 注销租户的全部调度器并返回它们，调用方负责停用
    pub async fn remove_organisation(&self, organisation: &str) -> Vec<SchedulerKind> {
        let mut schedulers = self.schedulers.write().await;
        let ids: Vec<String> = schedulers
            .values()
            .filter(|s| s.organisation() == organisation)
            .map(|s| s.id().to_string())
            .collect();
        ids.iter().filter_map(|id| schedulers.remove(id)).collect()
    }

    pub async fn get(&self, scheduler_id: &str) -> Option<SchedulerKind> {
        self.schedulers.read().await.get(scheduler_id).cloned()
    }

    pub async fn get_or_not_found(&self, scheduler_id: &str) -> SchedulerResult<SchedulerKind> {
        self.get(scheduler_id)
            .await
            .ok_or_else(|| SchedulerError::not_found("调度器", scheduler_id))
    }

    /// 按 id 排序
    pub async fn list(&self) -> Vec<SchedulerKind> {
        let mut schedulers: Vec<SchedulerKind> =
            self.schedulers.read().await.values().cloned().collect();
        schedulers.sort_by(|a, b| a.id().cmp(b.id()));
        schedulers
    }

    pub async fn list_by_organisation(&self, organisation: &str) -> Vec<SchedulerKind> {
        self.list()
            .await
            .into_iter()
            .filter(|s| s.organisation() == organisation)
            .collect()
    }

    pub async fn organisations(&self) -> BTreeSet<String> {
        self.schedulers
            .read()
            .await
            .values()
            .map(|s| s.organisation().to_string())
            .collect()
    }

    pub async fn scan_scheduler(&self, organisation: &str) -> Option<Arc<ScanScheduler>> {
        match self.get(&ScanScheduler::scheduler_id_for(organisation)).await {
            Some(SchedulerKind::Scan(scheduler)) => Some(scheduler),
            _ => None,
        }
    }

    pub async fn len(&self) -> usize {
        self.schedulers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.schedulers.read().await.is_empty()
    }

    /// 停止所有调度器的后台循环
    pub async fn stop_all(&self) {
        for scheduler in self.list().await {
            scheduler.stop().await;
        }
    }
}

//! 外部协作服务的抽象接口
//!
//! 插件目录、对象存储和原始数据存储都只暴露调度需要的只读查询

use async_trait::async_trait;
use scheduler_core::SchedulerResult;

use crate::entities::Organisation;
use crate::payloads::{LastRun, Plugin, PluginType, ScanObject};

/// 插件目录服务
#[async_trait]
pub trait CatalogService: Send + Sync {
    async fn get_organisations(&self) -> SchedulerResult<Vec<Organisation>>;

    async fn get_plugins(&self, organisation: &str) -> SchedulerResult<Vec<Plugin>>;

    async fn get_plugin(&self, plugin_id: &str, organisation: &str)
        -> SchedulerResult<Option<Plugin>>;

    /// 消费某对象类型的扫描插件
    async fn get_scan_plugins_by_type(
        &self,
        object_type: &str,
        organisation: &str,
    ) -> SchedulerResult<Vec<Plugin>> {
        Ok(self
            .get_plugins(organisation)
            .await?
            .into_iter()
            .filter(|p| p.plugin_type == PluginType::Scan && p.consumes_type(object_type))
            .collect())
    }

    /// 消费某内容类型标签的后处理插件
    async fn get_post_process_plugins_by_tag(
        &self,
        tag: &str,
        organisation: &str,
    ) -> SchedulerResult<Vec<Plugin>> {
        Ok(self
            .get_plugins(organisation)
            .await?
            .into_iter()
            .filter(|p| p.plugin_type == PluginType::PostProcess && p.consumes_type(tag))
            .collect())
    }

    /// 自上次调用以来新启用的扫描插件；无状态实现不跟踪变化
    async fn get_new_scan_plugins(&self, _organisation: &str) -> SchedulerResult<Vec<Plugin>> {
        Ok(Vec::new())
    }

    /// 与给定租户共享同一插件配置的其他租户
    async fn get_duplicate_organisations(
        &self,
        _plugin_id: &str,
        _organisation: &str,
    ) -> SchedulerResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn flush_caches(&self) {}
}

/// 对象存储服务
#[async_trait]
pub trait ObjectService: Send + Sync {
    async fn get_objects_by_types(
        &self,
        organisation: &str,
        object_types: &[String],
        scan_levels: &[i32],
    ) -> SchedulerResult<Vec<ScanObject>>;

    async fn get_object(
        &self,
        organisation: &str,
        primary_key: &str,
    ) -> SchedulerResult<Option<ScanObject>>;

    async fn get_random_objects(
        &self,
        organisation: &str,
        count: usize,
        scan_levels: &[i32],
    ) -> SchedulerResult<Vec<ScanObject>>;
}

/// 原始数据存储服务
#[async_trait]
pub trait ArtifactService: Send + Sync {
    async fn get_last_run(
        &self,
        plugin_id: &str,
        input_object: Option<&str>,
        organisation: &str,
    ) -> SchedulerResult<Option<LastRun>>;
}

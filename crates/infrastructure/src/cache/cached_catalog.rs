use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scheduler_core::SchedulerResult;
use scheduler_domain::{
    entities::Organisation,
    payloads::{Plugin, PluginType},
    services::CatalogService,
};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::ttl_cache::{CacheLookup, TtlCache};

type PluginsById = HashMap<String, Plugin>;
type PluginsByType = HashMap<String, Vec<Plugin>>;

/// 带按租户缓存的插件目录
///
/// 只缓存已启用的插件；缓存过期时整体刷新所有租户。
pub struct CachedCatalog {
    inner: Arc<dyn CatalogService>,
    plugins: TtlCache<String, PluginsById>,
    scan_by_type: TtlCache<String, PluginsByType>,
    post_process_by_type: TtlCache<String, PluginsByType>,
    seen_scan_plugins: Mutex<HashMap<String, HashSet<String>>>,
}

fn index_by_type(plugins: &PluginsById, plugin_type: PluginType) -> PluginsByType {
    let mut by_type: PluginsByType = HashMap::new();
    for plugin in plugins.values().filter(|p| p.plugin_type == plugin_type) {
        for consumed in &plugin.consumes {
            by_type.entry(consumed.clone()).or_default().push(plugin.clone());
        }
    }
    for list in by_type.values_mut() {
        list.sort_by(|a, b| a.id.cmp(&b.id));
    }
    by_type
}

impl CachedCatalog {
    pub fn new(inner: Arc<dyn CatalogService>, ttl: Duration) -> Self {
        Self {
            inner,
            plugins: TtlCache::new(ttl),
            scan_by_type: TtlCache::new(ttl),
            post_process_by_type: TtlCache::new(ttl),
            seen_scan_plugins: Mutex::new(HashMap::new()),
        }
    }

    async fn fetch_enabled(&self, organisation: &str) -> SchedulerResult<PluginsById> {
        Ok(self
            .inner
            .get_plugins(organisation)
            .await?
            .into_iter()
            .filter(|p| p.enabled)
            .map(|p| (p.id.clone(), p))
            .collect())
    }

    /// 重新加载所有租户的插件并整体替换三张缓存表
    #[instrument(skip(self))]
    pub async fn flush(&self) -> SchedulerResult<()> {
        let organisations = self.inner.get_organisations().await?;

        let mut plugins = HashMap::new();
        let mut scan = HashMap::new();
        let mut post_process = HashMap::new();
        for org in &organisations {
            let enabled = self.fetch_enabled(&org.id).await?;
            scan.insert(org.id.clone(), index_by_type(&enabled, PluginType::Scan));
            post_process.insert(org.id.clone(), index_by_type(&enabled, PluginType::PostProcess));
            plugins.insert(org.id.clone(), enabled);
        }

        self.plugins.flush(plugins).await;
        self.scan_by_type.flush(scan).await;
        self.post_process_by_type.flush(post_process).await;
        debug!("插件缓存已刷新: {} 个租户", organisations.len());
        Ok(())
    }

    /// 只加载单个租户，用于缓存中尚无该租户的情况
    async fn load_organisation(&self, organisation: &str) -> SchedulerResult<()> {
        let enabled = self.fetch_enabled(organisation).await?;
        self.scan_by_type
            .insert(organisation.to_string(), index_by_type(&enabled, PluginType::Scan))
            .await;
        self.post_process_by_type
            .insert(organisation.to_string(), index_by_type(&enabled, PluginType::PostProcess))
            .await;
        self.plugins.insert(organisation.to_string(), enabled).await;
        Ok(())
    }

    async fn lookup<V: Clone + Default>(
        &self,
        cache: &TtlCache<String, V>,
        organisation: &str,
    ) -> SchedulerResult<V> {
        let key = organisation.to_string();
        match cache.get(&key).await {
            CacheLookup::Hit(value) => return Ok(value),
            CacheLookup::Expired => self.flush().await?,
            CacheLookup::Missing => self.load_organisation(organisation).await?,
        }

        Ok(match cache.get(&key).await {
            CacheLookup::Hit(value) => value,
            _ => V::default(),
        })
    }

    pub fn stats(&self) -> super::CacheStats {
        self.plugins.stats()
    }
}

#[async_trait]
impl CatalogService for CachedCatalog {
    async fn get_organisations(&self) -> SchedulerResult<Vec<Organisation>> {
        self.inner.get_organisations().await
    }

    /// 该租户已启用的插件
    async fn get_plugins(&self, organisation: &str) -> SchedulerResult<Vec<Plugin>> {
        let mut plugins: Vec<Plugin> = self
            .lookup(&self.plugins, organisation)
            .await?
            .into_values()
            .collect();
        plugins.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(plugins)
    }

    async fn get_plugin(
        &self,
        plugin_id: &str,
        organisation: &str,
    ) -> SchedulerResult<Option<Plugin>> {
        Ok(self
            .lookup(&self.plugins, organisation)
            .await?
            .remove(plugin_id))
    }

    async fn get_scan_plugins_by_type(
        &self,
        object_type: &str,
        organisation: &str,
    ) -> SchedulerResult<Vec<Plugin>> {
        Ok(self
            .lookup(&self.scan_by_type, organisation)
            .await?
            .remove(object_type)
            .unwrap_or_default())
    }

    async fn get_post_process_plugins_by_tag(
        &self,
        tag: &str,
        organisation: &str,
    ) -> SchedulerResult<Vec<Plugin>> {
        Ok(self
            .lookup(&self.post_process_by_type, organisation)
            .await?
            .remove(tag)
            .unwrap_or_default())
    }

    /// 与上一次调用相比新启用的扫描插件，首次调用返回全部已启用插件
    #[instrument(skip(self))]
    async fn get_new_scan_plugins(&self, organisation: &str) -> SchedulerResult<Vec<Plugin>> {
        let enabled: Vec<Plugin> = self
            .fetch_enabled(organisation)
            .await?
            .into_values()
            .filter(|p| p.plugin_type == PluginType::Scan)
            .collect();

        let mut seen = self.seen_scan_plugins.lock().await;
        let previous = seen.entry(organisation.to_string()).or_default();
        let mut new_plugins: Vec<Plugin> = enabled
            .iter()
            .filter(|p| !previous.contains(&p.id))
            .cloned()
            .collect();
        *previous = enabled.iter().map(|p| p.id.clone()).collect();

        new_plugins.sort_by(|a, b| a.id.cmp(&b.id));
        debug!("租户 {} 发现 {} 个新插件", organisation, new_plugins.len());
        Ok(new_plugins)
    }

    /// 其他启用了完全相同插件配置的租户
    async fn get_duplicate_organisations(
        &self,
        plugin_id: &str,
        organisation: &str,
    ) -> SchedulerResult<Vec<String>> {
        let Some(reference) = self.get_plugin(plugin_id, organisation).await? else {
            return Ok(Vec::new());
        };

        let mut duplicates = Vec::new();
        for org in self.inner.get_organisations().await? {
            if org.id == organisation {
                continue;
            }
            if self.get_plugin(plugin_id, &org.id).await?.as_ref() == Some(&reference) {
                duplicates.push(org.id);
            }
        }
        Ok(duplicates)
    }

    async fn flush_caches(&self) {
        if let Err(e) = self.flush().await {
            tracing::warn!("刷新插件缓存失败: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCatalog {
        plugins: std::sync::Mutex<HashMap<String, Vec<Plugin>>>,
        calls: AtomicUsize,
    }

    fn plugin(id: &str, plugin_type: PluginType, consumes: &[&str], enabled: bool) -> Plugin {
        Plugin {
            id: id.to_string(),
            name: None,
            plugin_type,
            version: Some("1".into()),
            enabled,
            consumes: consumes.iter().map(|s| s.to_string()).collect(),
            produces: vec![],
            scan_level: Some(1),
            interval: None,
            cron: None,
        }
    }

    #[async_trait]
    impl CatalogService for CountingCatalog {
        async fn get_organisations(&self) -> SchedulerResult<Vec<Organisation>> {
            let plugins = self.plugins.lock().unwrap();
            let mut orgs: Vec<_> = plugins
                .keys()
                .map(|id| Organisation { id: id.clone(), name: id.clone() })
                .collect();
            orgs.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(orgs)
        }

        async fn get_plugins(&self, organisation: &str) -> SchedulerResult<Vec<Plugin>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.plugins.lock().unwrap().get(organisation).cloned().unwrap_or_default())
        }

        async fn get_plugin(&self, plugin_id: &str, organisation: &str) -> SchedulerResult<Option<Plugin>> {
            Ok(self
                .get_plugins(organisation)
                .await?
                .into_iter()
                .find(|p| p.id == plugin_id))
        }
    }

    fn catalog() -> Arc<CountingCatalog> {
        let shared = vec![
            plugin("dns-records", PluginType::Scan, &["Hostname"], true),
            plugin("kat-dns", PluginType::PostProcess, &["boefje/dns-records"], true),
        ];
        let mut org2 = shared.clone();
        org2.push(plugin("nmap", PluginType::Scan, &["IPAddressV4"], false));
        Arc::new(CountingCatalog {
            plugins: std::sync::Mutex::new(HashMap::from([
                ("org1".to_string(), shared),
                ("org2".to_string(), org2),
            ])),
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_lookups_are_cached() {
        let inner = catalog();
        let cached = CachedCatalog::new(inner.clone(), Duration::from_secs(60));

        let scan = cached.get_scan_plugins_by_type("Hostname", "org1").await.unwrap();
        assert_eq!(scan.len(), 1);
        let calls = inner.calls.load(Ordering::SeqCst);

        cached.get_scan_plugins_by_type("Hostname", "org1").await.unwrap();
        cached.get_post_process_plugins_by_tag("boefje/dns-records", "org1").await.unwrap();
        assert!(cached.get_plugin("dns-records", "org1").await.unwrap().is_some());
        assert_eq!(inner.calls.load(Ordering::SeqCst), calls);

        // 未启用的插件不在缓存中
        assert!(cached.get_plugin("nmap", "org2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_cache_refetches() {
        let inner = catalog();
        let cached = CachedCatalog::new(inner.clone(), Duration::from_millis(20));
        cached.get_plugins("org1").await.unwrap();

        inner.plugins.lock().unwrap().get_mut("org1").unwrap().push(plugin(
            "ssl",
            PluginType::Scan,
            &["Website"],
            true,
        ));
        tokio::time::sleep(Duration::from_millis(30)).await;

        let plugins = cached.get_scan_plugins_by_type("Website", "org1").await.unwrap();
        assert_eq!(plugins[0].id, "ssl");
    }

    #[tokio::test]
    async fn test_new_scan_plugins_diff() {
        let inner = catalog();
        let cached = CachedCatalog::new(inner.clone(), Duration::from_secs(60));

        let first = cached.get_new_scan_plugins("org1").await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(cached.get_new_scan_plugins("org1").await.unwrap().is_empty());

        inner.plugins.lock().unwrap().get_mut("org1").unwrap().push(plugin(
            "ssl",
            PluginType::Scan,
            &["Website"],
            true,
        ));
        let next = cached.get_new_scan_plugins("org1").await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, "ssl");
    }

    #[tokio::test]
    async fn test_duplicate_organisations() {
        let cached = CachedCatalog::new(catalog(), Duration::from_secs(60));
        let duplicates = cached
            .get_duplicate_organisations("dns-records", "org1")
            .await
            .unwrap();
        assert_eq!(duplicates, vec!["org2".to_string()]);
        assert!(cached
            .get_duplicate_organisations("nmap", "org2")
            .await
            .unwrap()
            .is_empty());
    }
}

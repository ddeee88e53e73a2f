//! Mock implementations of the external service traits
//!
//! In-memory doubles for the plugin catalog, object store and artifact store.
//! Every mock records the calls it receives and can be switched into a
//! failing mode to exercise error paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    ArtifactService, CatalogService, LastRun, ObjectService, Organisation, Plugin, ScanObject,
};

#[derive(Debug, Default)]
struct CallLog {
    calls: Mutex<Vec<String>>,
}

impl CallLog {
    fn record(&self, method: &str) {
        self.calls.lock().unwrap().push(method.to_string());
    }

    fn count(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.as_str() == method)
            .count()
    }
}

/// Mock plugin catalog keyed by organisation
#[derive(Debug, Clone, Default)]
pub struct MockCatalogService {
    organisations: Arc<Mutex<Vec<Organisation>>>,
    plugins: Arc<Mutex<HashMap<String, Vec<Plugin>>>>,
    new_plugins: Arc<Mutex<HashMap<String, Vec<Plugin>>>>,
    duplicates: Arc<Mutex<HashMap<(String, String), Vec<String>>>>,
    failing: Arc<AtomicBool>,
    log: Arc<CallLog>,
}

impl MockCatalogService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_organisations(ids: &[&str]) -> Self {
        let catalog = Self::new();
        for id in ids {
            catalog.add_organisation(id);
        }
        catalog
    }

    pub fn add_organisation(&self, id: &str) {
        self.organisations.lock().unwrap().push(Organisation {
            id: id.to_string(),
            name: format!("Organisation {id}"),
        });
    }

    pub fn remove_organisation(&self, id: &str) {
        self.organisations.lock().unwrap().retain(|o| o.id != id);
        self.plugins.lock().unwrap().remove(id);
    }

    pub fn add_plugin(&self, organisation: &str, plugin: Plugin) {
        let mut plugins = self.plugins.lock().unwrap();
        let entry = plugins.entry(organisation.to_string()).or_default();
        entry.retain(|p| p.id != plugin.id);
        entry.push(plugin);
    }

    /// Plugins returned (once) by the next `get_new_scan_plugins` call
    pub fn set_new_plugins(&self, organisation: &str, plugins: Vec<Plugin>) {
        self.new_plugins
            .lock()
            .unwrap()
            .insert(organisation.to_string(), plugins);
    }

    pub fn set_duplicate_organisations(
        &self,
        plugin_id: &str,
        organisation: &str,
        others: &[&str],
    ) {
        self.duplicates.lock().unwrap().insert(
            (plugin_id.to_string(), organisation.to_string()),
            others.iter().map(|o| o.to_string()).collect(),
        );
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.log.count(method)
    }

    fn check(&self, method: &str) -> SchedulerResult<()> {
        self.log.record(method);
        if self.failing.load(Ordering::SeqCst) {
            return Err(SchedulerError::external("catalog", "mock catalog unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogService for MockCatalogService {
    async fn get_organisations(&self) -> SchedulerResult<Vec<Organisation>> {
        self.check("get_organisations")?;
        Ok(self.organisations.lock().unwrap().clone())
    }

    async fn get_plugins(&self, organisation: &str) -> SchedulerResult<Vec<Plugin>> {
        self.check("get_plugins")?;
        Ok(self
            .plugins
            .lock()
            .unwrap()
            .get(organisation)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_plugin(
        &self,
        plugin_id: &str,
        organisation: &str,
    ) -> SchedulerResult<Option<Plugin>> {
        self.check("get_plugin")?;
        Ok(self
            .plugins
            .lock()
            .unwrap()
            .get(organisation)
            .and_then(|plugins| plugins.iter().find(|p| p.id == plugin_id).cloned()))
    }

    async fn get_new_scan_plugins(&self, organisation: &str) -> SchedulerResult<Vec<Plugin>> {
        self.check("get_new_scan_plugins")?;
        Ok(self
            .new_plugins
            .lock()
            .unwrap()
            .remove(organisation)
            .unwrap_or_default())
    }

    async fn get_duplicate_organisations(
        &self,
        plugin_id: &str,
        organisation: &str,
    ) -> SchedulerResult<Vec<String>> {
        self.check("get_duplicate_organisations")?;
        Ok(self
            .duplicates
            .lock()
            .unwrap()
            .get(&(plugin_id.to_string(), organisation.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn flush_caches(&self) {
        self.log.record("flush_caches");
    }
}

/// Mock object store keyed by organisation
#[derive(Debug, Clone, Default)]
pub struct MockObjectService {
    objects: Arc<Mutex<HashMap<String, Vec<ScanObject>>>>,
    failing: Arc<AtomicBool>,
    log: Arc<CallLog>,
}

impl MockObjectService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_object(&self, organisation: &str, object: ScanObject) {
        let mut objects = self.objects.lock().unwrap();
        let entry = objects.entry(organisation.to_string()).or_default();
        entry.retain(|o| o.primary_key != object.primary_key);
        entry.push(object);
    }

    pub fn remove_object(&self, organisation: &str, primary_key: &str) {
        if let Some(objects) = self.objects.lock().unwrap().get_mut(organisation) {
            objects.retain(|o| o.primary_key != primary_key);
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.log.count(method)
    }

    fn check(&self, method: &str) -> SchedulerResult<()> {
        self.log.record(method);
        if self.failing.load(Ordering::SeqCst) {
            return Err(SchedulerError::external("objects", "mock object store unavailable"));
        }
        Ok(())
    }

    fn matching(&self, organisation: &str, filter: impl Fn(&ScanObject) -> bool) -> Vec<ScanObject> {
        self.objects
            .lock()
            .unwrap()
            .get(organisation)
            .map(|objects| objects.iter().filter(|o| filter(o)).cloned().collect())
            .unwrap_or_default()
    }
}

fn level_matches(object: &ScanObject, scan_levels: &[i32]) -> bool {
    object
        .scan_level
        .is_some_and(|level| scan_levels.contains(&level))
}

#[async_trait]
impl ObjectService for MockObjectService {
    async fn get_objects_by_types(
        &self,
        organisation: &str,
        object_types: &[String],
        scan_levels: &[i32],
    ) -> SchedulerResult<Vec<ScanObject>> {
        self.check("get_objects_by_types")?;
        Ok(self.matching(organisation, |o| {
            object_types.contains(&o.object_type) && level_matches(o, scan_levels)
        }))
    }

    async fn get_object(
        &self,
        organisation: &str,
        primary_key: &str,
    ) -> SchedulerResult<Option<ScanObject>> {
        self.check("get_object")?;
        Ok(self
            .matching(organisation, |o| o.primary_key == primary_key)
            .into_iter()
            .next())
    }

    /// Deterministic: returns the first `count` matching objects
    async fn get_random_objects(
        &self,
        organisation: &str,
        count: usize,
        scan_levels: &[i32],
    ) -> SchedulerResult<Vec<ScanObject>> {
        self.check("get_random_objects")?;
        let mut objects = self.matching(organisation, |o| level_matches(o, scan_levels));
        objects.truncate(count);
        Ok(objects)
    }
}

type LastRunKey = (String, Option<String>, String);

/// Mock artifact store holding last-run records
#[derive(Debug, Clone, Default)]
pub struct MockArtifactService {
    last_runs: Arc<Mutex<HashMap<LastRunKey, LastRun>>>,
    failing: Arc<AtomicBool>,
    log: Arc<CallLog>,
}

impl MockArtifactService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_last_run(
        &self,
        plugin_id: &str,
        input_object: Option<&str>,
        organisation: &str,
        last_run: LastRun,
    ) {
        self.last_runs.lock().unwrap().insert(
            (
                plugin_id.to_string(),
                input_object.map(str::to_string),
                organisation.to_string(),
            ),
            last_run,
        );
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.log.count(method)
    }
}

#[async_trait]
impl ArtifactService for MockArtifactService {
    async fn get_last_run(
        &self,
        plugin_id: &str,
        input_object: Option<&str>,
        organisation: &str,
    ) -> SchedulerResult<Option<LastRun>> {
        self.log.record("get_last_run");
        if self.failing.load(Ordering::SeqCst) {
            return Err(SchedulerError::external("artifacts", "mock artifact store unavailable"));
        }
        Ok(self
            .last_runs
            .lock()
            .unwrap()
            .get(&(
                plugin_id.to_string(),
                input_object.map(str::to_string),
                organisation.to_string(),
            ))
            .cloned())
    }
}

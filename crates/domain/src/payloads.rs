//! 任务负载与外部服务的数据形状
//!
//! 所有去重都依赖 [`content_hash`]：队列与各调度器使用同一个函数计算任务身份。

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::TaskType;

/// 任务身份哈希，只依赖决定任务内容的字段
pub fn content_hash(parts: &[&str]) -> String {
    let mut hasher = Md5::new();
    hasher.update(parts.join("-").as_bytes());
    hex::encode(hasher.finalize())
}

/// 可入队的任务负载
pub trait TaskPayload: Serialize + DeserializeOwned + Send + Sync {
    const TASK_TYPE: TaskType;

    fn id(&self) -> Uuid;
    fn hash(&self) -> String;
    fn organisation(&self) -> &str;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PluginType {
    Scan,
    PostProcess,
    Report,
}

/// 插件目录中的插件元数据
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plugin {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    #[serde(default)]
    pub version: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub consumes: Vec<String>,
    #[serde(default)]
    pub produces: Vec<String>,
    /// 插件要求的最低扫描强度
    #[serde(default)]
    pub scan_level: Option<i32>,
    /// 重复间隔（分钟）
    #[serde(default)]
    pub interval: Option<i64>,
    #[serde(default)]
    pub cron: Option<String>,
}

impl Plugin {
    pub fn consumes_type(&self, object_type: &str) -> bool {
        self.consumes.iter().any(|t| t == object_type)
    }

    pub fn to_ref(&self) -> PluginRef {
        PluginRef {
            id: self.id.clone(),
            version: self.version.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PluginRef {
    pub id: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// 对象存储中的扫描目标
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanObject {
    pub primary_key: String,
    pub object_type: String,
    /// 目标当前的扫描强度，未分配时为 None
    #[serde(default)]
    pub scan_level: Option<i32>,
}

/// 原始数据存储记录的插件最近一次运行
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LastRun {
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl LastRun {
    pub fn is_running(&self) -> bool {
        self.started_at.is_some() && self.ended_at.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawArtifact {
    pub id: String,
    /// 产生该数据的扫描任务
    #[serde(default)]
    pub producer_task_id: Option<Uuid>,
    #[serde(default)]
    pub input_object: Option<String>,
    #[serde(default)]
    pub content_type_tags: Vec<String>,
}

impl RawArtifact {
    pub fn is_error(&self) -> bool {
        self.content_type_tags
            .iter()
            .any(|tag| tag.starts_with("error/"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanTask {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub plugin: PluginRef,
    #[serde(default)]
    pub input_object: Option<String>,
    pub organisation: String,
}

impl ScanTask {
    pub fn new(plugin: &Plugin, input_object: Option<String>, organisation: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            plugin: plugin.to_ref(),
            input_object,
            organisation: organisation.to_string(),
        }
    }
}

impl TaskPayload for ScanTask {
    const TASK_TYPE: TaskType = TaskType::Scan;

    fn id(&self) -> Uuid {
        self.id
    }

    fn hash(&self) -> String {
        match &self.input_object {
            Some(input) => content_hash(&[input, &self.plugin.id, &self.organisation]),
            None => content_hash(&[&self.plugin.id, &self.organisation]),
        }
    }

    fn organisation(&self) -> &str {
        &self.organisation
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostProcessTask {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub plugin: PluginRef,
    pub artifact: RawArtifact,
    pub organisation: String,
}

impl PostProcessTask {
    pub fn new(plugin: &Plugin, artifact: RawArtifact, organisation: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            plugin: plugin.to_ref(),
            artifact,
            organisation: organisation.to_string(),
        }
    }
}

impl TaskPayload for PostProcessTask {
    const TASK_TYPE: TaskType = TaskType::PostProcess;

    fn id(&self) -> Uuid {
        self.id
    }

    fn hash(&self) -> String {
        content_hash(&[&self.plugin.id, &self.artifact.id, &self.organisation])
    }

    fn organisation(&self) -> &str {
        &self.organisation
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportTask {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub report_recipe_id: String,
    pub organisation: String,
}

impl TaskPayload for ReportTask {
    const TASK_TYPE: TaskType = TaskType::Report;

    fn id(&self) -> Uuid {
        self.id
    }

    fn hash(&self) -> String {
        content_hash(&["report", &self.report_recipe_id, &self.organisation])
    }

    fn organisation(&self) -> &str {
        &self.organisation
    }
}

//! 领域事件
//!
//! 调度器监听的外部事件，均按租户划分

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payloads::{RawArtifact, ScanObject};

/// 领域事件基础trait
pub trait DomainEvent: Send + Sync {
    fn event_id(&self) -> Uuid;
    fn event_type(&self) -> &str;
    fn occurred_at(&self) -> DateTime<Utc>;
    fn organisation(&self) -> &str;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MutationOperation {
    Create,
    Update,
    Delete,
}

/// 对象扫描强度变更
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanLevelMutation {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub operation: MutationOperation,
    pub organisation: String,
    pub primary_key: String,
    /// 变更后的对象；为空时事件不携带可调度内容
    #[serde(default)]
    pub value: Option<ScanObject>,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent for ScanLevelMutation {
    fn event_id(&self) -> Uuid {
        self.id
    }

    fn event_type(&self) -> &str {
        "scan_level_mutation"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    fn organisation(&self) -> &str {
        &self.organisation
    }
}

/// 新的原始数据可供后处理
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawArtifactReceived {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub organisation: String,
    pub artifact: RawArtifact,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent for RawArtifactReceived {
    fn event_id(&self) -> Uuid {
        self.id
    }

    fn event_type(&self) -> &str {
        "raw_artifact_received"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    fn organisation(&self) -> &str {
        &self.organisation
    }
}

//! Test data builders for creating test entities
//!
//! This module provides builder patterns for creating test data with
//! sensible defaults and easy customization.

use chrono::{DateTime, Utc};
use scheduler_domain::{
    MutationOperation, Plugin, PluginType, RawArtifact, RawArtifactReceived, ScanLevelMutation,
    ScanObject,
};
use uuid::Uuid;

/// Builder for catalog plugins
pub struct PluginBuilder {
    plugin: Plugin,
}

impl PluginBuilder {
    pub fn new(id: &str, plugin_type: PluginType) -> Self {
        Self {
            plugin: Plugin {
                id: id.to_string(),
                name: Some(id.to_string()),
                plugin_type,
                version: None,
                enabled: true,
                consumes: vec![],
                produces: vec![],
                scan_level: Some(1),
                interval: None,
                cron: None,
            },
        }
    }

    pub fn scan(id: &str) -> Self {
        Self::new(id, PluginType::Scan)
    }

    pub fn post_process(id: &str) -> Self {
        Self::new(id, PluginType::PostProcess).scan_level(None)
    }

    pub fn consumes(mut self, types: &[&str]) -> Self {
        self.plugin.consumes = types.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn produces(mut self, types: &[&str]) -> Self {
        self.plugin.produces = types.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn scan_level(mut self, level: Option<i32>) -> Self {
        self.plugin.scan_level = level;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.plugin.enabled = enabled;
        self
    }

    pub fn interval_minutes(mut self, minutes: i64) -> Self {
        self.plugin.interval = Some(minutes);
        self
    }

    pub fn cron(mut self, cron: &str) -> Self {
        self.plugin.cron = Some(cron.to_string());
        self
    }

    pub fn build(self) -> Plugin {
        self.plugin
    }
}

/// Builder for object-store objects
pub struct ScanObjectBuilder {
    object: ScanObject,
}

impl ScanObjectBuilder {
    pub fn new(object_type: &str, primary_key: &str) -> Self {
        Self {
            object: ScanObject {
                primary_key: primary_key.to_string(),
                object_type: object_type.to_string(),
                scan_level: None,
            },
        }
    }

    pub fn hostname(name: &str) -> Self {
        Self::new("Hostname", &format!("Hostname|internet|{name}"))
    }

    pub fn ip_address(address: &str) -> Self {
        Self::new("IPAddressV4", &format!("IPAddressV4|internet|{address}"))
    }

    pub fn level(mut self, level: i32) -> Self {
        self.object.scan_level = Some(level);
        self
    }

    pub fn build(self) -> ScanObject {
        self.object
    }
}

/// Builder for scan-level mutation events
pub struct MutationBuilder {
    mutation: ScanLevelMutation,
}

impl MutationBuilder {
    pub fn new(organisation: &str, object: ScanObject) -> Self {
        Self {
            mutation: ScanLevelMutation {
                id: Uuid::new_v4(),
                operation: MutationOperation::Update,
                organisation: organisation.to_string(),
                primary_key: object.primary_key.clone(),
                value: Some(object),
                occurred_at: Utc::now(),
            },
        }
    }

    pub fn operation(mut self, operation: MutationOperation) -> Self {
        self.mutation.operation = operation;
        self
    }

    pub fn without_value(mut self) -> Self {
        self.mutation.value = None;
        self
    }

    pub fn build(self) -> ScanLevelMutation {
        self.mutation
    }
}

/// Builder for raw-artifact events
pub struct ArtifactEventBuilder {
    event: RawArtifactReceived,
}

impl ArtifactEventBuilder {
    pub fn new(organisation: &str, artifact_id: &str) -> Self {
        Self {
            event: RawArtifactReceived {
                id: Uuid::new_v4(),
                organisation: organisation.to_string(),
                artifact: RawArtifact {
                    id: artifact_id.to_string(),
                    producer_task_id: None,
                    input_object: None,
                    content_type_tags: vec![],
                },
                occurred_at: Utc::now(),
            },
        }
    }

    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.event.artifact.content_type_tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn input_object(mut self, primary_key: &str) -> Self {
        self.event.artifact.input_object = Some(primary_key.to_string());
        self
    }

    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.event.occurred_at = at;
        self
    }

    pub fn build(self) -> RawArtifactReceived {
        self.event
    }
}

//! 进程内事件总线
//!
//! 每个 (主题, 租户) 一条无界通道，消息在订阅者出现前会被缓存。
//! 外部消息代理的适配器只需调用 [`EventBus::publish`]。

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::events::{DomainEvent, RawArtifactReceived, ScanLevelMutation};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTopic {
    ScanLevels,
    RawArtifacts,
}

impl fmt::Display for EventTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventTopic::ScanLevels => write!(f, "scan_levels"),
            EventTopic::RawArtifacts => write!(f, "raw_artifacts"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    ScanLevel(ScanLevelMutation),
    RawArtifact(RawArtifactReceived),
}

impl SchedulerEvent {
    pub fn topic(&self) -> EventTopic {
        match self {
            SchedulerEvent::ScanLevel(_) => EventTopic::ScanLevels,
            SchedulerEvent::RawArtifact(_) => EventTopic::RawArtifacts,
        }
    }
}

impl DomainEvent for SchedulerEvent {
    fn event_id(&self) -> Uuid {
        match self {
            SchedulerEvent::ScanLevel(e) => e.event_id(),
            SchedulerEvent::RawArtifact(e) => e.event_id(),
        }
    }

    fn event_type(&self) -> &str {
        match self {
            SchedulerEvent::ScanLevel(e) => e.event_type(),
            SchedulerEvent::RawArtifact(e) => e.event_type(),
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            SchedulerEvent::ScanLevel(e) => e.occurred_at(),
            SchedulerEvent::RawArtifact(e) => e.occurred_at(),
        }
    }

    fn organisation(&self) -> &str {
        match self {
            SchedulerEvent::ScanLevel(e) => e.organisation(),
            SchedulerEvent::RawArtifact(e) => e.organisation(),
        }
    }
}

type ChannelKey = (EventTopic, String);

#[derive(Debug)]
struct Channel {
    sender: mpsc::UnboundedSender<SchedulerEvent>,
    /// 接收端共享，调度器停用后重新启用仍可继续消费
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<SchedulerEvent>>>,
    size: Arc<AtomicUsize>,
}

/// 某个主题、某个租户的订阅端
#[derive(Debug, Clone)]
pub struct EventReceiver {
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<SchedulerEvent>>>,
    size: Arc<AtomicUsize>,
}

impl EventReceiver {
    /// 等待下一条事件；总线关闭后返回 None
    pub async fn recv(&self) -> Option<SchedulerEvent> {
        let event = self.receiver.lock().await.recv().await;
        if event.is_some() {
            self.size.fetch_sub(1, Ordering::SeqCst);
        }
        event
    }

    pub fn pending(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct EventBus {
    channels: RwLock<HashMap<ChannelKey, Channel>>,
    /// 单条通道的最大积压，0 表示不限
    max_pending: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(0)
    }
}

impl EventBus {
    pub fn new(max_pending: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            max_pending,
        }
    }

    fn open_channel() -> Channel {
        let (sender, receiver) = mpsc::unbounded_channel();
        Channel {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            size: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn publish(&self, event: SchedulerEvent) -> SchedulerResult<()> {
        let key = (event.topic(), event.organisation().to_string());
        let mut channels = self.channels.write().await;
        let channel = channels.entry(key.clone()).or_insert_with(Self::open_channel);

        if self.max_pending > 0 && channel.size.load(Ordering::SeqCst) >= self.max_pending {
            return Err(SchedulerError::QueueFull {
                queue_id: format!("{}.{}", key.0, key.1),
            });
        }

        debug!("发布事件 {} 到 {}.{}", event.event_id(), key.0, key.1);
        channel
            .sender
            .send(event)
            .map_err(|e| SchedulerError::Internal(format!("事件通道已关闭: {e}")))?;
        channel.size.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub async fn subscribe(&self, topic: EventTopic, organisation: &str) -> EventReceiver {
        let mut channels = self.channels.write().await;
        let channel = channels
            .entry((topic, organisation.to_string()))
            .or_insert_with(Self::open_channel);
        EventReceiver {
            receiver: channel.receiver.clone(),
            size: channel.size.clone(),
        }
    }

    /// 租户被移除时关闭其全部通道
    pub async fn remove_organisation(&self, organisation: &str) {
        let mut channels = self.channels.write().await;
        let before = channels.len();
        channels.retain(|(_, org), _| org != organisation);
        info!("已关闭租户 {} 的 {} 个事件通道", organisation, before - channels.len());
    }

    pub async fn pending(&self, topic: EventTopic, organisation: &str) -> usize {
        self.channels
            .read()
            .await
            .get(&(topic, organisation.to_string()))
            .map(|c| c.size.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

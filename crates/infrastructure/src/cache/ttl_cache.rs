use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// 缓存查询结果：过期与缺失需要调用方区别处理
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<V> {
    Hit(V),
    Missing,
    Expired,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub flushes: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.expirations;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    flushes: AtomicU64,
}

type Entries<K, V> = HashMap<K, (V, Instant)>;

/// 带过期时间的键值缓存
///
/// 底层表通过 `Arc` 整体替换，`flush` 期间读者只会看到旧表或新表。
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: RwLock<Arc<Entries<K, V>>>,
    counters: Counters,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(Arc::new(HashMap::new())),
            counters: Counters::default(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, key: &K) -> CacheLookup<V> {
        let snapshot = self.entries.read().await.clone();
        match snapshot.get(key) {
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                CacheLookup::Missing
            }
            Some((_, inserted)) if inserted.elapsed() >= self.ttl => {
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                CacheLookup::Expired
            }
            Some((value, _)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                CacheLookup::Hit(value.clone())
            }
        }
    }

    pub async fn insert(&self, key: K, value: V) {
        let mut guard = self.entries.write().await;
        Arc::make_mut(&mut guard).insert(key, (value, Instant::now()));
    }

    /// 用一张全新的表替换全部内容
    pub async fn flush(&self, values: HashMap<K, V>) {
        let now = Instant::now();
        let fresh: Entries<K, V> = values.into_iter().map(|(k, v)| (k, (v, now))).collect();
        *self.entries.write().await = Arc::new(fresh);
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn clear(&self) {
        self.flush(HashMap::new()).await;
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
        }
    }
}

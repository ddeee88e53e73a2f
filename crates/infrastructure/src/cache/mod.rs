//! 外部查询结果的进程内缓存

pub mod cached_catalog;
pub mod ttl_cache;

pub use cached_catalog::CachedCatalog;
pub use ttl_cache::{CacheLookup, CacheStats, TtlCache};

pub mod cache;
pub mod config;
pub mod core;
pub mod maintenance;

// Re-export commonly used types
pub use cache::{CacheHandle, RedisCache, RedisConfig, RocksDbCache, RocksDbConfig};
pub use config::{CacheBackend, CacheConfig, LoggingConfig, MaintenanceConfig};
pub use core::{
    Cache, CacheError, CompactionReport, Compactor, Entry, NAMESPACE_SEPARATOR, Namespace, Result,
    Value, codec,
};
pub use maintenance::spawn_compaction;

use thiserror::Error;

/// Main error type for cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// Backend unreachable, pool exhausted or closed
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt payload: {0}")]
    CorruptPayload(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Engine-level failure that is not a connectivity problem
    #[error("Storage error: {0}")]
    Storage(String),
}

impl CacheError {
    /// True when the key is simply absent (fall through to the source of truth)
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True when the backend itself could not serve the request
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Storage(_))
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error()
            || e.is_connection_dropped()
            || e.is_connection_refusal()
            || e.is_timeout()
        {
            CacheError::Connection(e.to_string())
        } else {
            CacheError::Storage(e.to_string())
        }
    }
}

impl From<rocksdb::Error> for CacheError {
    fn from(e: rocksdb::Error) -> Self {
        CacheError::Storage(e.into_string())
    }
}

impl From<rmp_serde::encode::Error> for CacheError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CacheError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        CacheError::CorruptPayload(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for CacheError {
    fn from(e: serde_yaml::Error) -> Self {
        CacheError::Configuration(e.to_string())
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Storage(e.to_string())
    }
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

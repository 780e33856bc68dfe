use super::error::{CacheError, Result};
use super::types::{CompactionReport, Value};
use async_trait::async_trait;

/// Separator between the namespace prefix and the logical key
pub const NAMESPACE_SEPARATOR: char = ':';

/// Engine-agnostic cache operations
///
/// Implementations are shared across tasks as `Arc<dyn Cache>`; no
/// engine-specific type crosses this boundary.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Namespace prefix this instance writes under
    fn prefix(&self) -> &str;

    /// Store `value` under `key`, overwriting any previous value
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Fetch the value stored under `key`
    ///
    /// Fails with [`CacheError::NotFound`] when the key is absent.
    async fn get(&self, key: &str) -> Result<Value>;

    async fn has(&self, key: &str) -> Result<bool>;

    /// Delete `key`; succeeds when the key does not exist
    async fn forget(&self, key: &str) -> Result<()>;

    /// Delete every key of this namespace
    async fn empty(&self) -> Result<()> {
        self.empty_by_match("").await
    }

    /// Delete every key whose logical key starts with `pattern`
    async fn empty_by_match(&self, pattern: &str) -> Result<()>;

    /// Release the underlying pool or store handle
    async fn close(&self) -> Result<()>;
}

/// Maintenance hook invoked by an external scheduler
#[async_trait]
pub trait Compactor: Send + Sync {
    /// Reclaim space held by deleted and overwritten records when at least
    /// `reclaim_ratio` of the on-disk data is estimated reclaimable
    async fn compact(&self, reclaim_ratio: f64) -> Result<CompactionReport>;
}

/// Maps logical keys to physical keys for one namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    /// The prefix may be empty but must not contain the separator, otherwise
    /// two namespaces could claim the same physical key
    pub fn new(prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        if prefix.contains(NAMESPACE_SEPARATOR) {
            return Err(CacheError::Configuration(format!(
                "namespace prefix {:?} must not contain '{}'",
                prefix, NAMESPACE_SEPARATOR
            )));
        }
        Ok(Self { prefix })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Physical key for a logical key
    pub fn key(&self, key: &str) -> String {
        format!("{}{}{}", self.prefix, NAMESPACE_SEPARATOR, key)
    }

    /// Physical prefix shared by every logical key starting with `pattern`
    pub fn match_prefix(&self, pattern: &str) -> String {
        self.key(pattern)
    }

    /// Logical key for a physical key of this namespace
    pub fn logical<'a>(&self, physical: &'a str) -> Option<&'a str> {
        physical
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix(NAMESPACE_SEPARATOR)
    }
}

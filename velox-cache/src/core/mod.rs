pub mod codec;
pub mod contract;
mod convert;
pub mod error;
pub mod types;

pub use contract::{Cache, Compactor, NAMESPACE_SEPARATOR, Namespace};
pub use error::{CacheError, Result};
pub use types::{CompactionReport, Entry, Value};

//! Registry capability: key-value fields, member sets and pub/sub channels
//!
//! Every component takes an explicit `Arc<dyn Registry>` instead of reaching
//! a global connection. The store is expected to behave like a standard
//! in-memory data-structure server: atomic per-key get/set, set membership and
//! at-least-once delivery to currently subscribed consumers.

pub mod memory;
pub mod remote;

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

pub use memory::MemoryRegistry;
pub use remote::RedisRegistry;

/// Store used for discovery, stream metadata, configuration and commands.
pub trait Registry: Send + Sync {
    /// Add `member` to the set named `set`.
    fn register(&self, set: &str, member: &str) -> Result<()>;
    fn unregister(&self, set: &str, member: &str) -> Result<()>;
    fn list_members(&self, set: &str) -> Result<HashSet<String>>;
    fn is_registered(&self, set: &str, member: &str) -> Result<bool>;
    /// Uniformly random member of `set`, `None` when the set is empty.
    fn random_member(&self, set: &str) -> Result<Option<String>>;
    /// Drop a whole set.
    fn delete_set(&self, set: &str) -> Result<()>;

    fn set_field(&self, key: &str, value: &str) -> Result<()>;
    fn get_field(&self, key: &str) -> Result<Option<String>>;
    fn delete_field(&self, key: &str) -> Result<()>;
    /// Every field whose key starts with `prefix`, keyed by the full key.
    fn scan_fields(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Deliver `payload` to every current subscriber of `channel`.
    fn publish(&self, channel: &str, payload: &str) -> Result<()>;
    fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>>;
}

/// Receiving end of one channel subscription.
pub trait Subscription: Send {
    /// Wait at most `timeout` for the next message. A timeout yields `Ok(None)`.
    fn poll(&mut self, timeout: Duration) -> Result<Option<String>>;
}

/// Read a field and parse it, reporting unparsable values as corrupt state.
pub fn get_parsed<T: FromStr>(registry: &dyn Registry, key: &str) -> Result<Option<T>> {
    match registry.get_field(key)? {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::corrupt(key, format!("unparsable value '{}'", raw))),
        None => Ok(None),
    }
}

//! Key-value store adapter.
//!
//! The only I/O boundary of Beacon. Components talk to the store through the
//! [`KeyStore`] and [`Watcher`] traits:
//! - `etcd` - etcd v2 keys API over HTTP(S)
//! - `memory` - in-process store used by component tests

mod etcd;
#[cfg(test)]
pub mod memory;

pub use etcd::EtcdClient;

use async_trait::async_trait;
use beacon_common::{KeyEvent, StoreError};
use std::future::Future;
use std::time::Duration;

/// Existence precondition for a write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PrevExist {
    /// No precondition
    #[default]
    Ignore,
    /// The key must already exist
    Exists,
    /// The key must not exist (create-only)
    Absent,
}

/// Conditions and lease for a write
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub prev_exist: PrevExist,
    /// The stored value must equal this
    pub prev_value: Option<String>,
    /// Lease; `None` writes a permanent key
    pub ttl: Option<Duration>,
}

/// Conditions for a delete
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    /// The stored value must equal this
    pub prev_value: Option<String>,
    pub recursive: bool,
}

/// Where a watch starts and what it covers
#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    pub recursive: bool,
    /// Deliver events with an index strictly greater than this
    /// (0 = only events from the store's current index on)
    pub after_index: u64,
}

/// Narrow interface over the external store
#[async_trait]
pub trait KeyStore: Send + Sync + 'static {
    type Watcher: Watcher;

    /// Read a key; directories list their children, nested when `recursive`
    async fn get(&self, key: &str, recursive: bool) -> Result<KeyEvent, StoreError>;

    /// Write a value, subject to the given conditions
    async fn set(&self, key: &str, value: &str, opts: &SetOptions) -> Result<KeyEvent, StoreError>;

    /// Delete a key, subject to the given conditions
    async fn delete(&self, key: &str, opts: &DeleteOptions) -> Result<KeyEvent, StoreError>;

    /// Open a watch on a key or prefix
    fn watcher(&self, key: &str, opts: WatchOptions) -> Self::Watcher;
}

/// A single watch subscription
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Block until the next change event.
    ///
    /// After a transient error, calling `next` again resumes from the same
    /// position.
    async fn next(&mut self) -> Result<KeyEvent, StoreError>;
}

/// Re-issue `op` until it returns anything other than a transient error
pub async fn retry_transient<T, F, Fut>(operation: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    loop {
        match op().await {
            Err(e) if e.is_transient() => {
                tracing::debug!(operation, error = %e, "Transient store error, retrying");
                tokio::task::yield_now().await;
            }
            result => return result,
        }
    }
}

/// Whole seconds for a lease, rounded up, never zero
pub fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    secs.max(1)
}

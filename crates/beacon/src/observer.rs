//! Liveness Observer
//!
//! Read-only watch over `/running/` that turns token changes into fleet
//! events. Never writes to the store.

use beacon_common::error::Result;
use beacon_common::{BeaconError, LivenessEvent, LivenessTransition, StoreError};
use futures::Stream;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::store::{KeyStore, WatchOptions, Watcher, retry_transient};

/// Servers currently holding a liveness token
#[derive(Debug, Clone, Default)]
pub struct Fleet {
    /// server -> unix time of last registration or beat
    alive: BTreeMap<String, i64>,
}

impl Fleet {
    pub fn seed<I: IntoIterator<Item = String>>(servers: I) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            alive: servers.into_iter().map(|s| (s, now)).collect(),
        }
    }

    /// Update membership; returns true if the set of live servers changed
    pub fn apply(&mut self, event: &LivenessEvent) -> bool {
        match event.transition {
            LivenessTransition::Registered | LivenessTransition::Renewed => self
                .alive
                .insert(event.server.clone(), event.observed_at)
                .is_none(),
            LivenessTransition::Expired | LivenessTransition::Removed => {
                self.alive.remove(&event.server).is_some()
            }
            LivenessTransition::Unhandled(_) => false,
        }
    }

    pub fn last_seen(&self, server: &str) -> Option<i64> {
        self.alive.get(server).copied()
    }

    pub fn servers(&self) -> impl Iterator<Item = &str> {
        self.alive.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.alive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alive.is_empty()
    }
}

/// Watches the liveness namespace
pub struct LivenessObserver<S: KeyStore> {
    store: Arc<S>,
    root: String,
}

impl<S: KeyStore> LivenessObserver<S> {
    pub fn new(store: Arc<S>, running_root: &str) -> Self {
        Self {
            store,
            root: running_root.trim_end_matches('/').to_string(),
        }
    }

    /// Servers holding a token right now, and the store index of the listing
    pub async fn roster(&self) -> Result<(Vec<String>, u64)> {
        let (store, root) = (&*self.store, self.root.as_str());
        match retry_transient("roster", move || store.get(root, false)).await {
            Ok(event) => {
                let servers = event
                    .node
                    .nodes
                    .iter()
                    .filter(|n| !n.dir)
                    .map(|n| n.name().to_string())
                    .collect();
                Ok((servers, event.index))
            }
            Err(StoreError::KeyNotFound { index, .. }) => Ok((Vec::new(), index)),
            Err(e) => Err(e.into()),
        }
    }

    /// Fleet events after `after_index` (0 = from now on).
    ///
    /// Transient errors re-issue the watch silently; any other error is
    /// yielded once and ends the stream.
    pub fn watch(self, after_index: u64) -> impl Stream<Item = Result<LivenessEvent>> + Send {
        let watcher = self.store.watcher(
            &self.root,
            WatchOptions {
                recursive: true,
                after_index,
            },
        );
        tracing::info!(root = %self.root, after_index, "👀 Watching liveness namespace");

        futures::stream::try_unfold(watcher, |mut watcher| async move {
            loop {
                match watcher.next().await {
                    Ok(event) => {
                        let observed = LivenessEvent::from_key_event(&event);
                        if let LivenessTransition::Unhandled(action) = &observed.transition {
                            tracing::warn!(action = %action, key = %observed.key, "Unhandled liveness action");
                        }
                        return Ok::<_, BeaconError>(Some((observed, watcher)));
                    }
                    Err(e) if e.is_transient() => {
                        tracing::debug!(error = %e, "Watch interrupted, re-issuing");
                        tokio::task::yield_now().await;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        })
    }
}

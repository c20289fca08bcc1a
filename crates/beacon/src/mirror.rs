//! Config Mirror
//!
//! Keeps an in-memory copy of `/config/<server>` up to date: one recursive
//! snapshot, then a watch anchored at the snapshot's store index so that no
//! change between the two is lost or applied twice.

use beacon_common::error::Result;
use beacon_common::{BeaconError, KeyEvent, Node, StoreError, is_valid_segment};
use futures::Stream;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::store::{KeyStore, WatchOptions, Watcher, retry_transient};

/// Flat variable -> value mapping for one server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ConfigMap(BTreeMap<String, String>);

/// Effect of a change event on a [`ConfigMap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Upserted,
    Removed,
    Ignored,
}

impl ConfigMap {
    /// Build from a directory listing, keeping direct leaf children only
    pub fn from_listing(dir: &Node) -> Self {
        let entries = dir
            .nodes
            .iter()
            .filter(|n| !n.dir)
            .map(|n| (n.name().to_string(), n.value_str().to_string()))
            .collect();
        Self(entries)
    }

    pub fn get(&self, variable: &str) -> Option<&str> {
        self.0.get(variable).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Apply one change event observed under `prefix`
    pub fn apply(&mut self, prefix: &str, event: &KeyEvent) -> Applied {
        let Some(variable) = variable_name(prefix, &event.node.key) else {
            return Applied::Ignored;
        };
        if event.node.dir {
            return Applied::Ignored;
        }

        if event.action.is_write() {
            self.0
                .insert(variable.to_string(), event.node.value_str().to_string());
            Applied::Upserted
        } else if event.action.is_removal() {
            self.0.remove(variable);
            Applied::Removed
        } else {
            Applied::Ignored
        }
    }
}

impl fmt::Display for ConfigMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", k, v)?;
        }
        f.write_str("}")
    }
}

/// Variable name for a key that is a direct child of `prefix`
fn variable_name<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    let rest = key.strip_prefix(prefix)?.strip_prefix('/')?;
    (!rest.is_empty() && !rest.contains('/')).then_some(rest)
}

enum Phase<W> {
    Snapshot,
    Watching(W),
}

/// Mirror of one server's config subtree
pub struct ConfigMirror<S: KeyStore> {
    store: Arc<S>,
    server: String,
    prefix: String,
    settings: ConfigMap,
    phase: Phase<S::Watcher>,
}

impl<S: KeyStore> ConfigMirror<S> {
    pub fn new(store: Arc<S>, config_root: &str, server: &str) -> Result<Self> {
        if !is_valid_segment(server) {
            return Err(BeaconError::Config(format!("invalid server name {:?}", server)));
        }
        Ok(Self {
            store,
            server: server.to_string(),
            prefix: format!("{}/{}", config_root.trim_end_matches('/'), server),
            settings: ConfigMap::default(),
            phase: Phase::Snapshot,
        })
    }

    /// Read the subtree; a missing subtree is an empty map.
    ///
    /// Returns the map and the store index it was read at.
    pub async fn snapshot(&self) -> Result<(ConfigMap, u64)> {
        let (store, prefix) = (&*self.store, self.prefix.as_str());
        match retry_transient("snapshot", move || store.get(prefix, true)).await {
            Ok(event) => Ok((ConfigMap::from_listing(&event.node), event.index)),
            Err(StoreError::KeyNotFound { index, .. }) => Ok((ConfigMap::default(), index)),
            Err(e) => Err(e.into()),
        }
    }

    async fn resync(&mut self) -> Result<ConfigMap> {
        let (settings, index) = self.snapshot().await?;
        tracing::info!(
            server = %self.server,
            variables = settings.len(),
            index,
            "Config snapshot loaded"
        );

        let watcher = self.store.watcher(
            &self.prefix,
            WatchOptions {
                recursive: true,
                after_index: index,
            },
        );
        self.settings = settings;
        self.phase = Phase::Watching(watcher);
        Ok(self.settings.clone())
    }

    /// Advance to the next mapping worth publishing
    async fn step(&mut self) -> Result<ConfigMap> {
        loop {
            let Phase::Watching(watcher) = &mut self.phase else {
                return self.resync().await;
            };

            let event = match watcher.next().await {
                Ok(event) => event,
                Err(e) if e.is_transient() => {
                    tracing::debug!(server = %self.server, error = %e, "Watch interrupted, re-issuing");
                    tokio::task::yield_now().await;
                    continue;
                }
                Err(StoreError::IndexCleared { index, .. }) => {
                    tracing::warn!(server = %self.server, index, "Watch history cleared, resyncing");
                    self.phase = Phase::Snapshot;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match self.settings.apply(&self.prefix, &event) {
                Applied::Ignored => {
                    tracing::debug!(action = %event.action, key = %event.node.key, "Ignored config event");
                }
                applied => {
                    tracing::debug!(
                        action = %event.action,
                        key = %event.node.key,
                        effect = ?applied,
                        "Config changed"
                    );
                    return Ok(self.settings.clone());
                }
            }
        }
    }

    /// Mapping snapshots: the initial one, then one per applied change.
    ///
    /// The stream never ends on its own; after a fatal error it yields that
    /// error and finishes.
    pub fn sync(self) -> impl Stream<Item = Result<ConfigMap>> + Send {
        futures::stream::try_unfold(self, |mut mirror| async move {
            let settings = mirror.step().await?;
            Ok::<_, BeaconError>(Some((settings, mirror)))
        })
    }
}

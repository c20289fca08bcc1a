//! In-process key store with etcd v2 semantics, for component tests.
//!
//! Supports conditional writes, leases, an event log replayed to watchers,
//! and injected transient failures.

use async_trait::async_trait;
use beacon_common::{KeyEvent, Node, StoreAction, StoreError};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{DeleteOptions, KeyStore, PrevExist, SetOptions, WatchOptions, Watcher};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
    created_index: u64,
    modified_index: u64,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    index: u64,
    log: Vec<KeyEvent>,
    /// Pending transient failures for write/read operations
    op_failures: u32,
    /// Pending transient failures for watch-next
    watch_failures: u32,
    /// Pending cleared-history answers for watch-next
    cleared_watches: u32,
    /// Writes that commit but answer with a transient failure
    lost_replies: u32,
    watch_calls: u64,
}

impl State {
    fn node(&self, key: &str, entry: &Entry) -> Node {
        Node {
            key: key.to_string(),
            value: Some(entry.value.clone()),
            ttl: entry.expires_at.map(|at| {
                at.saturating_duration_since(Instant::now()).as_secs() as i64
            }),
            modified_index: entry.modified_index,
            created_index: entry.created_index,
            ..Default::default()
        }
    }

    fn record(&mut self, action: StoreAction, node: Node, prev_node: Option<Node>) -> KeyEvent {
        let event = KeyEvent {
            action,
            node,
            prev_node,
            index: self.index,
        };
        self.log.push(event.clone());
        event
    }

    /// Drop lapsed leases, logging an expire event for each
    fn expire_due(&mut self) {
        let now = Instant::now();
        let due: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in due {
            self.expire_key(&key);
        }
    }

    fn expire_key(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        self.index += 1;
        let prev = self.node(key, &entry);
        let node = Node {
            key: key.to_string(),
            modified_index: self.index,
            created_index: entry.created_index,
            ..Default::default()
        };
        self.record(StoreAction::Expire, node, Some(prev));
        true
    }

    fn not_found(&self, key: &str) -> StoreError {
        StoreError::KeyNotFound {
            key: key.to_string(),
            index: self.index,
        }
    }

    fn take_op_failure(&mut self) -> Result<(), StoreError> {
        if self.op_failures > 0 {
            self.op_failures -= 1;
            return Err(StoreError::Transient("injected cluster failure".into()));
        }
        Ok(())
    }

    fn take_lost_reply(&mut self) -> bool {
        if self.lost_replies > 0 {
            self.lost_replies -= 1;
            return true;
        }
        false
    }
}

struct Shared {
    state: Mutex<State>,
    changed: Notify,
}

/// In-memory [`KeyStore`]
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                changed: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current value of a key, ignoring leases that have lapsed
    pub fn value(&self, key: &str) -> Option<String> {
        let mut state = self.lock();
        state.expire_due();
        state.entries.get(key).map(|e| e.value.clone())
    }

    /// Every event recorded so far, in index order
    pub fn events(&self) -> Vec<KeyEvent> {
        self.lock().log.clone()
    }

    /// Actions of every mutation recorded so far
    pub fn actions(&self) -> Vec<StoreAction> {
        self.lock().log.iter().map(|e| e.action.clone()).collect()
    }

    /// Remaining lease of a key
    pub fn ttl(&self, key: &str) -> Option<std::time::Duration> {
        let state = self.lock();
        state
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Current store index
    pub fn index(&self) -> u64 {
        self.lock().index
    }

    /// Lapse a key's lease immediately
    pub fn expire(&self, key: &str) -> bool {
        let expired = self.lock().expire_key(key);
        if expired {
            self.shared.changed.notify_waiters();
        }
        expired
    }

    /// Make the next `n` get/set/delete calls fail transiently
    pub fn fail_ops(&self, n: u32) {
        self.lock().op_failures += n;
    }

    /// Make the next `n` watch-next calls fail transiently
    pub fn fail_watches(&self, n: u32) {
        self.lock().watch_failures += n;
    }

    /// Make the next `n` watch-next calls report the history as cleared
    pub fn fail_watches_cleared(&self, n: u32) {
        self.lock().cleared_watches += n;
    }

    /// Commit the next `n` set/delete calls but answer them with a
    /// transient failure, like a reply lost on the way back
    pub fn lose_replies(&self, n: u32) {
        self.lock().lost_replies += n;
    }

    /// Number of watch-next calls issued so far
    pub fn watch_calls(&self) -> u64 {
        self.lock().watch_calls
    }

    fn build_dir(state: &State, key: &str, recursive: bool) -> Node {
        let prefix = format!("{}/", key.trim_end_matches('/'));
        let mut children: BTreeMap<String, Node> = BTreeMap::new();

        for (k, entry) in state.entries.range(prefix.clone()..) {
            let Some(rest) = k.strip_prefix(&prefix) else {
                break;
            };
            match rest.split_once('/') {
                None => {
                    children.insert(k.clone(), state.node(k, entry));
                }
                Some((dir, _)) => {
                    let dir_key = format!("{}{}", prefix, dir);
                    if !children.contains_key(&dir_key) {
                        let dir_node = if recursive {
                            Self::build_dir(state, &dir_key, true)
                        } else {
                            Node {
                                key: dir_key.clone(),
                                dir: true,
                                ..Default::default()
                            }
                        };
                        children.insert(dir_key, dir_node);
                    }
                }
            }
        }

        Node {
            key: key.trim_end_matches('/').to_string(),
            dir: true,
            nodes: children.into_values().collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl KeyStore for MemoryStore {
    type Watcher = MemoryWatcher;

    async fn get(&self, key: &str, recursive: bool) -> Result<KeyEvent, StoreError> {
        let mut state = self.lock();
        state.take_op_failure()?;
        state.expire_due();

        let node = if let Some(entry) = state.entries.get(key) {
            state.node(key, entry)
        } else {
            let dir = Self::build_dir(&state, key, recursive);
            if dir.nodes.is_empty() {
                return Err(state.not_found(key));
            }
            dir
        };

        Ok(KeyEvent {
            action: StoreAction::Get,
            node,
            prev_node: None,
            index: state.index,
        })
    }

    async fn set(&self, key: &str, value: &str, opts: &SetOptions) -> Result<KeyEvent, StoreError> {
        let outcome = {
            let mut state = self.lock();
            state.take_op_failure()?;
            state.expire_due();

            let existing = state.entries.get(key).cloned();
            match (&existing, opts.prev_exist) {
                (Some(_), PrevExist::Absent) => {
                    return Err(StoreError::NodeExists {
                        key: key.to_string(),
                    });
                }
                (None, PrevExist::Exists) => return Err(state.not_found(key)),
                _ => {}
            }
            if let Some(expected) = &opts.prev_value {
                match &existing {
                    None => return Err(state.not_found(key)),
                    Some(entry) if &entry.value != expected => {
                        return Err(StoreError::PreconditionFailed {
                            key: key.to_string(),
                            cause: format!("[{} != {}]", expected, entry.value),
                        });
                    }
                    Some(_) => {}
                }
            }

            let action = if opts.prev_value.is_some() {
                StoreAction::CompareAndSwap
            } else {
                match opts.prev_exist {
                    PrevExist::Absent => StoreAction::Create,
                    PrevExist::Exists => StoreAction::Update,
                    PrevExist::Ignore => StoreAction::Set,
                }
            };

            state.index += 1;
            let entry = Entry {
                value: value.to_string(),
                expires_at: opts.ttl.map(|ttl| Instant::now() + ttl),
                created_index: existing
                    .as_ref()
                    .map_or(state.index, |e| e.created_index),
                modified_index: state.index,
            };
            let node = state.node(key, &entry);
            let prev = existing.map(|e| state.node(key, &e));
            state.entries.insert(key.to_string(), entry);
            let event = state.record(action, node, prev);
            (event, state.take_lost_reply())
        };

        self.shared.changed.notify_waiters();
        reply(outcome)
    }

    async fn delete(&self, key: &str, opts: &DeleteOptions) -> Result<KeyEvent, StoreError> {
        let outcome = {
            let mut state = self.lock();
            state.take_op_failure()?;
            state.expire_due();

            let Some(existing) = state.entries.get(key).cloned() else {
                return Err(state.not_found(key));
            };
            if let Some(expected) = &opts.prev_value {
                if &existing.value != expected {
                    return Err(StoreError::PreconditionFailed {
                        key: key.to_string(),
                        cause: format!("[{} != {}]", expected, existing.value),
                    });
                }
            }

            let action = if opts.prev_value.is_some() {
                StoreAction::CompareAndDelete
            } else {
                StoreAction::Delete
            };

            state.entries.remove(key);
            state.index += 1;
            let prev = state.node(key, &existing);
            let node = Node {
                key: key.to_string(),
                modified_index: state.index,
                created_index: existing.created_index,
                ..Default::default()
            };
            let event = state.record(action, node, Some(prev));
            (event, state.take_lost_reply())
        };

        self.shared.changed.notify_waiters();
        reply(outcome)
    }

    fn watcher(&self, key: &str, opts: WatchOptions) -> MemoryWatcher {
        let after = match opts.after_index {
            0 => self.index(),
            index => index,
        };
        MemoryWatcher {
            store: self.clone(),
            key: key.trim_end_matches('/').to_string(),
            recursive: opts.recursive,
            next_index: after + 1,
        }
    }
}

fn reply((event, lost): (KeyEvent, bool)) -> Result<KeyEvent, StoreError> {
    if lost {
        return Err(StoreError::Transient("reply lost after commit".into()));
    }
    Ok(event)
}

/// Watch over the store's event log
pub struct MemoryWatcher {
    store: MemoryStore,
    key: String,
    recursive: bool,
    /// First index still to deliver
    next_index: u64,
}

impl MemoryWatcher {
    fn matches(&self, key: &str) -> bool {
        key == self.key
            || (self.recursive
                && key
                    .strip_prefix(&self.key)
                    .is_some_and(|rest| rest.starts_with('/')))
    }
}

#[async_trait]
impl Watcher for MemoryWatcher {
    async fn next(&mut self) -> Result<KeyEvent, StoreError> {
        {
            let mut state = self.store.lock();
            state.watch_calls += 1;
            if state.watch_failures > 0 {
                state.watch_failures -= 1;
                return Err(StoreError::Transient("injected watch failure".into()));
            }
            if state.cleared_watches > 0 {
                state.cleared_watches -= 1;
                return Err(StoreError::IndexCleared {
                    key: self.key.clone(),
                    index: state.index,
                });
            }
        }

        loop {
            let changed = self.store.shared.changed.notified();
            {
                let mut state = self.store.lock();
                state.expire_due();
                let found = state
                    .log
                    .iter()
                    .find(|e| e.node.modified_index >= self.next_index && self.matches(&e.node.key))
                    .cloned();
                if let Some(event) = found {
                    self.next_index = event.node.modified_index + 1;
                    return Ok(event);
                }
            }
            changed.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn lease(secs: u64) -> SetOptions {
        SetOptions {
            prev_exist: PrevExist::Absent,
            ttl: Some(Duration::from_secs(secs)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_only_and_compare_and_swap() {
        let store = MemoryStore::new();
        let created = store.set("/running/s1", "tok", &lease(60)).await.unwrap();
        assert_eq!(created.action, StoreAction::Create);

        let again = store.set("/running/s1", "other", &lease(60)).await;
        assert_eq!(
            again,
            Err(StoreError::NodeExists {
                key: "/running/s1".into()
            })
        );

        let cas = SetOptions {
            prev_exist: PrevExist::Exists,
            prev_value: Some("wrong".into()),
            ttl: Some(Duration::from_secs(60)),
        };
        assert!(matches!(
            store.set("/running/s1", "tok", &cas).await,
            Err(StoreError::PreconditionFailed { .. })
        ));
        assert_eq!(store.value("/running/s1").as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn test_recursive_get_lists_children() {
        let store = MemoryStore::new();
        let plain = SetOptions::default();
        store.set("/config/s1/a", "1", &plain).await.unwrap();
        store.set("/config/s1/b", "2", &plain).await.unwrap();
        store.set("/config/s1/nested/c", "3", &plain).await.unwrap();
        store.set("/config/s2/a", "9", &plain).await.unwrap();

        let listing = store.get("/config/s1", true).await.unwrap();
        assert!(listing.node.dir);
        let keys: Vec<_> = listing.node.nodes.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(keys, ["/config/s1/a", "/config/s1/b", "/config/s1/nested"]);
        assert_eq!(listing.node.nodes[2].nodes[0].value.as_deref(), Some("3"));
        assert_eq!(listing.index, 4);

        let missing = store.get("/config/s3", true).await;
        assert_eq!(
            missing,
            Err(StoreError::KeyNotFound {
                key: "/config/s3".into(),
                index: 4
            })
        );
    }

    #[tokio::test]
    async fn test_watcher_replays_after_index() {
        let store = MemoryStore::new();
        let plain = SetOptions::default();
        store.set("/config/s1/a", "1", &plain).await.unwrap();
        store.set("/config/s2/a", "2", &plain).await.unwrap();
        store.set("/config/s1/b", "3", &plain).await.unwrap();

        let mut watcher = store.watcher(
            "/config/s1",
            WatchOptions {
                recursive: true,
                after_index: 1,
            },
        );
        let event = watcher.next().await.unwrap();
        assert_eq!(event.node.key, "/config/s1/b");
        assert_eq!(event.node.modified_index, 3);
    }

    #[tokio::test]
    async fn test_expire_records_event() {
        let store = MemoryStore::new();
        store.set("/running/s1", "tok", &lease(60)).await.unwrap();
        assert!(store.expire("/running/s1"));
        assert_eq!(store.value("/running/s1"), None);
        assert_eq!(
            store.actions(),
            [StoreAction::Create, StoreAction::Expire]
        );
        let expired = store.events().pop().unwrap();
        assert_eq!(expired.prev_node.unwrap().value.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn test_lost_reply_still_commits() {
        let store = MemoryStore::new();
        store.lose_replies(1);

        let first = store.set("/running/s1", "tok", &lease(60)).await;
        assert!(first.unwrap_err().is_transient());
        assert_eq!(store.value("/running/s1").as_deref(), Some("tok"));

        tokio_test::assert_ok!(store.set("/running/s2", "tok", &lease(60)).await);
    }
}

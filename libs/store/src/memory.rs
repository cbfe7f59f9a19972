//! In-process store implementation.
//!
//! Implements the full adapter contract (TTLs, exclusive create, recursive
//! watch) against a process-local map, so views, the reconciler, and the
//! lock/apply path can be exercised without a running coordination cluster.
//! TTL expiry is driven by [`MemoryStore::sweep_expired`] (call it from a
//! test, or run [`spawn_sweeper`] for wall-clock behavior); expired entries
//! are also collected lazily on every operation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::trace;

use crate::{Node, Operation, Store, StoreError, StoreEvent};

const WATCH_BUFFER: usize = 256;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
    modified_index: u64,
}

struct Watcher {
    prefix: String,
    tx: mpsc::Sender<Result<StoreEvent, StoreError>>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    index: u64,
    watchers: Vec<Watcher>,
}

/// In-memory coordination store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every entry whose TTL has elapsed, emitting `expire` events.
    pub fn sweep_expired(&self) {
        let mut inner = self.inner.lock().expect("memory store lock");
        Self::sweep_locked(&mut inner);
    }

    /// Force-expire a key regardless of its remaining TTL.
    ///
    /// Lets tests simulate a crashed host without waiting out the heartbeat
    /// TTL in wall-clock time.
    pub fn expire_now(&self, key: &str) {
        let mut inner = self.inner.lock().expect("memory store lock");
        if let Some(entry) = inner.entries.remove(key) {
            inner.index += 1;
            let index = inner.index;
            Self::notify(
                &mut inner,
                Operation::Remove,
                Node {
                    key: key.to_string(),
                    value: None,
                    modified_index: index.max(entry.modified_index),
                    ..Default::default()
                },
            );
        }
    }

    /// Write a value without notifying watchers.
    ///
    /// Simulates a change hidden by a missed/compacted watch event, so tests
    /// can verify that consumers repair themselves via full resync.
    pub fn set_silently(&self, key: &str, value: &str) {
        let mut inner = self.inner.lock().expect("memory store lock");
        inner.index += 1;
        let index = inner.index;
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
                modified_index: index,
            },
        );
    }

    /// Number of live (non-expired) entries under a prefix.
    pub fn count_under(&self, prefix: &str) -> usize {
        let mut inner = self.inner.lock().expect("memory store lock");
        Self::sweep_locked(&mut inner);
        inner
            .entries
            .keys()
            .filter(|k| in_subtree(k, prefix))
            .count()
    }

    fn sweep_locked(inner: &mut Inner) {
        let now = Instant::now();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in expired {
            inner.entries.remove(&key);
            inner.index += 1;
            let index = inner.index;
            trace!(key = %key, "Memory store entry expired");
            Self::notify(
                inner,
                Operation::Remove,
                Node {
                    key,
                    value: None,
                    modified_index: index,
                    ..Default::default()
                },
            );
        }
    }

    fn notify(inner: &mut Inner, operation: Operation, node: Node) {
        inner.watchers.retain(|watcher| {
            if !in_subtree(&node.key, &watcher.prefix) {
                return true;
            }
            let event = StoreEvent {
                operation,
                node: node.clone(),
            };
            match watcher.tx.try_send(Ok(event)) {
                Ok(()) => true,
                // A full buffer loses the event; the views' full resync is
                // the repair path, exactly as with a compacted real watch.
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    fn write(&self, key: &str, value: &str, ttl: Option<Duration>, exclusive: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock");
        Self::sweep_locked(&mut inner);

        if exclusive && inner.entries.contains_key(key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }

        inner.index += 1;
        let index = inner.index;
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
                modified_index: index,
            },
        );

        Self::notify(
            &mut inner,
            Operation::Add,
            Node {
                key: key.to_string(),
                value: Some(value.to_string()),
                modified_index: index,
                ..Default::default()
            },
        );
        Ok(())
    }
}

/// Run a background task sweeping expired entries every `period`.
pub fn spawn_sweeper(
    store: Arc<MemoryStore>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = tick.tick() => store.sweep_expired(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

fn in_subtree(key: &str, prefix: &str) -> bool {
    key == prefix || key.starts_with(&format!("{prefix}/"))
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str, recursive: bool) -> Result<Node, StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock");
        Self::sweep_locked(&mut inner);

        if let Some(entry) = inner.entries.get(key) {
            return Ok(Node {
                key: key.to_string(),
                value: Some(entry.value.clone()),
                modified_index: entry.modified_index,
                ..Default::default()
            });
        }

        // Directory lookup: answer with a flat subtree, which is all the
        // leaf walk upstream cares about.
        let children: Vec<Node> = inner
            .entries
            .iter()
            .filter(|(k, _)| in_subtree(k, key))
            .map(|(k, entry)| Node {
                key: k.clone(),
                value: Some(entry.value.clone()),
                modified_index: entry.modified_index,
                ..Default::default()
            })
            .collect();

        if children.is_empty() {
            return Err(StoreError::KeyNotFound(key.to_string()));
        }
        if !recursive {
            return Err(StoreError::Protocol(format!("{key} is a directory")));
        }

        Ok(Node {
            key: key.to_string(),
            dir: true,
            nodes: children,
            ..Default::default()
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.write(key, value, ttl, false)
    }

    async fn create_exclusive(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.write(key, value, ttl, true)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store lock");
        Self::sweep_locked(&mut inner);

        let entry = inner
            .entries
            .remove(key)
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))?;
        inner.index += 1;
        let index = inner.index;

        Self::notify(
            &mut inner,
            Operation::Remove,
            Node {
                key: key.to_string(),
                value: None,
                modified_index: index.max(entry.modified_index),
                ..Default::default()
            },
        );
        Ok(())
    }

    fn watch(
        &self,
        prefix: &str,
        _shutdown: watch::Receiver<bool>,
    ) -> mpsc::Receiver<Result<StoreEvent, StoreError>> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let mut inner = self.inner.lock().expect("memory store lock");
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        rx
    }
}

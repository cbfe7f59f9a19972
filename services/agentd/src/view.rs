//! Materialized views of coordination-store subtrees.
//!
//! A view owns an in-memory map of one subtree, seeded from a recursive get
//! and kept current from the watch stream, with a periodic full resync as
//! the repair path for missed or reordered events. After every semantic
//! change it publishes the whole map as an immutable snapshot; consumers
//! only ever see snapshots, never the live map, and never see errors; a
//! failed sync just leaves them on a stale but consistent view.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use daprdockr_store::{Node, Operation, Store, StoreError, StoreEvent};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Default interval between authoritative full resyncs.
pub const FULL_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Capacity of a view's snapshot channel.
const SNAPSHOT_BUFFER: usize = 16;

/// An immutable, shareable copy of a view's map.
pub type Snapshot<E> = Arc<BTreeMap<String, E>>;

/// Errors from interpreting a store node as an entity.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid key {key}: {reason}")]
    Key { key: String, reason: String },

    #[error("invalid value at {key}: {source}")]
    Value {
        key: String,
        source: serde_json::Error,
    },
}

impl ParseError {
    pub fn key(key: &str, reason: &str) -> Self {
        Self::Key {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn value(key: &str, source: serde_json::Error) -> Self {
        Self::Value {
            key: key.to_string(),
            source,
        }
    }
}

/// An entity materialized from one leaf of a store subtree.
pub trait ViewEntity: Clone + PartialEq + Send + Sync + 'static {
    /// The subtree this entity lives under.
    const SUBTREE: &'static str;

    /// Log tag.
    const TAG: &'static str;

    /// Interpret a leaf node. `Ok(None)` means the node is deliberately not
    /// part of the view (a lock token).
    fn parse_node(node: &Node) -> Result<Option<(String, Self)>, ParseError>;

    /// Derive the view key from a key path alone (delete events carry no
    /// value).
    fn key_from_path(key: &str) -> Result<String, ParseError>;
}

/// Spawn a view task; the returned channel yields a snapshot after every
/// semantic change, starting with the initial seed (which may be empty).
pub fn spawn_view<E: ViewEntity>(
    store: Arc<dyn Store>,
    full_sync_interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> mpsc::Receiver<Snapshot<E>> {
    let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
    tokio::spawn(run_view::<E>(store, full_sync_interval, shutdown, tx));
    rx
}

async fn run_view<E: ViewEntity>(
    store: Arc<dyn Store>,
    full_sync_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    out: mpsc::Sender<Snapshot<E>>,
) {
    // Register the watch before seeding so changes racing the seed are not
    // lost; duplicated events are idempotent against the map.
    let mut events = store.watch(E::SUBTREE, shutdown.clone());

    let mut map: BTreeMap<String, E> = BTreeMap::new();
    let mut seeded = false;

    match load_all::<E>(store.as_ref()).await {
        Ok(initial) => {
            info!(view = E::TAG, entries = initial.len(), "Seeded view");
            map = initial;
            seeded = true;
            if out.send(Arc::new(map.clone())).await.is_err() {
                return;
            }
        }
        Err(err) => {
            warn!(view = E::TAG, error = %err, "Initial load failed, deferring to full sync");
        }
    }

    let mut sync = tokio::time::interval(full_sync_interval);
    sync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    sync.tick().await; // the immediate first tick; the seed above covered it

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }

            event = events.recv() => match event {
                None => break,
                Some(Ok(event)) => {
                    if apply_event(&mut map, &event) && seeded {
                        if out.send(Arc::new(map.clone())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Err(err)) => {
                    warn!(view = E::TAG, error = %err, "Dropping undecodable watch event");
                }
            },

            _ = sync.tick() => match load_all::<E>(store.as_ref()).await {
                Ok(fresh) => {
                    let changed = fresh != map;
                    if changed {
                        debug!(view = E::TAG, entries = fresh.len(), "Full sync repaired view");
                        map = fresh;
                    }
                    if (changed || !seeded)
                        && out.send(Arc::new(map.clone())).await.is_err()
                    {
                        break;
                    }
                    seeded = true;
                }
                Err(err) => {
                    warn!(view = E::TAG, error = %err, "Full sync failed, keeping current view");
                }
            },
        }
    }

    debug!(view = E::TAG, "View exiting");
}

/// Apply one watch event to the map; true if the view semantically changed.
fn apply_event<E: ViewEntity>(map: &mut BTreeMap<String, E>, event: &StoreEvent) -> bool {
    match event.operation {
        Operation::Add => match E::parse_node(&event.node) {
            Ok(Some((key, entity))) => {
                if map.get(&key) == Some(&entity) {
                    return false;
                }
                debug!(view = E::TAG, key = %key, "Updating entry");
                map.insert(key, entity);
                true
            }
            Ok(None) => false,
            Err(err) => {
                warn!(view = E::TAG, error = %err, "Dropping unparseable node");
                false
            }
        },
        Operation::Remove => match E::key_from_path(&event.node.key) {
            Ok(key) => {
                let removed = map.remove(&key).is_some();
                if removed {
                    debug!(view = E::TAG, key = %key, "Removing entry");
                }
                removed
            }
            Err(err) => {
                warn!(view = E::TAG, error = %err, "Dropping remove for unparseable key");
                false
            }
        },
    }
}

/// Authoritative load of the whole subtree. A missing subtree is an empty
/// view, not an error.
async fn load_all<E: ViewEntity>(store: &dyn Store) -> Result<BTreeMap<String, E>, StoreError> {
    let tree = match store.get(E::SUBTREE, true).await {
        Ok(tree) => tree,
        Err(StoreError::KeyNotFound(_)) => return Ok(BTreeMap::new()),
        Err(err) => return Err(err),
    };

    let mut map = BTreeMap::new();
    for leaf in tree.leaves() {
        match E::parse_node(leaf) {
            Ok(Some((key, entity))) => {
                map.insert(key, entity);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(view = E::TAG, error = %err, "Dropping unparseable node");
            }
        }
    }
    Ok(map)
}

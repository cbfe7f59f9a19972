//! Typed facade over the cluster coordination store.
//!
//! The coordination store is a strongly-consistent key-value service with
//! TTLs, exclusive create, and recursive watch (the etcd v2 wire protocol).
//! This crate exposes the small surface the agent needs:
//!
//! - **`Store`**: the adapter trait (get / set-with-TTL / create-exclusive /
//!   delete / recursive watch).
//! - **`EtcdStore`**: the HTTP implementation, with endpoint rotation and
//!   transparent watch resumption.
//! - **`MemoryStore`**: an in-process implementation with manual TTL
//!   sweeping, so everything above the adapter is testable without a
//!   running cluster.
//!
//! Watch events carry the raw affected node plus the semantic operation the
//! materialized views consume: `set`/`update`/`create`/`compareAndSwap`
//! collapse to `Add`, `delete`/`expire` to `Remove`. Unknown actions surface
//! as errors on the watch stream.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

pub mod error;
mod etcd;
mod memory;

pub use error::StoreError;
pub use etcd::EtcdStore;
pub use memory::{spawn_sweeper, MemoryStore};

/// Semantic operation derived from a raw store action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// The key now holds the attached value.
    Add,
    /// The key is gone (explicit delete or TTL expiry).
    Remove,
}

impl Operation {
    /// Map a raw store action to the operation consumers care about.
    pub fn from_action(action: &str) -> Result<Self, StoreError> {
        match action {
            "set" | "update" | "create" | "compareAndSwap" => Ok(Self::Add),
            "delete" | "expire" => Ok(Self::Remove),
            other => Err(StoreError::UnknownAction(other.to_string())),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Add => f.write_str("add"),
            Self::Remove => f.write_str("remove"),
        }
    }
}

/// A node in the store's key tree.
///
/// Keys are normalized to have no leading slash, so `instances/g/s/0` splits
/// cleanly on `/`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub key: String,
    /// `None` for directories and for delete/expire events; `Some("")` is a
    /// present-but-empty value (a lock token in the instances subtree).
    pub value: Option<String>,
    pub modified_index: u64,
    pub dir: bool,
    pub nodes: Vec<Node>,
}

impl Node {
    /// All non-directory descendants, including `self` if it is a leaf.
    pub fn leaves(&self) -> Vec<&Node> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Node>) {
        if self.dir {
            for child in &self.nodes {
                child.collect_leaves(out);
            }
        } else {
            out.push(self);
        }
    }
}

/// A change observed on a watched prefix.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub operation: Operation,
    pub node: Node,
}

/// The coordination store adapter.
///
/// All writes the agent performs go through this trait: heartbeats via
/// `set`, lock acquisition via `create_exclusive`, flatlines via `delete`.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Fetch a key, optionally with its whole subtree.
    async fn get(&self, key: &str, recursive: bool) -> Result<Node, StoreError>;

    /// Write a value, optionally with a TTL after which the store expires it.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Create a key only if it does not already exist.
    ///
    /// Fails with [`StoreError::AlreadyExists`] when a peer holds the key;
    /// that is the distributed-lock loss signal, not a fault.
    async fn create_exclusive(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Delete a key.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Watch a prefix recursively.
    ///
    /// The stream is long-lived: disconnects are retried transparently and
    /// the watch resumes from the last observed index. It ends only when the
    /// shutdown signal flips or the receiver is dropped. Malformed or
    /// unknown events are delivered as `Err` items so consumers can log and
    /// drop them without losing the stream.
    fn watch(
        &self,
        prefix: &str,
        shutdown: watch::Receiver<bool>,
    ) -> mpsc::Receiver<Result<StoreEvent, StoreError>>;
}

/// Strip the leading slash the wire protocol puts on keys.
pub(crate) fn normalize_key(key: &str) -> String {
    key.trim_start_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_mapping() {
        for action in ["set", "update", "create", "compareAndSwap"] {
            assert_eq!(Operation::from_action(action).unwrap(), Operation::Add);
        }
        for action in ["delete", "expire"] {
            assert_eq!(Operation::from_action(action).unwrap(), Operation::Remove);
        }
    }

    #[test]
    fn test_unknown_action_is_an_error() {
        let err = Operation::from_action("get").unwrap_err();
        assert!(matches!(err, StoreError::UnknownAction(a) if a == "get"));
    }

    #[test]
    fn test_leaves_walk_nested_directories() {
        let tree = Node {
            key: "instances".into(),
            dir: true,
            nodes: vec![
                Node {
                    key: "instances/g1".into(),
                    dir: true,
                    nodes: vec![
                        Node {
                            key: "instances/g1/web".into(),
                            dir: true,
                            nodes: vec![Node {
                                key: "instances/g1/web/0".into(),
                                value: Some("{}".into()),
                                ..Default::default()
                            }],
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                },
                Node {
                    key: "instances/g2".into(),
                    dir: true,
                    nodes: vec![Node {
                        key: "instances/g2/db/1".into(),
                        value: Some("{}".into()),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let leaves = tree.leaves();
        let keys: Vec<_> = leaves.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(keys, vec!["instances/g1/web/0", "instances/g2/db/1"]);
    }
}

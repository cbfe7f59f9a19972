//! HTTP implementation of the store adapter (etcd v2 wire protocol).
//!
//! Requests rotate through the configured endpoints until one answers.
//! Watches long-poll `?wait=true&recursive=true&waitIndex=<n>` and resume
//! from the last observed modification index; an `EventIndexCleared` answer
//! restarts the watch from the store's current index (the views' periodic
//! full resync repairs whatever the gap hid).

use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::{normalize_key, Node, Operation, Store, StoreError, StoreEvent};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const WATCH_POLL_TIMEOUT: Duration = Duration::from_secs(55);
const WATCH_RETRY_BACKOFF: Duration = Duration::from_secs(1);

const ERR_KEY_NOT_FOUND: u64 = 100;
const ERR_NODE_EXISTS: u64 = 105;
const ERR_INDEX_CLEARED: u64 = 401;

/// Coordination-store client speaking the etcd v2 HTTP API.
#[derive(Clone)]
pub struct EtcdStore {
    endpoints: Vec<String>,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    action: Option<String>,
    node: Option<WireNode>,
    #[serde(rename = "errorCode")]
    error_code: Option<u64>,
    message: Option<String>,
    cause: Option<String>,
    index: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireNode {
    key: String,
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<WireNode>,
    #[serde(rename = "modifiedIndex", default)]
    modified_index: u64,
}

impl From<WireNode> for Node {
    fn from(wire: WireNode) -> Self {
        Node {
            key: normalize_key(&wire.key),
            value: wire.value,
            modified_index: wire.modified_index,
            dir: wire.dir,
            nodes: wire.nodes.into_iter().map(Node::from).collect(),
        }
    }
}

/// Outcome of one watch long-poll.
enum WatchPoll {
    Event(StoreEvent),
    /// The poll timed out without a change; retry with the same index.
    Idle,
    /// The requested index was compacted away; resume from this one.
    Reset(u64),
}

impl EtcdStore {
    /// Create a client for the given endpoints (e.g. `http://10.0.0.1:2379`).
    pub fn new(endpoints: Vec<String>) -> Self {
        let endpoints = endpoints
            .into_iter()
            .map(|e| e.trim_end_matches('/').to_string())
            .collect();

        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("default TLS backend available");

        Self { endpoints, http }
    }

    fn key_url(endpoint: &str, key: &str) -> String {
        format!("{}/v2/keys/{}", endpoint, key.trim_start_matches('/'))
    }

    /// Send the request against each endpoint in turn until one answers.
    async fn roundtrip<F>(&self, build: F) -> Result<WireResponse, StoreError>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    {
        let mut last = StoreError::Unavailable;
        for endpoint in &self.endpoints {
            let request = build(&self.http, endpoint).timeout(REQUEST_TIMEOUT);
            match request.send().await {
                Ok(response) => return Self::decode(response).await,
                Err(err) if err.is_connect() || err.is_timeout() => {
                    debug!(endpoint = %endpoint, error = %err, "Store endpoint unreachable, rotating");
                    last = err.into();
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(last)
    }

    /// Parse a v2 answer, success or error body alike.
    async fn decode(response: reqwest::Response) -> Result<WireResponse, StoreError> {
        let status = response.status();
        let body = response.bytes().await?;
        let wire: WireResponse = serde_json::from_slice(&body).map_err(|err| {
            StoreError::Protocol(format!("unparseable response (HTTP {status}): {err}"))
        })?;

        match wire.error_code {
            None => Ok(wire),
            Some(ERR_KEY_NOT_FOUND) => {
                Err(StoreError::KeyNotFound(wire.cause.unwrap_or_default()))
            }
            Some(ERR_NODE_EXISTS) => {
                Err(StoreError::AlreadyExists(wire.cause.unwrap_or_default()))
            }
            Some(code) => Err(StoreError::Protocol(format!(
                "error code {code}: {}",
                wire.message.unwrap_or_default()
            ))),
        }
    }

    fn node_from(wire: WireResponse) -> Result<Node, StoreError> {
        wire.node
            .map(Node::from)
            .ok_or_else(|| StoreError::Protocol("response without node".to_string()))
    }

    async fn watch_once(
        &self,
        prefix: &str,
        wait_index: Option<u64>,
    ) -> Result<WatchPoll, StoreError> {
        let mut last = StoreError::Unavailable;
        for endpoint in &self.endpoints {
            let mut request = self
                .http
                .get(Self::key_url(endpoint, prefix))
                .query(&[("wait", "true"), ("recursive", "true")])
                .timeout(WATCH_POLL_TIMEOUT);
            if let Some(index) = wait_index {
                request = request.query(&[("waitIndex", index.to_string())]);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) if err.is_timeout() => return Ok(WatchPoll::Idle),
                Err(err) if err.is_connect() => {
                    last = err.into();
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let status = response.status();
            let body = response.bytes().await?;
            if body.is_empty() {
                // The server closed its side of the long poll; re-arm.
                return Ok(WatchPoll::Idle);
            }
            let wire: WireResponse = serde_json::from_slice(&body).map_err(|err| {
                StoreError::Protocol(format!("unparseable watch response (HTTP {status}): {err}"))
            })?;

            if wire.error_code == Some(ERR_INDEX_CLEARED) {
                // The watch index was compacted; restart from the store's
                // current index (or from "now" if it did not tell us).
                return Ok(WatchPoll::Reset(wire.index.map(|i| i + 1).unwrap_or(0)));
            }
            if let Some(code) = wire.error_code {
                return Err(StoreError::Protocol(format!(
                    "error code {code}: {}",
                    wire.message.unwrap_or_default()
                )));
            }

            let action = wire
                .action
                .clone()
                .ok_or_else(|| StoreError::Protocol("watch event without action".to_string()))?;
            let operation = Operation::from_action(&action)?;
            let node = Self::node_from(wire)?;
            return Ok(WatchPoll::Event(StoreEvent { operation, node }));
        }
        Err(last)
    }
}

#[async_trait::async_trait]
impl Store for EtcdStore {
    async fn get(&self, key: &str, recursive: bool) -> Result<Node, StoreError> {
        let recursive = if recursive { "true" } else { "false" };
        let wire = self
            .roundtrip(|http, endpoint| {
                http.get(Self::key_url(endpoint, key))
                    .query(&[("recursive", recursive)])
            })
            .await?;
        Self::node_from(wire)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut form = vec![("value".to_string(), value.to_string())];
        if let Some(ttl) = ttl {
            form.push(("ttl".to_string(), ttl.as_secs().to_string()));
        }
        self.roundtrip(|http, endpoint| http.put(Self::key_url(endpoint, key)).form(&form))
            .await?;
        Ok(())
    }

    async fn create_exclusive(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut form = vec![
            ("value".to_string(), value.to_string()),
            ("prevExist".to_string(), "false".to_string()),
        ];
        if let Some(ttl) = ttl {
            form.push(("ttl".to_string(), ttl.as_secs().to_string()));
        }
        self.roundtrip(|http, endpoint| http.put(Self::key_url(endpoint, key)).form(&form))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.roundtrip(|http, endpoint| http.delete(Self::key_url(endpoint, key)))
            .await?;
        Ok(())
    }

    fn watch(
        &self,
        prefix: &str,
        shutdown: watch::Receiver<bool>,
    ) -> mpsc::Receiver<Result<StoreEvent, StoreError>> {
        let (tx, rx) = mpsc::channel(64);
        let store = self.clone();
        let prefix = prefix.to_string();
        tokio::spawn(watch_loop(store, prefix, shutdown, tx));
        rx
    }
}

async fn watch_loop(
    store: EtcdStore,
    prefix: String,
    mut shutdown: watch::Receiver<bool>,
    tx: mpsc::Sender<Result<StoreEvent, StoreError>>,
) {
    let mut wait_index: Option<u64> = None;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let poll = store.watch_once(&prefix, wait_index);
        tokio::pin!(poll);

        let result = tokio::select! {
            _ = shutdown.changed() => continue,
            result = &mut poll => result,
        };

        match result {
            Ok(WatchPoll::Event(event)) => {
                wait_index = Some(event.node.modified_index + 1);
                if tx.send(Ok(event)).await.is_err() {
                    break;
                }
            }
            Ok(WatchPoll::Idle) => {}
            Ok(WatchPoll::Reset(index)) => {
                warn!(prefix = %prefix, "Watch index compacted away, restarting from current state");
                wait_index = (index > 0).then_some(index);
            }
            Err(err) => {
                let fatal = tx.send(Err(err)).await.is_err();
                if fatal {
                    break;
                }
                tokio::time::sleep(WATCH_RETRY_BACKOFF).await;
            }
        }
    }

    debug!(prefix = %prefix, "Watch stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_success_node() {
        let body = r#"{
            "action": "set",
            "node": {"key": "/instances/g1/web/0", "value": "{}", "modifiedIndex": 7, "createdIndex": 7}
        }"#;
        let wire: WireResponse = serde_json::from_str(body).unwrap();
        assert_eq!(wire.action.as_deref(), Some("set"));

        let node = Node::from(wire.node.unwrap());
        assert_eq!(node.key, "instances/g1/web/0");
        assert_eq!(node.value.as_deref(), Some("{}"));
        assert_eq!(node.modified_index, 7);
        assert!(!node.dir);
    }

    #[test]
    fn test_decode_directory_tree() {
        let body = r#"{
            "action": "get",
            "node": {
                "key": "/instances",
                "dir": true,
                "nodes": [
                    {"key": "/instances/g1", "dir": true, "nodes": [
                        {"key": "/instances/g1/web", "dir": true, "nodes": [
                            {"key": "/instances/g1/web/0", "value": "", "modifiedIndex": 3}
                        ]}
                    ]}
                ]
            }
        }"#;
        let wire: WireResponse = serde_json::from_str(body).unwrap();
        let node = Node::from(wire.node.unwrap());
        let leaves = node.leaves();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].key, "instances/g1/web/0");
        // Present-but-empty value: a lock token, distinct from absent.
        assert_eq!(leaves[0].value.as_deref(), Some(""));
    }

    #[test]
    fn test_error_body_maps_to_typed_errors() {
        let exists = r#"{"errorCode":105,"message":"Key already exists","cause":"/instances/g1/web/0","index":12}"#;
        let wire: WireResponse = serde_json::from_str(exists).unwrap();
        assert_eq!(wire.error_code, Some(105));

        let missing = r#"{"errorCode":100,"message":"Key not found","cause":"/config/services/g1","index":12}"#;
        let wire: WireResponse = serde_json::from_str(missing).unwrap();
        assert_eq!(wire.error_code, Some(100));
    }

    #[test]
    fn test_delete_event_has_no_value() {
        let body = r#"{
            "action": "expire",
            "node": {"key": "/instances/g1/web/0", "modifiedIndex": 9},
            "prevNode": {"key": "/instances/g1/web/0", "value": "{}", "modifiedIndex": 8}
        }"#;
        let wire: WireResponse = serde_json::from_str(body).unwrap();
        let operation = Operation::from_action(wire.action.as_deref().unwrap()).unwrap();
        assert_eq!(operation, Operation::Remove);
        assert!(wire.node.unwrap().value.is_none());
    }
}

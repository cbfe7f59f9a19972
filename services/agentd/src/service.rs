//! Service configuration model: the desired state of one service.
//!
//! Identified by `(group, name)`, stored at
//! `config/services/<group>/<name>` with no TTL. The container spec is
//! forwarded to the runtime mostly verbatim; fields this agent does not
//! interpret ride along in a flattened map so they survive a round trip.

use std::collections::BTreeMap;

use daprdockr_store::{Node, Store, StoreError};
use serde::{Deserialize, Serialize};

use crate::view::{ParseError, ViewEntity};

/// Store subtree holding service configurations.
pub const SERVICES_SUBTREE: &str = "config/services";

/// Full-resync interval for the service view, deliberately offset from the
/// instance view's so the two authoritative reloads do not land together.
pub const CONFIG_FULL_SYNC_INTERVAL: std::time::Duration = std::time::Duration::from_secs(65);

/// HTTP exposure of a service through the reverse proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Public hostname the proxy serves this service under. Empty means the
    /// service is not exposed over HTTP.
    #[serde(rename = "HostName", default)]
    pub host_name: String,

    /// Container port (decimal string) backing the public hostname.
    #[serde(rename = "ContainerPort", default)]
    pub container_port: String,
}

impl HttpConfig {
    pub fn is_configured(&self) -> bool {
        !self.host_name.is_empty()
    }
}

/// The container runtime spec for a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    #[serde(rename = "Image", default)]
    pub image: String,

    #[serde(rename = "Cmd", default)]
    pub cmd: Vec<String>,

    #[serde(rename = "Env", default)]
    pub env: Vec<String>,

    #[serde(rename = "Hostname", default)]
    pub hostname: String,

    /// Ports the container exposes, keyed `"<port>/<proto>"`.
    #[serde(rename = "ExposedPorts", default)]
    pub exposed_ports: BTreeMap<String, serde_json::Value>,

    /// Memory limit in bytes; 0 means unlimited.
    #[serde(rename = "Memory", default)]
    pub memory: i64,

    #[serde(rename = "CpuShares", default)]
    pub cpu_shares: i64,

    /// Runtime-opaque fields forwarded verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Desired state of one service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(skip)]
    pub group: String,

    #[serde(skip)]
    pub name: String,

    /// Desired instance count; ordinals run `[0, instances)`.
    #[serde(rename = "Instances", default)]
    pub instances: u32,

    #[serde(rename = "Container", default)]
    pub container: ContainerSpec,

    #[serde(rename = "Http", default)]
    pub http: HttpConfig,
}

impl ServiceConfig {
    /// `<name>.<group>`, the key configs are held under in the view.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.name, self.group)
    }

    /// `<ordinal>.<name>.<group>`.
    pub fn instance_qualified_name(&self, ordinal: u32) -> String {
        format!("{}.{}", ordinal, self.qualified_name())
    }

    /// `<ordinal>.<name>.<group>.<suffix>`, the container name and DNS name.
    pub fn instance_fully_qualified_name(&self, ordinal: u32, suffix: &str) -> String {
        format!("{}.{}", self.instance_qualified_name(ordinal), suffix)
    }

    /// The store key for this config.
    pub fn key(&self) -> String {
        config_key(&self.group, &self.name)
    }

    /// The store key for one of this service's instances.
    pub fn instance_key(&self, ordinal: u32) -> String {
        crate::instance::instance_key(&self.group, &self.name, ordinal)
    }

    /// A config carrying only the identifier, for Removes of instances
    /// whose service no longer exists.
    pub fn identifier_only(group: &str, name: &str) -> Self {
        Self {
            group: group.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }
}

impl std::fmt::Display for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.qualified_name())
    }
}

/// Build the store key for a service config.
pub fn config_key(group: &str, name: &str) -> String {
    format!("{SERVICES_SUBTREE}/{group}/{name}")
}

fn parse_key(key: &str) -> Result<(String, String), ParseError> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        ["config", "services", group, name] if !group.is_empty() && !name.is_empty() => {
            Ok((group.to_string(), name.to_string()))
        }
        _ => Err(ParseError::key(key, "expected config/services/<group>/<name>")),
    }
}

impl ViewEntity for ServiceConfig {
    const SUBTREE: &'static str = SERVICES_SUBTREE;
    const TAG: &'static str = "ServiceConfig";

    fn parse_node(node: &Node) -> Result<Option<(String, Self)>, ParseError> {
        let (group, name) = parse_key(&node.key)?;

        let value = node
            .value
            .as_deref()
            .ok_or_else(|| ParseError::key(&node.key, "config node without value"))?;

        let mut config: ServiceConfig = if value.is_empty() {
            ServiceConfig::default()
        } else {
            serde_json::from_str(value).map_err(|err| ParseError::value(&node.key, err))?
        };
        config.group = group;
        config.name = name;
        Ok(Some((config.qualified_name(), config)))
    }

    fn key_from_path(key: &str) -> Result<String, ParseError> {
        let (group, name) = parse_key(key)?;
        Ok(format!("{name}.{group}"))
    }
}

/// Write a service configuration (no TTL).
pub async fn set_service_config(store: &dyn Store, config: &ServiceConfig) -> Result<(), StoreError> {
    let payload = serde_json::to_string(config)?;
    store.set(&config.key(), &payload, None).await
}

/// Read one service configuration.
pub async fn get_service_config(
    store: &dyn Store,
    group: &str,
    name: &str,
) -> Result<ServiceConfig, StoreError> {
    let node = store.get(&config_key(group, name), false).await?;
    match ServiceConfig::parse_node(&node) {
        Ok(Some((_, config))) => Ok(config),
        Ok(None) => Err(StoreError::Protocol(format!("{} holds no config", node.key))),
        Err(err) => Err(StoreError::Protocol(err.to_string())),
    }
}

/// Delete a service configuration; the reconciler will tear its instances
/// down on the next pass.
pub async fn delete_service_config(
    store: &dyn Store,
    group: &str,
    name: &str,
) -> Result<(), StoreError> {
    store.delete(&config_key(group, name)).await
}

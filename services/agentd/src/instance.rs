//! Instance model: a single running copy of a service on some host.
//!
//! An instance is identified by `(group, service, ordinal)`. The triple
//! lives only in the store key (`instances/<group>/<service>/<ordinal>`)
//! and in the managed container's name
//! (`<ordinal>.<service>.<group>.<suffix>`); the stored JSON value carries
//! just the reachable addresses and the container→host port mapping.

use std::collections::BTreeMap;
use std::net::IpAddr;

use daprdockr_store::Node;
use serde::{Deserialize, Serialize};

use crate::view::{ParseError, ViewEntity};

/// Store subtree holding live instance records.
pub const INSTANCES_SUBTREE: &str = "instances";

/// A live (heartbeating) instance of a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Instance {
    #[serde(skip)]
    pub group: String,

    #[serde(skip)]
    pub service: String,

    #[serde(skip)]
    pub ordinal: u32,

    /// Addresses at which the instance is reachable from peers.
    #[serde(rename = "Addrs", default)]
    pub addrs: Vec<IpAddr>,

    /// Container-internal port → host-exposed port, both decimal strings.
    #[serde(rename = "PortMappings", default)]
    pub port_mappings: BTreeMap<String, String>,
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        if self.group != other.group
            || self.service != other.service
            || self.ordinal != other.ordinal
            || self.port_mappings != other.port_mappings
        {
            return false;
        }
        // The address list is a set: ordering differences are not a change.
        let mut ours = self.addrs.clone();
        let mut theirs = other.addrs.clone();
        ours.sort();
        theirs.sort();
        ours == theirs
    }
}

impl Eq for Instance {}

impl Instance {
    /// `<ordinal>.<service>.<group>`, the name views and the reconciler
    /// key on.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}.{}", self.ordinal, self.service, self.group)
    }

    /// `<ordinal>.<service>.<group>.<suffix>`, the container name and the
    /// authoritative DNS name.
    pub fn fully_qualified_name(&self, suffix: &str) -> String {
        format!("{}.{}", self.qualified_name(), suffix)
    }

    /// The store key for this instance.
    pub fn key(&self) -> String {
        instance_key(&self.group, &self.service, self.ordinal)
    }
}

impl std::fmt::Display for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.qualified_name())
    }
}

/// Build the store key for an instance ordinal.
pub fn instance_key(group: &str, service: &str, ordinal: u32) -> String {
    format!("{INSTANCES_SUBTREE}/{group}/{service}/{ordinal}")
}

/// Parse `<ordinal>.<service>.<group>` (exactly three labels).
pub fn parse_qualified_name(name: &str) -> Option<(u32, &str, &str)> {
    let mut labels = name.split('.');
    let ordinal = labels.next()?.parse().ok()?;
    let service = labels.next()?;
    let group = labels.next()?;
    if service.is_empty() || group.is_empty() || labels.next().is_some() {
        return None;
    }
    Some((ordinal, service, group))
}

/// Split an instance key into its structural parts.
fn parse_key(key: &str) -> Result<(String, String, u32), ParseError> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [INSTANCES_SUBTREE, group, service, ordinal] if !group.is_empty() && !service.is_empty() => {
            let ordinal = ordinal
                .parse()
                .map_err(|_| ParseError::key(key, "ordinal is not a number"))?;
            Ok((group.to_string(), service.to_string(), ordinal))
        }
        _ => Err(ParseError::key(key, "expected instances/<group>/<service>/<ordinal>")),
    }
}

impl ViewEntity for Instance {
    const SUBTREE: &'static str = INSTANCES_SUBTREE;
    const TAG: &'static str = "Instances";

    fn parse_node(node: &Node) -> Result<Option<(String, Self)>, ParseError> {
        let (group, service, ordinal) = parse_key(&node.key)?;

        let value = node
            .value
            .as_deref()
            .ok_or_else(|| ParseError::key(&node.key, "instance node without value"))?;
        if value.is_empty() {
            // A lock token: some host is initializing this ordinal. Not an
            // instance yet; the view must not show it.
            return Ok(None);
        }

        let mut instance: Instance =
            serde_json::from_str(value).map_err(|err| ParseError::value(&node.key, err))?;
        instance.group = group;
        instance.service = service;
        instance.ordinal = ordinal;
        Ok(Some((instance.qualified_name(), instance)))
    }

    fn key_from_path(key: &str) -> Result<String, ParseError> {
        let (group, service, ordinal) = parse_key(key)?;
        Ok(format!("{ordinal}.{service}.{group}"))
    }
}

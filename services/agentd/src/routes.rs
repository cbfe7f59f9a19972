//! Routable host IP discovery.
//!
//! The addresses published in heartbeats (and injected into containers as
//! their resolver) must be reachable from peer hosts. We find them by
//! reading the kernel's IPv4 route table, keeping the interfaces that carry
//! a default route, and taking each such interface's addresses in the
//! gateway's subnet. An explicit `--host-ip` override skips all of this.
//!
//! Resolved once at boot and passed down explicitly; nothing re-reads the
//! route table at runtime.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Kernel route table, one line per IPv4 route.
pub const ROUTE_FILE: &str = "/proc/net/route";

/// The host's routable addresses, as resolved at boot.
#[derive(Debug, Clone, Default)]
pub struct HostNet {
    pub addrs: Vec<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RouteEntry {
    iface: String,
    destination: Ipv4Addr,
    gateway: Ipv4Addr,
    mask: Ipv4Addr,
}

impl RouteEntry {
    fn is_default(&self) -> bool {
        self.destination.is_unspecified()
    }
}

/// Resolve the host's routable addresses.
pub fn discover(route_file: &Path, override_ip: Option<IpAddr>) -> Result<HostNet> {
    if let Some(ip) = override_ip {
        debug!(ip = %ip, "Using configured host IP");
        return Ok(HostNet { addrs: vec![ip] });
    }

    let text = std::fs::read_to_string(route_file)
        .with_context(|| format!("read route table {}", route_file.display()))?;
    let routes = parse_route_table(&text)?;

    let mut addrs: BTreeSet<IpAddr> = BTreeSet::new();
    for route in routes.iter().filter(|r| r.is_default()) {
        for addr in interface_addrs(route) {
            addrs.insert(addr);
        }
    }

    if addrs.is_empty() {
        warn!("No internet-routed address found; peers will not reach this host's instances");
    } else {
        debug!(addrs = ?addrs, "Discovered routable host addresses");
    }

    Ok(HostNet {
        addrs: addrs.into_iter().collect(),
    })
}

/// Parse the kernel route table (header line + hex-encoded columns).
fn parse_route_table(text: &str) -> Result<Vec<RouteEntry>> {
    let mut routes = Vec::new();
    for line in text.lines().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        routes.push(parse_route_line(line)?);
    }
    Ok(routes)
}

fn parse_route_line(line: &str) -> Result<RouteEntry> {
    let columns: Vec<&str> = line.split_whitespace().collect();
    if columns.len() < 8 {
        anyhow::bail!("route entry has {} columns, expected at least 8", columns.len());
    }

    Ok(RouteEntry {
        iface: columns[0].to_string(),
        destination: parse_hex_ipv4(columns[1])
            .with_context(|| format!("destination of route on {}", columns[0]))?,
        gateway: parse_hex_ipv4(columns[2])
            .with_context(|| format!("gateway of route on {}", columns[0]))?,
        mask: parse_hex_ipv4(columns[7])
            .with_context(|| format!("mask of route on {}", columns[0]))?,
    })
}

/// The route table encodes addresses as little-endian hex words.
fn parse_hex_ipv4(hex: &str) -> Result<Ipv4Addr> {
    if hex.len() != 8 {
        anyhow::bail!("expected 8 hex digits, got {hex:?}");
    }
    let word = u32::from_str_radix(hex, 16).with_context(|| format!("hex address {hex:?}"))?;
    Ok(Ipv4Addr::from(word.swap_bytes()))
}

/// Addresses of the route's interface that can actually speak to its
/// gateway. A gateway-less (on-link) default route keeps every address of
/// the interface.
fn interface_addrs(route: &RouteEntry) -> Vec<IpAddr> {
    let Ok(interfaces) = nix::ifaddrs::getifaddrs() else {
        warn!(iface = %route.iface, "Could not list interface addresses");
        return Vec::new();
    };

    let mut addrs = Vec::new();
    for entry in interfaces {
        if entry.interface_name != route.iface {
            continue;
        }
        let Some(sockaddr) = entry.address.as_ref().and_then(|a| a.as_sockaddr_in()) else {
            continue;
        };
        let ip = sockaddr.ip();
        if ip.is_loopback() {
            continue;
        }

        let reaches_gateway = route.gateway.is_unspecified()
            || entry
                .netmask
                .as_ref()
                .and_then(|m| m.as_sockaddr_in())
                .is_some_and(|mask| same_subnet(ip, route.gateway, mask.ip()));
        if reaches_gateway {
            addrs.push(IpAddr::V4(ip));
        }
    }
    addrs
}

fn same_subnet(a: Ipv4Addr, b: Ipv4Addr, mask: Ipv4Addr) -> bool {
    let mask = u32::from(mask);
    (u32::from(a) & mask) == (u32::from(b) & mask)
}

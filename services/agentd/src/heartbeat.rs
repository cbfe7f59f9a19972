//! Heartbeat pump: keep this host's instances alive in the store.
//!
//! Instance records live under a short TTL; the pump re-lists the local
//! containers every interval and republishes each managed one, refreshing
//! liveness and picking up port-mapping changes. When the host (or the
//! pump) dies, the records it was refreshing expire and the cluster
//! reconverges without it. Containers whose name does not end in the
//! private suffix are not ours and are ignored.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use daprdockr_store::Store;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::instance::{parse_qualified_name, Instance};
use crate::runtime::{ContainerRuntime, ContainerSummary};

/// TTL of a published instance record; expiry is the cluster's liveness
/// signal for the instance.
pub const HEARTBEAT_TTL: Duration = Duration::from_secs(20);

/// Interval between pump passes; well under half the TTL so one missed
/// pass does not flatline a healthy instance.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Periodically republishes every managed local container.
pub struct HeartbeatPump {
    store: Arc<dyn Store>,
    runtime: Arc<dyn ContainerRuntime>,
    host_addrs: Vec<IpAddr>,
    suffix: String,
    interval: Duration,
    ttl: Duration,
}

impl HeartbeatPump {
    pub fn new(
        store: Arc<dyn Store>,
        runtime: Arc<dyn ContainerRuntime>,
        host_addrs: Vec<IpAddr>,
        suffix: &str,
        interval: Duration,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            runtime,
            host_addrs,
            suffix: suffix.to_string(),
            interval,
            ttl,
        }
    }

    /// Run until shutdown; every failure waits for the next tick.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    if let Err(err) = self.beat().await {
                        warn!(error = %err, "Heartbeat pass failed");
                    }
                }
            }
        }
        debug!("Heartbeat pump exiting");
    }

    /// One pass: republish every managed, running container.
    async fn beat(&self) -> anyhow::Result<()> {
        let containers = self.runtime.list_containers().await?;

        for summary in &containers {
            if !summary.running {
                continue;
            }
            let Some(instance) = instance_from_container(summary, &self.suffix, &self.host_addrs)
            else {
                continue;
            };

            let payload = serde_json::to_string(&instance)?;
            match self
                .store
                .set(&instance.key(), &payload, Some(self.ttl))
                .await
            {
                Ok(()) => debug!(instance = %instance, "Heartbeat"),
                Err(err) => {
                    warn!(instance = %instance, error = %err, "Failed to publish heartbeat");
                }
            }
        }
        Ok(())
    }
}

/// Derive an instance record from a managed container.
///
/// Returns `None` for containers this system does not manage (no name
/// ending in `.<suffix>`) or whose name does not parse.
pub fn instance_from_container(
    summary: &ContainerSummary,
    suffix: &str,
    host_addrs: &[IpAddr],
) -> Option<Instance> {
    let dotted = format!(".{suffix}");
    let name = summary
        .names
        .iter()
        .map(|n| n.trim_start_matches('/'))
        .find(|n| n.ends_with(&dotted))?;

    let qualified = name.strip_suffix(&dotted)?;
    let (ordinal, service, group) = parse_qualified_name(qualified)?;

    let mut instance = Instance {
        group: group.to_string(),
        service: service.to_string(),
        ordinal,
        addrs: host_addrs.to_vec(),
        ..Default::default()
    };
    for binding in &summary.ports {
        if let Some(host_port) = binding.host_port {
            instance
                .port_mappings
                .insert(binding.container_port.to_string(), host_port.to_string());
        }
    }
    Some(instance)
}

//! Lock & apply: turn required changes into container lifecycle operations.
//!
//! For every Add the agent races its peers for the instance key with an
//! exclusive create (empty value, lock TTL). Losing the race is the normal
//! outcome on all hosts but one and is skipped silently. The winner pulls
//! the image if needed, replaces any stale container of the same name,
//! starts the new one, and publishes the first heartbeat, which overwrites
//! the lock token with a real instance record. If anything between lock and
//! heartbeat fails, the token is left to expire so another host can retry.
//!
//! Removes stop (or kill) and remove the local container, then flatline the
//! instance key so peers converge immediately instead of waiting out the
//! heartbeat TTL. Only the host that actually removed a container
//! flatlines; on every other host the name is simply not present.
//!
//! Changes are applied serially: the engine serializes name-based
//! operations anyway, and an image pull must not race a remove for the same
//! name.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use daprdockr_store::Store;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::instance::Instance;
use crate::reconciler::{ChangeOp, Delta, RequiredChange};
use crate::runtime::{ContainerRuntime, CreateSpec, ImageSummary, RuntimeError};

/// TTL of a lock token: how long the winner has to get the container
/// running before peers may retry the ordinal.
pub const LOCK_TTL: Duration = Duration::from_secs(60);

/// Grace period before a stop escalates to a kill.
pub const STOP_GRACE: Duration = Duration::from_secs(30);

/// Timing knobs for the apply path.
#[derive(Debug, Clone)]
pub struct ApplyTimings {
    pub lock_ttl: Duration,
    /// TTL used for the first heartbeat published after a start.
    pub heartbeat_ttl: Duration,
    pub stop_grace: Duration,
}

impl Default for ApplyTimings {
    fn default() -> Self {
        Self {
            lock_ttl: LOCK_TTL,
            heartbeat_ttl: crate::heartbeat::HEARTBEAT_TTL,
            stop_grace: STOP_GRACE,
        }
    }
}

/// Serial executor of reconciler deltas on this host.
pub struct Applier {
    store: Arc<dyn Store>,
    runtime: Arc<dyn ContainerRuntime>,
    /// Routable addresses of this host, published with every heartbeat and
    /// injected into containers as their first resolver.
    host_addrs: Vec<IpAddr>,
    suffix: String,
    timings: ApplyTimings,
}

impl Applier {
    pub fn new(
        store: Arc<dyn Store>,
        runtime: Arc<dyn ContainerRuntime>,
        host_addrs: Vec<IpAddr>,
        suffix: &str,
        timings: ApplyTimings,
    ) -> Self {
        Self {
            store,
            runtime,
            host_addrs,
            suffix: suffix.to_string(),
            timings,
        }
    }

    /// Consume deltas until shutdown.
    pub async fn run(self, mut deltas: mpsc::Receiver<Delta>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                delta = deltas.recv() => {
                    let Some(delta) = delta else { break };
                    for change in delta.values() {
                        match change.op {
                            ChangeOp::Add => self.apply_add(change).await,
                            ChangeOp::Remove => self.apply_remove(change).await,
                        }
                    }
                }
            }
        }
        debug!("Applier exiting");
    }

    async fn apply_add(&self, change: &RequiredChange) {
        let key = change.config.instance_key(change.ordinal);
        let name = change
            .config
            .instance_fully_qualified_name(change.ordinal, &self.suffix);

        match self
            .store
            .create_exclusive(&key, "", Some(self.timings.lock_ttl))
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_contention() => {
                debug!(instance = %name, "Ordinal already claimed by a peer");
                return;
            }
            Err(err) => {
                warn!(instance = %name, error = %err, "Could not attempt lock");
                return;
            }
        }

        info!(instance = %name, "Acquired instance lock");
        match self.instantiate(change, &name, &key).await {
            Ok(()) => info!(instance = %name, "Instantiated"),
            Err(err) => {
                // The token expires on its own; a peer (or this host, next
                // tick) retries the ordinal.
                warn!(instance = %name, error = %format!("{err:#}"), "Failed to instantiate, leaving lock to expire");
            }
        }
    }

    async fn instantiate(
        &self,
        change: &RequiredChange,
        name: &str,
        key: &str,
    ) -> anyhow::Result<()> {
        let container = &change.config.container;
        if container.image.is_empty() {
            anyhow::bail!("service config has no image");
        }

        self.ensure_image(&container.image)
            .await
            .context("ensure image")?;

        // A stale container of the same name (a previous incarnation of
        // this ordinal) must go before the name can be reused.
        self.retire_container(name).await.context("retire stale container")?;

        let spec = self.create_spec(change, name);
        self.runtime
            .create_container(&spec)
            .await
            .context("create container")?;
        self.runtime
            .start_container(name)
            .await
            .context("start container")?;

        // First heartbeat: replaces the lock token and extends the TTL. If
        // port inspection hiccups, publish without mappings; the pump
        // refreshes them within one interval.
        let ports = match self.runtime.inspect_ports(name).await {
            Ok(ports) => ports,
            Err(err) => {
                warn!(instance = %name, error = %err, "Port inspection failed, publishing bare heartbeat");
                Vec::new()
            }
        };

        let mut instance = Instance {
            group: change.config.group.clone(),
            service: change.config.name.clone(),
            ordinal: change.ordinal,
            addrs: self.host_addrs.clone(),
            ..Default::default()
        };
        for binding in ports {
            if let Some(host_port) = binding.host_port {
                instance
                    .port_mappings
                    .insert(binding.container_port.to_string(), host_port.to_string());
            }
        }

        let payload = serde_json::to_string(&instance).context("encode instance")?;
        self.store
            .set(key, &payload, Some(self.timings.heartbeat_ttl))
            .await
            .context("publish first heartbeat")?;
        Ok(())
    }

    async fn apply_remove(&self, change: &RequiredChange) {
        let key = change.config.instance_key(change.ordinal);
        let name = change
            .config
            .instance_fully_qualified_name(change.ordinal, &self.suffix);

        let removed = match self.retire_container(&name).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(instance = %name, error = %err, "Failed to remove container, will retry next pass");
                return;
            }
        };

        if !removed {
            // Nothing local under that name; some other host owns it (or
            // nobody does, and the key will expire on its own).
            debug!(instance = %name, "No local container to remove");
            return;
        }

        info!(instance = %name, "Removed instance");
        if let Err(err) = self.store.delete(&key).await {
            warn!(instance = %name, error = %err, "Failed to flatline, key will expire instead");
        }
    }

    /// Ensure the image is available locally, pulling it if no local image
    /// satisfies the reference.
    async fn ensure_image(&self, reference: &str) -> Result<(), RuntimeError> {
        let images = self.runtime.list_images().await?;
        if !should_pull(reference, &images) {
            debug!(image = %reference, "Image already present");
            return Ok(());
        }
        self.runtime.pull_image(reference).await
    }

    /// Stop (escalating to kill) and remove any container of this name.
    /// Returns whether a container was actually removed; "not found" at any
    /// step means there is nothing to do.
    async fn retire_container(&self, name: &str) -> Result<bool, RuntimeError> {
        match self.runtime.stop_container(name, self.timings.stop_grace).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => return Ok(false),
            Err(err) => {
                debug!(container = %name, error = %err, "Stop failed, escalating to kill");
                match self.runtime.kill_container(name).await {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => return Ok(false),
                    Err(err) => return Err(err),
                }
            }
        }

        match self.runtime.remove_container(name).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn create_spec(&self, change: &RequiredChange, name: &str) -> CreateSpec {
        let container = &change.config.container;

        // The agent's own resolver goes first so instance names resolve
        // from inside the container.
        let dns = self.host_addrs.clone();

        CreateSpec {
            name: name.to_string(),
            image: container.image.clone(),
            cmd: container.cmd.clone(),
            env: container.env.clone(),
            hostname: format!("{}{}", container.hostname, change.ordinal),
            exposed_ports: container.exposed_ports.clone(),
            memory: container.memory,
            cpu_shares: container.cpu_shares,
            dns,
            extra: container.extra.clone(),
        }
    }
}

/// Decide whether an image reference requires a pull given what is local.
///
/// No pull when the reference is a prefix of a local image ID, or when a
/// local tag matches it, comparing repositories only when the reference
/// names no tag.
pub fn should_pull(reference: &str, images: &[ImageSummary]) -> bool {
    let tagged = reference.contains(':');
    for image in images {
        if image.id.starts_with(reference) {
            return false;
        }
        for tag in &image.repo_tags {
            if tagged {
                if tag == reference {
                    return false;
                }
            } else if tag.split(':').next() == Some(reference) {
                return false;
            }
        }
    }
    true
}

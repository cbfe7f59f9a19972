//! Docker Engine implementation of the container runtime interface.

use std::time::Duration;

use async_trait::async_trait;
use hyper::Method;
use tracing::{debug, info};

use crate::runtime::{
    ContainerRuntime, ContainerSummary, CreateSpec, ImageSummary, PortBinding, RuntimeError,
};

mod api;
mod types;

use api::DockerApi;
use types::{
    ContainerListItem, CreateContainerBody, HostConfigBody, ImageListItem, InspectResponse,
};

/// Container runtime backed by a Docker Engine daemon.
pub struct DockerClient {
    api: DockerApi,
}

impl DockerClient {
    /// Connect to the engine at the given endpoint
    /// (e.g. `unix:///var/run/docker.sock`).
    pub fn new(endpoint: &str) -> Result<Self, RuntimeError> {
        Ok(Self {
            api: DockerApi::new(endpoint)?,
        })
    }
}

fn summary_from(item: ContainerListItem) -> ContainerSummary {
    ContainerSummary {
        id: item.id,
        names: item.names,
        ports: item
            .ports
            .into_iter()
            .map(|p| PortBinding {
                container_port: p.private_port,
                host_port: p.public_port,
                protocol: p.proto,
            })
            .collect(),
        running: item.state == "running",
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let body = self
            .api
            .expect_ok(Method::GET, "/containers/json?all=true", None, "list containers")
            .await?;
        let items: Vec<ContainerListItem> = serde_json::from_slice(&body)
            .map_err(|err| RuntimeError::Transport(err.to_string()))?;
        Ok(items.into_iter().map(summary_from).collect())
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, RuntimeError> {
        let body = self
            .api
            .expect_ok(Method::GET, "/images/json", None, "list images")
            .await?;
        let items: Vec<ImageListItem> = serde_json::from_slice(&body)
            .map_err(|err| RuntimeError::Transport(err.to_string()))?;
        Ok(items
            .into_iter()
            .map(|i| ImageSummary {
                id: i.id,
                repo_tags: i.repo_tags.unwrap_or_default(),
            })
            .collect())
    }

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        info!(image = %reference, "Pulling image");
        // The engine streams progress JSON; draining the body is what makes
        // this call wait for pull completion.
        self.api
            .expect_ok(
                Method::POST,
                &format!("/images/create?fromImage={reference}"),
                None,
                "pull image",
            )
            .await?;
        debug!(image = %reference, "Image pull complete");
        Ok(())
    }

    async fn create_container(&self, spec: &CreateSpec) -> Result<(), RuntimeError> {
        let body = CreateContainerBody {
            image: spec.image.clone(),
            cmd: spec.cmd.clone(),
            env: spec.env.clone(),
            hostname: spec.hostname.clone(),
            exposed_ports: spec.exposed_ports.clone(),
            host_config: HostConfigBody {
                publish_all_ports: true,
                dns: spec.dns.iter().map(|ip| ip.to_string()).collect(),
                memory: spec.memory,
                cpu_shares: spec.cpu_shares,
            },
            extra: spec.extra.clone(),
        };
        let payload =
            serde_json::to_vec(&body).map_err(|err| RuntimeError::Transport(err.to_string()))?;

        self.api
            .expect_ok(
                Method::POST,
                &format!("/containers/create?name={}", spec.name),
                Some(payload),
                "create container",
            )
            .await?;
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.api
            .expect_ok(
                Method::POST,
                &format!("/containers/{name}/start"),
                None,
                "start container",
            )
            .await?;
        Ok(())
    }

    async fn stop_container(&self, name: &str, grace: Duration) -> Result<(), RuntimeError> {
        self.api
            .expect_ok(
                Method::POST,
                &format!("/containers/{name}/stop?t={}", grace.as_secs()),
                None,
                "stop container",
            )
            .await?;
        Ok(())
    }

    async fn kill_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.api
            .expect_ok(
                Method::POST,
                &format!("/containers/{name}/kill"),
                None,
                "kill container",
            )
            .await?;
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.api
            .expect_ok(
                Method::DELETE,
                &format!("/containers/{name}"),
                None,
                "remove container",
            )
            .await?;
        Ok(())
    }

    async fn inspect_ports(&self, name: &str) -> Result<Vec<PortBinding>, RuntimeError> {
        let body = self
            .api
            .expect_ok(
                Method::GET,
                &format!("/containers/{name}/json"),
                None,
                "inspect container",
            )
            .await?;
        let inspect: InspectResponse = serde_json::from_slice(&body)
            .map_err(|err| RuntimeError::Transport(err.to_string()))?;

        let mut bindings = Vec::new();
        for (exposed, hosts) in inspect.network_settings.ports {
            let Some((port, proto)) = exposed.split_once('/') else {
                continue;
            };
            let Ok(container_port) = port.parse() else {
                continue;
            };
            let host_port = hosts
                .as_deref()
                .and_then(|entries| entries.first())
                .and_then(|entry| entry.host_port.parse().ok());
            bindings.push(PortBinding {
                container_port,
                host_port,
                protocol: proto.to_string(),
            });
        }
        Ok(bindings)
    }
}

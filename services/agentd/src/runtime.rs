//! Container runtime interface and mock implementation.
//!
//! The runtime interface abstracts the container engine's lifecycle
//! operations: listing, image pulls, create/start/stop/kill/remove, and
//! port inspection. The Docker Engine implementation lives in
//! [`crate::docker`]; the mock here stands in for it in tests and keeps the
//! lock/apply and heartbeat logic exercisable without a daemon.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Errors from container runtime operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The named container or image does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation conflicts with the container's current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The engine answered with an error.
    #[error("runtime API error {status}: {message}")]
    Api { status: u16, message: String },

    /// The engine could not be reached.
    #[error("runtime transport error: {0}")]
    Transport(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// One port exposure of a running container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u16,
    /// Host port the engine mapped it to; `None` while unpublished.
    pub host_port: Option<u16>,
    pub protocol: String,
}

/// A container as reported by the engine's list endpoint.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    /// All names the engine knows the container by.
    pub names: Vec<String>,
    pub ports: Vec<PortBinding>,
    pub running: bool,
}

/// An image as reported by the engine's list endpoint.
#[derive(Debug, Clone)]
pub struct ImageSummary {
    pub id: String,
    pub repo_tags: Vec<String>,
}

/// Everything the agent specifies when creating a container.
#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub hostname: String,
    /// `"<port>/<proto>"` keys, engine-shaped empty-object values.
    pub exposed_ports: BTreeMap<String, serde_json::Value>,
    pub memory: i64,
    pub cpu_shares: i64,
    /// Resolvers injected into the container, the agent's own DNS first.
    pub dns: Vec<IpAddr>,
    /// Runtime-opaque fields forwarded verbatim.
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Container engine operations the agent depends on.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError>;

    async fn list_images(&self) -> Result<Vec<ImageSummary>, RuntimeError>;

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError>;

    /// Create a stopped container; all exposed ports will be published to
    /// ephemeral host ports on start.
    async fn create_container(&self, spec: &CreateSpec) -> Result<(), RuntimeError>;

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError>;

    async fn stop_container(&self, name: &str, grace: Duration) -> Result<(), RuntimeError>;

    async fn kill_container(&self, name: &str) -> Result<(), RuntimeError>;

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError>;

    /// Current port bindings of a (running) container.
    async fn inspect_ports(&self, name: &str) -> Result<Vec<PortBinding>, RuntimeError>;
}

#[derive(Debug, Clone)]
struct MockContainer {
    spec: CreateSpec,
    running: bool,
    ports: Vec<PortBinding>,
}

#[derive(Default)]
struct MockState {
    containers: BTreeMap<String, MockContainer>,
    images: Vec<ImageSummary>,
    pulled: Vec<String>,
    ops: Vec<String>,
    next_host_port: u16,
}

/// Mock runtime for tests: tracks container state in memory and records
/// every operation.
pub struct MockRuntime {
    state: Mutex<MockState>,
    fail_pulls: bool,
    fail_starts: bool,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_host_port: 49000,
                ..Default::default()
            }),
            fail_pulls: false,
            fail_starts: false,
        }
    }

    /// A runtime whose image pulls always fail.
    pub fn failing_pulls() -> Self {
        Self {
            fail_pulls: true,
            ..Self::new()
        }
    }

    /// A runtime whose container starts always fail.
    pub fn failing_starts() -> Self {
        Self {
            fail_starts: true,
            ..Self::new()
        }
    }

    /// Pre-seed a locally available image.
    pub fn with_image(self, id: &str, repo_tags: &[&str]) -> Self {
        {
            let mut state = self.state.lock().expect("mock runtime lock");
            state.images.push(ImageSummary {
                id: id.to_string(),
                repo_tags: repo_tags.iter().map(|t| t.to_string()).collect(),
            });
        }
        self
    }

    /// Names of containers currently present (running or not).
    pub fn container_names(&self) -> Vec<String> {
        let state = self.state.lock().expect("mock runtime lock");
        state.containers.keys().cloned().collect()
    }

    pub fn is_running(&self, name: &str) -> bool {
        let state = self.state.lock().expect("mock runtime lock");
        state.containers.get(name).is_some_and(|c| c.running)
    }

    /// Images pulled through this runtime, in order.
    pub fn pulled_images(&self) -> Vec<String> {
        let state = self.state.lock().expect("mock runtime lock");
        state.pulled.clone()
    }

    /// Every operation performed, in order, as `"op name"` strings.
    pub fn operations(&self) -> Vec<String> {
        let state = self.state.lock().expect("mock runtime lock");
        state.ops.clone()
    }

    /// The spec the named container was created from.
    pub fn created_spec(&self, name: &str) -> Option<CreateSpec> {
        let state = self.state.lock().expect("mock runtime lock");
        state.containers.get(name).map(|c| c.spec.clone())
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let state = self.state.lock().expect("mock runtime lock");
        Ok(state
            .containers
            .iter()
            .map(|(name, c)| ContainerSummary {
                id: format!("mock-{name}"),
                names: vec![format!("/{name}")],
                ports: c.ports.clone(),
                running: c.running,
            })
            .collect())
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>, RuntimeError> {
        let state = self.state.lock().expect("mock runtime lock");
        Ok(state.images.clone())
    }

    async fn pull_image(&self, reference: &str) -> Result<(), RuntimeError> {
        if self.fail_pulls {
            return Err(RuntimeError::Api {
                status: 500,
                message: "mock pull failure".to_string(),
            });
        }
        let mut state = self.state.lock().expect("mock runtime lock");
        state.ops.push(format!("pull {reference}"));
        state.pulled.push(reference.to_string());
        state.images.push(ImageSummary {
            id: format!("sha-{reference}"),
            repo_tags: vec![reference.to_string()],
        });
        debug!(reference = %reference, "[MOCK] Pulled image");
        Ok(())
    }

    async fn create_container(&self, spec: &CreateSpec) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().expect("mock runtime lock");
        if state.containers.contains_key(&spec.name) {
            return Err(RuntimeError::Conflict(spec.name.clone()));
        }
        state.ops.push(format!("create {}", spec.name));
        state.containers.insert(
            spec.name.clone(),
            MockContainer {
                spec: spec.clone(),
                running: false,
                ports: Vec::new(),
            },
        );
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        if self.fail_starts {
            return Err(RuntimeError::Api {
                status: 500,
                message: "mock start failure".to_string(),
            });
        }
        let mut state = self.state.lock().expect("mock runtime lock");
        state.ops.push(format!("start {name}"));

        let mut next_port = state.next_host_port;
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        container.running = true;
        container.ports = container
            .spec
            .exposed_ports
            .keys()
            .filter_map(|key| {
                let (port, proto) = key.split_once('/')?;
                let container_port = port.parse().ok()?;
                let binding = PortBinding {
                    container_port,
                    host_port: Some(next_port),
                    protocol: proto.to_string(),
                };
                next_port += 1;
                Some(binding)
            })
            .collect();
        state.next_host_port = next_port;
        Ok(())
    }

    async fn stop_container(&self, name: &str, _grace: Duration) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().expect("mock runtime lock");
        state.ops.push(format!("stop {name}"));
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        container.running = false;
        container.ports.clear();
        Ok(())
    }

    async fn kill_container(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().expect("mock runtime lock");
        state.ops.push(format!("kill {name}"));
        let container = state
            .containers
            .get_mut(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        container.running = false;
        container.ports.clear();
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().expect("mock runtime lock");
        state.ops.push(format!("remove {name}"));
        state
            .containers
            .remove(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        Ok(())
    }

    async fn inspect_ports(&self, name: &str) -> Result<Vec<PortBinding>, RuntimeError> {
        let state = self.state.lock().expect("mock runtime lock");
        state
            .containers
            .get(name)
            .map(|c| c.ports.clone())
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))
    }
}

//! HTTP plumbing for the Docker Engine API.
//!
//! The engine usually listens on a Unix socket (`unix:///var/run/docker.sock`)
//! but may also be exposed over TCP; both transports hang off the same
//! client. Error statuses are classified into the runtime error kinds the
//! lifecycle code dispatches on (404 → not found, 409 → conflict).

use hyper::client::HttpConnector;
use hyper::{body::Buf, Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector};
use tracing::debug;

use super::types::ErrorBody;
use crate::runtime::RuntimeError;

enum Transport {
    Unix {
        socket_path: String,
        client: Client<UnixConnector>,
    },
    Tcp {
        base: String,
        client: Client<HttpConnector>,
    },
}

/// Low-level Docker Engine API client.
pub struct DockerApi {
    transport: Transport,
}

impl DockerApi {
    /// Create a client for `unix://<path>`, `tcp://<host>:<port>`, or
    /// `http://<host>:<port>` endpoints.
    pub fn new(endpoint: &str) -> Result<Self, RuntimeError> {
        let transport = if let Some(path) = endpoint.strip_prefix("unix://") {
            Transport::Unix {
                socket_path: path.to_string(),
                client: Client::unix(),
            }
        } else if let Some(rest) = endpoint.strip_prefix("tcp://") {
            Transport::Tcp {
                base: format!("http://{rest}"),
                client: Client::new(),
            }
        } else if endpoint.starts_with("http://") {
            Transport::Tcp {
                base: endpoint.trim_end_matches('/').to_string(),
                client: Client::new(),
            }
        } else {
            return Err(RuntimeError::Transport(format!(
                "unsupported container runtime endpoint: {endpoint}"
            )));
        };

        Ok(Self { transport })
    }

    /// Perform a request; returns the status and the whole body.
    pub(super) async fn request(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Vec<u8>), RuntimeError> {
        debug!(method = %method, path = path_and_query, "Docker API request");

        let mut builder = Request::builder().method(method).header("Accept", "application/json");
        let body = match body {
            Some(bytes) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(bytes)
            }
            None => Body::empty(),
        };

        let response = match &self.transport {
            Transport::Unix {
                socket_path,
                client,
            } => {
                let uri: hyper::Uri = hyperlocal::Uri::new(socket_path, path_and_query).into();
                let request = builder
                    .uri(uri)
                    .body(body)
                    .map_err(|err| RuntimeError::Transport(err.to_string()))?;
                client.request(request).await
            }
            Transport::Tcp { base, client } => {
                let uri: hyper::Uri = format!("{base}{path_and_query}")
                    .parse()
                    .map_err(|err: hyper::http::uri::InvalidUri| {
                        RuntimeError::Transport(err.to_string())
                    })?;
                let request = builder
                    .uri(uri)
                    .body(body)
                    .map_err(|err| RuntimeError::Transport(err.to_string()))?;
                client.request(request).await
            }
        }
        .map_err(|err| RuntimeError::Transport(err.to_string()))?;

        let status = response.status();
        let mut buf = hyper::body::aggregate(response.into_body())
            .await
            .map_err(|err| RuntimeError::Transport(err.to_string()))?;
        let mut bytes = vec![0u8; buf.remaining()];
        buf.copy_to_slice(&mut bytes);
        Ok((status, bytes))
    }

    /// Run a request expected to answer 2xx (or 304, which the engine uses
    /// for already-started / already-stopped).
    pub(super) async fn expect_ok(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<Vec<u8>>,
        context: &str,
    ) -> Result<Vec<u8>, RuntimeError> {
        let (status, bytes) = self.request(method, path_and_query, body).await?;
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(bytes);
        }
        Err(classify(status, &bytes, context))
    }
}

/// Map an error status to the runtime error kind.
fn classify(status: StatusCode, body: &[u8], context: &str) -> RuntimeError {
    let message = serde_json::from_slice::<ErrorBody>(body)
        .map(|e| e.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string());
    let message = if message.is_empty() {
        context.to_string()
    } else {
        format!("{context}: {message}")
    };

    match status {
        StatusCode::NOT_FOUND => RuntimeError::NotFound(message),
        StatusCode::CONFLICT => RuntimeError::Conflict(message),
        _ => RuntimeError::Api {
            status: status.as_u16(),
            message,
        },
    }
}

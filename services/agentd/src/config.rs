//! Agent configuration: flags with environment fallbacks.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

/// Per-host cluster container agent.
#[derive(Debug, Clone, Parser)]
#[command(name = "daprdockrd", version, about = "Cluster container agent: converges declarative service state into running containers, DNS, and proxy config")]
pub struct Config {
    /// Coordination store endpoints, comma separated.
    #[arg(
        long,
        env = "DAPRDOCKR_ETCD",
        value_delimiter = ',',
        default_value = "http://127.0.0.1:2379"
    )]
    pub etcd: Vec<String>,

    /// Container runtime endpoint (unix:// or tcp://).
    #[arg(long, env = "DAPRDOCKR_DOCKER", default_value = "unix:///var/run/docker.sock")]
    pub docker: String,

    /// Routable host IP override; skips route-table discovery.
    #[arg(long, env = "DAPRDOCKR_HOST_IP")]
    pub host_ip: Option<IpAddr>,

    /// Route table used to discover the routable host IP.
    #[arg(long, env = "DAPRDOCKR_ROUTE_FILE", default_value = "/proc/net/route")]
    pub route_file: PathBuf,

    /// DNS listen address (TCP and UDP).
    #[arg(long, env = "DAPRDOCKR_DNS_ADDR", default_value = "0.0.0.0:53")]
    pub dns_addr: SocketAddr,

    /// Private DNS suffix; containers are named under it.
    #[arg(long, env = "DAPRDOCKR_DOMAIN_SUFFIX", default_value = "container")]
    pub domain_suffix: String,

    /// Resolver configuration for forwarded queries.
    #[arg(long, env = "DAPRDOCKR_RESOLV_CONF", default_value = "/etc/resolv.conf")]
    pub resolv_conf: PathBuf,

    /// Reverse-proxy configuration file (atomic-replaced on change).
    #[arg(long, env = "DAPRDOCKR_NGINX_CONF", default_value = "/tmp/nginx.conf")]
    pub nginx_conf: PathBuf,

    /// Reverse-proxy pid file.
    #[arg(long, env = "DAPRDOCKR_NGINX_PID", default_value = "/tmp/nginx.pid")]
    pub nginx_pid: PathBuf,

    /// Reverse-proxy binary.
    #[arg(long, env = "DAPRDOCKR_NGINX_BIN", default_value = "nginx")]
    pub nginx_bin: String,

    /// TSIG key name; responses to validly signed queries are signed when
    /// both this and the secret are set.
    #[arg(long, env = "DAPRDOCKR_TSIG_NAME")]
    pub tsig_name: Option<String>,

    /// TSIG HMAC-SHA256 secret, base64.
    #[arg(long, env = "DAPRDOCKR_TSIG_SECRET")]
    pub tsig_secret: Option<String>,
}

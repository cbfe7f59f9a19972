//! Reverse-proxy configurator and supervisor.
//!
//! Joins the latest instance snapshot with the latest service configs,
//! renders one upstream block per public hostname (every backend
//! `ip:host-port` pair implementing it) plus a port-80 virtual server, and
//! atomically replaces the nginx config file. The proxy process itself is
//! supervised: started on first need, signalled with SIGHUP on config
//! changes while alive, and restarted after a back-off when it exits.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use askama::Template;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::instance::Instance;
use crate::service::ServiceConfig;
use crate::sink::ErrorSink;
use crate::view::Snapshot;

/// Wait between a proxy death and the restart attempt.
pub const RESTART_BACKOFF: Duration = Duration::from_secs(10);

/// How often the supervisor polls the child for liveness.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// Where the proxy lives and how to run it.
#[derive(Debug, Clone)]
pub struct ProxyPaths {
    pub config: PathBuf,
    pub pid: PathBuf,
    pub binary: String,
}

impl Default for ProxyPaths {
    fn default() -> Self {
        Self {
            config: PathBuf::from("/tmp/nginx.conf"),
            pid: PathBuf::from("/tmp/nginx.pid"),
            binary: "nginx".to_string(),
        }
    }
}

/// One public hostname and the backends serving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    pub name: String,
    pub servers: Vec<String>,
}

#[derive(Template)]
#[template(
    ext = "txt",
    source = "events {
\tuse epoll;
\tworker_connections 51200;
}

http {
\tresolver 127.0.0.1;
{% for site in sites %}
\tupstream {{ site.name }}.lb {
{% for server in site.servers %}\t\tserver {{ server }};
{% endfor %}\t}
\tserver {
\t\tlisten 80;
\t\tserver_name {{ site.name }};
\t\tlocation / {
\t\t\tproxy_pass http://{{ site.name }}.lb;
\t\t}
\t}
{% endfor %}}
"
)]
struct NginxConf<'a> {
    sites: &'a [Site],
}

/// Render the proxy configuration for a set of sites.
pub fn render_config(sites: &[Site]) -> Result<String> {
    NginxConf { sites }.render().context("render proxy config")
}

/// Derive sites from the current instances joined with their configs.
///
/// Instances without addresses, without a config, without a public
/// hostname, or without a mapping for the configured container port do not
/// produce backends.
pub fn sites_from(
    instances: &BTreeMap<String, Instance>,
    configs: &BTreeMap<String, ServiceConfig>,
) -> Vec<Site> {
    let mut by_hostname: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for instance in instances.values() {
        let Some(addr) = instance.addrs.first() else {
            debug!(instance = %instance, "Skipping instance with no known addresses");
            continue;
        };
        let service_key = format!("{}.{}", instance.service, instance.group);
        let Some(config) = configs.get(&service_key) else {
            continue;
        };
        if !config.http.is_configured() {
            continue;
        }
        let Some(port) = instance.port_mappings.get(&config.http.container_port) else {
            debug!(instance = %instance, "Skipping instance without the configured port mapping");
            continue;
        };

        by_hostname
            .entry(config.http.host_name.clone())
            .or_default()
            .push(format!("{addr}:{port}"));
    }

    by_hostname
        .into_iter()
        .map(|(name, mut servers)| {
            servers.sort();
            Site { name, servers }
        })
        .collect()
}

/// Write the config through a temp file and rename into place.
pub async fn write_config_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, content)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("move config into place ({} -> {})", tmp.display(), path.display()))?;
    Ok(())
}

enum ProxyCommand {
    Reload,
}

/// Run the configurator (and its process supervisor) until shutdown.
pub async fn run_proxy(
    paths: ProxyPaths,
    mut instances_rx: mpsc::Receiver<Snapshot<Instance>>,
    mut configs_rx: mpsc::Receiver<Snapshot<ServiceConfig>>,
    errors: ErrorSink,
    mut shutdown: watch::Receiver<bool>,
) {
    // Capacity 1: reloads coalesce, nginx only ever needs the newest config.
    let (reload_tx, reload_rx) = mpsc::channel(1);
    let supervisor = tokio::spawn(supervise(paths.clone(), reload_rx, shutdown.clone()));

    let mut instances: Option<Snapshot<Instance>> = None;
    let mut configs: Option<Snapshot<ServiceConfig>> = None;
    let mut last_rendered: Option<String> = None;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            snapshot = instances_rx.recv() => match snapshot {
                Some(snapshot) => instances = Some(snapshot),
                None => break,
            },
            snapshot = configs_rx.recv() => match snapshot {
                Some(snapshot) => configs = Some(snapshot),
                None => break,
            },
        }

        let (Some(current), Some(desired)) = (&instances, &configs) else {
            continue;
        };

        let sites = sites_from(current, desired);
        let content = match render_config(&sites) {
            Ok(content) => content,
            Err(err) => {
                errors.report(err).await;
                continue;
            }
        };
        if last_rendered.as_deref() == Some(content.as_str()) {
            continue;
        }

        info!(sites = sites.len(), "Updating proxy configuration");
        if let Err(err) = write_config_atomic(&paths.config, &content).await {
            errors.report(err).await;
            continue;
        }
        last_rendered = Some(content);

        // Full buffer means a reload is already pending; that one will pick
        // up this config too.
        let _ = reload_tx.try_send(ProxyCommand::Reload);
    }

    drop(reload_tx);
    let _ = supervisor.await;
    debug!("Proxy configurator exiting");
}

/// Keep the proxy process running and deliver reloads.
async fn supervise(
    paths: ProxyPaths,
    mut commands: mpsc::Receiver<ProxyCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut child: Option<Child> = None;
    let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
    liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }

            _ = liveness.tick() => {
                let exited = child
                    .as_mut()
                    .and_then(|c| c.try_wait().ok().flatten());
                if let Some(status) = exited {
                    warn!(status = %status, "Proxy process died, restarting after back-off");
                    child = None;

                    // Stay responsive to shutdown through the back-off.
                    tokio::select! {
                        _ = tokio::time::sleep(RESTART_BACKOFF) => {
                            child = start_proxy(&paths).await;
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }

            command = commands.recv() => match command {
                None => break,
                Some(ProxyCommand::Reload) => {
                    let alive = child
                        .as_mut()
                        .map(|c| matches!(c.try_wait(), Ok(None)))
                        .unwrap_or(false);
                    let alive_pid = if alive {
                        child.as_ref().and_then(|c| c.id())
                    } else {
                        None
                    };
                    match alive_pid {
                        Some(pid) => {
                            info!("Reloading proxy configuration");
                            if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGHUP) {
                                warn!(error = %err, "Failed to signal proxy, restarting it");
                                child = start_proxy(&paths).await;
                            }
                        }
                        None => {
                            child = start_proxy(&paths).await;
                        }
                    }
                }
            },
        }
    }

    debug!("Proxy supervisor exiting");
}

/// Stop any stale daemon left by a previous run, then launch the proxy in
/// the foreground.
async fn start_proxy(paths: &ProxyPaths) -> Option<Child> {
    let _ = Command::new(&paths.binary)
        .arg("-g")
        .arg(format!("pid {};", paths.pid.display()))
        .arg("-s")
        .arg("stop")
        .status()
        .await;

    info!(binary = %paths.binary, config = %paths.config.display(), "Starting proxy");
    match Command::new(&paths.binary)
        .arg("-c")
        .arg(&paths.config)
        .arg("-g")
        .arg(format!("daemon off; pid {};", paths.pid.display()))
        .spawn()
    {
        Ok(child) => Some(child),
        Err(err) => {
            warn!(error = %err, "Failed to start proxy");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn instance(group: &str, service: &str, ordinal: u32, addr: &str, port: (&str, &str)) -> Instance {
        let mut instance = Instance {
            group: group.into(),
            service: service.into(),
            ordinal,
            addrs: vec![addr.parse::<IpAddr>().unwrap()],
            ..Default::default()
        };
        instance.port_mappings.insert(port.0.into(), port.1.into());
        instance
    }

    fn http_config(group: &str, name: &str, hostname: &str, container_port: &str) -> ServiceConfig {
        let mut config = ServiceConfig {
            group: group.into(),
            name: name.into(),
            instances: 1,
            ..Default::default()
        };
        config.http.host_name = hostname.into();
        config.http.container_port = container_port.into();
        config
    }

    fn keyed<T, F: Fn(&T) -> String>(items: Vec<T>, key: F) -> BTreeMap<String, T> {
        items.into_iter().map(|i| (key(&i), i)).collect()
    }

    #[test]
    fn test_sites_group_by_hostname() {
        let instances = keyed(
            vec![
                instance("g1", "web", 0, "10.0.0.5", ("8080", "49153")),
                instance("g1", "web", 1, "10.0.0.6", ("8080", "49201")),
                instance("g1", "db", 0, "10.0.0.7", ("5432", "49300")),
            ],
            |i| i.qualified_name(),
        );
        let configs = keyed(
            vec![http_config("g1", "web", "x.example", "8080")],
            |c| c.qualified_name(),
        );

        let sites = sites_from(&instances, &configs);
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].name, "x.example");
        assert_eq!(sites[0].servers, vec!["10.0.0.5:49153", "10.0.0.6:49201"]);
    }

    #[test]
    fn test_unexposed_instances_are_skipped() {
        let mut no_addrs = instance("g1", "web", 0, "10.0.0.5", ("8080", "49153"));
        no_addrs.addrs.clear();
        let wrong_port = instance("g1", "web", 1, "10.0.0.6", ("9999", "49201"));

        let instances = keyed(vec![no_addrs, wrong_port], |i| i.qualified_name());
        let configs = keyed(
            vec![http_config("g1", "web", "x.example", "8080")],
            |c| c.qualified_name(),
        );

        assert!(sites_from(&instances, &configs).is_empty());
    }

    #[test]
    fn test_services_without_hostname_are_skipped() {
        let instances = keyed(
            vec![instance("g1", "db", 0, "10.0.0.7", ("5432", "49300"))],
            |i| i.qualified_name(),
        );
        let mut config = http_config("g1", "db", "", "5432");
        config.http.host_name.clear();
        let configs = keyed(vec![config], |c| c.qualified_name());

        assert!(sites_from(&instances, &configs).is_empty());
    }

    #[test]
    fn test_rendered_config_shape() {
        let sites = vec![Site {
            name: "x.example".into(),
            servers: vec!["10.0.0.5:49153".into(), "10.0.0.6:49201".into()],
        }];

        let config = render_config(&sites).unwrap();
        assert!(config.contains("worker_connections 51200;"));
        assert!(config.contains("upstream x.example.lb {"));
        assert!(config.contains("server 10.0.0.5:49153;"));
        assert!(config.contains("server 10.0.0.6:49201;"));
        assert!(config.contains("server_name x.example;"));
        assert!(config.contains("proxy_pass http://x.example.lb;"));
    }

    #[test]
    fn test_empty_sites_still_render_valid_config() {
        let config = render_config(&[]).unwrap();
        assert!(config.contains("events {"));
        assert!(config.contains("http {"));
        assert!(!config.contains("upstream"));
    }

    #[tokio::test]
    async fn test_atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nginx.conf");

        write_config_atomic(&path, "first").await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "first");

        write_config_atomic(&path, "second").await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "second");
        // No leftover temp file.
        assert!(!path.with_extension("tmp").exists());
    }
}

//! DaprDockr agent daemon.
//!
//! Boots the store and runtime clients, wires the views, reconciler,
//! lock/apply path, heartbeat pump, DNS authority, and proxy configurator
//! together over typed channels, then runs until SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use daprdockr_store::{EtcdStore, Store};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use daprdockr_agent::apply::{Applier, ApplyTimings};
use daprdockr_agent::config::Config;
use daprdockr_agent::dns::{self, Upstreams};
use daprdockr_agent::docker::DockerClient;
use daprdockr_agent::heartbeat::{HeartbeatPump, HEARTBEAT_INTERVAL, HEARTBEAT_TTL};
use daprdockr_agent::instance::Instance;
use daprdockr_agent::latest::{fan_out, UPDATE_THROTTLE};
use daprdockr_agent::proxy::{self, ProxyPaths};
use daprdockr_agent::reconciler::{spawn_reconciler, NoDrift, RECONCILE_TICK};
use daprdockr_agent::routes::{self, HostNet};
use daprdockr_agent::runtime::ContainerRuntime;
use daprdockr_agent::service::{ServiceConfig, CONFIG_FULL_SYNC_INTERVAL};
use daprdockr_agent::sink::{self, ErrorSink};
use daprdockr_agent::view::{spawn_view, FULL_SYNC_INTERVAL};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();
    info!(
        etcd = ?config.etcd,
        docker = %config.docker,
        suffix = %config.domain_suffix,
        "Starting DaprDockr agent"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (sink_tx, sink_rx) = mpsc::channel(100);
    let sink_task = tokio::spawn(sink::run_sink(sink_rx));

    // Resolved once; every publisher of instance addresses shares it.
    let host = match routes::discover(&config.route_file, config.host_ip) {
        Ok(host) => host,
        Err(err) => {
            ErrorSink::new("routes", sink_tx.clone()).report(err).await;
            HostNet::default()
        }
    };
    info!(addrs = ?host.addrs, "Host addresses resolved");

    let store: Arc<dyn Store> = Arc::new(EtcdStore::new(config.etcd.clone()));
    // The one fatal constructor: without a runtime client the agent can do
    // nothing useful on this host.
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerClient::new(&config.docker).context("construct container runtime client")?,
    );

    // Views over the two store subtrees.
    let instance_snapshots =
        spawn_view::<Instance>(store.clone(), FULL_SYNC_INTERVAL, shutdown_rx.clone());
    let service_snapshots =
        spawn_view::<ServiceConfig>(store.clone(), CONFIG_FULL_SYNC_INTERVAL, shutdown_rx.clone());

    // Latest-value fan-out: instances feed the reconciler, DNS, and proxy;
    // configs feed the reconciler and proxy.
    let mut instance_feeds = fan_out(instance_snapshots, 3, UPDATE_THROTTLE).into_iter();
    let reconciler_instances = instance_feeds.next().expect("three instance feeds");
    let dns_instances = instance_feeds.next().expect("three instance feeds");
    let proxy_instances = instance_feeds.next().expect("three instance feeds");

    let mut service_feeds = fan_out(service_snapshots, 2, UPDATE_THROTTLE).into_iter();
    let reconciler_services = service_feeds.next().expect("two service feeds");
    let proxy_services = service_feeds.next().expect("two service feeds");

    // Reconcile and apply.
    let deltas = spawn_reconciler(
        reconciler_instances,
        reconciler_services,
        Arc::new(NoDrift),
        RECONCILE_TICK,
        shutdown_rx.clone(),
    );
    let applier = Applier::new(
        store.clone(),
        runtime.clone(),
        host.addrs.clone(),
        &config.domain_suffix,
        ApplyTimings::default(),
    );
    let apply_task = tokio::spawn(applier.run(deltas, shutdown_rx.clone()));

    // Keep this host's instances alive in the store.
    let pump = HeartbeatPump::new(
        store.clone(),
        runtime.clone(),
        host.addrs.clone(),
        &config.domain_suffix,
        HEARTBEAT_INTERVAL,
        HEARTBEAT_TTL,
    );
    let heartbeat_task = tokio::spawn(pump.run(shutdown_rx.clone()));

    // DNS authority plus forwarder.
    let upstreams = match Upstreams::from_resolv_conf(&config.resolv_conf) {
        Ok(upstreams) => upstreams,
        Err(err) => {
            ErrorSink::new("dns", sink_tx.clone()).report(err).await;
            Upstreams::new(Vec::new())
        }
    };
    let tsig = match (&config.tsig_name, &config.tsig_secret) {
        (Some(name), Some(secret)) => match dns::tsig_signer(name, secret) {
            Ok(signer) => Some(signer),
            Err(err) => {
                ErrorSink::new("dns", sink_tx.clone()).report(err).await;
                None
            }
        },
        _ => None,
    };
    let dns_task = tokio::spawn(dns::run_dns_server(
        config.dns_addr,
        config.domain_suffix.clone(),
        dns_instances,
        upstreams,
        tsig,
        ErrorSink::new("dns", sink_tx.clone()),
        shutdown_rx.clone(),
    ));

    // Reverse-proxy configuration and supervision.
    let proxy_task = tokio::spawn(proxy::run_proxy(
        ProxyPaths {
            config: config.nginx_conf.clone(),
            pid: config.nginx_pid.clone(),
            binary: config.nginx_bin.clone(),
        },
        proxy_instances,
        proxy_services,
        ErrorSink::new("proxy", sink_tx.clone()),
        shutdown_rx,
    ));
    drop(sink_tx);

    // Run until asked to stop.
    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received, stopping"),
        _ = sigterm.recv() => info!("SIGTERM received, stopping"),
    }

    let _ = shutdown_tx.send(true);
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = tokio::join!(apply_task, heartbeat_task, dns_task, proxy_task);
    })
    .await;
    if drained.is_err() {
        info!("Some tasks did not stop within the grace period");
    }
    let _ = tokio::time::timeout(Duration::from_secs(1), sink_task).await;

    info!("Agent stopped");
    Ok(())
}

//! Integration tests for the full control loop: views, fan-out, reconciler,
//! lock & apply, and heartbeat pump wired together over the in-memory store
//! and mock runtime: one task topology per simulated host, one shared
//! store per simulated cluster.

use std::sync::Arc;
use std::time::Duration;

use daprdockr_store::{spawn_sweeper, MemoryStore, Store};
use tokio::sync::watch;

use daprdockr_agent::apply::{Applier, ApplyTimings};
use daprdockr_agent::heartbeat::HeartbeatPump;
use daprdockr_agent::instance::Instance;
use daprdockr_agent::latest::fan_out;
use daprdockr_agent::reconciler::{spawn_reconciler, NoDrift};
use daprdockr_agent::runtime::{ContainerRuntime, MockRuntime};
use daprdockr_agent::service::{
    delete_service_config, set_service_config, ServiceConfig,
};
use daprdockr_agent::view::spawn_view;

const SUFFIX: &str = "container";
const CONVERGE_DEADLINE: Duration = Duration::from_secs(5);

/// Heartbeats in these tests carry a short TTL and the store runs a real
/// sweeper, so a record that loses the heartbeat/flatline race expires the
/// way it would in production instead of wedging the cluster.
const TEST_HEARTBEAT_TTL: Duration = Duration::from_secs(1);

/// A shared cluster store with its TTL sweeper running.
fn cluster_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let (sweeper_tx, sweeper_rx) = watch::channel(false);
    std::mem::forget(sweeper_tx);
    spawn_sweeper(store.clone(), Duration::from_millis(50), sweeper_rx);
    store
}

/// One simulated host: its runtime plus the full agent task topology.
struct TestAgent {
    runtime: Arc<MockRuntime>,
    _shutdown: watch::Sender<bool>,
}

fn spawn_agent(store: &Arc<MemoryStore>, host_ip: &str) -> TestAgent {
    let runtime = Arc::new(MockRuntime::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let store_dyn: Arc<dyn Store> = store.clone();

    let instance_snapshots =
        spawn_view::<Instance>(store_dyn.clone(), Duration::from_millis(50), shutdown_rx.clone());
    let service_snapshots = spawn_view::<ServiceConfig>(
        store_dyn.clone(),
        Duration::from_millis(55),
        shutdown_rx.clone(),
    );

    let mut instance_feeds = fan_out(instance_snapshots, 1, Duration::from_millis(5)).into_iter();
    let mut service_feeds = fan_out(service_snapshots, 1, Duration::from_millis(5)).into_iter();

    let deltas = spawn_reconciler(
        instance_feeds.next().unwrap(),
        service_feeds.next().unwrap(),
        Arc::new(NoDrift),
        Duration::from_millis(25),
        shutdown_rx.clone(),
    );

    let timings = ApplyTimings {
        lock_ttl: Duration::from_secs(60),
        heartbeat_ttl: TEST_HEARTBEAT_TTL,
        stop_grace: Duration::from_millis(10),
    };
    let applier = Applier::new(
        store_dyn.clone(),
        runtime.clone(),
        vec![host_ip.parse().unwrap()],
        SUFFIX,
        timings,
    );
    tokio::spawn(applier.run(deltas, shutdown_rx.clone()));

    let pump = HeartbeatPump::new(
        store_dyn,
        runtime.clone(),
        vec![host_ip.parse().unwrap()],
        SUFFIX,
        Duration::from_millis(20),
        TEST_HEARTBEAT_TTL,
    );
    tokio::spawn(pump.run(shutdown_rx));

    TestAgent {
        runtime,
        _shutdown: shutdown_tx,
    }
}

fn web_config(instances: u32) -> ServiceConfig {
    let mut config = ServiceConfig {
        group: "g1".into(),
        name: "web".into(),
        instances,
        ..Default::default()
    };
    config.container.image = "img:1".into();
    config
        .container
        .exposed_ports
        .insert("8080/tcp".into(), serde_json::json!({}));
    config.http.host_name = "x.example".into();
    config.http.container_port = "8080".into();
    config
}

async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + CONVERGE_DEADLINE;
    loop {
        if check() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_single_agent_converges_to_desired_count() {
    let store = cluster_store();
    let agent = spawn_agent(&store, "10.0.0.5");

    set_service_config(store.as_ref(), &web_config(2))
        .await
        .unwrap();

    wait_until("two running containers", || {
        agent.runtime.is_running("0.web.g1.container") && agent.runtime.is_running("1.web.g1.container")
    })
    .await;
    wait_until("two instance records", || store.count_under("instances") == 2).await;

    // Heartbeats replace the lock tokens with real records carrying the
    // host address and port mapping.
    let node = store.get("instances/g1/web/0", false).await.unwrap();
    let record: serde_json::Value = serde_json::from_str(&node.value.unwrap()).unwrap();
    assert_eq!(record["Addrs"][0], "10.0.0.5");
    assert!(record["PortMappings"]["8080"].is_string());
}

#[tokio::test]
async fn test_peer_lock_prevents_local_start() {
    let store = cluster_store();
    // A peer already holds ordinal 0.
    store
        .create_exclusive("instances/g1/web/0", "", Some(Duration::from_secs(60)))
        .await
        .unwrap();

    let agent = spawn_agent(&store, "10.0.0.5");
    set_service_config(store.as_ref(), &web_config(1))
        .await
        .unwrap();

    // Give the loop several reconcile passes to (not) act.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(
        agent.runtime.container_names().is_empty(),
        "agent must not start a container for a peer-locked ordinal"
    );
}

#[tokio::test]
async fn test_two_agents_split_the_ordinals_exclusively() {
    let store = cluster_store();
    let one = spawn_agent(&store, "10.0.0.1");
    let two = spawn_agent(&store, "10.0.0.2");

    set_service_config(store.as_ref(), &web_config(4))
        .await
        .unwrap();

    wait_until("four instance records", || store.count_under("instances") == 4).await;
    wait_until("four containers across the cluster", || {
        one.runtime.container_names().len() + two.runtime.container_names().len() == 4
    })
    .await;

    // Lock exclusivity: no ordinal ran on both hosts.
    let mut all = one.runtime.container_names();
    all.extend(two.runtime.container_names());
    let unique: std::collections::BTreeSet<_> = all.iter().cloned().collect();
    assert_eq!(unique.len(), all.len(), "an ordinal ran on two hosts: {all:?}");
    for ordinal in 0..4 {
        assert!(unique.contains(&format!("{ordinal}.web.g1.container")));
    }
}

#[tokio::test]
async fn test_scale_down_removes_high_ordinals() {
    let store = cluster_store();
    let agent = spawn_agent(&store, "10.0.0.5");

    set_service_config(store.as_ref(), &web_config(3))
        .await
        .unwrap();
    wait_until("three instance records", || store.count_under("instances") == 3).await;

    set_service_config(store.as_ref(), &web_config(1))
        .await
        .unwrap();

    wait_until("one instance record", || store.count_under("instances") == 1).await;
    wait_until("one container", || agent.runtime.container_names().len() == 1).await;
    assert!(agent.runtime.is_running("0.web.g1.container"));
    // The flatlines were explicit deletes, visible immediately.
    assert!(store.get("instances/g1/web/1", false).await.is_err());
    assert!(store.get("instances/g1/web/2", false).await.is_err());
}

#[tokio::test]
async fn test_config_deletion_tears_everything_down() {
    let store = cluster_store();
    let agent = spawn_agent(&store, "10.0.0.5");

    set_service_config(store.as_ref(), &web_config(2))
        .await
        .unwrap();
    wait_until("two instance records", || store.count_under("instances") == 2).await;

    delete_service_config(store.as_ref(), "g1", "web")
        .await
        .unwrap();

    wait_until("no instance records", || store.count_under("instances") == 0).await;
    wait_until("no containers", || agent.runtime.container_names().is_empty()).await;
}

#[tokio::test]
async fn test_crashed_instance_is_replaced_after_expiry() {
    let store = cluster_store();
    let agent = spawn_agent(&store, "10.0.0.5");

    set_service_config(store.as_ref(), &web_config(1))
        .await
        .unwrap();
    wait_until("instance running", || agent.runtime.is_running("0.web.g1.container")).await;

    // Simulate the container dying out from under the agent: the runtime
    // loses it, so the pump stops refreshing, and the record then expires.
    agent
        .runtime
        .kill_container("0.web.g1.container")
        .await
        .unwrap();
    agent
        .runtime
        .remove_container("0.web.g1.container")
        .await
        .unwrap();

    // Stand in for the TTL clock: keep expiring the dead record until the
    // loop notices the gap and brings the ordinal back (an in-flight
    // heartbeat can lose the race with the kill and republish once).
    wait_until("instance restarted", || {
        if agent.runtime.is_running("0.web.g1.container") {
            return true;
        }
        store.expire_now("instances/g1/web/0");
        false
    })
    .await;
    wait_until("record republished", || store.count_under("instances") == 1).await;
}

#[tokio::test]
async fn test_zero_instances_config_starts_nothing() {
    let store = cluster_store();
    let agent = spawn_agent(&store, "10.0.0.5");

    set_service_config(store.as_ref(), &web_config(0))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(agent.runtime.container_names().is_empty());
    assert_eq!(store.count_under("instances"), 0);
}

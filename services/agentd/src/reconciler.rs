//! Reconciliation: diff desired service configs against observed instances.
//!
//! The reconciler joins the latest snapshot of each view and emits the set
//! of required changes: add instance N of service S, or remove it. It
//! holds no other state and performs no side effects; the lock/apply path
//! consumes its deltas. It must not emit until both views have delivered at
//! least once: acting on half the state would propose spurious removes (no
//! configs seen yet) or adds (no instances seen yet) during startup.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::instance::Instance;
use crate::service::ServiceConfig;
use crate::view::Snapshot;

/// Interval between unconditional reconciliation passes. Changes normally
/// ride the view snapshots; the tick retries work that lost a lock race or
/// failed to apply.
pub const RECONCILE_TICK: Duration = Duration::from_secs(15);

const DELTA_BUFFER: usize = 8;

/// What to do about one instance ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Add,
    Remove,
}

impl std::fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Add => f.write_str("add"),
            Self::Remove => f.write_str("remove"),
        }
    }
}

/// One required change, carrying the service config it applies to. For
/// removes of instances whose service no longer exists, the config is
/// identifier-only.
#[derive(Debug, Clone)]
pub struct RequiredChange {
    pub config: ServiceConfig,
    pub op: ChangeOp,
    pub ordinal: u32,
}

/// A reconciliation delta: semantically a set, keyed by instance qualified
/// name for deterministic iteration.
pub type Delta = BTreeMap<String, RequiredChange>;

/// Decides whether a running instance no longer matches its config. The
/// only corrective action is removal; the next pass observes the gap and
/// re-adds.
pub trait DriftDetector: Send + Sync {
    fn drifted(&self, instance: &Instance, config: &ServiceConfig) -> bool;
}

/// Default detector: never fires. The instance record does not carry enough
/// of the container spec to judge drift from the store alone.
pub struct NoDrift;

impl DriftDetector for NoDrift {
    fn drifted(&self, _instance: &Instance, _config: &ServiceConfig) -> bool {
        false
    }
}

/// Compute the delta between desired and current state.
pub fn compute_delta(
    configs: &BTreeMap<String, ServiceConfig>,
    instances: &BTreeMap<String, Instance>,
    drift: &dyn DriftDetector,
) -> Delta {
    let mut delta = Delta::new();

    // Missing or drifted ordinals.
    for config in configs.values() {
        for ordinal in 0..config.instances {
            let key = config.instance_qualified_name(ordinal);
            match instances.get(&key) {
                None => {
                    delta.insert(
                        key,
                        RequiredChange {
                            config: config.clone(),
                            op: ChangeOp::Add,
                            ordinal,
                        },
                    );
                }
                Some(instance) if drift.drifted(instance, config) => {
                    delta.insert(
                        key,
                        RequiredChange {
                            config: config.clone(),
                            op: ChangeOp::Remove,
                            ordinal,
                        },
                    );
                }
                Some(_) => {}
            }
        }
    }

    // Orphaned instances: service gone, or ordinal beyond the desired count.
    for instance in instances.values() {
        let service_key = format!("{}.{}", instance.service, instance.group);
        let config = match configs.get(&service_key) {
            None => ServiceConfig::identifier_only(&instance.group, &instance.service),
            Some(config) if instance.ordinal >= config.instances => config.clone(),
            Some(_) => continue,
        };

        delta.insert(
            instance.qualified_name(),
            RequiredChange {
                config,
                op: ChangeOp::Remove,
                ordinal: instance.ordinal,
            },
        );
    }

    delta
}

/// Spawn the reconciler task; the returned channel yields non-empty deltas.
pub fn spawn_reconciler(
    mut instances_rx: mpsc::Receiver<Snapshot<Instance>>,
    mut configs_rx: mpsc::Receiver<Snapshot<ServiceConfig>>,
    drift: Arc<dyn DriftDetector>,
    tick: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> mpsc::Receiver<Delta> {
    let (tx, rx) = mpsc::channel(DELTA_BUFFER);

    tokio::spawn(async move {
        let mut instances: Option<Snapshot<Instance>> = None;
        let mut configs: Option<Snapshot<ServiceConfig>> = None;
        let mut wake = tokio::time::interval(tick);
        wake.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

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
                _ = wake.tick() => {}
            }

            let (Some(current), Some(desired)) = (&instances, &configs) else {
                debug!("Waiting for both views before creating work");
                continue;
            };

            let delta = compute_delta(desired, current, drift.as_ref());
            if delta.is_empty() {
                debug!("Desired and current state agree, no work posted");
                continue;
            }

            for (key, change) in &delta {
                info!(instance = %key, op = %change.op, "Reconciler posting work");
            }
            if tx.send(delta).await.is_err() {
                break;
            }
        }

        debug!("Reconciler exiting");
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(group: &str, name: &str, instances: u32) -> ServiceConfig {
        ServiceConfig {
            group: group.into(),
            name: name.into(),
            instances,
            ..Default::default()
        }
    }

    fn instance(group: &str, service: &str, ordinal: u32) -> Instance {
        Instance {
            group: group.into(),
            service: service.into(),
            ordinal,
            ..Default::default()
        }
    }

    fn config_map(configs: Vec<ServiceConfig>) -> BTreeMap<String, ServiceConfig> {
        configs
            .into_iter()
            .map(|c| (c.qualified_name(), c))
            .collect()
    }

    fn instance_map(instances: Vec<Instance>) -> BTreeMap<String, Instance> {
        instances
            .into_iter()
            .map(|i| (i.qualified_name(), i))
            .collect()
    }

    #[test]
    fn test_adds_for_missing_ordinals() {
        let configs = config_map(vec![config("g1", "web", 3)]);
        let instances = instance_map(vec![instance("g1", "web", 1)]);

        let delta = compute_delta(&configs, &instances, &NoDrift);
        assert_eq!(delta.len(), 2);
        for key in ["0.web.g1", "2.web.g1"] {
            let change = &delta[key];
            assert_eq!(change.op, ChangeOp::Add);
            assert_eq!(change.config.qualified_name(), "web.g1");
        }
    }

    #[test]
    fn test_removes_beyond_desired_count() {
        let configs = config_map(vec![config("g1", "web", 1)]);
        let instances = instance_map(vec![
            instance("g1", "web", 0),
            instance("g1", "web", 1),
            instance("g1", "web", 2),
        ]);

        let delta = compute_delta(&configs, &instances, &NoDrift);
        assert_eq!(delta.len(), 2);
        assert_eq!(delta["1.web.g1"].op, ChangeOp::Remove);
        assert_eq!(delta["2.web.g1"].op, ChangeOp::Remove);
    }

    #[test]
    fn test_removes_orphans_with_synthesized_config() {
        let configs = config_map(vec![]);
        let instances = instance_map(vec![instance("g1", "web", 0)]);

        let delta = compute_delta(&configs, &instances, &NoDrift);
        let change = &delta["0.web.g1"];
        assert_eq!(change.op, ChangeOp::Remove);
        assert_eq!(change.config.group, "g1");
        assert_eq!(change.config.name, "web");
        assert_eq!(change.config.instances, 0);
    }

    #[test]
    fn test_zero_desired_instances_only_removes() {
        let configs = config_map(vec![config("g1", "web", 0)]);
        let instances = instance_map(vec![instance("g1", "web", 0), instance("g1", "web", 1)]);

        let delta = compute_delta(&configs, &instances, &NoDrift);
        assert_eq!(delta.len(), 2);
        assert!(delta.values().all(|c| c.op == ChangeOp::Remove));
    }

    #[test]
    fn test_converged_state_is_empty_delta() {
        let configs = config_map(vec![config("g1", "web", 2)]);
        let instances = instance_map(vec![instance("g1", "web", 0), instance("g1", "web", 1)]);

        assert!(compute_delta(&configs, &instances, &NoDrift).is_empty());
    }

    #[test]
    fn test_drift_triggers_remove_only() {
        struct AlwaysDrifted;
        impl DriftDetector for AlwaysDrifted {
            fn drifted(&self, _: &Instance, _: &ServiceConfig) -> bool {
                true
            }
        }

        let configs = config_map(vec![config("g1", "web", 1)]);
        let instances = instance_map(vec![instance("g1", "web", 0)]);

        let delta = compute_delta(&configs, &instances, &AlwaysDrifted);
        assert_eq!(delta.len(), 1);
        assert_eq!(delta["0.web.g1"].op, ChangeOp::Remove);
    }

    #[tokio::test]
    async fn test_no_emission_until_both_views_delivered() {
        let (instances_tx, instances_rx) = mpsc::channel(4);
        let (configs_tx, configs_rx) = mpsc::channel(4);
        let (_sd_tx, sd_rx) = watch::channel(false);

        let mut deltas = spawn_reconciler(
            instances_rx,
            configs_rx,
            Arc::new(NoDrift),
            Duration::from_millis(10),
            sd_rx,
        );

        // Configs alone, even across several ticks: nothing.
        configs_tx
            .send(Arc::new(config_map(vec![config("g1", "web", 1)])))
            .await
            .unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(60), deltas.recv())
            .await
            .is_err());

        // The instance view arrives (empty): now work appears.
        instances_tx
            .send(Arc::new(instance_map(vec![])))
            .await
            .unwrap();
        let delta = tokio::time::timeout(Duration::from_secs(1), deltas.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delta["0.web.g1"].op, ChangeOp::Add);
    }

    #[tokio::test]
    async fn test_empty_delta_is_suppressed() {
        let (instances_tx, instances_rx) = mpsc::channel(4);
        let (configs_tx, configs_rx) = mpsc::channel(4);
        let (_sd_tx, sd_rx) = watch::channel(false);

        let mut deltas = spawn_reconciler(
            instances_rx,
            configs_rx,
            Arc::new(NoDrift),
            Duration::from_millis(10),
            sd_rx,
        );

        configs_tx
            .send(Arc::new(config_map(vec![config("g1", "web", 1)])))
            .await
            .unwrap();
        instances_tx
            .send(Arc::new(instance_map(vec![instance("g1", "web", 0)])))
            .await
            .unwrap();

        assert!(tokio::time::timeout(Duration::from_millis(80), deltas.recv())
            .await
            .is_err());
    }
}

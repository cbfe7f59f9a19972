//! Latest-value throttled fan-out.
//!
//! Converts one stream of snapshots into N downstream streams, each of which
//! only ever delivers the newest snapshot, with at least `throttle` between
//! deliveries. Consumers do heavy work per snapshot (reconciliation, DNS
//! table swap, proxy reconfiguration); coalescing a burst into its newest
//! value keeps them from churning through states nobody can observe anyway.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Default minimum interval between deliveries on one downstream channel.
pub const UPDATE_THROTTLE: Duration = Duration::from_secs(2);

/// Capacity of each downstream channel. One slot is enough: a forwarder
/// never sends again before the previous value was taken.
const DOWNSTREAM_BUFFER: usize = 1;

/// Fan `input` out to `n` downstream channels with latest-value semantics.
///
/// Each downstream channel independently receives some prefix of the input
/// ending in the newest value; values superseded while a consumer was busy
/// or throttled are never delivered.
pub fn fan_out<T: Clone + Send + Sync + 'static>(
    mut input: mpsc::Receiver<T>,
    n: usize,
    throttle: Duration,
) -> Vec<mpsc::Receiver<T>> {
    let (slot_tx, slot_rx) = watch::channel(None::<T>);

    // Pump: overwrite the shared slot with whatever is newest. When the
    // input closes, dropping the sender ends every forwarder once it has
    // delivered the final value.
    tokio::spawn(async move {
        while let Some(value) = input.recv().await {
            if slot_tx.send(Some(value)).is_err() {
                break;
            }
        }
        debug!("Fan-out input closed");
    });

    (0..n)
        .map(|_| {
            let mut slot = slot_rx.clone();
            let (tx, rx) = mpsc::channel(DOWNSTREAM_BUFFER);
            tokio::spawn(async move {
                loop {
                    // Wait for a value newer than the last one we took.
                    // `changed` still succeeds for an unseen final value
                    // after the pump is gone.
                    if slot.changed().await.is_err() {
                        break;
                    }
                    let value = match slot.borrow_and_update().clone() {
                        Some(value) => value,
                        None => continue,
                    };
                    if tx.send(value).await.is_err() {
                        break;
                    }
                    tokio::time::sleep(throttle).await;
                }
            });
            rx
        })
        .collect()
}

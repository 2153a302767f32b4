use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::bus::{Bus, SweepReport};

/// Periodically returns expired in-flight messages to their queues and routes
/// those over their receive limit to the dead-letter queue.
///
/// The task holds only a weak reference to the bus and exits when the bus is
/// dropped or disposed.
pub fn spawn_visibility_sweeper(bus: &Arc<Bus>) -> JoinHandle<()> {
    let weak = Arc::downgrade(bus);
    let interval = bus.config().sweep_interval;
    let clock = bus.clock().clone();
    let mut shutdown = bus.shutdown_signal();

    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = clock.sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
            let Some(bus) = weak.upgrade() else { break };
            if bus.is_disposed() {
                break;
            }
            let report = bus.sweep_expired();
            if report != SweepReport::default() {
                debug!(
                    released = report.released,
                    dead_lettered = report.dead_lettered,
                    dropped = report.dropped,
                    "visibility sweep"
                );
            }
        }
        debug!("visibility sweeper stopped");
    })
}

//! The failure-detection loop.
//!
//! One long-lived task wakes on a fixed interval and walks the storage
//! records. A server silent past the failure window is marked failed and
//! inactive without touching its socket; the next send will surface the
//! breakage. Everyone else is probed with a HEARTBEAT through the same
//! per-server worker the router uses, so a probe can never interleave
//! with a metadata command on the wire. The monitor toggles liveness
//! flags only; it never touches file or ACL state.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::naming::Coordinator;
use crate::protocol::message::Message;
use crate::protocol::ops::Opcode;

/// Bounded wait for one probe's reply, queue time included.
const PROBE_WAIT: Duration = Duration::from_secs(3);

/// Starts the monitor for the coordinator's lifetime.
pub fn spawn(coordinator: Arc<Coordinator>) -> JoinHandle<()> {
    tokio::spawn(run(coordinator))
}

async fn run(coordinator: Arc<Coordinator>) {
    let interval = Duration::from_secs(coordinator.config.heartbeat_interval_secs);
    let failure_window = Duration::from_secs(coordinator.config.heartbeat_timeout_secs);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        for (ss_id, handle, age, already_failed) in coordinator.pool.probe_targets() {
            if age > failure_window {
                if !already_failed {
                    warn!(
                        "storage server '{}' silent for {}s, marking failed",
                        ss_id,
                        age.as_secs()
                    );
                    coordinator.pool.mark_failed(&ss_id);
                }
                continue;
            }
            let Some(handle) = handle else {
                continue;
            };
            let probe = Message::request(Opcode::Heartbeat);
            match tokio::time::timeout(PROBE_WAIT, handle.call(probe)).await {
                Ok(Ok(reply)) if reply.status.is_ok() => {
                    if coordinator.pool.heartbeat_ok(&ss_id) {
                        info!("storage server '{}' recovered", ss_id);
                    } else {
                        debug!("heartbeat ok from '{}'", ss_id);
                    }
                }
                Ok(Ok(reply)) => {
                    warn!("heartbeat to '{}' answered {:?}, marking failed", ss_id, reply.status);
                    coordinator.pool.mark_failed_and_close(&ss_id);
                }
                Ok(Err(err)) => {
                    warn!("heartbeat to '{}' failed ({}), marking failed", ss_id, err);
                    coordinator.pool.mark_failed_and_close(&ss_id);
                }
                Err(_) => {
                    warn!("heartbeat to '{}' timed out, marking failed", ss_id);
                    coordinator.pool.mark_failed_and_close(&ss_id);
                }
            }
        }
    }
}

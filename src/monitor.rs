//! Scan outcome reporting.
//!
//! Two seams: [`ScanReporter`] is the mandatory per-node callback the
//! cluster manager feeds topology updates from, and [`MonitoringSink`] is
//! the optional application-facing heartbeat event stream. Both are invoked
//! from [`work`](crate::TopologyScanner::work) on the caller's task, never
//! from attempt tasks, so implementations need no internal locking beyond
//! `Send + Sync`.

use std::time::Duration;

use crate::address::ServerAddress;
use crate::probe::ProbeReply;
use crate::ScanError;

/// Per-node scan outcome callback. One method per outcome.
pub trait ScanReporter: Send + Sync + 'static {
    /// A probe completed and its reply parsed; `rtt` spans the probe write
    /// to the reply read.
    fn server_check_succeeded(&self, node_id: u32, reply: &ProbeReply, rtt: Duration);

    /// The node's attempt race ended without a usable reply.
    fn server_check_failed(&self, node_id: u32, error: &ScanError);

    /// A custom stream initiator refused to produce a stream for the node.
    /// The node is not probed this cycle.
    fn server_setup_failed(&self, node_id: u32, error: &ScanError) {
        self.server_check_failed(node_id, error);
    }
}

/// Application-facing heartbeat events, one `started` per probed node per
/// cycle, paired with exactly one `succeeded` or `failed`.
pub trait MonitoringSink: Send + Sync + 'static {
    fn heartbeat_started(&self, address: &ServerAddress);

    fn heartbeat_succeeded(&self, address: &ServerAddress, reply: &ProbeReply, rtt: Duration);

    fn heartbeat_failed(&self, address: &ServerAddress, error: &ScanError, elapsed: Duration);
}

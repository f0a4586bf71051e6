//! Per-server scanner state — banked connection, DNS cache, failure
//! bookkeeping, and the cooldown predicate.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::address::ServerAddress;
use crate::engine::ProbeConnection;
use crate::ScanError;

/// Post-failure window during which cooldown-obeying scans skip a node.
///
/// SDAM: "This value MUST be 5000 ms, and it MUST NOT be configurable."
pub const COOLDOWN_MS: u64 = 5000;

/// Cached DNS resolution for a node.
///
/// `successful_index` points at the resolved address that most recently won
/// the connection race; next cycle that address is tried alone instead of
/// re-racing the whole list. The bank survives non-terminal sibling
/// failures and is cleared only when the whole cache is invalidated on a
/// terminal node failure.
#[derive(Debug)]
pub(crate) struct DnsCache {
    pub addrs: Vec<SocketAddr>,
    pub resolved_at: Instant,
    pub successful_index: Option<usize>,
}

impl DnsCache {
    pub(crate) fn is_fresh(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.resolved_at) <= ttl
    }
}

/// Mutable per-server scan state, keyed by the cluster-assigned node id.
///
/// Created when the cluster manager registers an endpoint, mutated every
/// scan cycle, and physically destroyed at the start of the cycle *after*
/// it was retired so in-flight callbacks always see a valid node.
pub(crate) struct ScannerNode {
    pub id: u32,
    pub address: ServerAddress,
    /// The winning connection from the last successful cycle, if any.
    pub connection: Option<ProbeConnection>,
    pub last_used: Option<Instant>,
    /// Set on a network error while checking the server; enforces cooldown.
    /// Not set by application-operation failures on the banked connection.
    pub last_failed: Option<Instant>,
    pub last_error: Option<ScanError>,
    pub retired: bool,
    pub dns_cache: Option<DnsCache>,
    /// Mechanisms negotiated for this node; `Some` once negotiation ran,
    /// even if the server returned an empty list.
    pub sasl_supported_mechs: Option<Vec<String>>,
    /// Whether the full handshake document has gone out on this node at
    /// least once; gates the cheap plain probe on the reuse path.
    pub handshake_sent_once: bool,
}

impl ScannerNode {
    pub(crate) fn new(id: u32, address: ServerAddress) -> Self {
        Self {
            id,
            address,
            connection: None,
            last_used: None,
            last_failed: None,
            last_error: None,
            retired: false,
            dns_cache: None,
            sasl_supported_mechs: None,
            handshake_sent_once: false,
        }
    }

    /// True iff the node has a recorded failure and `when` falls strictly
    /// inside the [`COOLDOWN_MS`] window after it. A node that has never
    /// failed, or whose last check succeeded, is never in cooldown.
    pub(crate) fn in_cooldown(&self, when: Instant) -> bool {
        match self.last_failed {
            Some(failed_at) => {
                when.saturating_duration_since(failed_at) < Duration::from_millis(COOLDOWN_MS)
            }
            None => false,
        }
    }

    /// Record a terminal failure: start the cooldown clock and force
    /// re-resolution next cycle.
    pub(crate) fn note_failure(&mut self, error: ScanError, now: Instant) {
        self.last_used = Some(now);
        self.last_failed = Some(now);
        self.last_error = Some(error);
        self.dns_cache = None;
    }

    /// Record a successful check: clear failure state, keep the cooldown
    /// clock stopped.
    pub(crate) fn note_success(&mut self, now: Instant) {
        self.last_used = Some(now);
        self.last_failed = None;
        self.last_error = None;
        self.handshake_sent_once = true;
    }

    /// Drop the banked connection and the per-connection negotiation state.
    pub(crate) fn disconnect(&mut self) {
        if self.connection.take().is_some() {
            self.sasl_supported_mechs = None;
        }
    }

    /// Remember which resolved address won the connection race.
    pub(crate) fn bank_dns_success(&mut self, index: usize) {
        if let Some(cache) = self.dns_cache.as_mut() {
            if index < cache.addrs.len() {
                cache.successful_index = Some(index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node() -> ScannerNode {
        ScannerNode::new(
            1,
            ServerAddress::parse("a.example.com:27017").unwrap(),
        )
    }

    #[test]
    fn new_node_is_not_in_cooldown() {
        let node = test_node();
        assert!(!node.in_cooldown(Instant::now()));
    }

    #[test]
    fn cooldown_window_is_strict() {
        let mut node = test_node();
        let t0 = Instant::now();
        node.note_failure(
            ScanError::connect("connection refused", node.address.canonical()),
            t0,
        );

        assert!(node.in_cooldown(t0 + Duration::from_millis(4999)));
        assert!(!node.in_cooldown(t0 + Duration::from_millis(COOLDOWN_MS)));
    }

    #[test]
    fn success_clears_failure_state() {
        let mut node = test_node();
        let t0 = Instant::now();
        node.note_failure(
            ScanError::connect("connection refused", node.address.canonical()),
            t0,
        );
        node.note_success(t0 + Duration::from_millis(100));

        assert!(node.last_failed.is_none());
        assert!(node.last_error.is_none());
        assert!(!node.in_cooldown(t0 + Duration::from_millis(200)));
        assert!(node.handshake_sent_once);
    }

    #[test]
    fn terminal_failure_invalidates_dns_cache() {
        let mut node = test_node();
        node.dns_cache = Some(DnsCache {
            addrs: vec!["127.0.0.1:27017".parse().unwrap()],
            resolved_at: Instant::now(),
            successful_index: Some(0),
        });
        node.note_failure(
            ScanError::connect("connection refused", node.address.canonical()),
            Instant::now(),
        );
        assert!(node.dns_cache.is_none());
    }

    #[test]
    fn dns_cache_freshness_respects_ttl() {
        let t0 = Instant::now();
        let cache = DnsCache {
            addrs: vec![],
            resolved_at: t0,
            successful_index: None,
        };
        let ttl = Duration::from_millis(500);
        assert!(cache.is_fresh(ttl, t0 + Duration::from_millis(400)));
        assert!(!cache.is_fresh(ttl, t0 + Duration::from_millis(600)));
    }
}

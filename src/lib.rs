//! scout — async topology scanner for database cluster clients.
//!
//! Probes every registered server with a capability handshake over
//! TCP + MessagePack framing, racing staggered connection attempts across a
//! server's resolved addresses and reporting exactly one success or one
//! terminal failure per server per scan cycle.
//!
//! # Quick start
//!
//! 1. Implement [`ScanReporter`] on the type that consumes topology updates
//!    (and optionally [`MonitoringSink`] for application-facing heartbeat
//!    events).
//! 2. Construct a [`ScannerConfig`] and a [`TopologyScanner`].
//! 3. Register servers with [`add`](TopologyScanner::add), then drive scan
//!    cycles: [`start`](TopologyScanner::start) →
//!    [`work`](TopologyScanner::work) → [`finish`](TopologyScanner::finish).
//!
//! The scanner has no internal locking. A `start`/`work`/`finish` sequence
//! is one critical section; callers needing concurrent access wrap the
//! whole scanner in their own mutex or actor.

pub mod address;
pub mod config;
pub mod monitor;
pub mod probe;

mod engine;
mod node;

pub use address::{
    AddressFamily, AddressParseError, ServerAddress, DEFAULT_PORT, HOST_NAME_MAX,
};
pub use config::{ScannerConfig, TlsOptions};
pub use engine::{BoxedStream, ScanStream};
pub use monitor::{MonitoringSink, ScanReporter};
pub use node::COOLDOWN_MS;
pub use probe::{
    ClientMetadata, ClusterTime, ProbeCommand, ProbeReply, APPNAME_MAX_BYTES,
    HANDSHAKE_MAX_BYTES,
};

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::lookup_host;
use tracing::{debug, warn};

use engine::{
    AsyncEngine, AttemptEvent, AttemptOutcome, AttemptSpec, AttemptTarget, ProbeConnection,
    HAPPY_EYEBALLS_STAGGER_MS,
};
use node::{DnsCache, ScannerNode};

// ============================================================================
// Errors
// ============================================================================

/// Coarse classification of a scan error, preserved through aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidAddress,
    NameResolution,
    Connect,
    Timeout,
    Protocol,
    Setup,
}

/// A node-scoped or aggregated scan error.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ScanError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ScanError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn connect(message: &str, host: &str) -> Self {
        Self::new(ErrorKind::Connect, format!("{message} probing '{host}'"))
    }

    pub(crate) fn timeout(host: &str) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("connection timed out probing '{host}'"),
        )
    }

    pub(crate) fn protocol(message: &str, host: &str) -> Self {
        Self::new(ErrorKind::Protocol, format!("{message} from '{host}'"))
    }

    pub(crate) fn name_resolution(message: &str, host: &str) -> Self {
        Self::new(
            ErrorKind::NameResolution,
            format!("failed to resolve '{host}': {message}"),
        )
    }

    pub(crate) fn setup(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Setup, message)
    }
}

impl From<AddressParseError> for ScanError {
    fn from(error: AddressParseError) -> Self {
        Self::new(ErrorKind::InvalidAddress, error.to_string())
    }
}

// ============================================================================
// Stream initiator hook
// ============================================================================

/// Hook that produces a ready byte stream for a node instead of the built-in
/// TCP/unix-socket connect path — used for TLS wrapping, proxying, or test
/// doubles. The hook receives the node's address and the configured TLS
/// options; an error is reported through
/// [`ScanReporter::server_setup_failed`] and the node is not probed that
/// cycle.
pub type StreamInitiator =
    Arc<dyn Fn(&ServerAddress, Option<&TlsOptions>) -> Result<BoxedStream, ScanError> + Send + Sync>;

/// The shared full-handshake document, built lazily on the first full
/// probe. When the metadata does not fit the wire limit the degraded
/// metadata-less variant is cached instead, and the degradation is logged
/// a single time.
enum HandshakeCache {
    Unbuilt,
    Okay(ProbeCommand),
    TooBig(ProbeCommand),
}

/// How a node's setup failed, which decides the reporting path: a `Check`
/// failure had a heartbeat in flight, a `Setup` failure never got that far.
enum SetupError {
    Check(ScanError),
    Setup(ScanError),
}

// ============================================================================
// TopologyScanner
// ============================================================================

/// Orchestrates scan cycles across all registered server nodes.
pub struct TopologyScanner {
    config: ScannerConfig,
    nodes: BTreeMap<u32, ScannerNode>,
    engine: AsyncEngine,
    reporter: Arc<dyn ScanReporter>,
    sink: Option<Arc<dyn MonitoringSink>>,
    initiator: Option<StreamInitiator>,
    cluster_time: Option<ClusterTime>,
    handshake: HandshakeCache,
    dns_cache_ttl: Duration,
    error: Option<ScanError>,
}

impl TopologyScanner {
    /// Create a scanner. Fails if the configured application name exceeds
    /// [`APPNAME_MAX_BYTES`].
    pub fn new(config: ScannerConfig, reporter: Arc<dyn ScanReporter>) -> Result<Self, ScanError> {
        if let Some(appname) = &config.appname {
            if !probe::appname_is_valid(appname) {
                return Err(ScanError::setup(format!(
                    "appname exceeds {APPNAME_MAX_BYTES} bytes"
                )));
            }
        }
        let dns_cache_ttl = Duration::from_millis(config.dns_cache_ttl_ms);
        Ok(Self {
            config,
            nodes: BTreeMap::new(),
            engine: AsyncEngine::new(),
            reporter,
            sink: None,
            initiator: None,
            cluster_time: None,
            handshake: HandshakeCache::Unbuilt,
            dns_cache_ttl,
            error: None,
        })
    }

    pub fn set_monitoring_sink(&mut self, sink: Arc<dyn MonitoringSink>) {
        self.sink = Some(sink);
    }

    pub fn set_stream_initiator(&mut self, initiator: StreamInitiator) {
        self.initiator = Some(initiator);
    }

    /// Unconditionally replace the stored cluster time. The caller is
    /// responsible for only advancing it.
    pub fn set_cluster_time(&mut self, cluster_time: ClusterTime) {
        self.cluster_time = Some(cluster_time);
    }

    /// Override the DNS cache TTL. Intended for tests only; production
    /// callers use [`ScannerConfig::dns_cache_ttl_ms`].
    pub fn set_dns_cache_ttl(&mut self, ttl: Duration) {
        self.dns_cache_ttl = ttl;
    }

    /// Register a server under a caller-assigned id. Fails on a malformed
    /// address or an id that is already registered.
    pub fn add(&mut self, address: &str, id: u32) -> Result<(), ScanError> {
        let address = ServerAddress::parse(address)?;
        if self.nodes.contains_key(&id) {
            return Err(ScanError::setup(format!("node id {id} is already registered")));
        }
        self.nodes.insert(id, ScannerNode::new(id, address));
        Ok(())
    }

    /// Mark a node for removal. Its banked connection is dropped and its
    /// in-flight attempts are cancelled immediately; the node itself is
    /// destroyed at the start of the next cycle so callbacks still running
    /// this cycle see a valid node.
    pub fn retire(&mut self, id: u32) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.retired = true;
            node.disconnect();
            self.engine.cancel_node(id);
        }
    }

    /// Drop every node's banked connection. Node identity, DNS caches, and
    /// failure state survive; the next cycle reconnects from scratch.
    pub fn disconnect_all(&mut self) {
        for node in self.nodes.values_mut() {
            node.disconnect();
        }
    }

    /// Whether a non-retired node with this address is registered.
    pub fn contains(&self, address: &ServerAddress) -> bool {
        self.nodes
            .values()
            .any(|node| !node.retired && node.address == *address)
    }

    /// True iff the node recorded a failure and `when` falls strictly
    /// inside the [`COOLDOWN_MS`] window after it.
    pub fn in_cooldown(&self, id: u32, when: Instant) -> bool {
        self.nodes.get(&id).is_some_and(|node| node.in_cooldown(when))
    }

    /// The aggregate error from the last completed cycle, if any node
    /// failed. See [`finish`](TopologyScanner::finish).
    pub fn last_scan_error(&self) -> Option<&ScanError> {
        self.error.as_ref()
    }

    /// Begin a scan cycle: destroy nodes retired during the previous cycle,
    /// then start setup for every remaining node. With `obey_cooldown` set,
    /// nodes that failed within the last [`COOLDOWN_MS`] are skipped —
    /// used for blocking-style scans, never for pooled monitoring.
    pub async fn start(&mut self, obey_cooldown: bool) {
        self.error = None;
        self.nodes.retain(|_, node| !node.retired);
        let now = Instant::now();

        let ids: Vec<u32> = self.nodes.keys().copied().collect();
        for id in ids {
            let cooling = match self.nodes.get(&id) {
                Some(node) => node.in_cooldown(now),
                None => continue,
            };
            if obey_cooldown && cooling {
                debug!(node = id, "Skipping node in cooldown");
                continue;
            }
            match self.node_setup(id, now).await {
                Ok(()) => {}
                Err(SetupError::Check(error)) => self.fail_node(id, error, Duration::ZERO),
                Err(SetupError::Setup(error)) => {
                    // No heartbeat was attempted, so no heartbeat-failed
                    // event; the distinct setup callback fires instead.
                    if let Some(node) = self.nodes.get_mut(&id) {
                        node.note_failure(error.clone(), now);
                    }
                    debug!(node = id, error = %error, "Node setup failed");
                    self.reporter.server_setup_failed(id, &error);
                }
            }
        }
    }

    /// Drain the attempt engine until no attempts remain pending. All
    /// per-attempt callbacks fire from here, on the caller's task.
    pub async fn work(&mut self) {
        while let Some(event) = self.engine.next_event().await {
            match event {
                AttemptEvent::Connected {
                    attempt,
                    node_id,
                    dns_index,
                } => {
                    // First connected attempt wins the race for its node.
                    self.engine.cancel_node_excluding(node_id, attempt);
                    if let (Some(node), Some(index)) =
                        (self.nodes.get_mut(&node_id), dns_index)
                    {
                        node.bank_dns_success(index);
                    }
                }
                AttemptEvent::Finished {
                    node_id,
                    delay_ms,
                    outcome,
                    ..
                } => match outcome {
                    AttemptOutcome::Success {
                        connection,
                        reply,
                        rtt,
                    } => self.complete_node(node_id, connection, reply, rtt),
                    AttemptOutcome::Error { error, elapsed } => {
                        self.attempt_failed(node_id, error, elapsed, delay_ms)
                    }
                    AttemptOutcome::Timeout { elapsed } => {
                        let host = self
                            .nodes
                            .get(&node_id)
                            .map(|node| node.address.canonical().to_string())
                            .unwrap_or_default();
                        self.attempt_failed(node_id, ScanError::timeout(&host), elapsed, delay_ms)
                    }
                    AttemptOutcome::Cancelled => {}
                },
            }
        }
    }

    /// Close the cycle: concatenate every node's last error message into one
    /// aggregate scanner error (kind taken from the last erroring node in id
    /// order), then delete retired nodes.
    pub fn finish(&mut self) {
        let mut message = String::new();
        let mut kind = None;
        for node in self.nodes.values() {
            if let Some(error) = &node.last_error {
                if !message.is_empty() {
                    message.push(' ');
                }
                message.push_str(&error.message);
                kind = Some(error.kind);
            }
        }
        self.error = kind.map(|kind| ScanError::new(kind, message));
        self.nodes.retain(|_, node| !node.retired);
    }

    // ------------------------------------------------------------------------
    // Cycle internals
    // ------------------------------------------------------------------------

    async fn node_setup(&mut self, id: u32, now: Instant) -> Result<(), SetupError> {
        let (address, reuse, plain, negotiate) = match self.nodes.get(&id) {
            Some(node) if !node.retired => (
                node.address.clone(),
                node.connection.is_some(),
                // The cheap plain probe is only valid on a connection that
                // already carried the full handshake.
                node.connection.is_some() && node.handshake_sent_once,
                // Mechanism negotiation rides the full handshake only
                // until the node has negotiated once.
                self.config.negotiate_mechs_for.is_some()
                    && node.sasl_supported_mechs.is_none(),
            ),
            _ => return Ok(()),
        };
        let payload = self
            .encode_probe(plain, negotiate)
            .map_err(SetupError::Setup)?;
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let host = address.canonical().to_string();

        // Reuse path: probe the banked connection, no DNS, no racing.
        if reuse {
            let Some(connection) = self.nodes.get_mut(&id).and_then(|n| n.connection.take())
            else {
                return Ok(());
            };
            self.emit_started(&address);
            self.engine.submit(AttemptSpec {
                node_id: id,
                dns_index: None,
                target: AttemptTarget::Stream(connection),
                host,
                payload,
                initial_delay: Duration::ZERO,
                timeout,
            });
            return Ok(());
        }

        // Custom initiator path: the hook owns connection establishment.
        // The heartbeat only counts as started once the hook hands back a
        // stream.
        if let Some(initiator) = self.initiator.clone() {
            let stream =
                initiator(&address, self.config.tls.as_ref()).map_err(SetupError::Setup)?;
            self.emit_started(&address);
            self.engine.submit(AttemptSpec {
                node_id: id,
                dns_index: None,
                target: AttemptTarget::Stream(engine::frame_stream(stream)),
                host,
                payload,
                initial_delay: Duration::ZERO,
                timeout,
            });
            return Ok(());
        }

        if address.family() == AddressFamily::UnixSocket {
            self.emit_started(&address);
            #[cfg(unix)]
            {
                self.engine.submit(AttemptSpec {
                    node_id: id,
                    dns_index: None,
                    target: AttemptTarget::UnixPath(address.host().to_string()),
                    host,
                    payload,
                    initial_delay: Duration::ZERO,
                    timeout,
                });
                return Ok(());
            }
            #[cfg(not(unix))]
            {
                return Err(SetupError::Check(ScanError::connect(
                    "unix domain sockets are not supported on this platform",
                    address.canonical(),
                )));
            }
        }

        // Built-in TCP path: heartbeat starts before resolution so DNS
        // failures surface as heartbeat failures.
        self.emit_started(&address);
        let (resolved, banked) = self
            .resolve(id, &address, now)
            .await
            .map_err(SetupError::Check)?;

        if let Some((index, addr)) =
            banked.and_then(|index| resolved.get(index).map(|addr| (index, *addr)))
        {
            // Last cycle's winner gets an exclusive, immediate attempt.
            self.engine.submit(AttemptSpec {
                node_id: id,
                dns_index: Some(index),
                target: AttemptTarget::Addr(addr),
                host,
                payload,
                initial_delay: Duration::ZERO,
                timeout,
            });
        } else {
            for (index, addr) in resolved.iter().enumerate() {
                self.engine.submit(AttemptSpec {
                    node_id: id,
                    dns_index: Some(index),
                    target: AttemptTarget::Addr(*addr),
                    host: host.clone(),
                    payload: payload.clone(),
                    initial_delay: Duration::from_millis(
                        index as u64 * HAPPY_EYEBALLS_STAGGER_MS,
                    ),
                    timeout,
                });
            }
        }
        Ok(())
    }

    /// Resolve a node's address, preferring a fresh DNS cache entry (and
    /// its banked winning index) over a new lookup.
    async fn resolve(
        &mut self,
        id: u32,
        address: &ServerAddress,
        now: Instant,
    ) -> Result<(Vec<SocketAddr>, Option<usize>), ScanError> {
        if let Some(cache) = self.nodes.get(&id).and_then(|node| node.dns_cache.as_ref()) {
            if cache.is_fresh(self.dns_cache_ttl, now) {
                return Ok((cache.addrs.clone(), cache.successful_index));
            }
        }

        let mut addrs: Vec<SocketAddr> = lookup_host((address.host(), address.port()))
            .await
            .map_err(|e| ScanError::name_resolution(&e.to_string(), address.canonical()))?
            .collect();
        if address.family() == AddressFamily::Ipv6 {
            addrs.retain(|addr| addr.is_ipv6());
        }
        if addrs.is_empty() {
            return Err(ScanError::name_resolution(
                "no suitable addresses resolved",
                address.canonical(),
            ));
        }
        debug!(node = id, host = address.canonical(), count = addrs.len(), "Resolved node");

        if let Some(node) = self.nodes.get_mut(&id) {
            node.dns_cache = Some(DnsCache {
                addrs: addrs.clone(),
                resolved_at: now,
                successful_index: None,
            });
        }
        Ok((addrs, None))
    }

    fn encode_probe(&mut self, plain: bool, negotiate: bool) -> Result<Vec<u8>, ScanError> {
        let mut command = if plain {
            probe::plain_probe()
        } else {
            let mut command = match &self.handshake {
                HandshakeCache::Okay(command) | HandshakeCache::TooBig(command) => {
                    command.clone()
                }
                HandshakeCache::Unbuilt => {
                    let (command, fits) = probe::full_probe(
                        self.config.appname.as_deref(),
                        &self.config.compressors,
                    );
                    if fits {
                        self.handshake = HandshakeCache::Okay(command.clone());
                    } else {
                        warn!(
                            limit = HANDSHAKE_MAX_BYTES,
                            "Handshake metadata exceeds the wire limit; probing without client metadata"
                        );
                        self.handshake = HandshakeCache::TooBig(command.clone());
                    }
                    command
                }
            };
            if negotiate {
                command.sasl_supported_mechs = self.config.negotiate_mechs_for.clone();
            }
            command
        };
        command.cluster_time = self.cluster_time.clone();
        rmp_serde::to_vec(&command)
            .map_err(|e| ScanError::setup(format!("failed to encode probe: {e}")))
    }

    fn emit_started(&self, address: &ServerAddress) {
        if let Some(sink) = &self.sink {
            sink.heartbeat_started(address);
        }
    }

    /// A probe exchange completed for a node's winning attempt.
    fn complete_node(
        &mut self,
        id: u32,
        connection: ProbeConnection,
        reply: ProbeReply,
        rtt: Duration,
    ) {
        let now = Instant::now();
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        // A retired node's result is discarded; a second winner (a sibling
        // that completed before its cancellation landed) is dropped.
        if node.retired || node.connection.is_some() {
            return;
        }
        if self.config.negotiate_mechs_for.is_some() && node.sasl_supported_mechs.is_none() {
            node.sasl_supported_mechs =
                Some(reply.sasl_supported_mechs.clone().unwrap_or_default());
        }
        node.connection = Some(connection);
        node.note_success(now);
        let address = node.address.clone();

        debug!(node = id, rtt_ms = rtt.as_millis() as u64, "Server check succeeded");
        if let Some(sink) = &self.sink {
            sink.heartbeat_succeeded(&address, &reply, rtt);
        }
        self.reporter.server_check_succeeded(id, &reply, rtt);
    }

    /// One attempt failed. Only terminal for the node when nothing has won
    /// and no sibling is still pending; otherwise the laggards jumpstart.
    fn attempt_failed(&mut self, id: u32, error: ScanError, elapsed: Duration, delay_ms: u64) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        if node.retired {
            return;
        }
        let pending = self.engine.count_for_node(id);
        if node.connection.is_some() || pending > 0 {
            if pending > 0 {
                self.engine.jumpstart_node(id, delay_ms);
            }
            debug!(node = id, error = %error, "Attempt failed; siblings still racing");
            return;
        }
        self.fail_node(id, error, elapsed);
    }

    /// Terminal failure for a node this cycle: cooldown starts, DNS cache
    /// is invalidated, and both reporting seams fire.
    fn fail_node(&mut self, id: u32, error: ScanError, elapsed: Duration) {
        let now = Instant::now();
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        node.note_failure(error.clone(), now);
        let address = node.address.clone();

        debug!(node = id, error = %error, "Server check failed");
        if let Some(sink) = &self.sink {
            sink.heartbeat_failed(&address, &error, elapsed);
        }
        self.reporter.server_check_failed(id, &error);
    }
}

impl fmt::Debug for TopologyScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopologyScanner")
            .field("nodes", &self.nodes.len())
            .field("pending_attempts", &self.engine.pending())
            .finish()
    }
}

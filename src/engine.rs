//! Non-blocking connection-attempt scheduler.
//!
//! Every connection attempt is a background task owning its own stream,
//! reporting milestones through a shared event channel — the scanner drains
//! that channel in [`work`](crate::TopologyScanner::work). Attempts carry an
//! adjustable start delay (for happy-eyeballs staggering and jumpstart) and
//! a cancellation token checked before every state transition, so a
//! sibling's success or a node's retirement stops them without tearing down
//! the engine.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::probe::ProbeReply;
use crate::ScanError;

/// Stagger between racing connection attempts to sibling DNS results.
pub(crate) const HAPPY_EYEBALLS_STAGGER_MS: u64 = 250;

/// Upper bound on a single framed probe reply.
const MAX_MESSAGE_BYTES: usize = 48 * 1024 * 1024;

/// Byte stream usable for a probe exchange. Blanket-implemented, so TCP and
/// unix-socket streams, in-memory duplexes, and TLS wrappers all qualify.
pub trait ScanStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ScanStream for T {}

/// An owned, type-erased stream as produced by a stream initiator.
pub type BoxedStream = Box<dyn ScanStream>;

/// A probe-ready connection: framed MessagePack over a byte stream.
pub(crate) type ProbeConnection = Framed<BoxedStream, LengthDelimitedCodec>;

/// Wrap a raw stream in the probe framing.
pub(crate) fn frame_stream(stream: BoxedStream) -> ProbeConnection {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_MESSAGE_BYTES)
        .new_codec();
    Framed::new(stream, codec)
}

/// Opaque handle identifying one in-flight attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct AttemptId(u64);

/// What an attempt connects to.
pub(crate) enum AttemptTarget {
    /// Open a fresh TCP connection to a resolved address.
    Addr(SocketAddr),
    /// Connect to a unix domain socket path.
    #[cfg(unix)]
    UnixPath(String),
    /// Probe an already-established connection (reuse or custom initiator).
    Stream(ProbeConnection),
}

pub(crate) struct AttemptSpec {
    pub node_id: u32,
    /// Index into the node's resolved-address list, when racing DNS results.
    pub dns_index: Option<usize>,
    pub target: AttemptTarget,
    /// Canonical host form, for error messages.
    pub host: String,
    /// Encoded probe command.
    pub payload: Vec<u8>,
    pub initial_delay: Duration,
    pub timeout: Duration,
}

/// Milestones delivered to the scanner's event loop.
pub(crate) enum AttemptEvent {
    /// The attempt reached the send phase (socket connected). The attempt
    /// stays live; a terminal `Finished` event follows.
    Connected {
        attempt: AttemptId,
        node_id: u32,
        dns_index: Option<usize>,
    },
    Finished {
        attempt: AttemptId,
        node_id: u32,
        /// The attempt's scheduled delay (ms) when it finished, for
        /// jumpstart comparisons against still-pending siblings.
        delay_ms: u64,
        outcome: AttemptOutcome,
    },
}

pub(crate) enum AttemptOutcome {
    Success {
        connection: ProbeConnection,
        reply: ProbeReply,
        rtt: Duration,
    },
    Error {
        error: ScanError,
        elapsed: Duration,
    },
    Timeout {
        elapsed: Duration,
    },
    /// The attempt was cancelled by a sibling's success or by retirement;
    /// no further events follow and the scanner ignores this one.
    Cancelled,
}

struct AttemptHandle {
    node_id: u32,
    delay_ms: Arc<AtomicU64>,
    reschedule: Arc<Notify>,
    cancel: CancellationToken,
}

/// Multiplexes every pending connection attempt for one scanner.
pub(crate) struct AsyncEngine {
    events_tx: mpsc::UnboundedSender<AttemptEvent>,
    events_rx: mpsc::UnboundedReceiver<AttemptEvent>,
    live: HashMap<AttemptId, AttemptHandle>,
    next_id: u64,
}

impl AsyncEngine {
    pub(crate) fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            events_tx,
            events_rx,
            live: HashMap::new(),
            next_id: 0,
        }
    }

    /// Schedule a connection attempt. Must be called within a tokio runtime.
    pub(crate) fn submit(&mut self, spec: AttemptSpec) -> AttemptId {
        self.next_id += 1;
        let attempt = AttemptId(self.next_id);

        let delay_ms = Arc::new(AtomicU64::new(spec.initial_delay.as_millis() as u64));
        let reschedule = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        self.live.insert(
            attempt,
            AttemptHandle {
                node_id: spec.node_id,
                delay_ms: Arc::clone(&delay_ms),
                reschedule: Arc::clone(&reschedule),
                cancel: cancel.clone(),
            },
        );

        let tx = self.events_tx.clone();
        tokio::spawn(run_attempt(
            attempt, spec, delay_ms, reschedule, cancel, tx,
        ));

        attempt
    }

    /// Number of attempts still in flight.
    pub(crate) fn pending(&self) -> usize {
        self.live.len()
    }

    pub(crate) fn count_for_node(&self, node_id: u32) -> usize {
        self.live.values().filter(|h| h.node_id == node_id).count()
    }

    /// Receive the next attempt milestone. Returns `None` once no attempts
    /// remain in flight. Terminal events remove the attempt from the live
    /// set before being handed to the caller.
    pub(crate) async fn next_event(&mut self) -> Option<AttemptEvent> {
        loop {
            if self.live.is_empty() {
                return None;
            }
            // The engine owns a sender, so recv() cannot see a closed channel.
            let event = self.events_rx.recv().await?;
            match &event {
                AttemptEvent::Connected { attempt, .. } => {
                    // A cancel that raced this milestone wins: suppressing
                    // the late Connected keeps two near-simultaneous
                    // winners from cancelling each other. The attempt
                    // still delivers its terminal event.
                    let cancelled = self
                        .live
                        .get(attempt)
                        .map_or(true, |handle| handle.cancel.is_cancelled());
                    if cancelled {
                        continue;
                    }
                }
                AttemptEvent::Finished { attempt, .. } => {
                    self.live.remove(attempt);
                }
            }
            return Some(event);
        }
    }

    /// Cancel every in-flight attempt for a node. Idempotent; cancelling an
    /// attempt that already finished is a no-op.
    pub(crate) fn cancel_node(&self, node_id: u32) {
        self.cancel_where(|h, _| h.node_id == node_id);
    }

    /// Cancel a node's attempts except the one that just won the race.
    pub(crate) fn cancel_node_excluding(&self, node_id: u32, keep: AttemptId) {
        self.cancel_where(|h, id| h.node_id == node_id && *id != keep);
    }

    fn cancel_where(&self, pred: impl Fn(&AttemptHandle, &AttemptId) -> bool) {
        for (id, handle) in &self.live {
            if pred(handle, id) {
                handle.cancel.cancel();
            }
        }
    }

    /// A sibling scheduled before the others failed: pull each later
    /// sibling's start forward by one stagger increment (floored at zero)
    /// so the node doesn't wait out the full stagger after a known-bad
    /// address.
    pub(crate) fn jumpstart_node(&self, node_id: u32, failed_delay_ms: u64) {
        for handle in self.live.values() {
            if handle.node_id != node_id {
                continue;
            }
            let current = handle.delay_ms.load(Ordering::Acquire);
            if failed_delay_ms < current {
                handle
                    .delay_ms
                    .store(current.saturating_sub(HAPPY_EYEBALLS_STAGGER_MS), Ordering::Release);
                handle.reschedule.notify_one();
            }
        }
    }
}

async fn run_attempt(
    attempt: AttemptId,
    spec: AttemptSpec,
    delay_ms: Arc<AtomicU64>,
    reschedule: Arc<Notify>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<AttemptEvent>,
) {
    let node_id = spec.node_id;
    let submitted = Instant::now();

    // Adjustable stagger delay: re-read the deadline whenever a jumpstart
    // pulls it forward.
    loop {
        let wake_at = submitted + Duration::from_millis(delay_ms.load(Ordering::Acquire));
        if Instant::now() >= wake_at {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep_until(wake_at.into()) => {}
            _ = reschedule.notified() => {}
            _ = cancel.cancelled() => {
                let _ = tx.send(AttemptEvent::Finished {
                    attempt,
                    node_id,
                    delay_ms: delay_ms.load(Ordering::Acquire),
                    outcome: AttemptOutcome::Cancelled,
                });
                return;
            }
        }
    }

    let started = Instant::now();
    let exchange = exchange_probe(
        attempt,
        node_id,
        spec.dns_index,
        spec.target,
        &spec.host,
        spec.payload,
        &tx,
    );

    let outcome = tokio::select! {
        _ = cancel.cancelled() => AttemptOutcome::Cancelled,
        result = tokio::time::timeout(spec.timeout, exchange) => match result {
            Err(_) => AttemptOutcome::Timeout { elapsed: started.elapsed() },
            Ok(Ok((connection, reply, rtt))) => AttemptOutcome::Success { connection, reply, rtt },
            Ok(Err(error)) => AttemptOutcome::Error { error, elapsed: started.elapsed() },
        },
    };

    let _ = tx.send(AttemptEvent::Finished {
        attempt,
        node_id,
        delay_ms: delay_ms.load(Ordering::Acquire),
        outcome,
    });
}

async fn exchange_probe(
    attempt: AttemptId,
    node_id: u32,
    dns_index: Option<usize>,
    target: AttemptTarget,
    host: &str,
    payload: Vec<u8>,
    tx: &mpsc::UnboundedSender<AttemptEvent>,
) -> Result<(ProbeConnection, ProbeReply, Duration), ScanError> {
    let mut connection = match target {
        AttemptTarget::Addr(addr) => {
            debug!(%addr, host, "Opening probe connection");
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| ScanError::connect(&e.to_string(), host))?;
            stream
                .set_nodelay(true)
                .map_err(|e| ScanError::connect(&e.to_string(), host))?;
            frame_stream(Box::new(stream))
        }
        #[cfg(unix)]
        AttemptTarget::UnixPath(path) => {
            debug!(path = %path, "Opening unix-socket probe connection");
            let stream = tokio::net::UnixStream::connect(&path)
                .await
                .map_err(|e| ScanError::connect(&e.to_string(), host))?;
            frame_stream(Box::new(stream))
        }
        AttemptTarget::Stream(connection) => connection,
    };

    // Socket is ready for the probe: report the connected milestone so the
    // scanner can cancel this attempt's siblings.
    let _ = tx.send(AttemptEvent::Connected {
        attempt,
        node_id,
        dns_index,
    });

    connection
        .send(Bytes::from(payload))
        .await
        .map_err(|_| ScanError::connect("failed to send probe", host))?;
    let sent_at = Instant::now();

    match connection.next().await {
        Some(Ok(frame)) => {
            let reply: ProbeReply = rmp_serde::from_slice(&frame)
                .map_err(|e| ScanError::protocol(&format!("invalid probe reply: {e}"), host))?;
            Ok((connection, reply, sent_at.elapsed()))
        }
        Some(Err(_)) | None => Err(ScanError::connect("server closed connection", host)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn far_future_spec(node_id: u32, dns_index: usize, delay_ms: u64) -> AttemptSpec {
        AttemptSpec {
            node_id,
            dns_index: Some(dns_index),
            // Discard port: nothing answers, but the attempts never get
            // that far within the test.
            target: AttemptTarget::Addr("127.0.0.1:9".parse().unwrap()),
            host: "example:9".to_string(),
            payload: Vec::new(),
            initial_delay: Duration::from_millis(delay_ms),
            timeout: Duration::from_secs(1),
        }
    }

    fn delay_of(engine: &AsyncEngine, attempt: AttemptId) -> u64 {
        engine.live[&attempt].delay_ms.load(Ordering::Acquire)
    }

    async fn drain(engine: &mut AsyncEngine) {
        while engine.next_event().await.is_some() {}
    }

    /// Attempts staggered 0 / +250 / +500 past a common base: when the
    /// first fails, each later sibling moves up by one stagger increment.
    #[tokio::test]
    async fn jumpstart_accelerates_later_siblings() {
        let mut engine = AsyncEngine::new();
        let base = 60_000;
        let _first = engine.submit(far_future_spec(7, 0, base));
        let second = engine.submit(far_future_spec(7, 1, base + 250));
        let third = engine.submit(far_future_spec(7, 2, base + 500));

        engine.jumpstart_node(7, base);

        assert_eq!(delay_of(&engine, second), base);
        assert_eq!(delay_of(&engine, third), base + 250);

        engine.cancel_node(7);
        drain(&mut engine).await;
    }

    /// A sibling already scheduled earlier than the failed attempt keeps
    /// its slot; acceleration floors at zero.
    #[tokio::test]
    async fn jumpstart_floors_at_zero_and_skips_earlier_siblings() {
        let mut engine = AsyncEngine::new();
        let early = engine.submit(far_future_spec(3, 0, 50));
        let late = engine.submit(far_future_spec(3, 1, 100));

        engine.jumpstart_node(3, 60);

        assert_eq!(delay_of(&engine, early), 50);
        assert_eq!(delay_of(&engine, late), 0);

        engine.cancel_node(3);
        drain(&mut engine).await;
    }

    /// Jumpstart only touches the failed attempt's own node.
    #[tokio::test]
    async fn jumpstart_ignores_other_nodes() {
        let mut engine = AsyncEngine::new();
        let other = engine.submit(far_future_spec(2, 0, 60_500));

        engine.jumpstart_node(1, 0);
        assert_eq!(delay_of(&engine, other), 60_500);

        engine.cancel_node(2);
        drain(&mut engine).await;
    }

    #[tokio::test]
    async fn cancellation_is_idempotent_and_drains_to_empty() {
        let mut engine = AsyncEngine::new();
        engine.submit(far_future_spec(1, 0, 60_000));
        engine.submit(far_future_spec(1, 1, 60_250));
        assert_eq!(engine.pending(), 2);
        assert_eq!(engine.count_for_node(1), 2);

        engine.cancel_node(1);
        engine.cancel_node(1);
        while let Some(event) = engine.next_event().await {
            // Both attempts were still in their stagger delay, so the only
            // terminal outcome is cancellation.
            if let AttemptEvent::Finished { outcome, .. } = event {
                assert!(matches!(outcome, AttemptOutcome::Cancelled));
            }
        }

        assert_eq!(engine.pending(), 0);
        assert!(engine.next_event().await.is_none());
    }
}

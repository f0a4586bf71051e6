//! Shared test helpers for scout integration tests.
//!
//! Provides a localhost probe server speaking the framed MessagePack
//! protocol, plus recording implementations of the reporting seams.

// Each test binary compiles this module independently and only uses a subset
// of exports, so unused items are expected.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use scout::{
    MonitoringSink, ProbeCommand, ProbeReply, ScanError, ScanReporter, ServerAddress,
};

/// Install a logging subscriber once so failing tests print scan logs.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// ProbeServer — fake server answering capability probes
// ============================================================================

/// A localhost TCP server that decodes probe commands and answers each with
/// a canned reply. Connections are kept open so banked-connection reuse
/// across scan cycles exercises the same socket.
pub struct ProbeServer {
    pub port: u16,
    received: Arc<Mutex<Vec<ProbeCommand>>>,
    _accept: JoinHandle<()>,
}

impl ProbeServer {
    pub async fn start(reply: ProbeReply) -> Self {
        Self::start_inner(reply, false).await
    }

    /// Like [`start`](Self::start), but each connection is dropped after a
    /// single reply, so banked connections die between scan cycles.
    pub async fn start_single_reply(reply: ProbeReply) -> Self {
        Self::start_inner(reply, true).await
    }

    async fn start_inner(reply: ProbeReply, single_reply: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));

        let received_clone = Arc::clone(&received);
        let accept = tokio::spawn(async move {
            loop {
                let (socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let reply = reply.clone();
                let received = Arc::clone(&received_clone);
                tokio::spawn(async move {
                    let mut framed = Framed::new(socket, LengthDelimitedCodec::new());
                    while let Some(Ok(frame)) = framed.next().await {
                        let command: ProbeCommand = rmp_serde::from_slice(&frame).unwrap();
                        received.lock().unwrap().push(command);
                        let bytes = rmp_serde::to_vec(&reply).unwrap();
                        if framed.send(Bytes::from(bytes)).await.is_err() {
                            return;
                        }
                        if single_reply {
                            return;
                        }
                    }
                });
            }
        });

        Self {
            port,
            received,
            _accept: accept,
        }
    }

    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// Every probe command decoded so far, in arrival order.
    pub fn received(&self) -> Vec<ProbeCommand> {
        self.received.lock().unwrap().clone()
    }
}

/// A plain healthy-primary reply.
pub fn ok_reply() -> ProbeReply {
    ProbeReply {
        ok: true,
        is_writable_primary: true,
        hosts: vec!["127.0.0.1:27017".to_string()],
        sasl_supported_mechs: None,
        cluster_time: None,
    }
}

/// Bind to port 0 and return the OS-assigned port, leaving it closed so
/// connections to it are refused.
pub fn refused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// Recording seams
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ReporterEvent {
    Succeeded { id: u32, primary: bool },
    Failed { id: u32, message: String },
    SetupFailed { id: u32, message: String },
}

/// `ScanReporter` that records every callback for later assertions.
#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<ReporterEvent>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<ReporterEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ScanReporter for RecordingReporter {
    fn server_check_succeeded(&self, id: u32, reply: &ProbeReply, _rtt: Duration) {
        self.events.lock().unwrap().push(ReporterEvent::Succeeded {
            id,
            primary: reply.is_writable_primary,
        });
    }

    fn server_check_failed(&self, id: u32, error: &ScanError) {
        self.events.lock().unwrap().push(ReporterEvent::Failed {
            id,
            message: error.message.clone(),
        });
    }

    fn server_setup_failed(&self, id: u32, error: &ScanError) {
        self.events.lock().unwrap().push(ReporterEvent::SetupFailed {
            id,
            message: error.message.clone(),
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatEvent {
    Started(String),
    Succeeded(String),
    Failed(String),
}

/// `MonitoringSink` that records the heartbeat event stream.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<HeartbeatEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<HeartbeatEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl MonitoringSink for RecordingSink {
    fn heartbeat_started(&self, address: &ServerAddress) {
        self.events
            .lock()
            .unwrap()
            .push(HeartbeatEvent::Started(address.canonical().to_string()));
    }

    fn heartbeat_succeeded(&self, address: &ServerAddress, _reply: &ProbeReply, _rtt: Duration) {
        self.events
            .lock()
            .unwrap()
            .push(HeartbeatEvent::Succeeded(address.canonical().to_string()));
    }

    fn heartbeat_failed(&self, address: &ServerAddress, _error: &ScanError, _elapsed: Duration) {
        self.events
            .lock()
            .unwrap()
            .push(HeartbeatEvent::Failed(address.canonical().to_string()));
    }
}

//! Wire protocol types for the capability probe, plus the handshake builder.
//!
//! Probe commands and replies are MessagePack encoded over a
//! length-delimited frame. The full handshake variant carries client
//! identification metadata and is subject to a hard size cap; an oversized
//! handshake degrades to the plain probe rather than failing.

use serde::{Deserialize, Serialize};

/// Maximum byte size of an encoded full handshake command. A command that
/// would exceed this is rebuilt without the client metadata.
pub const HANDSHAKE_MAX_BYTES: usize = 512;

/// Maximum byte length of a configured application name.
pub const APPNAME_MAX_BYTES: usize = 128;

/// Capability-probe command sent to a server.
///
/// The plain variant (`client`, `compression` unset) is used on a node that
/// succeeded last cycle and has not failed since — it avoids resending the
/// client metadata every heartbeat.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeCommand {
    pub hello: bool,
    /// Client identification metadata (full handshake only).
    pub client: Option<ClientMetadata>,
    /// Compressor names supported by this client (full handshake only).
    pub compression: Option<Vec<String>>,
    /// Identity (`"db.user"`) to negotiate SASL mechanisms for.
    pub sasl_supported_mechs: Option<String>,
    /// Latest cluster time seen by the caller, echoed for causal ordering.
    pub cluster_time: Option<ClusterTime>,
}

/// Client identification metadata sent once per connection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientMetadata {
    pub application: Option<ApplicationMetadata>,
    pub driver: DriverMetadata,
    pub os: OsMetadata,
    pub platform: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApplicationMetadata {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriverMetadata {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OsMetadata {
    pub os_type: String,
    pub architecture: String,
}

/// Logical cluster timestamp, monotonically advanced by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClusterTime {
    pub time: u64,
    pub increment: u32,
    pub signature: Vec<u8>,
}

/// Server reply to a probe command.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeReply {
    pub ok: bool,
    pub is_writable_primary: bool,
    /// Peer addresses the server knows about (replica-set view).
    pub hosts: Vec<String>,
    /// Mechanisms returned when negotiation was requested.
    pub sasl_supported_mechs: Option<Vec<String>>,
    pub cluster_time: Option<ClusterTime>,
}

/// Whether `appname` may be sent in the handshake.
pub(crate) fn appname_is_valid(appname: &str) -> bool {
    appname.len() <= APPNAME_MAX_BYTES
}

/// Minimal capability probe: no metadata, no compressor list.
pub(crate) fn plain_probe() -> ProbeCommand {
    ProbeCommand {
        hello: true,
        client: None,
        compression: None,
        sasl_supported_mechs: None,
        cluster_time: None,
    }
}

/// Full handshake probe with client metadata and the compressor list.
///
/// Returns the command and whether it fit [`HANDSHAKE_MAX_BYTES`] once
/// encoded. When it does not fit, only the optional client metadata is
/// dropped — the compressor list stays — and the flag is false so callers
/// can warn once and degrade.
pub(crate) fn full_probe(appname: Option<&str>, compressors: &[String]) -> (ProbeCommand, bool) {
    let compression = if compressors.is_empty() {
        None
    } else {
        Some(compressors.to_vec())
    };
    let cmd = ProbeCommand {
        hello: true,
        client: Some(client_metadata(appname)),
        compression: compression.clone(),
        sasl_supported_mechs: None,
        cluster_time: None,
    };

    match rmp_serde::to_vec(&cmd) {
        Ok(bytes) if bytes.len() <= HANDSHAKE_MAX_BYTES => (cmd, true),
        _ => {
            let mut cmd = plain_probe();
            cmd.compression = compression;
            (cmd, false)
        }
    }
}

fn client_metadata(appname: Option<&str>) -> ClientMetadata {
    ClientMetadata {
        application: appname.map(|name| ApplicationMetadata {
            name: name.to_string(),
        }),
        driver: DriverMetadata {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        os: OsMetadata {
            os_type: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
        },
        platform: format!("rust/{}", env!("CARGO_PKG_VERSION")),
    }
}

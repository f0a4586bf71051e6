/// Scanner configuration.
///
/// The consumer constructs this struct however they want (env vars, TOML,
/// URI options, etc.) — scout does no file I/O or env reading.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Connect timeout for each racing connection attempt (ms). The timeout
    /// runs from the attempt's actual start, independent of its stagger
    /// delay.
    pub connect_timeout_ms: u64,
    /// How long cached DNS results stay valid (ms). Only meant to be
    /// overridden for testing; the default is 10 minutes.
    pub dns_cache_ttl_ms: u64,
    /// Application name sent in the full handshake. Max 128 bytes.
    pub appname: Option<String>,
    /// Identity (`"db.user"`) to negotiate SASL mechanisms for. When set,
    /// a mechanism-negotiation clause is appended to the probe of every
    /// node that has not yet negotiated.
    pub negotiate_mechs_for: Option<String>,
    /// Compressor names advertised in the full handshake.
    pub compressors: Vec<String>,
    /// TLS options handed through to the stream initiator. Scout does not
    /// perform the TLS handshake itself; a custom initiator hook (or the
    /// embedding driver's stream factory) consumes these.
    pub tls: Option<TlsOptions>,
}

/// TLS options for the stream initiator.
///
/// Opaque to the scanner core — carried as configuration data only.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub ca_file: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub allow_invalid_certificates: bool,
    pub allow_invalid_hostnames: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            dns_cache_ttl_ms: 10 * 60 * 1000,
            appname: None,
            negotiate_mechs_for: None,
            compressors: Vec::new(),
            tls: None,
        }
    }
}

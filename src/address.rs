//! Server endpoint identity — host, port, address family, canonical form.
//!
//! Addresses are pure immutable values. Equality is case-insensitive on the
//! canonical `"host:port"` form and requires matching address families.

use thiserror::Error;

/// Default server port used when an address string carries no port.
pub const DEFAULT_PORT: u16 = 27017;

/// Maximum hostname length accepted by [`ServerAddress::parse`].
pub const HOST_NAME_MAX: usize = 255;

/// Errors from parsing an address string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressParseError {
    #[error("Empty hostname in '{0}'")]
    EmptyHost(String),
    #[error("Hostname in '{0}' is too long, max is {HOST_NAME_MAX} chars")]
    HostTooLong(String),
    #[error("Invalid IPv6 literal '{0}': {1}")]
    InvalidIpv6(String, &'static str),
    #[error("Invalid port in '{0}'")]
    InvalidPort(String),
}

/// Address family of a server endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// IPv4 address or hostname resolved at connect time.
    Unspecified,
    /// IPv6 literal.
    Ipv6,
    /// Filesystem path to a unix domain socket.
    UnixSocket,
}

/// Immutable identity of a server endpoint.
///
/// Constructed by [`parse`](ServerAddress::parse) from a `"host[:port]"`
/// string or by [`from_host_port`](ServerAddress::from_host_port). The
/// canonical form is `"host:port"` (bracketed for IPv6 literals, the bare
/// path for unix sockets) and is always derivable from the other fields.
#[derive(Debug, Clone)]
pub struct ServerAddress {
    host: String,
    port: u16,
    family: AddressFamily,
    canonical: String,
}

impl ServerAddress {
    /// Parse a `"host:port"` pair, a bracketed IPv6 literal `"[addr]:port"`,
    /// or a unix-socket path (any path containing `/` and `.sock`).
    ///
    /// A missing port defaults to [`DEFAULT_PORT`]. Rejects an empty host, a
    /// host longer than [`HOST_NAME_MAX`], and a port-only string.
    pub fn parse(text: &str) -> Result<Self, AddressParseError> {
        if text.contains(']') {
            // A closing bracket means an IPv6 literal, which is stricter.
            return Self::parse_ipv6(text);
        }

        match text.split_once(':') {
            Some((host, port_str)) => {
                let port = port_str
                    .parse::<u16>()
                    .map_err(|_| AddressParseError::InvalidPort(text.to_string()))?;
                Self::from_host_port(host, port)
            }
            None => Self::from_host_port(text, DEFAULT_PORT),
        }
    }

    fn parse_ipv6(text: &str) -> Result<Self, AddressParseError> {
        if !text.starts_with('[') {
            return Err(AddressParseError::InvalidIpv6(
                text.to_string(),
                "must start with a bracket '['",
            ));
        }
        let Some(close) = text.find(']') else {
            return Err(AddressParseError::InvalidIpv6(
                text.to_string(),
                "missing closing bracket ']'",
            ));
        };

        let rest = &text[close + 1..];
        let port = if rest.is_empty() {
            DEFAULT_PORT
        } else if let Some(port_str) = rest.strip_prefix(':') {
            port_str
                .parse::<u16>()
                .map_err(|_| AddressParseError::InvalidPort(text.to_string()))?
        } else {
            return Err(AddressParseError::InvalidIpv6(
                text.to_string(),
                "invalid trailing content after closing bracket ']'",
            ));
        };

        Self::from_host_port(&text[1..close], port)
    }

    /// Build an address from an already-split host and port.
    ///
    /// The family is classified from the host text: a `:` means an IPv6
    /// literal, a path with a `.sock` component means a unix socket, and
    /// anything else is an IPv4 address or hostname.
    pub fn from_host_port(host: &str, port: u16) -> Result<Self, AddressParseError> {
        if host.is_empty() {
            return Err(AddressParseError::EmptyHost(host.to_string()));
        }
        if host.len() > HOST_NAME_MAX {
            return Err(AddressParseError::HostTooLong(host.to_string()));
        }

        // like "fe80::1" or "::1"
        if host.contains(':') {
            // Two chars shorter to leave room for the brackets.
            if host.len() > HOST_NAME_MAX - 2 {
                return Err(AddressParseError::HostTooLong(host.to_string()));
            }
            let host = host.to_ascii_lowercase();
            let canonical = format!("[{host}]:{port}");
            return Ok(Self {
                host,
                port,
                family: AddressFamily::Ipv6,
                canonical,
            });
        }

        if host.contains('/') && host.contains(".sock") {
            return Ok(Self {
                host: host.to_string(),
                port,
                family: AddressFamily::UnixSocket,
                canonical: host.to_string(),
            });
        }

        let host = host.to_ascii_lowercase();
        let canonical = format!("{host}:{port}");
        Ok(Self {
            host,
            port,
            family: AddressFamily::Unspecified,
            canonical,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Canonical `"host:port"` form (bracketed for IPv6, bare path for
    /// unix sockets).
    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.family == other.family && self.canonical.eq_ignore_ascii_case(&other.canonical)
    }
}

impl Eq for ServerAddress {}

impl std::hash::Hash for ServerAddress {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.family.hash(state);
        self.canonical.to_ascii_lowercase().hash(state);
    }
}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical)
    }
}

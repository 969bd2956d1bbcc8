//! Typed network addresses of the form `scheme://host:port`.
//!
//! The scheme selects the transport ([`ConnType`]). Addresses are stored in a
//! normalized string form (lowercase scheme and host, canonical IPv6 text) so
//! that equality and hashing agree for inputs that name the same endpoint.

use crate::error::{TypesError, TypesResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// Transport family an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnType {
    /// Plain TCP.
    Plain,
    /// TCP wrapped in TLS with certificate-bound identities.
    Tls,
    /// In-process transport used by tests.
    Local,
}

impl ConnType {
    /// URL scheme used for this transport.
    pub fn scheme(&self) -> &'static str {
        match self {
            ConnType::Plain => "tcp",
            ConnType::Tls => "tls",
            ConnType::Local => "local",
        }
    }

    /// Look up a transport from its scheme (case-insensitive).
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "tcp" => Some(ConnType::Plain),
            "tls" => Some(ConnType::Tls),
            "local" => Some(ConnType::Local),
            _ => None,
        }
    }
}

impl fmt::Display for ConnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// A validated `scheme://host:port` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    normalized: String,
    conn_type: ConnType,
    port: u16,
}

impl Address {
    /// Parse and normalize an address string.
    pub fn parse(input: &str) -> TypesResult<Self> {
        let invalid = |reason: &str| TypesError::InvalidAddress {
            address: input.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = input.trim();
        let (scheme, rest) = trimmed
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        let conn_type =
            ConnType::from_scheme(scheme).ok_or_else(|| invalid("unknown scheme"))?;

        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("port is not a number"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("port out of range"))?;

        let host = if let Some(inner) = host.strip_prefix('[') {
            let inner = inner
                .strip_suffix(']')
                .ok_or_else(|| invalid("unterminated IPv6 host"))?;
            let ip = Ipv6Addr::from_str(inner).map_err(|_| invalid("invalid IPv6 host"))?;
            format!("[{ip}]")
        } else {
            if host.is_empty() {
                return Err(invalid("empty host"));
            }
            if host
                .chars()
                .any(|c| c == ':' || c == '/' || c == '[' || c == ']' || c.is_whitespace())
            {
                return Err(invalid("host contains invalid characters"));
            }
            host.to_ascii_lowercase()
        };

        Ok(Self {
            normalized: format!("{}://{}:{}", conn_type.scheme(), host, port),
            conn_type,
            port,
        })
    }

    /// Build an address from its parts.
    pub fn new(conn_type: ConnType, host: &str, port: u16) -> TypesResult<Self> {
        let host = match host.parse::<Ipv6Addr>() {
            Ok(ip) => format!("[{ip}]"),
            Err(_) => host.to_string(),
        };
        Self::parse(&format!("{}://{}:{}", conn_type.scheme(), host, port))
    }

    /// Build an address for a socket address (IPv6 hosts get brackets).
    pub fn from_socket_addr(conn_type: ConnType, addr: SocketAddr) -> Self {
        let host = match addr.ip() {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) => format!("[{ip}]"),
        };
        Self {
            normalized: format!("{}://{}:{}", conn_type.scheme(), host, addr.port()),
            conn_type,
            port: addr.port(),
        }
    }

    /// The transport this address selects.
    pub fn conn_type(&self) -> ConnType {
        self.conn_type
    }

    /// The `host:port` part, suitable for DNS lookup or socket binding.
    pub fn network_address(&self) -> &str {
        let scheme_len = self.conn_type.scheme().len() + "://".len();
        &self.normalized[scheme_len..]
    }

    /// The host without IPv6 brackets.
    pub fn host(&self) -> &str {
        let network = self.network_address();
        let host = &network[..network.len() - self.port.to_string().len() - 1];
        host.trim_start_matches('[').trim_end_matches(']')
    }

    /// The port number.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the host is a DNS name rather than an IP literal.
    pub fn is_hostname(&self) -> bool {
        self.host().parse::<IpAddr>().is_err()
    }

    /// The same host and port under another transport.
    pub fn with_conn_type(&self, conn_type: ConnType) -> Self {
        let network = self.network_address();
        Self {
            normalized: format!("{}://{}", conn_type.scheme(), network),
            conn_type,
            port: self.port,
        }
    }

    /// The same transport and host with another port.
    pub fn with_port(&self, port: u16) -> Self {
        let network = self.network_address();
        let host = &network[..network.len() - self.port.to_string().len() - 1];
        Self {
            normalized: format!("{}://{}:{}", self.conn_type.scheme(), host, port),
            conn_type: self.conn_type,
            port,
        }
    }

    /// The normalized string form.
    pub fn as_str(&self) -> &str {
        &self.normalized
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized)
    }
}

impl FromStr for Address {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = TypesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.normalized
    }
}

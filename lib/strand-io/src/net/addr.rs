use std::{
    fmt,
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs as _},
};

use snafu::ResultExt as _;

use super::{EndpointError, FailedToResolve};

/// A transport protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// In-process delivery. No socket is involved.
    Inproc,

    /// TCP, with length-delimited framing.
    Tcp,

    /// UDP datagrams.
    Udp,

    /// Inter-process sockets. Not implemented.
    Ipc,

    /// Pragmatic General Multicast, carried as UDP multicast.
    Pgm,

    /// Encapsulated PGM, carried as UDP multicast.
    Epgm,
}

impl Protocol {
    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "inproc" => Some(Self::Inproc),
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            "ipc" => Some(Self::Ipc),
            "pgm" => Some(Self::Pgm),
            "epgm" => Some(Self::Epgm),
            _ => None,
        }
    }

    /// Returns the URL scheme of the protocol.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Inproc => "inproc",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Ipc => "ipc",
            Self::Pgm => "pgm",
            Self::Epgm => "epgm",
        }
    }

    /// Returns `true` if endpoints of this protocol require a port.
    pub const fn requires_port(&self) -> bool {
        !matches!(self, Self::Inproc | Self::Ipc)
    }

    /// Returns `true` if endpoints of this protocol use the network.
    pub const fn is_network(&self) -> bool {
        !matches!(self, Self::Inproc)
    }

    /// Returns `true` if the protocol carries messages as datagrams rather than framed streams.
    pub const fn is_datagram(&self) -> bool {
        matches!(self, Self::Udp | Self::Pgm | Self::Epgm)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed endpoint URL.
///
/// Endpoint URLs take the form `scheme://[*][host][:port]`. A `*` in place of the host marks a server endpoint, which
/// binds to all interfaces. Anything else is a client endpoint that connects or sends to `host`.
///
/// ## Examples
///
/// - `tcp://*:9000` (TCP server on port 9000)
/// - `tcp://10.0.0.5:9000` (TCP client)
/// - `udp://[::1]:53` (UDP client, IPv6 loopback)
/// - `inproc://worker-1` (in-process, no port)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointAddress {
    protocol: Protocol,
    host: String,
    port: Option<u16>,
    is_server: bool,
}

impl EndpointAddress {
    /// Parses an endpoint URL.
    ///
    /// # Errors
    ///
    /// If the URL is malformed, names an unknown scheme, or has an invalid or missing port, an error is returned.
    pub fn parse(url: &str) -> Result<Self, EndpointError> {
        let invalid = |reason| EndpointError::InvalidUrl {
            url: url.to_string(),
            reason,
        };

        let (scheme, rest) = url.split_once("://").ok_or_else(|| invalid("missing '://' separator"))?;
        let protocol = Protocol::from_scheme(scheme).ok_or_else(|| EndpointError::UnknownScheme {
            scheme: scheme.to_string(),
        })?;

        let (is_server, rest) = match rest.strip_prefix('*') {
            Some(rest) => (true, rest),
            None => (false, rest),
        };

        let (host, port) = match rest.strip_prefix('[') {
            Some(bracketed) => {
                let (host, tail) = bracketed
                    .split_once(']')
                    .ok_or_else(|| invalid("unterminated IPv6 address"))?;
                if host.is_empty() {
                    return Err(invalid("empty IPv6 address"));
                }
                let port = match tail {
                    "" => None,
                    tail => Some(
                        tail.strip_prefix(':')
                            .ok_or_else(|| invalid("unexpected characters after IPv6 address"))?,
                    ),
                };
                (host, port)
            }
            None => match rest.rsplit_once(':') {
                Some((host, _)) if host.contains(':') => {
                    return Err(invalid("IPv6 addresses must be enclosed in brackets"))
                }
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            },
        };

        if is_server && !host.is_empty() {
            return Err(invalid("server endpoints cannot name a host"));
        }
        if !is_server && host.is_empty() {
            return Err(EndpointError::MissingHost { url: url.to_string() });
        }

        let port = match port {
            Some(port) => match port.parse::<u16>() {
                Ok(parsed) if parsed != 0 => Some(parsed),
                _ => {
                    return Err(EndpointError::InvalidPort {
                        url: url.to_string(),
                        port: port.to_string(),
                    })
                }
            },
            None if protocol.requires_port() => return Err(EndpointError::MissingPort { url: url.to_string() }),
            None => None,
        };

        let host = if is_server {
            Ipv4Addr::UNSPECIFIED.to_string()
        } else {
            host.to_string()
        };

        Ok(Self {
            protocol,
            host,
            port,
            is_server,
        })
    }

    /// Returns the protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Returns the host.
    ///
    /// Server endpoints always report `0.0.0.0`.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port, if one was given.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Returns `true` if this is a server endpoint.
    pub fn is_server(&self) -> bool {
        self.is_server
    }

    pub(super) fn required_port(&self) -> Result<u16, EndpointError> {
        self.port.ok_or_else(|| EndpointError::MissingPort { url: self.to_string() })
    }

    /// Resolves the host and port to socket addresses.
    pub(super) fn resolve(&self) -> Result<Vec<SocketAddr>, EndpointError> {
        let port = self.required_port()?;
        let addrs = (self.host.as_str(), port)
            .to_socket_addrs()
            .context(FailedToResolve {
                address: self.to_string(),
            })?
            .collect::<Vec<_>>();
        if addrs.is_empty() {
            return Err(EndpointError::FailedToResolve {
                address: self.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found"),
            });
        }
        Ok(addrs)
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.protocol)?;
        if self.is_server {
            write!(f, "*")?;
        } else if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

impl TryFrom<&str> for EndpointAddress {
    type Error = EndpointError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

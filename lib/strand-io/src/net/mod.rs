//! Endpoints and socket transport.
use std::{io, net::Ipv4Addr, time::Duration};

use snafu::Snafu;
use strand_config::{ConfigurationError, GenericConfiguration};

use crate::framing::{FramingError, DEFAULT_MAX_FRAME_LEN};

mod addr;
pub use self::addr::{EndpointAddress, Protocol};

mod endpoint;
pub use self::endpoint::Endpoint;

mod listener;
mod socket;

/// An endpoint error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum EndpointError {
    /// The endpoint URL is malformed.
    #[snafu(display("invalid endpoint URL '{}': {}", url, reason))]
    InvalidUrl {
        /// The URL that failed to parse.
        url: String,

        /// Cause of the failure.
        reason: &'static str,
    },

    /// The URL scheme does not name a supported protocol.
    #[snafu(display("unknown endpoint scheme '{}'", scheme))]
    UnknownScheme {
        /// The unrecognized scheme.
        scheme: String,
    },

    /// The port is not a number in `1..=65535`.
    #[snafu(display("invalid port '{}' in endpoint URL '{}'", port, url))]
    InvalidPort {
        /// The URL that failed to parse.
        url: String,

        /// The port as written.
        port: String,
    },

    /// The protocol requires a port, but none was given.
    #[snafu(display("endpoint URL '{}' requires a port", url))]
    MissingPort {
        /// The URL that failed to parse.
        url: String,
    },

    /// A client endpoint did not name a host.
    #[snafu(display("client endpoint URL '{}' requires a host", url))]
    MissingHost {
        /// The URL that failed to parse.
        url: String,
    },

    /// The host could not be resolved to any socket address.
    #[snafu(display("failed to resolve {}: {}", address, source))]
    FailedToResolve {
        /// Endpoint address.
        address: String,

        /// Source of the error.
        source: io::Error,
    },

    /// Failed to create or bind the endpoint socket.
    #[snafu(display("failed to bind {}: {}", address, source))]
    FailedToBind {
        /// Endpoint address.
        address: String,

        /// Source of the error.
        source: io::Error,
    },

    /// Failed to connect to the remote endpoint.
    #[snafu(display("failed to connect to {}: {}", address, source))]
    FailedToConnect {
        /// Endpoint address.
        address: String,

        /// Source of the error.
        source: io::Error,
    },

    /// Failed to configure a setting on the endpoint socket.
    #[snafu(display("failed to configure {} for {}: {}", setting, address, source))]
    FailedToConfigure {
        /// Endpoint address.
        address: String,

        /// Name of the setting.
        setting: &'static str,

        /// Source of the error.
        source: io::Error,
    },

    /// Failed to start the listener for a server endpoint.
    #[snafu(display("failed to start listener for {}: {}", address, source))]
    FailedToStartListener {
        /// Endpoint address.
        address: String,

        /// Source of the error.
        source: strand_core::goroutine::SpawnError,
    },

    /// The protocol is recognized but has no transport.
    #[snafu(display("{} endpoints are not implemented", protocol))]
    Unimplemented {
        /// The unimplemented protocol.
        protocol: Protocol,
    },

    /// A send was attempted on a server endpoint.
    #[snafu(display("{} is not a client endpoint", address))]
    NotAClient {
        /// Endpoint address.
        address: String,
    },

    /// A listener was requested on a client endpoint.
    #[snafu(display("{} is not a server endpoint", address))]
    NotAServer {
        /// Endpoint address.
        address: String,
    },

    /// The runtime context does not permit network access.
    #[snafu(display("network access is not permitted for {}", address))]
    NotPermitted {
        /// Endpoint address.
        address: String,
    },

    /// Failed to write a message to the socket.
    #[snafu(display("failed to send to {}: {}", address, source))]
    FailedToSend {
        /// Endpoint address.
        address: String,

        /// Source of the error.
        source: io::Error,
    },

    /// A message could not be framed.
    #[snafu(display("failed to encode message: {}", source))]
    Encode {
        /// Source of the error.
        source: FramingError,
    },

    /// No endpoint is attached to the channel.
    #[snafu(display("no endpoint attached"))]
    NoEndpoint,
}

/// Transport configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    tcp_backlog: i32,
    max_frame_len: usize,
    poll_interval: Duration,
    multicast_group: Ipv4Addr,
    multicast_ttl: u32,
}

impl TransportConfig {
    /// Reads the transport configuration from the `transport.*` keys.
    ///
    /// Missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// If a key is present but has the wrong type, or the multicast group is not a multicast address, an error is
    /// returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, ConfigurationError> {
        let mut transport = Self::default();
        if let Some(backlog) = config.try_get_typed("transport.tcp_backlog")? {
            transport.tcp_backlog = backlog;
        }
        if let Some(max_frame_len) = config.try_get_typed("transport.max_frame_len")? {
            transport.max_frame_len = max_frame_len;
        }
        if let Some(millis) = config.try_get_typed::<u64>("transport.poll_interval_ms")? {
            transport.poll_interval = Duration::from_millis(millis.max(1));
        }
        if let Some(group) = config.try_get_typed::<Ipv4Addr>("transport.multicast_group")? {
            if !group.is_multicast() {
                return Err(ConfigurationError::InvalidFieldType {
                    field: "transport.multicast_group".to_string(),
                    expected_ty: "IPv4 multicast address".to_string(),
                    actual_ty: group.to_string(),
                });
            }
            transport.multicast_group = group;
        }
        if let Some(ttl) = config.try_get_typed("transport.multicast_ttl")? {
            transport.multicast_ttl = ttl;
        }
        Ok(transport)
    }

    /// Sets the frame length limit for stream transports.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Sets how often listener loops check for shutdown.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Returns the listen backlog for TCP servers.
    pub fn tcp_backlog(&self) -> i32 {
        self.tcp_backlog
    }

    /// Returns the frame length limit for stream transports.
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    /// Returns how often listener loops check for shutdown.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Returns the default multicast group for PGM and EPGM endpoints.
    pub fn multicast_group(&self) -> Ipv4Addr {
        self.multicast_group
    }

    /// Returns the multicast TTL for PGM and EPGM clients.
    pub fn multicast_ttl(&self) -> u32 {
        self.multicast_ttl
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tcp_backlog: 10,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            poll_interval: Duration::from_millis(100),
            multicast_group: Ipv4Addr::new(239, 192, 0, 1),
            multicast_ttl: 1,
        }
    }
}

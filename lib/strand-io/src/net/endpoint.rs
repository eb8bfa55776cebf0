use std::{
    fmt,
    io::Write as _,
    net::{SocketAddr, TcpListener, TcpStream, UdpSocket},
    sync::{Arc, Mutex, PoisonError},
};

use bytes::{Bytes, BytesMut};
use metrics::counter;
use snafu::ResultExt as _;
use strand_core::context::{Capability, RuntimeContext};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    listener::{Listener, MessageSink},
    socket, Encode, EndpointAddress, EndpointError, FailedToConfigure, FailedToSend, Protocol, TransportConfig,
};
use crate::framing::encode_frame;

enum Transport {
    Inproc,
    TcpListener(TcpListener),
    TcpStream(Mutex<TcpStream>),
    Datagram { socket: UdpSocket, peer: Option<SocketAddr> },
}

/// A live endpoint.
///
/// A client endpoint holds a connected (TCP) or aimed (UDP, PGM, EPGM) socket and sends messages with
/// [`send`][Endpoint::send]. A server endpoint holds a bound socket and, once [`listen`][Endpoint::listen] is called,
/// a listener that hands every inbound message to a sink.
///
/// The endpoint owns its listener threads. Dropping the endpoint, or calling [`shutdown`][Endpoint::shutdown], stops
/// them and waits for them to exit.
pub struct Endpoint {
    address: EndpointAddress,
    config: TransportConfig,
    context: RuntimeContext,
    transport: Transport,
    listener: Option<Listener>,
}

impl Endpoint {
    /// Creates the socket for `address` with a default runtime context.
    ///
    /// # Errors
    ///
    /// If the protocol is not implemented, or the socket cannot be created, bound, or connected, an error is returned.
    pub fn initialize(address: EndpointAddress, config: &TransportConfig) -> Result<Self, EndpointError> {
        Self::initialize_with_context(address, config, &RuntimeContext::default())
    }

    /// Creates the socket for `address`.
    ///
    /// Network protocols must be permitted by the context's [`Capability::Network`] check.
    ///
    /// # Errors
    ///
    /// If network access is not permitted, the protocol is not implemented, or the socket cannot be created, bound, or
    /// connected, an error is returned.
    pub fn initialize_with_context(
        address: EndpointAddress, config: &TransportConfig, context: &RuntimeContext,
    ) -> Result<Self, EndpointError> {
        let protocol = address.protocol();
        if protocol.is_network() && !context.is_permitted(Capability::Network) {
            return Err(EndpointError::NotPermitted {
                address: address.to_string(),
            });
        }

        let transport = match (protocol, address.is_server()) {
            (Protocol::Inproc, _) => Transport::Inproc,
            (Protocol::Ipc, _) => return Err(EndpointError::Unimplemented { protocol }),
            (Protocol::Tcp, true) => Transport::TcpListener(socket::bind_tcp(&address, config)?),
            (Protocol::Tcp, false) => Transport::TcpStream(Mutex::new(socket::connect_tcp(&address)?)),
            (Protocol::Udp, true) => Transport::Datagram {
                socket: socket::bind_udp(&address)?,
                peer: None,
            },
            (Protocol::Udp, false) => {
                let (socket, peer) = socket::udp_client(&address)?;
                Transport::Datagram {
                    socket,
                    peer: Some(peer),
                }
            }
            (Protocol::Pgm | Protocol::Epgm, true) => Transport::Datagram {
                socket: socket::bind_multicast(&address, config)?,
                peer: None,
            },
            (Protocol::Pgm | Protocol::Epgm, false) => {
                let (socket, peer) = socket::multicast_client(&address, config)?;
                Transport::Datagram {
                    socket,
                    peer: Some(peer),
                }
            }
        };

        debug!(endpoint = %address, server = address.is_server(), "Initialized endpoint.");

        Ok(Self {
            address,
            config: config.clone(),
            context: context.clone(),
            transport,
            listener: None,
        })
    }

    /// Returns the endpoint address.
    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    /// Returns `true` if this is a server endpoint.
    pub fn is_server(&self) -> bool {
        self.address.is_server()
    }

    /// Returns `true` if the listener has been started and not shut down.
    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    /// Returns the local address of the socket, if the endpoint has one.
    ///
    /// For a server endpoint this is the bound address. Client datagram sockets have no local address until their
    /// first send.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.transport {
            Transport::Inproc => None,
            Transport::TcpListener(listener) => listener.local_addr().ok(),
            Transport::TcpStream(stream) => stream.lock().unwrap_or_else(PoisonError::into_inner).local_addr().ok(),
            Transport::Datagram { socket, .. } => socket.local_addr().ok(),
        }
    }

    /// Sends one message payload to the remote endpoint.
    ///
    /// TCP payloads are written as a single length-delimited frame. Datagram payloads are sent as-is. In-process
    /// endpoints have nothing to send to, and succeed without doing anything.
    ///
    /// # Errors
    ///
    /// If this is a server endpoint, the payload cannot be framed, or the write fails, an error is returned.
    pub fn send(&self, payload: &[u8]) -> Result<(), EndpointError> {
        let wire = self.encode(payload)?;
        self.transmit(&wire)
    }

    /// Converts a message payload into the bytes written on the wire, without sending them.
    ///
    /// # Errors
    ///
    /// If this is a server endpoint, or the payload exceeds the configured frame limit on a TCP endpoint, an error is
    /// returned.
    pub(crate) fn encode(&self, payload: &[u8]) -> Result<Bytes, EndpointError> {
        match &self.transport {
            Transport::Inproc if !self.is_server() => Ok(Bytes::new()),
            Transport::TcpStream(_) => {
                let mut frame = BytesMut::new();
                encode_frame(payload, self.config.max_frame_len(), &mut frame).context(Encode)?;
                Ok(frame.freeze())
            }
            Transport::Datagram { peer: Some(_), .. } => Ok(Bytes::copy_from_slice(payload)),
            Transport::Inproc | Transport::TcpListener(_) | Transport::Datagram { peer: None, .. } => {
                Err(EndpointError::NotAClient {
                    address: self.address.to_string(),
                })
            }
        }
    }

    /// Writes bytes produced by [`encode`][Self::encode] to the remote endpoint.
    pub(crate) fn transmit(&self, wire: &[u8]) -> Result<(), EndpointError> {
        match &self.transport {
            Transport::Inproc if !self.is_server() => return Ok(()),
            Transport::TcpStream(stream) => {
                // Frames from concurrent senders must not interleave.
                let mut stream = stream.lock().unwrap_or_else(PoisonError::into_inner);
                stream.write_all(wire).context(FailedToSend {
                    address: self.address.to_string(),
                })?;
            }
            Transport::Datagram { socket, peer: Some(peer) } => {
                socket.send_to(wire, peer).context(FailedToSend {
                    address: self.address.to_string(),
                })?;
            }
            Transport::Inproc | Transport::TcpListener(_) | Transport::Datagram { peer: None, .. } => {
                return Err(EndpointError::NotAClient {
                    address: self.address.to_string(),
                })
            }
        }

        counter!("strand_transport_frames_sent_total", "protocol" => self.address.protocol().as_str()).increment(1);
        Ok(())
    }

    /// Starts the listener for a server endpoint.
    ///
    /// TCP servers accept connections and read each one on its own thread. Datagram servers receive on a single
    /// thread. Every inbound message is passed to `sink` along with the listener's cancellation token; returning
    /// `false` stops the connection or receive loop that produced it. A listener that is already running is stopped
    /// first. In-process endpoints have no socket, and starting their listener does nothing.
    ///
    /// # Errors
    ///
    /// If this is not a server endpoint, or the listener threads cannot be started, an error is returned.
    pub fn listen<F>(&mut self, sink: F) -> Result<(), EndpointError>
    where
        F: Fn(Bytes, &CancellationToken) -> bool + Send + Sync + 'static,
    {
        if !self.is_server() {
            return Err(EndpointError::NotAServer {
                address: self.address.to_string(),
            });
        }

        self.shutdown();

        let sink: MessageSink = Arc::new(sink);
        let endpoint = self.address.to_string();
        let listener = match &self.transport {
            Transport::Inproc => return Ok(()),
            Transport::TcpListener(listener) => {
                let listener = listener.try_clone().context(FailedToConfigure {
                    address: endpoint.clone(),
                    setting: "listener handle",
                })?;
                Listener::spawn_tcp(listener, endpoint, &self.config, &self.context, sink)?
            }
            Transport::Datagram { socket, .. } => {
                let socket = socket.try_clone().context(FailedToConfigure {
                    address: endpoint.clone(),
                    setting: "socket handle",
                })?;
                Listener::spawn_datagram(
                    socket,
                    endpoint,
                    self.address.protocol(),
                    &self.config,
                    &self.context,
                    sink,
                )?
            }
            Transport::TcpStream(_) => {
                return Err(EndpointError::NotAServer {
                    address: self.address.to_string(),
                })
            }
        };

        debug!(endpoint = %self.address, "Listener started.");
        self.listener = Some(listener);
        Ok(())
    }

    /// Stops the listener, if one is running, and waits for its threads to exit.
    ///
    /// The socket stays open, so the listener can be started again.
    pub fn shutdown(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.stop();
            debug!(endpoint = %self.address, "Listener stopped.");
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.address)
            .field("listening", &self.is_listening())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use strand_core::channel::Channel;

    use super::*;

    fn parse(url: &str) -> EndpointAddress {
        EndpointAddress::parse(url).unwrap()
    }

    #[test]
    fn inproc_needs_no_socket() {
        let mut server = Endpoint::initialize(parse("inproc://*"), &TransportConfig::default()).unwrap();
        assert!(server.is_server());
        assert_eq!(server.local_addr(), None);
        server.listen(|_, _| true).unwrap();
        assert!(!server.is_listening());

        let client = Endpoint::initialize(parse("inproc://worker-1"), &TransportConfig::default()).unwrap();
        client.send(b"ignored").unwrap();
    }

    #[test]
    fn ipc_is_unimplemented() {
        let result = Endpoint::initialize(parse("ipc://bridge"), &TransportConfig::default());
        assert!(matches!(
            result,
            Err(EndpointError::Unimplemented { protocol: Protocol::Ipc })
        ));
    }

    #[test]
    fn network_requires_capability() {
        let context =
            RuntimeContext::default().with_capabilities(|capability: Capability| capability != Capability::Network);

        let result =
            Endpoint::initialize_with_context(parse("udp://127.0.0.1:9"), &TransportConfig::default(), &context);
        assert!(matches!(result, Err(EndpointError::NotPermitted { .. })));

        Endpoint::initialize_with_context(parse("inproc://local"), &TransportConfig::default(), &context).unwrap();
    }

    #[test]
    fn server_and_client_roles() {
        let config = TransportConfig::default().with_poll_interval(Duration::from_millis(10));
        let port = free_udp_port();
        let mut server = Endpoint::initialize(parse(&format!("udp://*:{}", port)), &config).unwrap();
        assert!(matches!(server.send(b"x"), Err(EndpointError::NotAClient { .. })));

        let mut client = Endpoint::initialize(parse(&format!("udp://127.0.0.1:{}", port)), &config).unwrap();
        assert_eq!(server.local_addr().map(|addr| addr.port()), Some(port));
        assert!(matches!(client.listen(|_, _| true), Err(EndpointError::NotAServer { .. })));

        let received = Channel::bounded(4).unwrap();
        let sink = received.clone();
        server.listen(move |payload, token| sink.send_until(payload, token).is_ok()).unwrap();
        assert!(server.is_listening());

        client.send(b"ping").unwrap();
        assert_eq!(
            received.receive_timeout(Duration::from_secs(5)).unwrap(),
            Bytes::from_static(b"ping")
        );

        server.shutdown();
        assert!(!server.is_listening());
    }

    #[test]
    fn pgm_server_binds_requested_port() {
        let port = free_udp_port();
        let config = TransportConfig::default().with_poll_interval(Duration::from_millis(10));
        let mut server = match Endpoint::initialize(parse(&format!("pgm://*:{}", port)), &config) {
            Ok(server) => server,
            // Hosts without a multicast-capable interface cannot join the group.
            Err(EndpointError::FailedToConfigure {
                setting: "IP_ADD_MEMBERSHIP",
                ..
            }) => return,
            Err(e) => panic!("failed to initialize pgm server: {}", e),
        };

        assert!(server.is_server());
        assert_eq!(server.address().protocol(), Protocol::Pgm);
        assert_eq!(server.local_addr().map(|addr| addr.port()), Some(port));
        assert!(matches!(server.send(b"x"), Err(EndpointError::NotAClient { .. })));

        server.listen(|_, _| true).unwrap();
        assert!(server.is_listening());
        server.shutdown();
        assert!(!server.is_listening());
    }

    #[test]
    fn epgm_client_targets_group() {
        let port = free_udp_port();
        let url = format!("epgm://239.192.0.1:{}", port);
        let mut client = Endpoint::initialize(parse(&url), &TransportConfig::default()).unwrap();

        assert!(!client.is_server());
        assert_eq!(client.address().host(), "239.192.0.1");
        assert!(matches!(client.listen(|_, _| true), Err(EndpointError::NotAServer { .. })));
        assert_eq!(&client.encode(b"tick").unwrap()[..], b"tick");
    }

    fn free_udp_port() -> u16 {
        UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }
}

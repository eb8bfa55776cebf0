//! Protocol-specific socket setup.
use std::{
    io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream, UdpSocket},
};

use snafu::ResultExt as _;
use socket2::{Domain, Protocol as SocketProtocol, SockAddr, Socket, Type};
use tracing::debug;

use super::{EndpointAddress, EndpointError, FailedToBind, FailedToConfigure, TransportConfig};

fn server_addr(address: &EndpointAddress) -> Result<SocketAddr, EndpointError> {
    Ok(SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::UNSPECIFIED,
        address.required_port()?,
    )))
}

fn new_socket(
    address: &EndpointAddress, domain: Domain, ty: Type, protocol: SocketProtocol,
) -> Result<Socket, EndpointError> {
    Socket::new(domain, ty, Some(protocol)).context(FailedToBind {
        address: address.to_string(),
    })
}

fn bind_reusable(address: &EndpointAddress, socket: &Socket, bind_addr: SocketAddr) -> Result<(), EndpointError> {
    socket.set_reuse_address(true).context(FailedToConfigure {
        address: address.to_string(),
        setting: "SO_REUSEADDR",
    })?;
    socket.bind(&SockAddr::from(bind_addr)).context(FailedToBind {
        address: address.to_string(),
    })
}

/// Binds and listens on all interfaces.
///
/// The listener is non-blocking so the accept loop can poll for shutdown.
pub(super) fn bind_tcp(address: &EndpointAddress, config: &TransportConfig) -> Result<TcpListener, EndpointError> {
    let bind_addr = server_addr(address)?;
    let socket = new_socket(address, Domain::IPV4, Type::STREAM, SocketProtocol::TCP)?;
    bind_reusable(address, &socket, bind_addr)?;
    socket.listen(config.tcp_backlog()).context(FailedToBind {
        address: address.to_string(),
    })?;
    socket.set_nonblocking(true).context(FailedToConfigure {
        address: address.to_string(),
        setting: "O_NONBLOCK",
    })?;

    debug!(endpoint = %address, backlog = config.tcp_backlog(), "Listening for TCP connections.");
    Ok(socket.into())
}

/// Connects to the first reachable address the host resolves to.
pub(super) fn connect_tcp(address: &EndpointAddress) -> Result<TcpStream, EndpointError> {
    let mut last_error = None;
    for addr in address.resolve()? {
        let socket = new_socket(address, Domain::for_address(addr), Type::STREAM, SocketProtocol::TCP)?;
        match socket.connect(&SockAddr::from(addr)) {
            Ok(()) => {
                socket.set_nodelay(true).context(FailedToConfigure {
                    address: address.to_string(),
                    setting: "TCP_NODELAY",
                })?;
                debug!(endpoint = %address, peer = %addr, "Connected.");
                return Ok(socket.into());
            }
            Err(e) => {
                debug!(endpoint = %address, peer = %addr, error = %e, "Connection attempt failed.");
                last_error = Some(e);
            }
        }
    }

    let source = last_error.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses to connect to"));
    Err(EndpointError::FailedToConnect {
        address: address.to_string(),
        source,
    })
}

/// Binds a UDP socket on all interfaces.
pub(super) fn bind_udp(address: &EndpointAddress) -> Result<UdpSocket, EndpointError> {
    let bind_addr = server_addr(address)?;
    let socket = new_socket(address, Domain::IPV4, Type::DGRAM, SocketProtocol::UDP)?;
    bind_reusable(address, &socket, bind_addr)?;

    debug!(endpoint = %address, "Bound UDP socket.");
    Ok(socket.into())
}

/// Creates an unbound UDP socket aimed at the resolved host.
///
/// The socket is bound to an ephemeral port by the first send.
pub(super) fn udp_client(address: &EndpointAddress) -> Result<(UdpSocket, SocketAddr), EndpointError> {
    let resolved = address.resolve()?;
    let peer = resolved
        .iter()
        .copied()
        .find(SocketAddr::is_ipv4)
        .unwrap_or(resolved[0]);
    let socket = new_socket(address, Domain::for_address(peer), Type::DGRAM, SocketProtocol::UDP)?;
    Ok((socket.into(), peer))
}

fn multicast_group(address: &EndpointAddress, config: &TransportConfig) -> Ipv4Addr {
    match address.host().parse::<Ipv4Addr>() {
        Ok(group) if group.is_multicast() => group,
        _ => config.multicast_group(),
    }
}

/// Binds on all interfaces and joins the configured multicast group.
pub(super) fn bind_multicast(address: &EndpointAddress, config: &TransportConfig) -> Result<UdpSocket, EndpointError> {
    let bind_addr = server_addr(address)?;
    let group = multicast_group(address, config);
    let socket = new_socket(address, Domain::IPV4, Type::DGRAM, SocketProtocol::UDP)?;
    bind_reusable(address, &socket, bind_addr)?;
    socket
        .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
        .context(FailedToConfigure {
            address: address.to_string(),
            setting: "IP_ADD_MEMBERSHIP",
        })?;

    debug!(endpoint = %address, %group, "Joined multicast group.");
    Ok(socket.into())
}

/// Creates a UDP socket that sends to a multicast group.
///
/// The group is the endpoint host when it is a multicast address, and the configured group otherwise.
pub(super) fn multicast_client(
    address: &EndpointAddress, config: &TransportConfig,
) -> Result<(UdpSocket, SocketAddr), EndpointError> {
    let group = multicast_group(address, config);
    let peer = SocketAddr::V4(SocketAddrV4::new(group, address.required_port()?));
    let socket = new_socket(address, Domain::IPV4, Type::DGRAM, SocketProtocol::UDP)?;
    socket
        .set_multicast_ttl_v4(config.multicast_ttl())
        .context(FailedToConfigure {
            address: address.to_string(),
            setting: "IP_MULTICAST_TTL",
        })?;

    debug!(endpoint = %address, %group, ttl = config.multicast_ttl(), "Created multicast sender.");
    Ok((socket.into(), peer))
}

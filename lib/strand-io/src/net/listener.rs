//! Listener loops for server endpoints.
use std::{
    io::{self, Read as _},
    net::{SocketAddr, TcpListener, TcpStream, UdpSocket},
    sync::Arc,
    thread,
};

use bytes::{Bytes, BytesMut};
use metrics::counter;
use snafu::ResultExt as _;
use strand_core::{
    context::RuntimeContext,
    goroutine::{GoroutineConfig, GoroutineManager},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{EndpointError, FailedToStartListener, Protocol, TransportConfig};
use crate::framing::FrameDecoder;

const READ_BUFFER_LEN: usize = 8192;
const MAX_DATAGRAM_LEN: usize = 65_536;

/// Receives every inbound message.
///
/// Returns `false` once the receiver can no longer accept messages, which stops the connection or socket loop that
/// produced the message.
pub(super) type MessageSink = Arc<dyn Fn(Bytes, &CancellationToken) -> bool + Send + Sync>;

/// Owned listener threads for a server endpoint.
///
/// Stopping the listener cancels its token and joins every thread it started.
pub(super) struct Listener {
    token: CancellationToken,
    goroutines: Arc<GoroutineManager>,
}

impl Listener {
    fn new(context: &RuntimeContext) -> Self {
        let config = GoroutineConfig::unbounded().with_thread_name_prefix("strand-listen");
        Self {
            token: CancellationToken::new(),
            goroutines: Arc::new(GoroutineManager::with_context(config, context.clone())),
        }
    }

    pub fn spawn_tcp(
        listener: TcpListener, endpoint: String, config: &TransportConfig, context: &RuntimeContext, sink: MessageSink,
    ) -> Result<Self, EndpointError> {
        let this = Self::new(context);
        let accept = AcceptLoop {
            listener,
            endpoint: endpoint.clone(),
            config: config.clone(),
            token: this.token.clone(),
            goroutines: Arc::clone(&this.goroutines),
            sink,
        };
        this.goroutines
            .spawn(move || accept.run())
            .context(FailedToStartListener { address: endpoint })?;
        Ok(this)
    }

    pub fn spawn_datagram(
        socket: UdpSocket, endpoint: String, protocol: Protocol, config: &TransportConfig, context: &RuntimeContext,
        sink: MessageSink,
    ) -> Result<Self, EndpointError> {
        let this = Self::new(context);
        let token = this.token.clone();
        let poll_interval = config.poll_interval();
        let address = endpoint.clone();
        this.goroutines
            .spawn(move || run_datagram_loop(socket, address, protocol, poll_interval, token, sink))
            .context(FailedToStartListener { address: endpoint })?;
        Ok(this)
    }

    pub fn stop(&self) {
        self.token.cancel();
        // Connections accepted just before cancellation may be registered after the first pass.
        self.goroutines.join_all();
        self.goroutines.join_all();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

struct AcceptLoop {
    listener: TcpListener,
    endpoint: String,
    config: TransportConfig,
    token: CancellationToken,
    goroutines: Arc<GoroutineManager>,
    sink: MessageSink,
}

impl AcceptLoop {
    fn run(self) {
        debug!(endpoint = %self.endpoint, "Accept loop started.");

        while !self.token.is_cancelled() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.spawn_connection(stream, peer) {
                        warn!(endpoint = %self.endpoint, %peer, error = %e, "Dropping connection.");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(self.config.poll_interval()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(endpoint = %self.endpoint, error = %e, "Failed to accept connection. Stopping listener.");
                    break;
                }
            }
        }

        debug!(endpoint = %self.endpoint, "Accept loop stopped.");
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        // Accepted sockets inherit non-blocking mode from the listener on some platforms.
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.config.poll_interval()))?;

        debug!(endpoint = %self.endpoint, %peer, "Accepted connection.");

        let connection = Connection {
            stream,
            peer,
            endpoint: self.endpoint.clone(),
            decoder: FrameDecoder::new(self.config.max_frame_len()),
            token: self.token.clone(),
            sink: Arc::clone(&self.sink),
        };
        self.goroutines
            .spawn(move || connection.run())
            .map_err(io::Error::other)
    }
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    endpoint: String,
    decoder: FrameDecoder,
    token: CancellationToken,
    sink: MessageSink,
}

impl Connection {
    fn run(mut self) {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_LEN);
        let mut chunk = [0; READ_BUFFER_LEN];

        while !self.token.is_cancelled() {
            let n = match self.stream.read(&mut chunk) {
                Ok(0) => {
                    if let Err(e) = self.decoder.decode_eof(&mut buf) {
                        warn!(endpoint = %self.endpoint, peer = %self.peer, error = %e, "Connection closed mid-frame.");
                    }
                    break;
                }
                Ok(n) => n,
                Err(e) if is_timeout(&e) => continue,
                Err(e) => {
                    debug!(endpoint = %self.endpoint, peer = %self.peer, error = %e, "Connection read failed.");
                    break;
                }
            };

            buf.extend_from_slice(&chunk[..n]);
            if !self.drain(&mut buf) {
                break;
            }
        }

        debug!(endpoint = %self.endpoint, peer = %self.peer, "Connection closed.");
    }

    // Delivers every complete frame in `buf`. Returns `false` if the connection should be dropped.
    fn drain(&mut self, buf: &mut BytesMut) -> bool {
        loop {
            match self.decoder.decode(buf) {
                Ok(Some(frame)) => {
                    counter!("strand_transport_frames_received_total", "protocol" => Protocol::Tcp.as_str())
                        .increment(1);
                    if !(self.sink)(frame, &self.token) {
                        return false;
                    }
                }
                Ok(None) => return true,
                Err(e) => {
                    error!(
                        endpoint = %self.endpoint, peer = %self.peer, error = %e,
                        "Invalid frame. Dropping connection."
                    );
                    return false;
                }
            }
        }
    }
}

fn run_datagram_loop(
    socket: UdpSocket, endpoint: String, protocol: Protocol, poll_interval: std::time::Duration,
    token: CancellationToken, sink: MessageSink,
) {
    if let Err(e) = socket.set_read_timeout(Some(poll_interval)) {
        error!(endpoint = %endpoint, error = %e, "Failed to set read timeout. Stopping listener.");
        return;
    }

    debug!(endpoint = %endpoint, "Receive loop started.");

    let mut buf = vec![0; MAX_DATAGRAM_LEN];
    while !token.is_cancelled() {
        match socket.recv_from(&mut buf) {
            Ok((n, peer)) => {
                counter!("strand_transport_frames_received_total", "protocol" => protocol.as_str()).increment(1);
                if !sink(Bytes::copy_from_slice(&buf[..n]), &token) {
                    debug!(endpoint = %endpoint, %peer, "Receiver closed.");
                    break;
                }
            }
            Err(e) if is_timeout(&e) => {}
            Err(e) => {
                error!(endpoint = %endpoint, error = %e, "Failed to receive datagram. Stopping listener.");
                break;
            }
        }
    }

    debug!(endpoint = %endpoint, "Receive loop stopped.");
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

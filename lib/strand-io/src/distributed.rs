use std::{fmt, net::SocketAddr};

use snafu::{ResultExt as _, Snafu};
use strand_core::{
    channel::{Channel, ChannelError, ChannelPattern},
    context::RuntimeContext,
};
use tracing::{debug, warn};

use crate::{
    message::WireMessage,
    net::{Endpoint, EndpointAddress, EndpointError, TransportConfig},
};

/// Error returned by [`DistributedChannel::distributed_send`].
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum DistributedSendError {
    /// The value could not be enqueued on the local channel. Nothing was transmitted.
    #[snafu(display("failed to enqueue locally: {}", source))]
    Local {
        /// Source of the error.
        source: ChannelError,
    },

    /// The value could not be encoded for the attached endpoint. Nothing was enqueued or transmitted.
    #[snafu(display("failed to encode for transmission: {}", source))]
    Encode {
        /// Source of the error.
        source: EndpointError,
    },

    /// The value was enqueued locally, but transmitting it failed.
    #[snafu(display("failed to transmit: {}", source))]
    Remote {
        /// Source of the error.
        source: EndpointError,
    },
}

/// A channel bridged to a network endpoint.
///
/// When a server endpoint is attached, every message it receives is decoded and sent into the channel, blocking the
/// receiving connection while the channel is full. When a client endpoint is attached, values can be transmitted to
/// the remote side with [`send_to_endpoint`][Self::send_to_endpoint] or
/// [`distributed_send`][Self::distributed_send].
///
/// Attaching happens before the channel is shared with other threads: `attach` takes `&mut self`.
pub struct DistributedChannel<T> {
    channel: Channel<T>,
    endpoint: Option<Endpoint>,
    context: RuntimeContext,
    config: TransportConfig,
}

impl<T> DistributedChannel<T>
where
    T: WireMessage + Send + 'static,
{
    /// Wraps an existing channel. No endpoint is attached.
    pub fn new(channel: Channel<T>) -> Self {
        Self {
            channel,
            endpoint: None,
            context: RuntimeContext::default(),
            config: TransportConfig::default(),
        }
    }

    /// Creates a channel with the given capacity and pattern, and attaches `endpoint` if one is given.
    ///
    /// # Errors
    ///
    /// If `capacity` is zero, or the endpoint cannot be attached, an error is returned. Endpoint failures are reported
    /// as [`ChannelError::InvalidEndpoint`].
    pub fn create(capacity: usize, pattern: ChannelPattern, endpoint: Option<&str>) -> Result<Self, ChannelError> {
        let mut channel = Self::new(Channel::with_pattern(capacity, pattern)?);
        if let Some(url) = endpoint {
            channel.attach(url).map_err(|e| ChannelError::InvalidEndpoint { reason: e.to_string() })?;
        }
        Ok(channel)
    }

    /// Sets the runtime context consulted when attaching endpoints.
    pub fn with_context(mut self, context: RuntimeContext) -> Self {
        self.context = context;
        self
    }

    /// Sets the transport configuration used when attaching endpoints.
    pub fn with_config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the local channel.
    pub fn channel(&self) -> &Channel<T> {
        &self.channel
    }

    /// Returns the attached endpoint, if any.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// Returns the local socket address of the attached endpoint, if it has one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.as_ref().and_then(Endpoint::local_addr)
    }

    /// Parses `url`, initializes the endpoint, and attaches it.
    ///
    /// Server endpoints start listening immediately. Inbound messages that fail to decode are logged and dropped. An
    /// endpoint that is already attached is shut down and replaced.
    ///
    /// # Errors
    ///
    /// If the URL is invalid, network access is not permitted, or the endpoint cannot be initialized or started, an
    /// error is returned and the previously attached endpoint, if any, is left in place.
    pub fn attach(&mut self, url: &str) -> Result<(), EndpointError> {
        let address = EndpointAddress::parse(url)?;
        let mut endpoint = Endpoint::initialize_with_context(address, &self.config, &self.context)?;

        if endpoint.is_server() {
            let channel = self.channel.clone();
            let source = endpoint.address().to_string();
            endpoint.listen(move |payload, token| match T::decode(payload) {
                Ok(value) => match channel.send_until(value, token) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(endpoint = %source, error = %e, "Channel no longer accepting messages.");
                        false
                    }
                },
                Err(e) => {
                    warn!(endpoint = %source, error = %e, "Dropping message that failed to decode.");
                    true
                }
            })?;
        }

        debug!(endpoint = %endpoint.address(), pattern = %self.channel.pattern(), "Attached endpoint to channel.");
        self.endpoint = Some(endpoint);
        Ok(())
    }

    /// Detaches the endpoint, returning it.
    ///
    /// The endpoint's listener keeps running until the returned endpoint is dropped or shut down.
    pub fn detach(&mut self) -> Option<Endpoint> {
        self.endpoint.take()
    }

    /// Transmits `value` through the attached endpoint without enqueuing it locally.
    ///
    /// # Errors
    ///
    /// If no endpoint is attached, the endpoint is a server, or the transmission fails, an error is returned.
    pub fn send_to_endpoint(&self, value: &T) -> Result<(), EndpointError> {
        let endpoint = self.endpoint.as_ref().ok_or(EndpointError::NoEndpoint)?;
        endpoint.send(&value.to_bytes())
    }

    /// Enqueues `value` locally and then, if a client endpoint is attached, transmits it.
    ///
    /// The value is encoded for the endpoint before it is enqueued, so a value the endpoint can never carry is
    /// rejected without touching the local channel.
    ///
    /// # Errors
    ///
    /// If encoding fails, nothing is enqueued and [`DistributedSendError::Encode`] is returned. If the local send
    /// fails, nothing is transmitted and [`DistributedSendError::Local`] is returned. If the transmission fails, the
    /// value stays enqueued and [`DistributedSendError::Remote`] is returned.
    pub fn distributed_send(&self, value: T) -> Result<(), DistributedSendError> {
        let outbound = match self.endpoint.as_ref().filter(|endpoint| !endpoint.is_server()) {
            Some(endpoint) => Some((endpoint, endpoint.encode(&value.to_bytes()).context(Encode)?)),
            None => None,
        };

        self.channel.send(value).context(Local)?;

        if let Some((endpoint, wire)) = outbound {
            endpoint.transmit(&wire).context(Remote)?;
        }
        Ok(())
    }

    /// Stops the attached endpoint and closes the local channel.
    pub fn shutdown(&mut self) {
        if let Some(mut endpoint) = self.endpoint.take() {
            endpoint.shutdown();
        }
        self.channel.close();
    }
}

impl<T> fmt::Debug for DistributedChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedChannel")
            .field("channel", &self.channel)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_without_endpoint() {
        let channel = DistributedChannel::<u32>::create(4, ChannelPattern::Push, None).unwrap();
        assert!(channel.endpoint().is_none());
        assert_eq!(channel.channel().pattern(), ChannelPattern::Push);
        assert!(matches!(channel.send_to_endpoint(&1), Err(EndpointError::NoEndpoint)));

        channel.distributed_send(7).unwrap();
        assert_eq!(channel.channel().receive(), Ok(7));
    }

    #[test]
    fn create_rejects_bad_endpoints() {
        let result = DistributedChannel::<u32>::create(4, ChannelPattern::Default, Some("tcp:/nowhere"));
        assert!(matches!(result, Err(ChannelError::InvalidEndpoint { .. })));

        let result = DistributedChannel::<u32>::create(4, ChannelPattern::Default, Some("ipc://bridge"));
        assert!(matches!(result, Err(ChannelError::InvalidEndpoint { .. })));

        let result = DistributedChannel::<u32>::create(0, ChannelPattern::Default, None);
        assert!(matches!(result, Err(ChannelError::InvalidCapacity { .. })));
    }

    #[test]
    fn local_failure_short_circuits() {
        let mut channel = DistributedChannel::<String>::create(1, ChannelPattern::Pair, Some("inproc://pair")).unwrap();
        assert!(channel.endpoint().is_some());

        channel.channel().close();
        assert!(matches!(
            channel.distributed_send("dropped".to_string()),
            Err(DistributedSendError::Local {
                source: ChannelError::Closed
            })
        ));

        channel.shutdown();
        assert!(channel.endpoint().is_none());
    }
}

//! Network transport for strand channels.
//!
//! This crate bridges [`Channel`][strand_core::channel::Channel]s across processes. An endpoint URL such as
//! `tcp://*:9000` or `udp://10.0.0.5:53` is parsed into an [`EndpointAddress`][net::EndpointAddress], turned into a
//! live [`Endpoint`][net::Endpoint], and attached to a channel through a [`DistributedChannel`].
#![deny(warnings)]
#![deny(missing_docs)]

mod distributed;
pub use self::distributed::{DistributedChannel, DistributedSendError};

pub mod framing;
pub mod message;
pub mod net;

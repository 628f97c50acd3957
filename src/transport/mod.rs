//! Socket transports: a TCP circuit per server and priority, and the UDP
//! transport used for searches and beacons.
//!
//! Transports turn readiness events into complete frames and hand each one to a
//! [`ResponseHandler`] along with the transport it arrived on. Channels that use
//! a circuit register themselves as its owners ([`TransportClient`]) and are told
//! when the circuit goes away.

pub mod connector;
pub mod registry;
pub mod tcp;
pub mod udp;

use std::{io, net::SocketAddr};

use thiserror::Error;

use crate::{messages::Header, reactor::ReactorError};

pub use connector::TransportConnector;
pub use registry::TransportRegistry;
pub use tcp::{SendBufferGuard, TcpTransport};
pub use udp::BroadcastTransport;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Declared frame of {size} bytes exceeds receive buffer of {capacity}")]
    PayloadTooLarge { size: usize, capacity: usize },
    #[error("Send buffer still full after retrying, {pending} bytes unsent")]
    SendBufferFull { pending: usize },
    #[error("Peer closed the connection")]
    PeerDisconnected,
    #[error("Transport is closed")]
    Closed,
    #[error("Timed out connecting to {0}")]
    ConnectTimeout(SocketAddr),
    #[error(transparent)]
    Reactor(#[from] ReactorError),
}

impl TransportError {
    /// Errors after which the connection cannot be used any more
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::SendBufferFull { .. })
    }
}

/// What response handlers can ask of the transport a frame arrived on
pub trait Transport: Send + Sync {
    /// The peer, for a circuit. Datagram transports have no single peer.
    fn remote_address(&self) -> Option<SocketAddr>;

    fn priority(&self) -> u16;

    /// Protocol minor revision the peer announced, zero until known
    fn minor_revision(&self) -> u16;

    /// Record the minor revision from the peer's version message
    fn set_minor_revision(&self, _revision: u16) {}
}

/// An owner of a circuit, normally a channel
pub trait TransportClient: Send + Sync {
    fn client_id(&self) -> u32;

    /// The transport closed. Called once, without any transport lock held.
    fn transport_closed(&self);
}

/// Receives every complete frame read from a transport
pub trait ResponseHandler: Send + Sync {
    fn handle_response(
        &self,
        from: SocketAddr,
        transport: &dyn Transport,
        header: &Header,
        payload: &[u8],
    );
}

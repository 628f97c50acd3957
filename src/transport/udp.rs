//! The datagram transport used for searches, their replies and beacons.

use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicBool, AtomicU16, Ordering},
    },
};

use nom::Err::Incomplete;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::{ResponseHandler, Transport, TransportError};
use crate::{
    messages::{CA_DEFAULT_PRIORITY, Header, MAX_UDP_RECV},
    reactor::{Dispatcher, InterestOps, ReactorHandler, Readiness, SelectionKey},
};

pub struct BroadcastTransport {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    send_addresses: Vec<SocketAddr>,
    handler: Arc<dyn ResponseHandler>,
    dispatcher: Dispatcher,
    key: OnceLock<SelectionKey>,
    receive: Mutex<Vec<u8>>,
    closed: AtomicBool,
    minor_revision: AtomicU16,
}

struct UdpEvents(Weak<BroadcastTransport>);

impl ReactorHandler for UdpEvents {
    fn handle_event(&self, _key: SelectionKey, readiness: Readiness) {
        if let Some(transport) = self.0.upgrade()
            && readiness.readable
        {
            transport.process_read();
        }
    }
}

impl BroadcastTransport {
    /// Start receiving on `socket`; `send` goes to each of `send_addresses`
    pub fn new(
        socket: UdpSocket,
        send_addresses: Vec<SocketAddr>,
        handler: Arc<dyn ResponseHandler>,
        dispatcher: Dispatcher,
    ) -> Result<Arc<Self>, TransportError> {
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        let socket = Arc::new(socket);
        let transport = Arc::new(BroadcastTransport {
            socket: socket.clone(),
            local,
            send_addresses,
            handler,
            dispatcher: dispatcher.clone(),
            key: OnceLock::new(),
            receive: Mutex::new(vec![0u8; MAX_UDP_RECV]),
            closed: AtomicBool::new(false),
            minor_revision: AtomicU16::new(0),
        });
        let key = dispatcher.register(
            socket,
            InterestOps::READ,
            Arc::new(UdpEvents(Arc::downgrade(&transport))),
        )?;
        let _ = transport.key.set(key);
        debug!("Listening for datagrams on {local}");
        Ok(transport)
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local
    }

    pub fn send_addresses(&self) -> &[SocketAddr] {
        &self.send_addresses
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn send_to(&self, frame: &[u8], address: SocketAddr) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let sent = self.socket.send_to(frame, address)?;
        if sent < frame.len() {
            warn!("Only sent {sent} of {} bytes to {address}", frame.len());
        }
        Ok(())
    }

    /// Send a frame to every configured address.
    ///
    /// Fails only if no address could be sent to.
    pub fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut last_error = None;
        let mut any_sent = false;
        for &address in &self.send_addresses {
            match self.send_to(frame, address) {
                Ok(()) => any_sent = true,
                Err(e) => {
                    debug!("Failed to send datagram to {address}: {e}");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if !any_sent => Err(e),
            _ => Ok(()),
        }
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Closing datagram transport on {}", self.local);
        if let Some(&key) = self.key.get() {
            self.dispatcher.reactor().unregister_and_close(key, || {});
        }
    }

    fn process_read(&self) {
        let mut buffer = self.receive.lock();
        while !self.is_closed() {
            match self.socket.recv_from(&mut buffer) {
                Ok((size, from)) => {
                    trace!("Received {size} byte datagram from {from}");
                    process_datagram(from, self, self.handler.as_ref(), &buffer[..size]);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    // ICMP errors from earlier sends surface here; keep reading
                    debug!("Datagram receive error on {}: {e}", self.local);
                    break;
                }
            }
        }
    }
}

/// Hand each complete frame in one datagram to the handler.
///
/// Datagrams arrive whole, so a frame that claims more bytes than remain is
/// never completed by a later read; the rest of the datagram is dropped.
pub(crate) fn process_datagram(
    from: SocketAddr,
    transport: &dyn Transport,
    handler: &dyn ResponseHandler,
    mut datagram: &[u8],
) {
    while !datagram.is_empty() {
        let header = match Header::parse(datagram) {
            Ok((_, header)) => header,
            Err(Incomplete(_)) => {
                warn!(
                    "Discarding {} trailing bytes of datagram from {from}: truncated header",
                    datagram.len()
                );
                return;
            }
            Err(e) => {
                warn!("Discarding malformed datagram from {from}: {e}");
                return;
            }
        };
        let frame_len = header.frame_len();
        if frame_len > datagram.len() {
            warn!(
                "Discarding datagram from {from}: {} payload bytes declared, {} remain",
                header.payload_size,
                datagram.len() - header.encoded_len()
            );
            return;
        }
        let payload = &datagram[header.encoded_len()..frame_len];
        handler.handle_response(from, transport, &header, payload);
        datagram = &datagram[frame_len..];
    }
}

impl Transport for BroadcastTransport {
    fn remote_address(&self) -> Option<SocketAddr> {
        None
    }

    fn priority(&self) -> u16 {
        CA_DEFAULT_PRIORITY
    }

    fn minor_revision(&self) -> u16 {
        self.minor_revision.load(Ordering::Acquire)
    }

    fn set_minor_revision(&self, revision: u16) {
        self.minor_revision.store(revision, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AsBytes, Search, Version, command};

    #[derive(Default)]
    struct Collect(Mutex<Vec<(u16, usize)>>);

    impl ResponseHandler for Collect {
        fn handle_response(
            &self,
            _from: SocketAddr,
            _transport: &dyn Transport,
            header: &Header,
            payload: &[u8],
        ) {
            self.0.lock().push((header.command, payload.len()));
        }
    }

    struct NoTransport;
    impl Transport for NoTransport {
        fn remote_address(&self) -> Option<SocketAddr> {
            None
        }
        fn priority(&self) -> u16 {
            0
        }
        fn minor_revision(&self) -> u16 {
            0
        }
    }

    #[test]
    fn datagram_frames_dispatched_in_order() {
        let mut datagram = Version::default().as_bytes();
        datagram.extend(
            Search {
                search_id: 1,
                channel_name: "TEST:PV".to_string(),
                ..Default::default()
            }
            .as_bytes(),
        );
        let collect = Collect::default();
        process_datagram("127.0.0.1:5064".parse().unwrap(), &NoTransport, &collect, &datagram);
        assert_eq!(
            *collect.0.lock(),
            vec![(command::VERSION, 0), (command::SEARCH, 8)]
        );
    }

    #[test]
    fn truncated_datagram_is_discarded() {
        let mut datagram = Version::default().as_bytes();
        let search = Search {
            search_id: 1,
            channel_name: "A_LONGER_PV_NAME".to_string(),
            ..Default::default()
        }
        .as_bytes();
        datagram.extend(&search[..search.len() - 4]);
        let collect = Collect::default();
        process_datagram("127.0.0.1:5064".parse().unwrap(), &NoTransport, &collect, &datagram);
        assert_eq!(*collect.0.lock(), vec![(command::VERSION, 0)]);
    }

    #[test]
    fn extended_header_with_small_values_keeps_following_frames_aligned() {
        let mut datagram = Vec::new();
        Header {
            command: command::READ_NOTIFY,
            payload_size: 8,
            data_count: 1,
            extended: true,
            ..Default::default()
        }
        .write(&mut datagram)
        .unwrap();
        datagram.extend_from_slice(&[0xEE; 8]);
        datagram.extend(Version::default().as_bytes());
        let collect = Collect::default();
        process_datagram("127.0.0.1:5064".parse().unwrap(), &NoTransport, &collect, &datagram);
        assert_eq!(
            *collect.0.lock(),
            vec![(command::READ_NOTIFY, 8), (command::VERSION, 0)]
        );
    }
}

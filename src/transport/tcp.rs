//! A virtual circuit: one TCP connection to a server at a given priority.
//!
//! Reading happens on the reactor's dispatch thread. Bytes are read into a
//! fixed buffer big enough for the largest accepted frame, every complete frame
//! is handed to the response handler, and whatever is left over is moved to the
//! front of the buffer for the next read.
//!
//! Sending goes through a single send buffer guarded by a lock. Callers take a
//! [`SendBufferGuard`], append messages, then flush, commit or discard them; a
//! guard dropped without either rolls its messages back.

use std::{
    collections::HashMap,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicBool, AtomicU16, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use nom::Err::Incomplete;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, debug_span, error, trace, warn};

use super::{ResponseHandler, Transport, TransportClient, TransportError, TransportRegistry};
use crate::{
    messages::{
        CA_MINOR_PROTOCOL_REVISION, CAMessage, ClientName, Echo, EventsOff, EventsOn, Header,
        HostName, Version,
    },
    reactor::{Dispatcher, InterestOps, ReactorHandler, Readiness, SelectionKey},
};

/// Consecutive completely-full reads before flow control is asserted
const FLOW_CONTROL_THRESHOLD: usize = 3;
/// Leftovers shorter than this are moved byte by byte
const COMPACT_COPY_THRESHOLD: usize = 64;
const MAX_SEND_CHUNK: usize = 64 * 1024;
const SEND_RETRIES: u32 = 8;
const INITIAL_SEND_BACKOFF: Duration = Duration::from_millis(1);
const MAX_SEND_BACKOFF: Duration = Duration::from_millis(100);
/// How long close waits for a busy send buffer before giving up on flushing
const CLOSE_FLUSH_WAIT: Duration = Duration::from_millis(200);

struct ReceiveBuffer {
    data: Vec<u8>,
    filled: usize,
    consecutive_full: usize,
    flow_control: bool,
}

struct Liveness {
    last_received: Instant,
    echo_sent: Option<Instant>,
}

pub struct TcpTransport {
    stream: Arc<TcpStream>,
    remote: SocketAddr,
    priority: u16,
    dispatcher: Dispatcher,
    key: OnceLock<SelectionKey>,
    handler: Arc<dyn ResponseHandler>,
    receive: Mutex<ReceiveBuffer>,
    send: Mutex<Vec<u8>>,
    owners: Mutex<HashMap<u32, Arc<dyn TransportClient>>>,
    closed: AtomicBool,
    minor_revision: AtomicU16,
    liveness: Mutex<Liveness>,
    registry: Weak<TransportRegistry>,
}

/// Reactor-side view of a transport, so the reactor never keeps it alive
struct TcpEvents(Weak<TcpTransport>);

impl ReactorHandler for TcpEvents {
    fn handle_event(&self, _key: SelectionKey, readiness: Readiness) {
        if let Some(transport) = self.0.upgrade()
            && (readiness.readable || readiness.closed || readiness.error)
        {
            transport.process_read();
        }
    }
}

impl TcpTransport {
    /// Wrap a connected stream and start reading from it.
    ///
    /// `receive_capacity` bounds the largest frame (header included) that will
    /// be accepted.
    pub fn new(
        stream: TcpStream,
        priority: u16,
        receive_capacity: usize,
        handler: Arc<dyn ResponseHandler>,
        dispatcher: Dispatcher,
        registry: Weak<TransportRegistry>,
    ) -> Result<Arc<Self>, TransportError> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let remote = stream.peer_addr()?;
        let stream = Arc::new(stream);
        let transport = Arc::new(TcpTransport {
            stream: stream.clone(),
            remote,
            priority,
            dispatcher: dispatcher.clone(),
            key: OnceLock::new(),
            handler,
            receive: Mutex::new(ReceiveBuffer {
                data: vec![0u8; receive_capacity],
                filled: 0,
                consecutive_full: 0,
                flow_control: false,
            }),
            send: Mutex::new(Vec::new()),
            owners: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            minor_revision: AtomicU16::new(0),
            liveness: Mutex::new(Liveness {
                last_received: Instant::now(),
                echo_sent: None,
            }),
            registry,
        });
        let key = dispatcher.register(
            stream,
            InterestOps::READ,
            Arc::new(TcpEvents(Arc::downgrade(&transport))),
        )?;
        let _ = transport.key.set(key);
        debug!("Opened circuit to {remote} at priority {priority}");
        Ok(transport)
    }

    pub fn address(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_flow_controlled(&self) -> bool {
        self.receive.lock().flow_control
    }

    /// Send version and identification, the first messages on any circuit
    pub fn send_handshake(
        &self,
        client_name: Option<&str>,
        host_name: Option<&str>,
    ) -> Result<(), TransportError> {
        let client_name = client_name
            .map(|u| u.to_string())
            .unwrap_or_else(whoami::username);
        let host_name = host_name
            .map(|h| h.to_string())
            .or_else(|| whoami::fallible::hostname().ok())
            .unwrap_or_else(|| client_name.clone());
        let mut buffer = self.acquire_send_buffer()?;
        buffer.push(&Version {
            priority: self.priority,
            protocol_version: CA_MINOR_PROTOCOL_REVISION,
            sequence: 0,
        })?;
        buffer.push(&ClientName { name: client_name })?;
        buffer.push(&HostName { name: host_name })?;
        buffer.flush()
    }

    /// Add an owner. Fails if the transport has already closed.
    pub fn acquire(&self, client: Arc<dyn TransportClient>) -> bool {
        let mut owners = self.owners.lock();
        if self.is_closed() {
            return false;
        }
        trace!("Circuit {} acquired by {}", self.remote, client.client_id());
        owners.insert(client.client_id(), client);
        true
    }

    /// Remove an owner, closing the transport when the last one leaves
    pub fn release(&self, client_id: u32) {
        let now_unowned = {
            let mut owners = self.owners.lock();
            owners.remove(&client_id).is_some() && owners.is_empty()
        };
        trace!("Circuit {} released by {client_id}", self.remote);
        if now_unowned {
            debug!("Last owner of circuit {} released it", self.remote);
            self.close(false);
        }
    }

    pub fn owner_count(&self) -> usize {
        self.owners.lock().len()
    }

    /// Lock the send buffer for appending messages
    pub fn acquire_send_buffer(&self) -> Result<SendBufferGuard<'_>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let buffer = self.send.lock();
        let mark = buffer.len();
        Ok(SendBufferGuard {
            transport: self,
            buffer,
            mark,
            finished: false,
        })
    }

    /// Send a single message immediately
    pub fn send<M: CAMessage>(&self, message: &M) -> Result<(), TransportError> {
        let mut buffer = self.acquire_send_buffer()?;
        buffer.push(message)?;
        buffer.flush()
    }

    /// Write out anything committed to the send buffer
    pub fn flush(&self) -> Result<(), TransportError> {
        self.acquire_send_buffer()?.flush()
    }

    /// Write the whole buffer, retrying with backoff while the socket is full.
    ///
    /// On `SendBufferFull` the unsent remainder stays in the buffer.
    fn write_out(&self, buffer: &mut Vec<u8>) -> Result<(), TransportError> {
        let mut written = 0;
        let mut retries = 0;
        let mut backoff = INITIAL_SEND_BACKOFF;
        while written < buffer.len() {
            let end = buffer.len().min(written + MAX_SEND_CHUNK);
            match (&*self.stream).write(&buffer[written..end]) {
                Ok(0) => return Err(TransportError::PeerDisconnected),
                Ok(n) => {
                    written += n;
                    retries = 0;
                    backoff = INITIAL_SEND_BACKOFF;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    retries += 1;
                    if retries > SEND_RETRIES {
                        buffer.drain(..written);
                        return Err(TransportError::SendBufferFull {
                            pending: buffer.len(),
                        });
                    }
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_SEND_BACKOFF);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        trace!("Flushed {written} bytes to {}", self.remote);
        buffer.clear();
        Ok(())
    }

    /// Note that the peer is alive
    pub fn mark_alive(&self) {
        let mut liveness = self.liveness.lock();
        liveness.last_received = Instant::now();
        liveness.echo_sent = None;
    }

    /// Probe a quiet circuit with an echo, closing it if a probe went unanswered.
    ///
    /// Returns false if the transport is (now) closed.
    pub fn check_liveness(&self, now: Instant, timeout: Duration) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut liveness = self.liveness.lock();
        match liveness.echo_sent {
            Some(sent) if now.saturating_duration_since(sent) >= timeout => {
                drop(liveness);
                warn!("Circuit to {} is unresponsive, closing", self.remote);
                self.close(true);
                false
            }
            Some(_) => true,
            None if now.saturating_duration_since(liveness.last_received) >= timeout / 2 => {
                liveness.echo_sent = Some(now);
                drop(liveness);
                trace!("Sending echo to {}", self.remote);
                if let Err(e) = self.send(&Echo) {
                    debug!("Failed to send echo to {}: {e}", self.remote);
                }
                !self.is_closed()
            }
            None => true,
        }
    }

    /// Close the transport. Only the first call has any effect.
    ///
    /// Pending sends are flushed unless the peer has already gone. Every owner
    /// is told exactly once, with no lock held.
    pub fn close(&self, remote_closed: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _span = debug_span!("close", remote = %self.remote).entered();
        debug!("Closing circuit (remote closed: {remote_closed})");

        if !remote_closed {
            match self.send.try_lock_for(CLOSE_FLUSH_WAIT) {
                Some(mut buffer) if !buffer.is_empty() => {
                    if let Err(e) = self.write_out(&mut buffer) {
                        debug!("Could not flush before closing: {e}");
                    }
                }
                Some(_) => {}
                None => warn!("Send buffer busy, closing without flushing"),
            }
        }

        match self.key.get() {
            Some(&key) => {
                let stream = self.stream.clone();
                self.dispatcher.reactor().unregister_and_close(key, move || {
                    let _ = stream.shutdown(Shutdown::Both);
                });
            }
            None => {
                let _ = self.stream.shutdown(Shutdown::Both);
            }
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self);
        }

        let owners: Vec<Arc<dyn TransportClient>> =
            self.owners.lock().drain().map(|(_, owner)| owner).collect();
        for owner in owners {
            if catch_unwind(AssertUnwindSafe(|| owner.transport_closed())).is_err() {
                error!(
                    "Owner {} panicked while being told its circuit closed",
                    owner.client_id()
                );
            }
        }
    }

    fn process_read(&self) {
        let mut receive = self.receive.lock();
        loop {
            if self.is_closed() {
                return;
            }
            let ReceiveBuffer { data, filled, .. } = &mut *receive;
            let capacity = data.len();
            let read = match (&*self.stream).read(&mut data[*filled..]) {
                Ok(0) => {
                    drop(receive);
                    debug!("Circuit to {} closed by peer", self.remote);
                    self.close(true);
                    return;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    drop(receive);
                    warn!("Read from {} failed: {e}", self.remote);
                    self.close(true);
                    return;
                }
            };
            *filled += read;
            let buffer_full = *filled == capacity;
            trace!("Read {read} bytes from {}", self.remote);
            self.mark_alive();
            self.update_flow_control(&mut receive, buffer_full);

            if let Err(e) = self.process_frames(&mut receive) {
                drop(receive);
                error!("Closing circuit to {}: {e}", self.remote);
                self.close(false);
                return;
            }
            if receive.flow_control {
                // Give other sockets a turn, and get polled again for the rest
                if let Some(&key) = self.key.get() {
                    self.dispatcher.yield_key(key);
                }
                return;
            }
        }
    }

    fn update_flow_control(&self, receive: &mut ReceiveBuffer, buffer_full: bool) {
        if buffer_full {
            receive.consecutive_full += 1;
            if receive.consecutive_full > FLOW_CONTROL_THRESHOLD && !receive.flow_control {
                debug!("Asserting flow control on {}", self.remote);
                receive.flow_control = true;
                if let Err(e) = self.send(&EventsOff) {
                    debug!("Could not send EVENTS_OFF: {e}");
                }
            }
        } else {
            receive.consecutive_full = 0;
            if receive.flow_control {
                debug!("Releasing flow control on {}", self.remote);
                receive.flow_control = false;
                if let Err(e) = self.send(&EventsOn) {
                    debug!("Could not send EVENTS_ON: {e}");
                }
            }
        }
    }

    /// Deliver every complete frame, then compact the remainder
    fn process_frames(&self, receive: &mut ReceiveBuffer) -> Result<(), TransportError> {
        let capacity = receive.data.len();
        let mut position = 0;
        while position < receive.filled {
            let available = &receive.data[position..receive.filled];
            let header = match Header::parse(available) {
                Ok((_, header)) => header,
                Err(Incomplete(_)) => break,
                Err(e) => {
                    return Err(TransportError::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("Malformed header: {e}"),
                    )));
                }
            };
            let frame_len = header.frame_len();
            if frame_len > capacity {
                return Err(TransportError::PayloadTooLarge {
                    size: frame_len,
                    capacity,
                });
            }
            if available.len() < frame_len {
                break;
            }
            let payload = &available[header.encoded_len()..frame_len];
            trace!("Frame from {}: {header:?}", self.remote);
            self.handler
                .handle_response(self.remote, self, &header, payload);
            position += frame_len;
        }
        receive.filled = compact(&mut receive.data, position, receive.filled);
        Ok(())
    }
}

/// Move `data[start..end]` to the front, returning the new fill level
fn compact(data: &mut [u8], start: usize, end: usize) -> usize {
    let remaining = end - start;
    if start == 0 {
        return remaining;
    }
    if remaining < COMPACT_COPY_THRESHOLD {
        for i in 0..remaining {
            data[i] = data[start + i];
        }
    } else {
        data.copy_within(start..end, 0);
    }
    remaining
}

impl Transport for TcpTransport {
    fn remote_address(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    fn priority(&self) -> u16 {
        self.priority
    }

    fn minor_revision(&self) -> u16 {
        self.minor_revision.load(Ordering::Acquire)
    }

    fn set_minor_revision(&self, revision: u16) {
        self.minor_revision.store(revision, Ordering::Release);
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("remote", &self.remote)
            .field("priority", &self.priority)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Exclusive access to a transport's send buffer
pub struct SendBufferGuard<'a> {
    transport: &'a TcpTransport,
    buffer: MutexGuard<'a, Vec<u8>>,
    /// Buffer length when this guard was taken
    mark: usize,
    finished: bool,
}

impl SendBufferGuard<'_> {
    pub fn push<M: CAMessage>(&mut self, message: &M) -> Result<(), TransportError> {
        message.write(&mut *self.buffer)?;
        Ok(())
    }

    /// Raw access, for payloads already encoded
    pub fn buffer(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }

    /// Bytes waiting to be sent, including anything committed earlier
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Keep the appended messages for a later flush
    pub fn commit(mut self) {
        self.finished = true;
    }

    /// Drop everything appended through this guard
    pub fn discard(mut self) {
        let mark = self.mark;
        self.buffer.truncate(mark);
        self.finished = true;
    }

    /// Send everything now. Fatal errors close the transport once the buffer
    /// has been released.
    pub fn flush(mut self) -> Result<(), TransportError> {
        self.finished = true;
        let transport = self.transport;
        let result = transport.write_out(&mut self.buffer);
        drop(self);
        if let Err(e) = &result
            && e.is_fatal()
        {
            warn!("Send to {} failed: {e}", transport.remote);
            transport.close(true);
        }
        result
    }
}

impl Drop for SendBufferGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let mark = self.mark;
            self.buffer.truncate(mark);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compaction_moves_remainder_to_front() {
        let mut data: Vec<u8> = (0..200).map(|i| i as u8).collect();
        assert_eq!(compact(&mut data, 10, 20), 10);
        assert_eq!(&data[..10], &(10..20).collect::<Vec<u8>>()[..]);

        let mut data: Vec<u8> = (0..200).map(|i| i as u8).collect();
        assert_eq!(compact(&mut data, 50, 200), 150);
        assert_eq!(data[0], 50);
        assert_eq!(data[149], 199);

        assert_eq!(compact(&mut data, 0, 30), 30);
    }
}

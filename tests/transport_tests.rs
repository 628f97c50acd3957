use std::{
    io::{ErrorKind, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Barrier, Weak,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use epicars_client::{
    messages::{AsBytes, Echo, EventsOff, EventsOn, Header, RawMessage, command},
    reactor::{Dispatcher, LeaderFollowersThreadPool, Reactor},
    transport::{
        ResponseHandler, TcpTransport, Transport, TransportClient, TransportConnector,
        TransportError, TransportRegistry,
    },
};
use parking_lot::Mutex;
use socket2::SockRef;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::TestWriter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_writer(TestWriter::new())
        .try_init();
}

fn start_dispatcher() -> (Arc<LeaderFollowersThreadPool>, Dispatcher) {
    let reactor = Arc::new(Reactor::new().unwrap());
    let pool = LeaderFollowersThreadPool::new(reactor, 2).unwrap();
    pool.start().unwrap();
    (pool.clone(), Dispatcher::leader_followers(pool))
}

/// Forwards every frame to a channel
struct Collect(Mutex<mpsc::Sender<(Header, Vec<u8>)>>);

impl ResponseHandler for Collect {
    fn handle_response(
        &self,
        _from: SocketAddr,
        _transport: &dyn Transport,
        header: &Header,
        payload: &[u8],
    ) {
        let _ = self.0.lock().send((*header, payload.to_vec()));
    }
}

struct Ignore;

impl ResponseHandler for Ignore {
    fn handle_response(&self, _: SocketAddr, _: &dyn Transport, _: &Header, _: &[u8]) {}
}

struct Owner {
    id: u32,
    closed: AtomicUsize,
}

impl Owner {
    fn new(id: u32) -> Arc<Self> {
        Arc::new(Owner {
            id,
            closed: AtomicUsize::new(0),
        })
    }

    fn times_closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl TransportClient for Owner {
    fn client_id(&self) -> u32 {
        self.id
    }

    fn transport_closed(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// A connected client stream and the server end it talks to
fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (stream, server)
}

/// Read from the server end until at least `count` whole messages have arrived
fn read_messages(server: &mut TcpStream, count: usize) -> Vec<RawMessage> {
    server
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut received = Vec::new();
    loop {
        let mut messages = Vec::new();
        let mut rest = received.as_slice();
        while let Ok((remaining, message)) = RawMessage::parse(rest) {
            messages.push(message);
            rest = remaining;
        }
        if messages.len() >= count {
            return messages;
        }
        let mut chunk = [0u8; 256];
        let n = server.read(&mut chunk).unwrap();
        assert!(n > 0, "circuit closed early");
        received.extend_from_slice(&chunk[..n]);
    }
}

fn assert_nothing_more(server: &mut TcpStream) {
    server
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let mut buffer = [0u8; 16];
    let error = server.read(&mut buffer).unwrap_err();
    assert!(
        matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
        "{error}"
    );
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn fragmented_frames_are_reassembled() {
    init_tracing();
    let (pool, dispatcher) = start_dispatcher();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (mut server, _) = listener.accept().unwrap();

    let (tx, rx) = mpsc::channel();
    let transport = TcpTransport::new(
        stream,
        0,
        1024,
        Arc::new(Collect(Mutex::new(tx))),
        dispatcher,
        Weak::new(),
    )
    .unwrap();

    let mut wire = RawMessage {
        command: command::EVENT_ADD,
        data_type: 5,
        data_count: 10,
        parameter_2: 3,
        payload: (0..40).collect(),
        ..Default::default()
    }
    .as_bytes();
    wire.extend(
        RawMessage {
            command: command::ECHO,
            ..Default::default()
        }
        .as_bytes(),
    );
    // Large element count forces the extended header
    wire.extend(
        RawMessage {
            command: command::READ_NOTIFY,
            data_count: 70_000,
            payload: vec![7; 8],
            ..Default::default()
        }
        .as_bytes(),
    );
    for chunk in wire.chunks(5) {
        server.write_all(chunk).unwrap();
        server.flush().unwrap();
        thread::sleep(Duration::from_millis(2));
    }

    let timeout = Duration::from_secs(5);
    let (header, payload) = rx.recv_timeout(timeout).unwrap();
    assert_eq!(header.command, command::EVENT_ADD);
    assert_eq!(header.parameter_2, 3);
    assert_eq!(payload, (0..40).collect::<Vec<u8>>());

    let (header, payload) = rx.recv_timeout(timeout).unwrap();
    assert_eq!(header.command, command::ECHO);
    assert!(payload.is_empty());

    let (header, payload) = rx.recv_timeout(timeout).unwrap();
    assert_eq!(header.command, command::READ_NOTIFY);
    assert!(header.is_extended());
    assert_eq!(header.data_count, 70_000);
    assert_eq!(payload, vec![7; 8]);

    transport.close(false);
    pool.shutdown(Duration::from_secs(1));
}

#[test]
fn oversized_frame_closes_circuit() {
    init_tracing();
    let (pool, dispatcher) = start_dispatcher();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (mut server, _) = listener.accept().unwrap();

    let transport =
        TcpTransport::new(stream, 0, 64, Arc::new(Ignore), dispatcher, Weak::new()).unwrap();
    let owner = Owner::new(1);
    assert!(transport.acquire(owner.clone()));

    let mut header = Vec::new();
    Header {
        command: command::EVENT_ADD,
        payload_size: 1024,
        ..Default::default()
    }
    .write(&mut header)
    .unwrap();
    server.write_all(&header).unwrap();

    assert!(wait_until(|| transport.is_closed()));
    assert!(wait_until(|| owner.times_closed() == 1));

    // The socket itself is shut down too
    server
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buffer = [0u8; 16];
    assert_eq!(server.read(&mut buffer).unwrap(), 0);
    pool.shutdown(Duration::from_secs(1));
}

#[test]
fn shared_circuit_closes_with_last_owner() {
    init_tracing();
    let (pool, dispatcher) = start_dispatcher();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    let registry = TransportRegistry::new();
    let connector = TransportConnector::new(
        dispatcher,
        registry.clone(),
        Arc::new(Ignore),
        1024,
        Duration::from_secs(5),
    )
    .with_identity(Some("tester".into()), Some("testhost".into()));

    let first = Owner::new(1);
    let second = Owner::new(2);
    let a = connector.connect(first.clone(), address, 0).unwrap();
    let b = connector.connect(second.clone(), address, 0).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.owner_count(), 2);
    assert_eq!(registry.len(), 1);

    // The circuit opens with version and identification
    let (mut server, _) = listener.accept().unwrap();
    let messages = read_messages(&mut server, 3);
    assert_eq!(messages[0].command, command::VERSION);
    assert_eq!(messages[1].command, command::CLIENT_NAME);
    assert_eq!(&messages[1].payload[..7], b"tester\0");
    assert_eq!(messages[2].command, command::HOST_NAME);
    assert_eq!(&messages[2].payload[..9], b"testhost\0");

    a.release(1);
    assert!(!a.is_closed());
    a.release(2);
    assert!(a.is_closed());
    assert!(registry.is_empty());
    // Owners that released it are not told about the close
    assert_eq!(first.times_closed(), 0);
    assert_eq!(second.times_closed(), 0);
    pool.shutdown(Duration::from_secs(1));
}

#[test]
fn owners_told_once_when_circuit_closes() {
    init_tracing();
    let (pool, dispatcher) = start_dispatcher();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    let registry = TransportRegistry::new();
    let connector = TransportConnector::new(
        dispatcher,
        registry.clone(),
        Arc::new(Ignore),
        1024,
        Duration::from_secs(5),
    );
    let owner = Owner::new(9);
    let transport = connector.connect(owner.clone(), address, 1).unwrap();
    let (server, _) = listener.accept().unwrap();

    transport.close(true);
    transport.close(true);
    transport.close(false);
    assert_eq!(owner.times_closed(), 1);
    assert!(registry.is_empty());
    assert!(!transport.acquire(Owner::new(10)));
    drop(server);
    pool.shutdown(Duration::from_secs(1));
}

#[test]
fn concurrent_connects_share_one_circuit() {
    init_tracing();
    let (pool, dispatcher) = start_dispatcher();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    let registry = TransportRegistry::new();
    let connector = Arc::new(TransportConnector::new(
        dispatcher,
        registry.clone(),
        Arc::new(Ignore),
        1024,
        Duration::from_secs(5),
    ));

    let barrier = Arc::new(Barrier::new(8));
    let connects: Vec<_> = (0..8)
        .map(|id| {
            let connector = connector.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                connector.connect(Owner::new(id), address, 0).unwrap()
            })
        })
        .collect();
    let transports: Vec<Arc<TcpTransport>> =
        connects.into_iter().map(|t| t.join().unwrap()).collect();

    assert!(transports.iter().all(|t| Arc::ptr_eq(t, &transports[0])));
    assert_eq!(transports[0].owner_count(), 8);
    assert_eq!(registry.len(), 1);

    // Exactly one connection reached the server
    let _first = listener.accept().unwrap();
    listener.set_nonblocking(true).unwrap();
    assert_eq!(
        listener.accept().map(|_| ()).unwrap_err().kind(),
        ErrorKind::WouldBlock
    );

    registry.close_all();
    pool.shutdown(Duration::from_secs(1));
}

#[test]
fn sustained_full_reads_toggle_flow_control() {
    init_tracing();
    let (pool, dispatcher) = start_dispatcher();
    let (stream, mut server) = socket_pair();

    // 20 reads that fill a 64 byte buffer, then one that does not
    let echo = Echo.as_bytes();
    let wire: Vec<u8> = echo.iter().copied().cycle().take(echo.len() * 81).collect();
    server.write_all(&wire).unwrap();
    thread::sleep(Duration::from_millis(20));

    let (tx, rx) = mpsc::channel();
    let transport = TcpTransport::new(
        stream,
        0,
        64,
        Arc::new(Collect(Mutex::new(tx))),
        dispatcher,
        Weak::new(),
    )
    .unwrap();
    for _ in 0..81 {
        let (header, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(header.command, command::ECHO);
    }

    let messages = read_messages(&mut server, 2);
    let commands: Vec<u16> = messages.iter().map(|m| m.command).collect();
    assert_eq!(commands, vec![command::EVENTS_OFF, command::EVENTS_ON]);
    assert!(!transport.is_flow_controlled());
    assert!(!transport.is_closed());

    transport.close(true);
    pool.shutdown(Duration::from_secs(1));
}

#[test]
fn uncommitted_messages_are_rolled_back() {
    init_tracing();
    let (pool, dispatcher) = start_dispatcher();
    let (stream, mut server) = socket_pair();
    let transport =
        TcpTransport::new(stream, 0, 1024, Arc::new(Ignore), dispatcher, Weak::new()).unwrap();

    let mut guard = transport.acquire_send_buffer().unwrap();
    guard.push(&EventsOff).unwrap();
    guard.commit();

    let mut guard = transport.acquire_send_buffer().unwrap();
    assert_eq!(guard.pending(), 16);
    guard.push(&Echo).unwrap();
    assert_eq!(guard.pending(), 32);
    guard.discard();

    {
        let mut guard = transport.acquire_send_buffer().unwrap();
        guard.push(&Echo).unwrap();
        guard.buffer().extend_from_slice(&[0xAA; 8]);
    }

    let mut guard = transport.acquire_send_buffer().unwrap();
    assert_eq!(guard.pending(), 16);
    guard.push(&EventsOn).unwrap();
    guard.flush().unwrap();

    let messages = read_messages(&mut server, 2);
    let commands: Vec<u16> = messages.iter().map(|m| m.command).collect();
    assert_eq!(commands, vec![command::EVENTS_OFF, command::EVENTS_ON]);
    assert_nothing_more(&mut server);

    transport.close(false);
    pool.shutdown(Duration::from_secs(1));
}

#[test]
fn full_socket_keeps_unsent_bytes_and_circuit() {
    init_tracing();
    let (pool, dispatcher) = start_dispatcher();
    let (stream, server) = socket_pair();
    SockRef::from(&stream).set_send_buffer_size(4096).unwrap();
    SockRef::from(&server).set_recv_buffer_size(4096).unwrap();
    let transport =
        TcpTransport::new(stream, 0, 1024, Arc::new(Ignore), dispatcher, Weak::new()).unwrap();

    // The server never reads, so this cannot all be written
    let size = 16 * 1024 * 1024;
    let mut guard = transport.acquire_send_buffer().unwrap();
    guard.buffer().resize(size, 0);
    let started = Instant::now();
    let pending = match guard.flush() {
        Err(TransportError::SendBufferFull { pending }) => pending,
        other => panic!("expected a full send buffer, got {other:?}"),
    };
    // Retried with backoff before giving up
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(pending > 0 && pending < size, "{pending}");

    // Not fatal: the circuit stays open with the remainder still queued
    assert!(!transport.is_closed());
    assert_eq!(transport.acquire_send_buffer().unwrap().pending(), pending);

    transport.close(true);
    drop(server);
    pool.shutdown(Duration::from_secs(1));
}

#[test]
fn quiet_circuit_is_probed_then_closed() {
    init_tracing();
    let (pool, dispatcher) = start_dispatcher();
    let (stream, mut server) = socket_pair();
    let (tx, rx) = mpsc::channel();
    let transport = TcpTransport::new(
        stream,
        0,
        1024,
        Arc::new(Collect(Mutex::new(tx))),
        dispatcher,
        Weak::new(),
    )
    .unwrap();
    let owner = Owner::new(3);
    assert!(transport.acquire(owner.clone()));
    let timeout = Duration::from_secs(1);
    let start = Instant::now();

    // Not quiet for long enough yet
    assert!(transport.check_liveness(start, timeout));
    assert_nothing_more(&mut server);

    // Quiet for half the timeout
    assert!(transport.check_liveness(start + Duration::from_millis(600), timeout));
    assert_eq!(read_messages(&mut server, 1)[0].command, command::ECHO);

    // An answer counts as traffic, so the next quiet spell probes again
    server.write_all(&Echo.as_bytes()).unwrap();
    let (header, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(header.command, command::ECHO);
    let answered = Instant::now();
    assert!(transport.check_liveness(answered + Duration::from_millis(600), timeout));
    assert_eq!(read_messages(&mut server, 1)[0].command, command::ECHO);

    // Waiting on that probe
    assert!(transport.check_liveness(answered + Duration::from_millis(1200), timeout));
    assert!(!transport.is_closed());

    // Unanswered for a whole timeout
    assert!(!transport.check_liveness(answered + Duration::from_millis(1700), timeout));
    assert!(transport.is_closed());
    assert_eq!(owner.times_closed(), 1);
    pool.shutdown(Duration::from_secs(1));
}

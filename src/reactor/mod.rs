//! Readiness multiplexing for every socket the client owns.
//!
//! A single [`Reactor`] wraps a `mio::Poll`. Sockets stay owned by their
//! transports and are registered by file descriptor; the reactor holds a shared
//! reference to the socket until it has been deregistered so that the descriptor
//! cannot be reused underneath it.
//!
//! Requests to register, deregister or change interest may come from any thread.
//! They are queued and applied by whichever thread is about to wait on the poll,
//! so they are never applied while a wait is in progress. The waiting thread is
//! woken whenever a request is queued.
//!
//! mio reports readiness edge-triggered. Re-enabling a key re-arms it, which
//! reports any readiness still pending, so a handler that stops reading before
//! `WouldBlock` will be called again.

pub mod leader_followers;

use std::{
    collections::{HashMap, VecDeque},
    io,
    os::fd::{AsRawFd, RawFd},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use mio::{Events, Interest, Poll, Token, Waker, unix::SourceFd};
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

pub use leader_followers::LeaderFollowersThreadPool;

const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENT_CAPACITY: usize = 256;
/// Longest single wait, so shutdown is observed even without a wake
const SELECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ReactorError {
    #[error("Reactor I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Reactor has been shut down")]
    Closed,
}

/// Opaque handle for a registered socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SelectionKey(usize);

impl SelectionKey {
    fn token(self) -> Token {
        Token(self.0)
    }
}

/// What readiness a registration is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterestOps {
    pub read: bool,
    pub write: bool,
}

impl InterestOps {
    pub const NONE: InterestOps = InterestOps {
        read: false,
        write: false,
    };
    pub const READ: InterestOps = InterestOps {
        read: true,
        write: false,
    };
    pub const WRITE: InterestOps = InterestOps {
        read: false,
        write: true,
    };
    pub const READ_WRITE: InterestOps = InterestOps {
        read: true,
        write: true,
    };

    fn as_mio(self) -> Option<Interest> {
        match (self.read, self.write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Readiness reported for one key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// The peer has shut down its side, or the socket hung up
    pub closed: bool,
    pub error: bool,
}

impl Readiness {
    fn from_event(event: &mio::event::Event) -> Self {
        Readiness {
            readable: event.is_readable(),
            writable: event.is_writable(),
            closed: event.is_read_closed() || event.is_write_closed(),
            error: event.is_error(),
        }
    }

    fn merge(&mut self, other: Readiness) {
        self.readable |= other.readable;
        self.writable |= other.writable;
        self.closed |= other.closed;
        self.error |= other.error;
    }
}

/// Called when a registered socket becomes ready
pub trait ReactorHandler: Send + Sync {
    fn handle_event(&self, key: SelectionKey, readiness: Readiness);
}

/// Anything with a file descriptor that can be polled
pub trait Selectable: AsRawFd + Send + Sync + 'static {}
impl<T: AsRawFd + Send + Sync + 'static> Selectable for T {}

type Closer = Box<dyn FnOnce() + Send>;

struct KeyEntry {
    source: Arc<dyn Selectable>,
    interest: InterestOps,
    handler: Arc<dyn ReactorHandler>,
    /// Events for a disabled key are dropped until it is re-enabled
    disabled: bool,
}

enum Request {
    Register(SelectionKey),
    Rearm(SelectionKey),
    Deregister {
        key: SelectionKey,
        source: Arc<dyn Selectable>,
        closer: Option<Closer>,
    },
}

struct Selector {
    poll: Poll,
    events: Events,
    /// Keys currently known to the poll
    armed: HashMap<SelectionKey, RawFd>,
}

pub struct Reactor {
    selector: Mutex<Selector>,
    waker: Waker,
    keys: Mutex<HashMap<SelectionKey, KeyEntry>>,
    requests: Mutex<VecDeque<Request>>,
    ready: Mutex<VecDeque<(SelectionKey, Readiness)>>,
    next_key: AtomicUsize,
    closed: CancellationToken,
}

impl Reactor {
    pub fn new() -> Result<Self, ReactorError> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(Reactor {
            selector: Mutex::new(Selector {
                poll,
                events: Events::with_capacity(EVENT_CAPACITY),
                armed: HashMap::new(),
            }),
            waker,
            keys: Mutex::new(HashMap::new()),
            requests: Mutex::new(VecDeque::new()),
            ready: Mutex::new(VecDeque::new()),
            next_key: AtomicUsize::new(0),
            closed: CancellationToken::new(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Register a socket. The registration takes effect before the next wait.
    pub fn register(
        &self,
        source: Arc<dyn Selectable>,
        interest: InterestOps,
        handler: Arc<dyn ReactorHandler>,
    ) -> Result<SelectionKey, ReactorError> {
        if self.is_closed() {
            return Err(ReactorError::Closed);
        }
        let key = SelectionKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        trace!("Registering fd {} as {key:?}", source.as_raw_fd());
        self.keys.lock().insert(
            key,
            KeyEntry {
                source,
                interest,
                handler,
                disabled: false,
            },
        );
        if let Err(e) = self.submit(Request::Register(key)) {
            self.keys.lock().remove(&key);
            return Err(e);
        }
        Ok(key)
    }

    pub fn set_interest_ops(&self, key: SelectionKey, interest: InterestOps) {
        if let Some(entry) = self.keys.lock().get_mut(&key) {
            if entry.interest == interest {
                return;
            }
            entry.interest = interest;
        } else {
            return;
        }
        let _ = self.submit(Request::Rearm(key));
    }

    pub fn interest_ops(&self, key: SelectionKey) -> Option<InterestOps> {
        self.keys.lock().get(&key).map(|e| e.interest)
    }

    /// Stop dispatching events for a key.
    ///
    /// Returns false if the key was already disabled (or is unknown), in which
    /// case somebody else is already handling it.
    pub fn disable(&self, key: SelectionKey) -> bool {
        match self.keys.lock().get_mut(&key) {
            Some(entry) if !entry.disabled => {
                entry.disabled = true;
                true
            }
            _ => false,
        }
    }

    /// Resume dispatching events for a key, re-reporting any pending readiness
    pub fn enable(&self, key: SelectionKey) {
        match self.keys.lock().get_mut(&key) {
            Some(entry) => entry.disabled = false,
            None => return,
        }
        let _ = self.submit(Request::Rearm(key));
    }

    /// Stop polling a key, then run `closer` once the socket has left the poll
    pub fn unregister_and_close<F>(&self, key: SelectionKey, closer: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(entry) = self.keys.lock().remove(&key) else {
            closer();
            return;
        };
        self.ready.lock().retain(|(k, _)| *k != key);
        let request = Request::Deregister {
            key,
            source: entry.source,
            closer: Some(Box::new(closer)),
        };
        if let Err(ReactorError::Closed) = self.submit(request) {
            debug!("Closed {key:?} after reactor shutdown");
        }
    }

    fn submit(&self, request: Request) -> Result<(), ReactorError> {
        {
            let mut requests = self.requests.lock();
            if self.is_closed() {
                drop(requests);
                // Nothing is polling any more, so close straight away
                if let Request::Deregister {
                    closer: Some(closer),
                    ..
                } = request
                {
                    closer();
                }
                return Err(ReactorError::Closed);
            }
            requests.push_back(request);
        }
        self.waker.wake()?;
        Ok(())
    }

    /// Apply queued requests. Only called with the selector held.
    fn drain_requests(&self, selector: &mut Selector, shutting_down: bool) {
        let requests: Vec<Request> = self.requests.lock().drain(..).collect();
        for request in requests {
            match request {
                Request::Register(key) | Request::Rearm(key) if shutting_down => {
                    trace!("Dropping pending registration of {key:?}");
                }
                Request::Register(key) | Request::Rearm(key) => self.arm(selector, key),
                Request::Deregister {
                    key,
                    source,
                    closer,
                } => {
                    let fd = source.as_raw_fd();
                    if selector.armed.remove(&key).is_some()
                        && let Err(e) = selector.poll.registry().deregister(&mut SourceFd(&fd))
                    {
                        debug!("Deregistering fd {fd} failed: {e}");
                    }
                    if let Some(closer) = closer
                        && catch_unwind(AssertUnwindSafe(closer)).is_err()
                    {
                        error!("Socket closer for fd {fd} panicked");
                    }
                    drop(source);
                }
            }
        }
    }

    fn arm(&self, selector: &mut Selector, key: SelectionKey) {
        let (fd, interest) = match self.keys.lock().get(&key) {
            Some(entry) => (entry.source.as_raw_fd(), entry.interest),
            // Deregistered before it was ever armed
            None => return,
        };
        let registry = selector.poll.registry();
        let was_armed = selector.armed.contains_key(&key);
        let result = match (interest.as_mio(), was_armed) {
            (Some(interest), true) => {
                registry.reregister(&mut SourceFd(&fd), key.token(), interest)
            }
            (Some(interest), false) => {
                registry.register(&mut SourceFd(&fd), key.token(), interest)
            }
            (None, true) => {
                selector.armed.remove(&key);
                registry.deregister(&mut SourceFd(&fd))
            }
            (None, false) => Ok(()),
        };
        match result {
            Ok(()) => {
                if interest.as_mio().is_some() {
                    selector.armed.insert(key, fd);
                }
            }
            Err(e) => {
                error!("Failed to register fd {fd} with the reactor: {e}");
                selector.armed.remove(&key);
                self.keys.lock().remove(&key);
            }
        }
    }

    fn next_ready(&self) -> Option<(SelectionKey, Readiness)> {
        self.ready.lock().pop_front()
    }

    /// Run one iteration: dispatch a single ready event, waiting for one if none
    /// are queued. Returns `Ok(false)` once the reactor has been shut down.
    pub fn process(&self) -> Result<bool, ReactorError> {
        if self.is_closed() {
            return Ok(false);
        }
        if let Some((key, readiness)) = self.next_ready() {
            self.dispatch(key, readiness);
            return Ok(true);
        }

        {
            let mut selector = self.selector.lock();
            if self.is_closed() {
                return Ok(false);
            }
            // Another thread may have polled while we waited for the selector
            if self.ready.lock().is_empty() {
                self.drain_requests(&mut selector, false);
                let Selector { poll, events, .. } = &mut *selector;
                match poll.poll(events, Some(SELECT_TIMEOUT)) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(true),
                    Err(e) => return Err(e.into()),
                }
                let mut ready = self.ready.lock();
                for event in selector.events.iter() {
                    if event.token() == WAKER_TOKEN {
                        continue;
                    }
                    let key = SelectionKey(event.token().0);
                    let readiness = Readiness::from_event(event);
                    match ready.iter_mut().find(|(k, _)| *k == key) {
                        Some((_, existing)) => existing.merge(readiness),
                        None => ready.push_back((key, readiness)),
                    }
                }
            }
        }

        if self.is_closed() {
            return Ok(false);
        }
        if let Some((key, readiness)) = self.next_ready() {
            self.dispatch(key, readiness);
        }
        Ok(true)
    }

    fn dispatch(&self, key: SelectionKey, readiness: Readiness) {
        let handler = match self.keys.lock().get(&key) {
            Some(entry) if !entry.disabled => entry.handler.clone(),
            _ => return,
        };
        trace!("Dispatching {key:?}: {readiness:?}");
        if catch_unwind(AssertUnwindSafe(|| handler.handle_event(key, readiness))).is_err() {
            error!("Reactor handler for {key:?} panicked");
        }
    }

    /// Stop the reactor and release every registration.
    ///
    /// Pending registrations are cancelled, pending deregistrations are carried
    /// out (running their closers) and the waiting thread is woken. Returns once
    /// cleanup is complete.
    pub fn shutdown(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        debug!("Shutting down reactor");
        {
            // No request can be queued once this is observed
            let _requests = self.requests.lock();
            self.closed.cancel();
        }
        if let Err(e) = self.waker.wake() {
            warn!("Could not wake reactor for shutdown: {e}");
        }
        let mut selector = self.selector.lock();
        self.drain_requests(&mut selector, true);
        let keys: Vec<(SelectionKey, KeyEntry)> = self.keys.lock().drain().collect();
        for (key, entry) in keys {
            if selector.armed.remove(&key).is_some() {
                let fd = entry.source.as_raw_fd();
                let _ = selector.poll.registry().deregister(&mut SourceFd(&fd));
            }
        }
        self.ready.lock().clear();
        debug!("Reactor shut down");
    }
}

/// How transports get their sockets polled.
///
/// Either straight on a reactor driven by the caller, or through a
/// leader/followers pool that wraps every handler.
#[derive(Clone)]
pub struct Dispatcher {
    reactor: Arc<Reactor>,
    pool: Option<Arc<LeaderFollowersThreadPool>>,
}

impl Dispatcher {
    pub fn direct(reactor: Arc<Reactor>) -> Self {
        Dispatcher {
            reactor,
            pool: None,
        }
    }

    pub fn leader_followers(pool: Arc<LeaderFollowersThreadPool>) -> Self {
        Dispatcher {
            reactor: pool.reactor().clone(),
            pool: Some(pool),
        }
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    pub fn register(
        &self,
        source: Arc<dyn Selectable>,
        interest: InterestOps,
        handler: Arc<dyn ReactorHandler>,
    ) -> Result<SelectionKey, ReactorError> {
        let handler = match &self.pool {
            Some(pool) => pool.wrap(handler),
            None => handler,
        };
        self.reactor.register(source, interest, handler)
    }

    /// Ask to be dispatched again for a key whose handler is returning early.
    ///
    /// Under leader/followers the key is re-enabled as the wrapped handler
    /// returns, so this does nothing there; re-enabling from inside the handler
    /// would let another thread handle the key before this one is done.
    pub fn yield_key(&self, key: SelectionKey) {
        if self.pool.is_none() {
            self.reactor.enable(key);
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

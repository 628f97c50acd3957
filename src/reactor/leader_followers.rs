//! Leader/followers dispatch on top of the [`Reactor`].
//!
//! One pool thread at a time (the leader) waits in [`Reactor::process`]. When it
//! receives an event it disables that key, hands leadership to another pool
//! thread and then handles the event itself, so the next wait starts without
//! waiting for the handler. The key is re-enabled when the handler returns, even
//! if it panicked, and the thread goes back to the pool.

use std::{
    cell::Cell,
    sync::{Arc, Weak},
    thread,
    time::Duration,
};

use tracing::{debug, error, trace};

use super::{Reactor, ReactorHandler, Readiness, SelectionKey};
use crate::thread_pool::{PoolError, WorkerPool};

thread_local! {
    static LEADERSHIP: Cell<bool> = const { Cell::new(false) };
}

pub struct LeaderFollowersThreadPool {
    reactor: Arc<Reactor>,
    pool: WorkerPool,
    me: Weak<LeaderFollowersThreadPool>,
}

impl LeaderFollowersThreadPool {
    pub fn new(reactor: Arc<Reactor>, threads: usize) -> Result<Arc<Self>, PoolError> {
        let pool = WorkerPool::new("ca-io", threads)?;
        Ok(Arc::new_cyclic(|me| LeaderFollowersThreadPool {
            reactor,
            pool,
            me: me.clone(),
        }))
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    /// Start the first leader
    pub fn start(&self) -> Result<(), PoolError> {
        self.spawn_leader()
    }

    fn spawn_leader(&self) -> Result<(), PoolError> {
        let me = self.me.clone();
        self.pool.execute(move || {
            if let Some(pool) = me.upgrade() {
                pool.lead();
            }
        })
    }

    fn lead(&self) {
        LEADERSHIP.set(true);
        trace!("{:?} is leading", thread::current().name());
        while LEADERSHIP.get() {
            match self.reactor.process() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    error!("Reactor failed: {e}");
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
        LEADERSHIP.set(false);
    }

    /// Hand leadership to another pool thread.
    ///
    /// A no-op unless called on the current leader. If no new leader can be
    /// started this thread keeps leading.
    pub fn promote_leader(&self) {
        if !LEADERSHIP.get() {
            return;
        }
        match self.spawn_leader() {
            Ok(()) => LEADERSHIP.set(false),
            Err(e) => debug!("Could not promote a new leader, keeping leadership: {e}"),
        }
    }

    /// Wrap a handler so that it runs under leader/followers dispatch
    pub fn wrap(&self, handler: Arc<dyn ReactorHandler>) -> Arc<dyn ReactorHandler> {
        Arc::new(LeaderFollowersHandler {
            pool: self.me.clone(),
            reactor: Arc::downgrade(&self.reactor),
            inner: handler,
        })
    }

    /// Stop the reactor, then wait up to `grace` for handlers to finish
    pub fn shutdown(&self, grace: Duration) -> bool {
        self.reactor.shutdown();
        self.pool.shutdown(grace)
    }
}

struct LeaderFollowersHandler {
    pool: Weak<LeaderFollowersThreadPool>,
    reactor: Weak<Reactor>,
    inner: Arc<dyn ReactorHandler>,
}

/// Re-enables a key however the handler exits
struct EnableOnDrop<'a> {
    reactor: &'a Reactor,
    key: SelectionKey,
}

impl Drop for EnableOnDrop<'_> {
    fn drop(&mut self) {
        self.reactor.enable(self.key);
    }
}

impl ReactorHandler for LeaderFollowersHandler {
    fn handle_event(&self, key: SelectionKey, readiness: Readiness) {
        let Some(reactor) = self.reactor.upgrade() else {
            return;
        };
        if !reactor.disable(key) {
            // Already being handled on another thread
            return;
        }
        let _enable = EnableOnDrop {
            reactor: &reactor,
            key,
        };
        if let Some(pool) = self.pool.upgrade() {
            pool.promote_leader();
        }
        self.inner.handle_event(key, readiness);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::InterestOps;
    use std::{
        net::UdpSocket,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            mpsc,
        },
    };

    /// Drains one datagram per call, slowly, checking it is never re-entered
    struct SlowReader {
        socket: Arc<UdpSocket>,
        busy: AtomicBool,
        overlapped: AtomicBool,
        handled: AtomicUsize,
        done: mpsc::Sender<()>,
    }

    impl ReactorHandler for SlowReader {
        fn handle_event(&self, _key: SelectionKey, _readiness: Readiness) {
            if self.busy.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            let mut buffer = [0u8; 16];
            while self.socket.recv(&mut buffer).is_ok() {
                thread::sleep(Duration::from_millis(5));
                self.handled.fetch_add(1, Ordering::SeqCst);
                let _ = self.done.send(());
            }
            self.busy.store(false, Ordering::SeqCst);
        }
    }

    #[test]
    fn one_handler_per_key_at_a_time() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let pool = LeaderFollowersThreadPool::new(reactor.clone(), 4).unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        let address = socket.local_addr().unwrap();
        let socket = Arc::new(socket);
        let (done, finished) = mpsc::channel();
        let reader = Arc::new(SlowReader {
            socket: socket.clone(),
            busy: AtomicBool::new(false),
            overlapped: AtomicBool::new(false),
            handled: AtomicUsize::new(0),
            done,
        });
        reactor
            .register(socket, InterestOps::READ, pool.wrap(reader.clone()))
            .unwrap();
        pool.start().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        for _ in 0..10 {
            sender.send_to(b"x", address).unwrap();
            thread::sleep(Duration::from_millis(1));
        }
        for _ in 0..10 {
            finished.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(reader.handled.load(Ordering::SeqCst), 10);
        assert!(!reader.overlapped.load(Ordering::SeqCst));
        assert!(pool.shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn promote_is_noop_off_the_leader() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let pool = LeaderFollowersThreadPool::new(reactor, 1).unwrap();
        pool.promote_leader();
        assert_eq!(pool.pool.pending(), 0);
        pool.shutdown(Duration::from_secs(1));
    }
}

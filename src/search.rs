//! Resolving channel names to servers over UDP.
//!
//! Every unresolved channel has a [`SearchTask`] on the manager's private
//! [`Timer`]. Each time it fires it adds a search request to the shared outgoing
//! datagram and backs off exponentially. Requests from tasks firing close
//! together are batched: the datagram is only sent straight away if no other
//! task is due within the coalescing window.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, debug_span, trace, warn};

use crate::{
    config::SearchConfig,
    messages::{
        CA_DEFAULT_PRIORITY, CA_MINOR_PROTOCOL_REVISION, CAMessage, MAX_UDP_SEND, Search, Version,
    },
    timer::{Timer, TimerHandle, TimerTask},
    transport::{BroadcastTransport, TransportError},
    utils::wrapping_inplace_add,
};

/// Somewhere search datagrams can be sent
pub trait DatagramSender: Send + Sync {
    fn send_datagram(&self, frame: &[u8]) -> Result<(), TransportError>;
}

impl DatagramSender for BroadcastTransport {
    fn send_datagram(&self, frame: &[u8]) -> Result<(), TransportError> {
        self.send(frame)
    }
}

/// A server's answer to a search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    pub cid: u32,
    /// Server id field of the reply (the server IP, or `u32::MAX`)
    pub sid: u32,
    pub data_type: u16,
    pub data_count: u32,
    pub minor_version: u16,
    /// Where to open the circuit
    pub server_address: SocketAddr,
}

/// The delay after `delay`: multiplied up, and kept within the configured bounds
pub fn next_search_delay(delay: Duration, config: &SearchConfig) -> Duration {
    delay
        .saturating_mul(config.multiplier)
        .clamp(config.min_interval, config.max_interval)
}

pub struct SearchTask {
    cid: u32,
    name: String,
    delay: Mutex<Duration>,
    manager: Weak<ChannelSearchManager>,
}

impl SearchTask {
    pub fn cid(&self) -> u32 {
        self.cid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Interval that will follow the next search
    pub fn current_delay(&self) -> Duration {
        *self.delay.lock()
    }
}

impl TimerTask for SearchTask {
    fn run(&self) -> Option<Duration> {
        let manager = self.manager.upgrade()?;
        if !manager.is_pending(self) {
            return None;
        }
        manager.search(self);
        let mut delay = self.delay.lock();
        let interval = *delay;
        *delay = next_search_delay(interval, &manager.config);
        Some(interval)
    }
}

struct PendingSearch {
    task: Arc<SearchTask>,
    handle: TimerHandle,
    reply: Option<oneshot::Sender<SearchResult>>,
}

#[derive(Default)]
struct SearchFrame {
    buffer: Vec<u8>,
    searches: usize,
    sequence: u32,
}

pub struct ChannelSearchManager {
    config: SearchConfig,
    timer: Timer,
    sender: Arc<dyn DatagramSender>,
    frame: Mutex<SearchFrame>,
    pending: Mutex<HashMap<u32, PendingSearch>>,
    immediate_flushes: AtomicUsize,
    me: Weak<ChannelSearchManager>,
}

impl ChannelSearchManager {
    pub fn new(config: SearchConfig, sender: Arc<dyn DatagramSender>) -> io::Result<Arc<Self>> {
        let timer = Timer::new("ca-search")?;
        Ok(Arc::new_cyclic(|me| ChannelSearchManager {
            config,
            timer,
            sender,
            frame: Mutex::new(SearchFrame::default()),
            pending: Mutex::new(HashMap::new()),
            immediate_flushes: AtomicUsize::new(0),
            me: me.clone(),
        }))
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Start searching for a channel. Replaces any search already running for `cid`.
    pub fn register(&self, cid: u32, name: &str) {
        self.start(cid, name, None);
    }

    /// Start searching, with a receiver resolved by the first reply
    pub fn register_with_reply(&self, cid: u32, name: &str) -> oneshot::Receiver<SearchResult> {
        let (tx, rx) = oneshot::channel();
        self.start(cid, name, Some(tx));
        rx
    }

    fn start(&self, cid: u32, name: &str, reply: Option<oneshot::Sender<SearchResult>>) {
        debug!("Searching for {name} (cid {cid})");
        let task = Arc::new(SearchTask {
            cid,
            name: name.to_string(),
            delay: Mutex::new(self.config.min_interval),
            manager: self.me.clone(),
        });
        // Held while scheduling so the first run already sees the task as pending
        let mut pending = self.pending.lock();
        let handle = self.timer.execute_after_delay(Duration::ZERO, task.clone());
        let previous = pending.insert(
            cid,
            PendingSearch {
                task,
                handle,
                reply,
            },
        );
        if let Some(previous) = previous {
            previous.handle.cancel();
        }
    }

    /// Stop searching for a channel. Returns whether it was being searched for.
    pub fn unregister(&self, cid: u32) -> bool {
        let Some(pending) = self.pending.lock().remove(&cid) else {
            return false;
        };
        trace!("Stopped searching for {}", pending.task.name);
        self.timer.cancel(&pending.handle);
        // Nobody else may be due to send what is already batched
        if !self.timer.has_next(self.config.coalesce_window) {
            self.flush();
        }
        true
    }

    /// A reply arrived. Returns false for late or duplicate replies.
    pub fn search_response(&self, result: SearchResult) -> bool {
        let Some(pending) = self.pending.lock().remove(&result.cid) else {
            return false;
        };
        debug!(
            "Found {} at {} (cid {})",
            pending.task.name, result.server_address, result.cid
        );
        self.timer.cancel(&pending.handle);
        if let Some(reply) = pending.reply {
            let _ = reply.send(result);
        }
        true
    }

    /// A server restarted or reappeared: retry everything now, from the
    /// shortest interval
    pub fn beacon_anomaly(&self) {
        let pending = self.pending.lock();
        debug!("Beacon anomaly, boosting {} searches", pending.len());
        for search in pending.values() {
            *search.task.delay.lock() = self.config.min_interval;
        }
        drop(pending);
        self.timer.reschedule_all_after_delay(Duration::ZERO);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn is_pending(&self, task: &SearchTask) -> bool {
        self.pending
            .lock()
            .get(&task.cid)
            .is_some_and(|p| std::ptr::eq(Arc::as_ptr(&p.task), task))
    }

    pub fn is_searching(&self, cid: u32) -> bool {
        self.pending.lock().contains_key(&cid)
    }

    /// Add one request to the outgoing datagram, sending it if nothing else is due
    fn search(&self, task: &SearchTask) {
        let _span = debug_span!("search", cid = task.cid).entered();
        let request = Search {
            search_id: task.cid,
            channel_name: task.name.clone(),
            should_reply: false,
            protocol_version: CA_MINOR_PROTOCOL_REVISION,
        };
        let mut frame = self.frame.lock();
        if frame.searches > 0 && frame.buffer.len() + request.encoded_len() > MAX_UDP_SEND {
            self.send_frame(&mut frame);
        }
        if frame.searches == 0 {
            let version = Version {
                priority: CA_DEFAULT_PRIORITY,
                protocol_version: CA_MINOR_PROTOCOL_REVISION,
                sequence: wrapping_inplace_add(&mut frame.sequence),
            };
            let _ = version.write(&mut frame.buffer);
        }
        let _ = request.write(&mut frame.buffer);
        frame.searches += 1;
        trace!("Queued search for {}", task.name);

        if self.timer.has_next(self.config.coalesce_window) {
            self.immediate_flushes.store(0, Ordering::Relaxed);
            return;
        }
        self.send_frame(&mut frame);
        drop(frame);
        let flushes = self.immediate_flushes.fetch_add(1, Ordering::Relaxed) + 1;
        if flushes >= self.config.max_immediate_flushes {
            self.immediate_flushes.store(0, Ordering::Relaxed);
            thread::sleep(self.config.flush_pause);
        }
    }

    /// Send whatever is batched
    pub fn flush(&self) {
        let mut frame = self.frame.lock();
        self.send_frame(&mut frame);
    }

    fn send_frame(&self, frame: &mut SearchFrame) {
        if frame.searches == 0 {
            return;
        }
        trace!(
            "Sending search datagram with {} requests, {} bytes",
            frame.searches,
            frame.buffer.len()
        );
        if let Err(e) = self.sender.send_datagram(&frame.buffer) {
            warn!("Failed to send search datagram: {e}");
        }
        frame.buffer.clear();
        frame.searches = 0;
    }

    /// Cancel every search and stop the timer
    pub fn shutdown(&self) {
        let pending: Vec<PendingSearch> = self.pending.lock().drain().map(|(_, p)| p).collect();
        for search in pending {
            search.handle.cancel();
        }
        self.timer.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_clamps() {
        let config = SearchConfig::default();
        let mut delay = config.min_interval;
        let mut intervals = vec![delay];
        for _ in 0..12 {
            delay = next_search_delay(delay, &config);
            intervals.push(delay);
        }
        for pair in intervals.windows(2) {
            assert!(pair[1] >= pair[0]);
            assert!(pair[1] == pair[0] * 2 || pair[1] == config.max_interval);
        }
        assert_eq!(intervals[1], Duration::from_millis(200));
        assert_eq!(*intervals.last().unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn delay_never_below_minimum() {
        let config = SearchConfig::default();
        assert_eq!(next_search_delay(Duration::ZERO, &config), config.min_interval);
    }
}

//! A single-threaded task timer backed by a binary min-heap.
//!
//! Tasks are ordered by the instant they are due. Cancelling only flags the
//! task; its heap entry is thrown away when it reaches the top. A task says
//! when it wants to run next by returning a delay from [`TimerTask::run`].

use std::{
    cmp::{Ordering as CmpOrdering, Reverse},
    collections::BinaryHeap,
    io,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{error, trace};

pub trait TimerTask: Send + Sync {
    /// Run once. Returns the delay until the next run, or `None` when finished.
    fn run(&self) -> Option<Duration>;
}

struct Node {
    task: Arc<dyn TimerTask>,
    cancelled: AtomicBool,
}

/// Handle used to cancel a scheduled task
#[derive(Clone)]
pub struct TimerHandle(Arc<Node>);

impl TimerHandle {
    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::Acquire)
    }
}

struct Entry {
    time_to_run: Instant,
    /// Insertion order, so tasks due at the same instant run first-in first-out
    sequence: u64,
    node: Arc<Node>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.time_to_run
            .cmp(&other.time_to_run)
            .then(self.sequence.cmp(&other.sequence))
    }
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Reverse<Entry>>,
    sequence: u64,
    shutdown: bool,
}

impl State {
    fn push(&mut self, time_to_run: Instant, node: Arc<Node>) {
        self.sequence += 1;
        self.heap.push(Reverse(Entry {
            time_to_run,
            sequence: self.sequence,
            node,
        }));
    }

    /// Drop cancelled entries sitting at the top of the heap
    fn discard_cancelled(&mut self) {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if !entry.node.cancelled.load(Ordering::Acquire) {
                break;
            }
            self.heap.pop();
        }
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
}

pub struct Timer {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub fn new(name: &str) -> io::Result<Self> {
        let shared = Arc::new(Shared::default());
        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || timer_loop(&thread_shared))?;
        Ok(Timer {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn execute_after_delay(&self, delay: Duration, task: Arc<dyn TimerTask>) -> TimerHandle {
        let node = Arc::new(Node {
            task,
            cancelled: AtomicBool::new(false),
        });
        let mut state = self.shared.state.lock();
        state.push(Instant::now() + delay, node.clone());
        self.shared.wakeup.notify_one();
        TimerHandle(node)
    }

    /// Move every pending task to run `delay` from now
    pub fn reschedule_all_after_delay(&self, delay: Duration) {
        let time_to_run = Instant::now() + delay;
        let mut state = self.shared.state.lock();
        let nodes: Vec<Arc<Node>> = state
            .heap
            .drain()
            .map(|Reverse(entry)| entry.node)
            .filter(|node| !node.cancelled.load(Ordering::Acquire))
            .collect();
        trace!("Rescheduling {} timer tasks", nodes.len());
        for node in nodes {
            state.push(time_to_run, node);
        }
        self.shared.wakeup.notify_one();
    }

    pub fn cancel(&self, handle: &TimerHandle) {
        handle.cancel();
        // Wake in case the cancelled task is the one being waited for
        let _state = self.shared.state.lock();
        self.shared.wakeup.notify_one();
    }

    /// Is any live task due within `within` from now
    pub fn has_next(&self, within: Duration) -> bool {
        let mut state = self.shared.state.lock();
        state.discard_cancelled();
        state
            .heap
            .peek()
            .is_some_and(|Reverse(entry)| entry.time_to_run <= Instant::now() + within)
    }

    /// Entries in the heap, possibly including cancelled ones not yet discarded
    pub fn len(&self) -> usize {
        self.shared.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the timer thread. Pending tasks are dropped without running.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.heap.clear();
            self.shared.wakeup.notify_all();
        }
        if let Some(thread) = self.thread.lock().take()
            && thread.thread().id() != thread::current().id()
            && thread.join().is_err()
        {
            error!("Timer thread panicked");
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(shared: &Shared) {
    loop {
        let node = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                state.discard_cancelled();
                let next = state.heap.peek().map(|Reverse(entry)| entry.time_to_run);
                match next {
                    None => shared.wakeup.wait(&mut state),
                    Some(due) if due <= Instant::now() => break,
                    Some(due) => {
                        shared.wakeup.wait_until(&mut state, due);
                    }
                }
            }
            match state.heap.pop() {
                Some(Reverse(entry)) => entry.node,
                None => continue,
            }
        };

        let next = match catch_unwind(AssertUnwindSafe(|| node.task.run())) {
            Ok(next) => next,
            Err(_) => {
                error!("Timer task panicked, not rescheduling it");
                None
            }
        };
        if let Some(delay) = next
            && !node.cancelled.load(Ordering::Acquire)
        {
            let mut state = shared.state.lock();
            if !state.shutdown {
                state.push(Instant::now() + delay, node);
            }
        }
    }
}

//! A small fixed-size pool of named worker threads.
//!
//! Used both by the leader/followers I/O pool and by the monitor notification
//! engines. Jobs are boxed closures passed over a `crossbeam-channel`; a job that
//! panics is logged and the worker carries on.

use std::{
    io,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Worker pool '{0}' has been shut down")]
    ShutDown(String),
    #[error("Could not spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}

pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
    /// Jobs submitted but not yet finished
    pending: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(name: &str, threads: usize) -> Result<Self, PoolError> {
        let threads = threads.max(1);
        let (sender, receiver) = unbounded::<Job>();
        let pending = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let receiver = receiver.clone();
            let pending = pending.clone();
            let pool_name = name.to_string();
            workers.push(
                thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || worker_loop(&pool_name, receiver, pending))?,
            );
        }
        debug!("Started worker pool {name} with {threads} threads");
        Ok(WorkerPool {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            size: threads,
            pending,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threads(&self) -> usize {
        self.size
    }

    /// Number of jobs queued or running
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn execute<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(PoolError::ShutDown(self.name.clone()));
        };
        self.pending.fetch_add(1, Ordering::AcqRel);
        sender.send(Box::new(job)).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            PoolError::ShutDown(self.name.clone())
        })
    }

    pub fn is_shutdown(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stop accepting jobs and wait up to `grace` for queued work to finish.
    ///
    /// Workers still busy when the grace period runs out are detached. Returns
    /// whether every worker finished in time. Safe to call from a worker thread,
    /// which will not wait for itself.
    pub fn shutdown(&self, grace: Duration) -> bool {
        drop(self.sender.lock().take());
        let deadline = Instant::now() + grace;
        let current = thread::current().id();
        let mut workers = self.workers.lock();
        let mut clean = true;
        for handle in workers.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!("Worker in pool {} exited by panic", self.name);
                }
            } else {
                clean = false;
            }
        }
        if !clean {
            warn!(
                "Worker pool {} did not finish within {grace:?}, abandoning busy workers",
                self.name
            );
        }
        clean
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Let the workers drain and exit on their own
        drop(self.sender.get_mut().take());
    }
}

fn worker_loop(name: &str, receiver: Receiver<Job>, pending: Arc<AtomicUsize>) {
    while let Ok(job) = receiver.recv() {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("Job in worker pool {name} panicked");
        }
        pending.fetch_sub(1, Ordering::AcqRel);
    }
}

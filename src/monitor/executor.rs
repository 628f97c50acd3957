//! Run jobs one at a time, in order, on a shared worker pool.

use std::{
    collections::VecDeque,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{error, trace};

use crate::thread_pool::WorkerPool;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Jobs run per pool task before yielding the worker to other executors
const JOBS_PER_TURN: usize = 16;

#[derive(Default)]
struct SerialQueue {
    jobs: VecDeque<Job>,
    /// A drain task is queued on, or running in, the pool
    scheduled: bool,
    /// Jobs accepted but not yet finished
    outstanding: usize,
    running_on: Option<ThreadId>,
}

#[derive(Default)]
struct SerialInner {
    queue: Mutex<SerialQueue>,
    idle: Condvar,
}

/// A stripe: jobs submitted here run in submission order, never two at once,
/// while other stripes share the same pool in parallel
pub struct SerialExecutor {
    pool: Arc<WorkerPool>,
    inner: Arc<SerialInner>,
}

impl SerialExecutor {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        SerialExecutor {
            pool,
            inner: Arc::default(),
        }
    }

    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let schedule = {
            let mut queue = self.inner.queue.lock();
            queue.jobs.push_back(Box::new(job));
            queue.outstanding += 1;
            !std::mem::replace(&mut queue.scheduled, true)
        };
        if schedule {
            self.schedule();
        }
    }

    fn schedule(&self) {
        let inner = self.inner.clone();
        let pool = self.pool.clone();
        if let Err(e) = self.pool.execute(move || drain(&inner, &pool)) {
            // No pool left to run on, so run here rather than lose the jobs
            trace!("Running stripe inline: {e}");
            run_inline(&self.inner);
        }
    }

    /// Jobs accepted and not yet finished
    pub fn outstanding(&self) -> usize {
        self.inner.queue.lock().outstanding
    }

    /// Block until every accepted job has finished, or `timeout` passes.
    ///
    /// Returns false on timeout, or immediately if called from one of this
    /// executor's own jobs.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut queue = self.inner.queue.lock();
        if queue.running_on == Some(thread::current().id()) {
            return queue.outstanding <= 1;
        }
        while queue.outstanding > 0 {
            match deadline {
                Some(deadline) => {
                    if self.inner.idle.wait_until(&mut queue, deadline).timed_out() {
                        return queue.outstanding == 0;
                    }
                }
                None => self.inner.idle.wait(&mut queue),
            }
        }
        true
    }
}

fn run_job(inner: &SerialInner, job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("Notification job panicked");
    }
    let mut queue = inner.queue.lock();
    queue.outstanding -= 1;
    if queue.outstanding == 0 {
        inner.idle.notify_all();
    }
}

/// Run up to a turn's worth of jobs, then hand the worker back
fn drain(inner: &Arc<SerialInner>, pool: &Arc<WorkerPool>) {
    for _ in 0..JOBS_PER_TURN {
        let job = {
            let mut queue = inner.queue.lock();
            match queue.jobs.pop_front() {
                Some(job) => {
                    queue.running_on = Some(thread::current().id());
                    job
                }
                None => {
                    queue.scheduled = false;
                    queue.running_on = None;
                    return;
                }
            }
        };
        run_job(inner, job);
    }
    inner.queue.lock().running_on = None;
    let next_inner = inner.clone();
    let next_pool = pool.clone();
    if pool.execute(move || drain(&next_inner, &next_pool)).is_err() {
        run_inline(inner);
    }
}

fn run_inline(inner: &SerialInner) {
    loop {
        let job = {
            let mut queue = inner.queue.lock();
            match queue.jobs.pop_front() {
                Some(job) => job,
                None => {
                    queue.scheduled = false;
                    return;
                }
            }
        };
        run_job(inner, job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_on_one_stripe_run_in_order() {
        let pool = Arc::new(WorkerPool::new("stripes", 4).unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let executor = SerialExecutor::new(pool.clone());
        for i in 0..100 {
            let seen = seen.clone();
            executor.execute(move || seen.lock().push(i));
        }
        assert!(executor.wait_idle(Some(Duration::from_secs(5))));
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_job_does_not_stop_stripe() {
        let pool = Arc::new(WorkerPool::new("stripes", 1).unwrap());
        let executor = SerialExecutor::new(pool);
        let ran = Arc::new(Mutex::new(false));
        executor.execute(|| panic!("consumer failure"));
        let flag = ran.clone();
        executor.execute(move || *flag.lock() = true);
        assert!(executor.wait_idle(Some(Duration::from_secs(5))));
        assert!(*ran.lock());
    }

    #[test]
    fn runs_inline_once_pool_is_gone() {
        let pool = Arc::new(WorkerPool::new("stripes", 1).unwrap());
        pool.shutdown(Duration::from_secs(1));
        let executor = SerialExecutor::new(pool);
        let ran = Arc::new(Mutex::new(0));
        let count = ran.clone();
        executor.execute(move || *count.lock() += 1);
        assert_eq!(*ran.lock(), 1);
        assert_eq!(executor.outstanding(), 0);
    }
}

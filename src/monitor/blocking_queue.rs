use std::{collections::VecDeque, sync::Arc};

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use super::{MonitorConsumer, NotificationService, QualityOfService, SerialExecutor, ValueSlot};
use crate::thread_pool::WorkerPool;

struct Shared<T> {
    consumer: Arc<dyn MonitorConsumer<T>>,
    queue: Mutex<VecDeque<T>>,
    slot: ValueSlot<T>,
}

impl<T> Shared<T> {
    fn deliver_oldest(&self) {
        let Some(value) = self.queue.lock().pop_front() else {
            return;
        };
        self.consumer.consume(&value);
        self.slot.recycle(value);
    }
}

/// Bounded per-consumer queue, delivered by a shared pool.
///
/// When the queue is full the oldest queued value is evicted, so the newest
/// value always gets through.
pub struct BlockingQueueNotifier<T> {
    shared: Arc<Shared<T>>,
    capacity: usize,
    executor: SerialExecutor,
    threads: usize,
    /// Publishers hold this shared until their value is handed to the executor
    closed: RwLock<bool>,
}

impl<T: Send + Sync + 'static> BlockingQueueNotifier<T> {
    pub fn new(
        consumer: Arc<dyn MonitorConsumer<T>>,
        pool: Arc<WorkerPool>,
        capacity: usize,
    ) -> Self {
        let capacity = capacity.max(1);
        BlockingQueueNotifier {
            shared: Arc::new(Shared {
                consumer,
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                slot: ValueSlot::default(),
            }),
            capacity,
            threads: pool.threads(),
            executor: SerialExecutor::new(pool),
            closed: RwLock::new(false),
        }
    }

    pub(crate) fn slot(&self) -> &ValueSlot<T> {
        &self.shared.slot
    }

    /// Values waiting for delivery
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

impl<T: Send + Sync + 'static> NotificationService<T> for BlockingQueueNotifier<T> {
    fn publish_value(&self, value: T) -> bool {
        let closed = self.closed.read();
        if *closed {
            return false;
        }
        let evicted = {
            let mut queue = self.shared.queue.lock();
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(value);
            evicted
        };
        match evicted {
            Some(old) => {
                // The delivery job already queued for the evicted value will
                // carry the new one instead
                trace!("Notification queue full, dropped oldest value");
                self.shared.slot.recycle(old);
                false
            }
            None => {
                let shared = self.shared.clone();
                self.executor.execute(move || shared.deliver_oldest());
                true
            }
        }
    }

    fn close(&self) {
        if std::mem::replace(&mut *self.closed.write(), true) {
            return;
        }
        self.executor.wait_idle(None);
    }

    fn quality_of_service(&self) -> QualityOfService {
        QualityOfService {
            is_buffered: true,
            buffer_size: Some(self.capacity),
            threads_per_consumer: self.threads,
            allows_null: false,
        }
    }
}

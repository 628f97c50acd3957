use std::sync::Arc;

use parking_lot::RwLock;

use super::{MonitorConsumer, NotificationService, QualityOfService, SerialExecutor, ValueSlot};
use crate::thread_pool::WorkerPool;

/// Each consumer is a stripe of a shared pool: unbounded, ordered, and never
/// dropping a value.
pub struct StripedNotifier<T> {
    consumer: Arc<dyn MonitorConsumer<T>>,
    slot: Arc<ValueSlot<T>>,
    executor: SerialExecutor,
    threads: usize,
    /// Publishers hold this shared until their value is handed to the executor
    closed: RwLock<bool>,
}

impl<T: Send + Sync + 'static> StripedNotifier<T> {
    pub fn new(consumer: Arc<dyn MonitorConsumer<T>>, pool: Arc<WorkerPool>) -> Self {
        StripedNotifier {
            consumer,
            slot: Arc::default(),
            threads: pool.threads(),
            executor: SerialExecutor::new(pool),
            closed: RwLock::new(false),
        }
    }

    pub(crate) fn slot(&self) -> &ValueSlot<T> {
        &self.slot
    }

    /// Values accepted but not yet delivered
    pub fn backlog(&self) -> usize {
        self.executor.outstanding()
    }
}

impl<T: Send + Sync + 'static> NotificationService<T> for StripedNotifier<T> {
    fn publish_value(&self, value: T) -> bool {
        let closed = self.closed.read();
        if *closed {
            return false;
        }
        let consumer = self.consumer.clone();
        let slot = self.slot.clone();
        self.executor.execute(move || {
            consumer.consume(&value);
            slot.recycle(value);
        });
        true
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
            buffer_size: None,
            threads_per_consumer: self.threads,
            allows_null: false,
        }
    }
}

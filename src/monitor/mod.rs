//! Delivery of subscription updates to consumers.
//!
//! Values decoded from the wire are handed to a [`MonitorNotifier`], which
//! calls its consumer on some other thread. The three engines differ in how
//! they buffer and what they drop under load:
//!
//! | engine | buffer | on overflow | threads |
//! |---|---|---|---|
//! | blocking queue | bounded per consumer | evicts the oldest queued value | shared pool |
//! | ring buffer | one pending slot | overwrites the pending value | one per consumer |
//! | striped executor | unbounded | never drops | shared pool |
//!
//! Every engine delivers to any one consumer in publish order, one value at a
//! time. Delivered values are handed back to the notifier so the next
//! [`publish_raw`](MonitorNotifier::publish_raw) can decode into their storage.

pub mod blocking_queue;
pub mod executor;
pub mod ring_buffer;
pub mod striped;

use std::{io, sync::Arc, time::Duration};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::{
    codec::{CodecError, TypeCodec},
    config::MonitorEngine,
    thread_pool::{PoolError, WorkerPool},
};

pub use blocking_queue::BlockingQueueNotifier;
pub use executor::SerialExecutor;
pub use ring_buffer::RingBufferNotifier;
pub use striped::StripedNotifier;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Could not start notification pool: {0}")]
    Pool(#[from] PoolError),
    #[error("Could not start notification thread: {0}")]
    Spawn(#[from] io::Error),
    #[error("Could not decode update: {0}")]
    Codec(#[from] CodecError),
}

/// Receives subscription updates
pub trait MonitorConsumer<T>: Send + Sync {
    fn consume(&self, value: &T);

    /// An explicit "no value" marker, on engines that allow one
    fn no_value(&self) {}
}

/// What an engine promises its consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityOfService {
    pub is_buffered: bool,
    /// Values held per consumer, `None` when unbounded
    pub buffer_size: Option<usize>,
    /// Threads that may deliver to one consumer (never more than one at a time)
    pub threads_per_consumer: usize,
    pub allows_null: bool,
}

pub trait NotificationService<T>: Send + Sync {
    /// Queue a value for delivery. Returns false if accepting it displaced or
    /// dropped another value, or if the service is closed.
    fn publish_value(&self, value: T) -> bool;

    /// Queue a "no value" marker, if the engine supports one
    fn publish_null(&self) -> bool {
        false
    }

    fn start(&self) -> Result<(), MonitorError> {
        Ok(())
    }

    /// Stop accepting values and finish delivering what was accepted
    fn close(&self);

    fn quality_of_service(&self) -> QualityOfService;
}

/// One spare value, kept between deliveries to reuse its allocation
pub struct ValueSlot<T>(Mutex<Option<T>>);

impl<T> Default for ValueSlot<T> {
    fn default() -> Self {
        ValueSlot(Mutex::new(None))
    }
}

impl<T> ValueSlot<T> {
    pub fn take(&self) -> Option<T> {
        self.0.lock().take()
    }

    pub fn recycle(&self, value: T) {
        *self.0.lock() = Some(value);
    }
}

/// A notifier of whichever engine was configured
pub enum MonitorNotifier<T: Send + Sync + 'static> {
    BlockingQueue(BlockingQueueNotifier<T>),
    RingBuffer(RingBufferNotifier<T>),
    Striped(StripedNotifier<T>),
}

impl<T: Send + Sync + 'static> MonitorNotifier<T> {
    fn service(&self) -> &dyn NotificationService<T> {
        match self {
            MonitorNotifier::BlockingQueue(n) => n,
            MonitorNotifier::RingBuffer(n) => n,
            MonitorNotifier::Striped(n) => n,
        }
    }

    fn slot(&self) -> &ValueSlot<T> {
        match self {
            MonitorNotifier::BlockingQueue(n) => n.slot(),
            MonitorNotifier::RingBuffer(n) => n.slot(),
            MonitorNotifier::Striped(n) => n.slot(),
        }
    }

    /// Decode a payload, reusing the last delivered value's storage, and publish it
    pub fn publish_raw<C>(&self, raw: &[u8], codec: &C, count: usize) -> Result<bool, MonitorError>
    where
        C: TypeCodec<Value = T>,
    {
        let count = codec.forced_element_count().unwrap_or(count);
        let value = codec.deserialize(raw, self.slot().take(), count)?;
        Ok(self.publish_value(value))
    }
}

impl<T: Send + Sync + 'static> NotificationService<T> for MonitorNotifier<T> {
    fn publish_value(&self, value: T) -> bool {
        self.service().publish_value(value)
    }

    fn publish_null(&self) -> bool {
        self.service().publish_null()
    }

    fn start(&self) -> Result<(), MonitorError> {
        self.service().start()
    }

    fn close(&self) {
        self.service().close()
    }

    fn quality_of_service(&self) -> QualityOfService {
        self.service().quality_of_service()
    }
}

/// Creates notifiers for the configured engine, sharing its worker pool
pub struct MonitorNotificationFactory {
    engine: MonitorEngine,
    pool: Option<Arc<WorkerPool>>,
}

impl MonitorNotificationFactory {
    pub fn new(engine: MonitorEngine) -> Result<Self, MonitorError> {
        let pool = match engine {
            MonitorEngine::BlockingQueue { threads, .. } => {
                Some(Arc::new(WorkerPool::new("ca-monitor", threads)?))
            }
            MonitorEngine::Striped { threads } => {
                Some(Arc::new(WorkerPool::new("ca-stripe", threads)?))
            }
            MonitorEngine::RingBuffer => None,
        };
        debug!("Monitor notifications using {engine:?}");
        Ok(MonitorNotificationFactory { engine, pool })
    }

    pub fn engine(&self) -> MonitorEngine {
        self.engine
    }

    /// A started notifier delivering to `consumer`
    pub fn create<T: Send + Sync + 'static>(
        &self,
        consumer: Arc<dyn MonitorConsumer<T>>,
    ) -> Result<MonitorNotifier<T>, MonitorError> {
        let notifier = match (self.engine, &self.pool) {
            (MonitorEngine::BlockingQueue { buffer_size, .. }, Some(pool)) => {
                MonitorNotifier::BlockingQueue(BlockingQueueNotifier::new(
                    consumer,
                    pool.clone(),
                    buffer_size,
                ))
            }
            (MonitorEngine::Striped { .. }, Some(pool)) => {
                MonitorNotifier::Striped(StripedNotifier::new(consumer, pool.clone()))
            }
            _ => MonitorNotifier::RingBuffer(RingBufferNotifier::new(consumer)),
        };
        notifier.start()?;
        Ok(notifier)
    }

    /// Stop the shared pool, waiting up to `grace` for deliveries in flight
    pub fn shutdown(&self, grace: Duration) -> bool {
        self.pool.as_ref().is_none_or(|pool| pool.shutdown(grace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ArrayCodec;
    use std::sync::mpsc;

    struct Forward(Mutex<mpsc::Sender<Vec<i32>>>);

    impl MonitorConsumer<Vec<i32>> for Forward {
        fn consume(&self, value: &Vec<i32>) {
            let _ = self.0.lock().send(value.clone());
        }
    }

    #[test]
    fn factory_builds_configured_engine() {
        for (specifier, buffer_size) in [
            ("BlockingQueueSingleThread,4", Some(4)),
            ("RingBuffer", Some(2)),
            ("StripedExecutor,2", None),
        ] {
            let factory = MonitorNotificationFactory::new(specifier.parse().unwrap()).unwrap();
            let (tx, _rx) = mpsc::channel();
            let notifier = factory
                .create::<Vec<i32>>(Arc::new(Forward(Mutex::new(tx))))
                .unwrap();
            assert_eq!(notifier.quality_of_service().buffer_size, buffer_size);
            notifier.close();
            factory.shutdown(Duration::from_secs(1));
        }
    }

    #[test]
    fn publish_raw_decodes_with_codec() {
        let factory =
            MonitorNotificationFactory::new(MonitorEngine::Striped { threads: 1 }).unwrap();
        let (tx, rx) = mpsc::channel();
        let notifier = factory.create(Arc::new(Forward(Mutex::new(tx)))).unwrap();
        let codec = ArrayCodec::<i32>::new();
        let raw = codec.serialize(&vec![4, 5, 6], 3);
        assert!(notifier.publish_raw(&raw, &codec, 3).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), vec![4, 5, 6]);
        assert!(notifier.publish_raw(&raw[..4], &codec, 3).is_err());
        notifier.close();
    }
}

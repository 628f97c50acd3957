use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};
use tracing::{error, trace};

use super::{MonitorConsumer, MonitorError, NotificationService, QualityOfService, ValueSlot};

const PARK_INTERVAL: Duration = Duration::from_millis(100);

enum RingItem<T> {
    Value(T),
    Null,
}

struct Shared<T> {
    consumer: Arc<dyn MonitorConsumer<T>>,
    /// The newest value not yet picked up by the consumer thread
    pending: ArcSwapOption<RingItem<T>>,
    slot: ValueSlot<T>,
    closed: AtomicBool,
}

impl<T> Shared<T> {
    fn recycle(&self, item: Arc<RingItem<T>>) {
        if let Ok(RingItem::Value(value)) = Arc::try_unwrap(item) {
            self.slot.recycle(value);
        }
    }

    /// Deliver the pending item, if any
    fn deliver_pending(&self) -> bool {
        let Some(item) = self.pending.swap(None) else {
            return false;
        };
        let delivered = catch_unwind(AssertUnwindSafe(|| match item.as_ref() {
            RingItem::Value(value) => self.consumer.consume(value),
            RingItem::Null => self.consumer.no_value(),
        }));
        if delivered.is_err() {
            error!("Monitor consumer panicked");
        }
        self.recycle(item);
        true
    }
}

fn consume_loop<T>(shared: Arc<Shared<T>>) {
    loop {
        if shared.deliver_pending() {
            continue;
        }
        if shared.closed.load(Ordering::Acquire) {
            break;
        }
        thread::park_timeout(PARK_INTERVAL);
    }
    trace!("Ring buffer consumer stopped");
}

/// Latest-value delivery on a dedicated thread per consumer.
///
/// Holds at most one value waiting while another is being delivered. A value
/// published before the consumer picked up the previous one replaces it.
pub struct RingBufferNotifier<T> {
    shared: Arc<Shared<T>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    /// Held shared for a whole publish, and exclusively while closing
    publishing: RwLock<()>,
}

impl<T: Send + Sync + 'static> RingBufferNotifier<T> {
    pub fn new(consumer: Arc<dyn MonitorConsumer<T>>) -> Self {
        RingBufferNotifier {
            shared: Arc::new(Shared {
                consumer,
                pending: ArcSwapOption::empty(),
                slot: ValueSlot::default(),
                closed: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
            publishing: RwLock::new(()),
        }
    }

    pub(crate) fn slot(&self) -> &ValueSlot<T> {
        &self.shared.slot
    }

    fn publish(&self, item: RingItem<T>) -> bool {
        let _publishing = self.publishing.read();
        if self.shared.closed.load(Ordering::Acquire) {
            return false;
        }
        let displaced = self.shared.pending.swap(Some(Arc::new(item)));
        if let Some(handle) = self.thread.lock().as_ref() {
            handle.thread().unpark();
        }
        match displaced {
            Some(old) => {
                trace!("Overwrote undelivered monitor value");
                self.shared.recycle(old);
                false
            }
            None => true,
        }
    }
}

impl<T: Send + Sync + 'static> NotificationService<T> for RingBufferNotifier<T> {
    fn publish_value(&self, value: T) -> bool {
        self.publish(RingItem::Value(value))
    }

    fn publish_null(&self) -> bool {
        self.publish(RingItem::Null)
    }

    fn start(&self) -> Result<(), MonitorError> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }
        let shared = self.shared.clone();
        *thread = Some(
            thread::Builder::new()
                .name("ca-ring".to_string())
                .spawn(move || consume_loop(shared))?,
        );
        Ok(())
    }

    fn close(&self) {
        {
            let _publishing = self.publishing.write();
            if self.shared.closed.swap(true, Ordering::AcqRel) {
                return;
            }
        }
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            handle.thread().unpark();
            if handle.join().is_err() {
                error!("Ring buffer consumer thread panicked");
            }
        }
        // Anything that raced in after the consumer thread stopped
        self.shared.deliver_pending();
    }

    fn quality_of_service(&self) -> QualityOfService {
        QualityOfService {
            is_buffered: true,
            buffer_size: Some(2),
            threads_per_consumer: 1,
            allows_null: true,
        }
    }
}

impl<T> Drop for RingBufferNotifier<T> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            handle.thread().unpark();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    struct Slow {
        seen: Mutex<Vec<Option<u32>>>,
        gate: Mutex<mpsc::Receiver<()>>,
    }

    impl MonitorConsumer<u32> for Slow {
        fn consume(&self, value: &u32) {
            let _ = self.gate.lock().recv_timeout(Duration::from_secs(2));
            self.seen.lock().push(Some(*value));
        }

        fn no_value(&self) {
            self.seen.lock().push(None);
        }
    }

    #[test]
    fn newest_value_replaces_undelivered_one() {
        let (gate, rx) = mpsc::channel();
        let consumer = Arc::new(Slow {
            seen: Mutex::new(Vec::new()),
            gate: Mutex::new(rx),
        });
        let notifier = RingBufferNotifier::new(consumer.clone());
        notifier.start().unwrap();
        assert!(notifier.publish_value(1));
        // Wait for the consumer to take 1 and block on the gate
        while notifier.shared.pending.load().is_some() {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(notifier.publish_value(2));
        assert!(!notifier.publish_value(3));
        gate.send(()).unwrap();
        gate.send(()).unwrap();
        notifier.close();
        assert_eq!(*consumer.seen.lock(), vec![Some(1), Some(3)]);
        // The displaced value's storage is kept for reuse
        assert!(notifier.slot().take().is_some());
    }

    #[test]
    fn null_marker_delivered() {
        let (_gate, rx) = mpsc::channel();
        let consumer = Arc::new(Slow {
            seen: Mutex::new(Vec::new()),
            gate: Mutex::new(rx),
        });
        let notifier = RingBufferNotifier::<u32>::new(consumer.clone());
        notifier.start().unwrap();
        assert!(notifier.publish_null());
        notifier.close();
        assert_eq!(*consumer.seen.lock(), vec![None]);
        assert!(!notifier.publish_null());
    }
}

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use tracing::trace;

use super::{TcpTransport, Transport};

/// Live circuits, keyed by server address and priority.
///
/// The registry holds the only long-lived strong references to transports;
/// channels keep `Weak` handles and look the circuit up again when they need it.
#[derive(Default)]
pub struct TransportRegistry {
    transports: Mutex<HashMap<(SocketAddr, u16), Arc<TcpTransport>>>,
}

impl TransportRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(TransportRegistry::default())
    }

    pub fn get(&self, address: SocketAddr, priority: u16) -> Option<Arc<TcpTransport>> {
        self.transports
            .lock()
            .get(&(address, priority))
            .filter(|t| !t.is_closed())
            .cloned()
    }

    pub fn put(&self, transport: Arc<TcpTransport>) {
        trace!("Registering circuit {transport:?}");
        self.transports
            .lock()
            .insert((transport.address(), transport.priority()), transport);
    }

    /// Remove `transport`, if it is still the one registered under its key
    pub fn remove(&self, transport: &TcpTransport) -> bool {
        let mut transports = self.transports.lock();
        let key = (transport.address(), transport.priority());
        match transports.get(&key) {
            Some(existing) if std::ptr::eq(Arc::as_ptr(existing), transport) => {
                transports.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Every circuit to `address`, whatever its priority
    pub fn for_address(&self, address: SocketAddr) -> Vec<Arc<TcpTransport>> {
        self.transports
            .lock()
            .iter()
            .filter(|((a, _), _)| *a == address)
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<TcpTransport>> {
        self.transports.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.transports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every circuit. Closing removes each from the registry.
    pub fn close_all(&self) {
        for transport in self.all() {
            transport.close(false);
        }
        self.transports.lock().clear();
    }
}

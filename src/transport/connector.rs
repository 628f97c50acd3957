use std::{
    collections::HashMap,
    io,
    net::{SocketAddr, TcpStream},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, debug_span};

use super::{ResponseHandler, TcpTransport, TransportClient, TransportError, TransportRegistry};
use crate::reactor::Dispatcher;

type CircuitKey = (SocketAddr, u16);

/// Opens circuits, sharing an existing one for the same server and priority.
///
/// Connects to one key are serialised through a per-key lock so that
/// simultaneous requests end up on a single transport, while connects to
/// different servers proceed in parallel.
pub struct TransportConnector {
    dispatcher: Dispatcher,
    registry: Arc<TransportRegistry>,
    handler: Arc<dyn ResponseHandler>,
    receive_capacity: usize,
    connect_timeout: Duration,
    client_name: Option<String>,
    host_name: Option<String>,
    locks: Mutex<HashMap<CircuitKey, Arc<Mutex<()>>>>,
}

impl TransportConnector {
    pub fn new(
        dispatcher: Dispatcher,
        registry: Arc<TransportRegistry>,
        handler: Arc<dyn ResponseHandler>,
        receive_capacity: usize,
        connect_timeout: Duration,
    ) -> Self {
        TransportConnector {
            dispatcher,
            registry,
            handler,
            receive_capacity,
            connect_timeout,
            client_name: None,
            host_name: None,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Override the names sent in the circuit handshake
    pub fn with_identity(mut self, client_name: Option<String>, host_name: Option<String>) -> Self {
        self.client_name = client_name;
        self.host_name = host_name;
        self
    }

    pub fn registry(&self) -> &Arc<TransportRegistry> {
        &self.registry
    }

    /// Get a circuit to `address` owned by `client`, connecting if needed
    pub fn connect(
        &self,
        client: Arc<dyn TransportClient>,
        address: SocketAddr,
        priority: u16,
    ) -> Result<Arc<TcpTransport>, TransportError> {
        if let Some(transport) = self.shared(&client, address, priority) {
            return Ok(transport);
        }
        let key = (address, priority);
        let lock = self.locks.lock().entry(key).or_default().clone();
        let result = {
            let _guard = lock.lock();
            match self.shared(&client, address, priority) {
                Some(transport) => Ok(transport),
                None => self.open(client, address, priority),
            }
        };
        let mut locks = self.locks.lock();
        // Only the map and this call still hold it
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(&key);
        }
        result
    }

    fn shared(
        &self,
        client: &Arc<dyn TransportClient>,
        address: SocketAddr,
        priority: u16,
    ) -> Option<Arc<TcpTransport>> {
        self.registry
            .get(address, priority)
            .filter(|transport| transport.acquire(client.clone()))
    }

    fn open(
        &self,
        client: Arc<dyn TransportClient>,
        address: SocketAddr,
        priority: u16,
    ) -> Result<Arc<TcpTransport>, TransportError> {
        let _span = debug_span!("connect", %address, priority).entered();
        debug!("Connecting new circuit");
        let stream = TcpStream::connect_timeout(&address, self.connect_timeout).map_err(|e| {
            if e.kind() == io::ErrorKind::TimedOut {
                TransportError::ConnectTimeout(address)
            } else {
                e.into()
            }
        })?;
        let transport = TcpTransport::new(
            stream,
            priority,
            self.receive_capacity,
            self.handler.clone(),
            self.dispatcher.clone(),
            Arc::downgrade(&self.registry),
        )?;
        self.registry.put(transport.clone());
        if let Err(e) =
            transport.send_handshake(self.client_name.as_deref(), self.host_name.as_deref())
        {
            transport.close(true);
            return Err(e);
        }
        if !transport.acquire(client) {
            return Err(TransportError::Closed);
        }
        debug!("Circuit ready");
        Ok(transport)
    }
}

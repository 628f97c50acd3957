//! The assembled I/O core of a client.
//!
//! [`CoreContext`] owns one of everything: the reactor and its leader/followers
//! pool, the circuit registry and connector, the search transport and manager,
//! the beacon listener, the circuit echo timer and the monitor notification
//! factory. Whatever the servers say that a channel layer has to act on comes
//! out of [`CoreContext::take_events`] as [`ContextEvent`]s.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub use crate::handler::ContextEvent;
use crate::{
    config::ContextConfig,
    handler::ClientResponseHandler,
    messages::{CAMessage, RepeaterRegister},
    monitor::{MonitorConsumer, MonitorError, MonitorNotificationFactory, MonitorNotifier},
    reactor::{Dispatcher, LeaderFollowersThreadPool, Reactor, ReactorError},
    search::{ChannelSearchManager, SearchResult},
    thread_pool::PoolError,
    timer::{Timer, TimerTask},
    transport::{
        BroadcastTransport, TcpTransport, TransportClient, TransportConnector, TransportError,
        TransportRegistry,
    },
    utils::{new_broadcast_udp_socket, new_reusable_udp_socket},
};

/// How long shutdown waits for worker threads to finish what they are doing
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);
/// Circuits are checked this many times per connection timeout
const LIVENESS_CHECKS_PER_TIMEOUT: u32 = 4;
const MIN_LIVENESS_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Could not start reactor: {0}")]
    Reactor(#[from] ReactorError),
    #[error("Could not start I/O threads: {0}")]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Context has been shut down")]
    ShutDown,
}

/// Periodically probes every open circuit
struct LivenessTask {
    registry: Weak<TransportRegistry>,
    timeout: Duration,
    interval: Duration,
}

impl TimerTask for LivenessTask {
    fn run(&self) -> Option<Duration> {
        let registry = self.registry.upgrade()?;
        let now = Instant::now();
        for transport in registry.all() {
            transport.check_liveness(now, self.timeout);
        }
        Some(self.interval)
    }
}

pub struct CoreContext {
    config: ContextConfig,
    reactor: Arc<Reactor>,
    io_pool: Arc<LeaderFollowersThreadPool>,
    registry: Arc<TransportRegistry>,
    connector: TransportConnector,
    handler: Arc<ClientResponseHandler>,
    search_transport: Arc<BroadcastTransport>,
    beacon_listener: Option<Arc<BroadcastTransport>>,
    search: Arc<ChannelSearchManager>,
    liveness: Timer,
    monitors: MonitorNotificationFactory,
    events: Mutex<Option<mpsc::UnboundedReceiver<ContextEvent>>>,
    closed: CancellationToken,
}

impl CoreContext {
    pub fn new(config: ContextConfig) -> Result<Self, ContextError> {
        let reactor = Arc::new(Reactor::new()?);
        let io_pool = LeaderFollowersThreadPool::new(reactor.clone(), config.io_threads)?;
        io_pool.start()?;
        let dispatcher = Dispatcher::leader_followers(io_pool.clone());

        let registry = TransportRegistry::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handler = Arc::new(ClientResponseHandler::new(
            events_tx,
            Arc::downgrade(&registry),
            config.server_port,
        ));

        let search_transport = BroadcastTransport::new(
            new_broadcast_udp_socket()?,
            config.search_addresses(),
            handler.clone(),
            dispatcher.clone(),
        )?;
        let search = ChannelSearchManager::new(config.search, search_transport.clone())?;
        handler.set_search_manager(&search);

        register_with_repeater(&search_transport, config.repeater_port);
        let beacon_address = (Ipv4Addr::UNSPECIFIED, config.repeater_port);
        let beacon_listener = match new_reusable_udp_socket(beacon_address) {
            Ok(socket) => Some(BroadcastTransport::new(
                socket,
                Vec::new(),
                handler.clone(),
                dispatcher.clone(),
            )?),
            Err(e) => {
                debug!(
                    "Not listening for beacons on port {}: {e}",
                    config.repeater_port
                );
                None
            }
        };

        let connector = TransportConnector::new(
            dispatcher,
            registry.clone(),
            handler.clone(),
            config.receive_buffer_size(),
            config.connection_timeout,
        )
        .with_identity(config.client_name.clone(), config.host_name.clone());

        let liveness = Timer::new("ca-echo")?;
        let interval =
            (config.connection_timeout / LIVENESS_CHECKS_PER_TIMEOUT).max(MIN_LIVENESS_INTERVAL);
        liveness.execute_after_delay(
            interval,
            Arc::new(LivenessTask {
                registry: Arc::downgrade(&registry),
                timeout: config.connection_timeout,
                interval,
            }),
        );

        let monitors = MonitorNotificationFactory::new(config.monitor_engine)?;

        info!(
            "Client context started, searching on {:?}",
            search_transport.send_addresses()
        );
        Ok(CoreContext {
            config,
            reactor,
            io_pool,
            registry,
            connector,
            handler,
            search_transport,
            beacon_listener,
            search,
            liveness,
            monitors,
            events: Mutex::new(Some(events_rx)),
            closed: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    pub fn registry(&self) -> &Arc<TransportRegistry> {
        &self.registry
    }

    pub fn search_manager(&self) -> &Arc<ChannelSearchManager> {
        &self.search
    }

    pub fn response_handler(&self) -> &Arc<ClientResponseHandler> {
        &self.handler
    }

    pub fn monitors(&self) -> &MonitorNotificationFactory {
        &self.monitors
    }

    /// Local address searches are sent from, and replies arrive at
    pub fn search_address(&self) -> SocketAddr {
        self.search_transport.local_address()
    }

    pub fn is_listening_for_beacons(&self) -> bool {
        self.beacon_listener.is_some()
    }

    /// The event receiver. Only the first call gets it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ContextEvent>> {
        self.events.lock().take()
    }

    /// The event receiver as a stream. Only the first call (of this or
    /// [`take_events`](Self::take_events)) gets it.
    pub fn event_stream(&self) -> Option<UnboundedReceiverStream<ContextEvent>> {
        self.take_events().map(UnboundedReceiverStream::new)
    }

    /// Start searching for a channel; the answer arrives as [`ContextEvent::ChannelFound`]
    pub fn search(&self, cid: u32, name: &str) -> Result<(), ContextError> {
        self.check_open()?;
        self.search.register(cid, name);
        Ok(())
    }

    /// Start searching for a channel and get the answer directly
    pub fn search_with_reply(
        &self,
        cid: u32,
        name: &str,
    ) -> Result<oneshot::Receiver<SearchResult>, ContextError> {
        self.check_open()?;
        Ok(self.search.register_with_reply(cid, name))
    }

    pub fn cancel_search(&self, cid: u32) -> bool {
        self.search.unregister(cid)
    }

    /// A circuit to `address`, shared with other clients at the same priority
    pub fn connect(
        &self,
        client: Arc<dyn TransportClient>,
        address: SocketAddr,
        priority: u16,
    ) -> Result<Arc<TcpTransport>, ContextError> {
        self.check_open()?;
        Ok(self.connector.connect(client, address, priority)?)
    }

    /// A started notifier of the configured engine
    pub fn create_notifier<T: Send + Sync + 'static>(
        &self,
        consumer: Arc<dyn MonitorConsumer<T>>,
    ) -> Result<MonitorNotifier<T>, ContextError> {
        self.check_open()?;
        Ok(self.monitors.create(consumer)?)
    }

    fn check_open(&self) -> Result<(), ContextError> {
        if self.closed.is_cancelled() {
            Err(ContextError::ShutDown)
        } else {
            Ok(())
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Stop searching, close every transport and stop all threads.
    pub fn shutdown(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        debug!("Shutting down client context");
        self.search.shutdown();
        self.liveness.shutdown();
        self.registry.close_all();
        self.search_transport.close();
        if let Some(listener) = &self.beacon_listener {
            listener.close();
        }
        if !self.io_pool.shutdown(SHUTDOWN_GRACE) {
            warn!("I/O threads still busy after shutdown grace period");
        }
        if !self.monitors.shutdown(SHUTDOWN_GRACE) {
            warn!("Notification threads still busy after shutdown grace period");
        }
        info!("Client context shut down");
    }
}

impl Drop for CoreContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Ask the local repeater to forward beacons to the search socket
fn register_with_repeater(transport: &BroadcastTransport, repeater_port: u16) {
    let mut frame = Vec::new();
    let message = RepeaterRegister {
        client_ip: Ipv4Addr::LOCALHOST,
    };
    if let Err(e) = message.write(&mut frame) {
        warn!("Could not build repeater registration: {e}");
        return;
    }
    let repeater = SocketAddr::from((Ipv4Addr::LOCALHOST, repeater_port));
    match transport.send_to(&frame, repeater) {
        Ok(()) => trace!("Registered with repeater at {repeater}"),
        Err(e) => debug!("Could not register with repeater at {repeater}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SearchConfig;

    fn quiet_config() -> ContextConfig {
        ContextConfig {
            address_list: vec!["127.0.0.1:1".parse().unwrap()],
            auto_address_list: false,
            repeater_port: 1,
            io_threads: 2,
            search: SearchConfig {
                min_interval: Duration::from_secs(60),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn events_taken_once() {
        let context = CoreContext::new(quiet_config()).unwrap();
        assert!(context.take_events().is_some());
        assert!(context.event_stream().is_none());
        context.shutdown();
    }

    #[test]
    fn refuses_work_after_shutdown() {
        let context = CoreContext::new(quiet_config()).unwrap();
        context.search(1, "TEST:A").unwrap();
        assert!(context.search_manager().is_searching(1));
        context.shutdown();
        assert!(context.is_shut_down());
        assert!(!context.search_manager().is_searching(1));
        assert!(matches!(
            context.search(2, "TEST:B"),
            Err(ContextError::ShutDown)
        ));
    }
}

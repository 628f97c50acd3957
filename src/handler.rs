//! Client side dispatch of every frame read from a transport.
//!
//! Circuit and datagram transports share one [`ClientResponseHandler`]. Search
//! replies and beacons are handled here, against the search manager and the
//! per-server beacon state. Everything a channel layer has to act on is
//! forwarded as a [`ContextEvent`].

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, OnceLock, Weak},
    time::Instant,
};

use nom::{Finish, number::complete::be_u16};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, debug_span, trace, warn};

use crate::{
    beacon::BeaconHandler,
    messages::{Header, command, padded_string},
    search::{ChannelSearchManager, SearchResult},
    transport::{ResponseHandler, Transport, TransportRegistry},
};

/// Beacon IP field meaning "use the address the beacon came from"
const BEACON_SENDER_ADDRESS: u32 = 0;
/// Search reply IP field meaning "use the address the reply came from"
const SEARCH_SENDER_ADDRESS: u32 = u32::MAX;

/// Something the channel layer needs to know about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEvent {
    /// A pending search was answered
    ChannelFound(SearchResult),
    ChannelCreated {
        server: SocketAddr,
        cid: u32,
        sid: u32,
        data_type: u16,
        data_count: u32,
    },
    ChannelCreateFailed {
        server: SocketAddr,
        cid: u32,
    },
    /// The server dropped a channel
    ChannelDisconnected {
        server: SocketAddr,
        cid: u32,
    },
    AccessRights {
        server: SocketAddr,
        cid: u32,
        access: u32,
    },
    MonitorUpdate {
        server: SocketAddr,
        subscription_id: u32,
        status: u32,
        data_type: u16,
        data_count: u32,
        payload: Vec<u8>,
    },
    /// Reply to a read or write request
    NotifyResponse {
        server: SocketAddr,
        command: u16,
        ioid: u32,
        status: u32,
        data_type: u16,
        data_count: u32,
        payload: Vec<u8>,
    },
    ServerError {
        server: SocketAddr,
        cid: u32,
        status: u32,
        /// The header of the request that failed, when it could be read
        request: Option<Header>,
        message: String,
    },
    BeaconAnomaly {
        server: SocketAddr,
    },
}

pub struct ClientResponseHandler {
    events: mpsc::UnboundedSender<ContextEvent>,
    search: OnceLock<Weak<ChannelSearchManager>>,
    registry: Weak<TransportRegistry>,
    server_port: u16,
    beacons: Mutex<HashMap<SocketAddr, Arc<BeaconHandler>>>,
}

impl ClientResponseHandler {
    /// `server_port` is assumed for replies from servers too old to state their own
    pub fn new(
        events: mpsc::UnboundedSender<ContextEvent>,
        registry: Weak<TransportRegistry>,
        server_port: u16,
    ) -> Self {
        ClientResponseHandler {
            events,
            search: OnceLock::new(),
            registry,
            server_port,
            beacons: Mutex::new(HashMap::new()),
        }
    }

    /// Connect the search manager, which is created after its transport
    pub fn set_search_manager(&self, manager: &Arc<ChannelSearchManager>) {
        if self.search.set(Arc::downgrade(manager)).is_err() {
            warn!("Search manager already set on response handler");
        }
    }

    fn search_manager(&self) -> Option<Arc<ChannelSearchManager>> {
        self.search.get().and_then(Weak::upgrade)
    }

    /// Beacon state for a server, created on first sight
    pub fn beacon_handler(&self, server: SocketAddr) -> Arc<BeaconHandler> {
        self.beacons
            .lock()
            .entry(server)
            .or_insert_with(|| Arc::new(BeaconHandler::new(server)))
            .clone()
    }

    /// Servers a beacon has been seen from
    pub fn known_servers(&self) -> Vec<SocketAddr> {
        self.beacons.lock().keys().copied().collect()
    }

    fn emit(&self, event: ContextEvent) {
        if self.events.send(event).is_err() {
            trace!("No receiver for context events");
        }
    }

    fn search_response(&self, from: SocketAddr, header: &Header, payload: &[u8]) {
        let ip = match header.parameter_1 {
            SEARCH_SENDER_ADDRESS => from.ip(),
            raw => IpAddr::V4(Ipv4Addr::from_bits(raw)),
        };
        let port = match header.data_type {
            0 => self.server_port,
            port => port,
        };
        let minor_version = be_u16::<_, nom::error::Error<&[u8]>>(payload)
            .finish()
            .map(|(_, v)| v)
            .unwrap_or(0);
        let result = SearchResult {
            cid: header.parameter_2,
            sid: header.parameter_1,
            data_type: header.data_type,
            data_count: header.data_count,
            minor_version,
            server_address: SocketAddr::new(ip, port),
        };
        let Some(manager) = self.search_manager() else {
            return;
        };
        if manager.search_response(result.clone()) {
            self.emit(ContextEvent::ChannelFound(result));
        } else {
            trace!("Ignoring late or duplicate search reply for cid {}", result.cid);
        }
    }

    fn beacon(&self, from: SocketAddr, header: &Header) {
        let ip = match header.parameter_2 {
            BEACON_SENDER_ADDRESS => from.ip(),
            raw => IpAddr::V4(Ipv4Addr::from_bits(raw)),
        };
        let port = match header.data_count as u16 {
            0 => self.server_port,
            port => port,
        };
        let server = SocketAddr::new(ip, port);
        let minor_revision = header.data_type;
        let handler = self.beacon_handler(server);

        // A beacon is proof of life for every circuit to that server
        if let Some(registry) = self.registry.upgrade() {
            for transport in registry.for_address(server) {
                transport.mark_alive();
            }
        }

        if handler.beacon_notify(minor_revision, header.parameter_1, Instant::now()) {
            debug!("Beacon anomaly from {server}");
            if let Some(manager) = self.search_manager() {
                manager.beacon_anomaly();
            }
            self.emit(ContextEvent::BeaconAnomaly { server });
        }
    }

    fn server_error(&self, server: SocketAddr, header: &Header, payload: &[u8]) {
        let (request, message) = match Header::parse(payload) {
            Ok((rest, request)) => {
                // Skip the original payload if it was echoed back
                let skip = (request.payload_size as usize).min(rest.len());
                let message = rest.get(skip..).filter(|m| !m.is_empty()).unwrap_or(rest);
                (Some(request), padded_string(message))
            }
            Err(_) => (None, padded_string(payload)),
        };
        warn!(
            "Server {server} reported error {} for cid {}: {message}",
            header.parameter_2, header.parameter_1
        );
        self.emit(ContextEvent::ServerError {
            server,
            cid: header.parameter_1,
            status: header.parameter_2,
            request,
            message,
        });
    }
}

impl ResponseHandler for ClientResponseHandler {
    fn handle_response(
        &self,
        from: SocketAddr,
        transport: &dyn Transport,
        header: &Header,
        payload: &[u8],
    ) {
        let _span = debug_span!("response", command = header.command, %from).entered();
        let server = transport.remote_address().unwrap_or(from);
        match header.command {
            command::VERSION => {
                let revision = header.data_count as u16;
                trace!("Peer speaks minor revision {revision}");
                transport.set_minor_revision(revision);
            }
            command::SEARCH => self.search_response(from, header, payload),
            command::RSRV_IS_UP => self.beacon(from, header),
            command::ECHO => {}
            command::REPEATER_CONFIRM => debug!("Repeater registration confirmed by {from}"),
            command::NOT_FOUND => trace!("Server {from} does not host cid {}", header.parameter_2),
            command::EVENT_ADD => self.emit(ContextEvent::MonitorUpdate {
                server,
                subscription_id: header.parameter_2,
                status: header.parameter_1,
                data_type: header.data_type,
                data_count: header.data_count,
                payload: payload.to_vec(),
            }),
            command::READ_NOTIFY | command::WRITE_NOTIFY => {
                self.emit(ContextEvent::NotifyResponse {
                    server,
                    command: header.command,
                    ioid: header.parameter_2,
                    status: header.parameter_1,
                    data_type: header.data_type,
                    data_count: header.data_count,
                    payload: payload.to_vec(),
                })
            }
            command::CREATE_CHAN => self.emit(ContextEvent::ChannelCreated {
                server,
                cid: header.parameter_1,
                sid: header.parameter_2,
                data_type: header.data_type,
                data_count: header.data_count,
            }),
            command::ACCESS_RIGHTS => self.emit(ContextEvent::AccessRights {
                server,
                cid: header.parameter_1,
                access: header.parameter_2,
            }),
            command::CREATE_CH_FAIL => self.emit(ContextEvent::ChannelCreateFailed {
                server,
                cid: header.parameter_1,
            }),
            command::SERVER_DISCONN => self.emit(ContextEvent::ChannelDisconnected {
                server,
                cid: header.parameter_1,
            }),
            command::ERROR => self.server_error(server, header, payload),
            other => debug!("Ignoring unexpected command {other} from {from}"),
        }
    }
}

//! Configuration consumed by the client core.
//!
//! A [`ContextConfig`] is built once, either from defaults or from the usual
//! `EPICS_CA_*` environment variables, and handed to each component when it is
//! constructed. Nothing in the crate reads the environment after that point.

use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use thiserror::Error;
use tracing::warn;

use crate::{
    messages::CA_EXTENDED_MESSAGE_HEADER_SIZE,
    utils::{interface_broadcast_addresses, parse_address_list},
};

pub const DEFAULT_SERVER_PORT: u16 = 5064;
pub const DEFAULT_REPEATER_PORT: u16 = 5065;
pub const DEFAULT_MAX_ARRAY_BYTES: usize = 16384;
pub const DEFAULT_QUEUE_SIZE: usize = 16;
pub const DEFAULT_NOTIFIER_THREADS: usize = 4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unknown monitor notifier '{0}'")]
    UnknownEngine(String),
    #[error("Invalid argument '{1}' for monitor notifier {0}")]
    InvalidArgument(String, String),
    #[error("Too many arguments for monitor notifier {0}")]
    TooManyArguments(String),
}

/// Which monitor notification engine to use, and its parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEngine {
    /// Bounded per-consumer queue drained by a shared worker pool
    BlockingQueue { threads: usize, buffer_size: usize },
    /// Two-slot overwriting ring with one dedicated thread per consumer
    RingBuffer,
    /// Unbounded per-consumer stripes over a shared pool
    Striped { threads: usize },
}

impl Default for MonitorEngine {
    fn default() -> Self {
        MonitorEngine::BlockingQueue {
            threads: 1,
            buffer_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

fn parse_positive(engine: &str, argument: &str) -> Result<usize, ConfigError> {
    match argument.trim().parse::<usize>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(ConfigError::InvalidArgument(
            engine.to_string(),
            argument.to_string(),
        )),
    }
}

impl FromStr for MonitorEngine {
    type Err = ConfigError;

    /// Parse a specifier such as `BlockingQueueMultipleWorker,4,32`
    fn from_str(specifier: &str) -> Result<Self, Self::Err> {
        let mut parts = specifier.split(',');
        let name = parts.next().unwrap_or_default().trim();
        let arguments: Vec<&str> = parts.collect();
        let max_arguments = |count: usize| {
            if arguments.len() > count {
                Err(ConfigError::TooManyArguments(name.to_string()))
            } else {
                Ok(())
            }
        };

        match name.to_ascii_lowercase().as_str() {
            "blockingqueuesinglethread" => {
                max_arguments(1)?;
                Ok(MonitorEngine::BlockingQueue {
                    threads: 1,
                    buffer_size: arguments
                        .first()
                        .map(|a| parse_positive(name, a))
                        .transpose()?
                        .unwrap_or(DEFAULT_QUEUE_SIZE),
                })
            }
            "blockingqueuemultipleworker" => {
                max_arguments(2)?;
                Ok(MonitorEngine::BlockingQueue {
                    threads: arguments
                        .first()
                        .map(|a| parse_positive(name, a))
                        .transpose()?
                        .unwrap_or(DEFAULT_NOTIFIER_THREADS),
                    buffer_size: arguments
                        .get(1)
                        .map(|a| parse_positive(name, a))
                        .transpose()?
                        .unwrap_or(DEFAULT_QUEUE_SIZE),
                })
            }
            "ringbuffer" => {
                max_arguments(0)?;
                Ok(MonitorEngine::RingBuffer)
            }
            "stripedexecutor" => {
                max_arguments(1)?;
                Ok(MonitorEngine::Striped {
                    threads: arguments
                        .first()
                        .map(|a| parse_positive(name, a))
                        .transpose()?
                        .unwrap_or(DEFAULT_NOTIFIER_THREADS),
                })
            }
            _ => Err(ConfigError::UnknownEngine(specifier.to_string())),
        }
    }
}

/// Tuning for the channel search retry schedule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchConfig {
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: u32,
    /// Retries due within this window are batched into the same datagram
    pub coalesce_window: Duration,
    /// Consecutive immediate flushes allowed before pausing
    pub max_immediate_flushes: usize,
    pub flush_pause: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(30),
            multiplier: 2,
            coalesce_window: Duration::from_millis(3),
            max_immediate_flushes: 5,
            flush_pause: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Explicit addresses to send searches to
    pub address_list: Vec<SocketAddr>,
    /// Also search on the broadcast address of every interface
    pub auto_address_list: bool,
    pub connection_timeout: Duration,
    pub beacon_period: Duration,
    pub server_port: u16,
    pub repeater_port: u16,
    /// Largest payload we accept on a circuit
    pub max_array_bytes: usize,
    pub monitor_engine: MonitorEngine,
    pub search: SearchConfig,
    /// Threads available to the leader/followers pool
    pub io_threads: usize,
    /// Name sent to servers; the login user if not set
    pub client_name: Option<String>,
    /// Host name sent to servers; the system host name if not set
    pub host_name: Option<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            address_list: Vec::new(),
            auto_address_list: true,
            connection_timeout: Duration::from_secs(30),
            beacon_period: Duration::from_secs(15),
            server_port: DEFAULT_SERVER_PORT,
            repeater_port: DEFAULT_REPEATER_PORT,
            max_array_bytes: DEFAULT_MAX_ARRAY_BYTES,
            monitor_engine: MonitorEngine::default(),
            search: SearchConfig::default(),
            io_threads: 4,
            client_name: None,
            host_name: None,
        }
    }
}

impl ContextConfig {
    /// Read configuration from the standard EPICS environment variables
    pub fn from_env() -> Self {
        let server_port = get_default_server_port();
        let mut search = SearchConfig::default();
        search.max_interval = search.max_interval.min(get_default_max_search_interval());
        ContextConfig {
            address_list: env::var("EPICS_CA_ADDR_LIST")
                .map(|list| parse_address_list(&list, server_port))
                .unwrap_or_default(),
            auto_address_list: env::var("EPICS_CA_AUTO_ADDR_LIST")
                .map(|v| !v.eq_ignore_ascii_case("no"))
                .unwrap_or(true),
            connection_timeout: get_default_connection_timeout(),
            beacon_period: get_default_beacon_period(),
            server_port,
            repeater_port: get_default_beacon_port(),
            max_array_bytes: get_default_max_array_bytes(),
            monitor_engine: get_default_monitor_engine(),
            search,
            ..Default::default()
        }
    }

    /// Final list of destinations for search datagrams
    pub fn search_addresses(&self) -> Vec<SocketAddr> {
        let mut addresses = self.address_list.clone();
        if self.auto_address_list {
            for address in interface_broadcast_addresses(self.server_port) {
                if !addresses.contains(&address) {
                    addresses.push(address);
                }
            }
        }
        if addresses.is_empty() {
            warn!("Empty PV search address list");
        }
        addresses
    }

    /// Capacity of a circuit receive buffer: the largest frame we accept
    pub fn receive_buffer_size(&self) -> usize {
        self.max_array_bytes + CA_EXTENDED_MESSAGE_HEADER_SIZE
    }
}

/// Get the server listen port, either from environment or default 5064
pub fn get_default_server_port() -> u16 {
    env::var("EPICS_CA_SERVER_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(DEFAULT_SERVER_PORT)
        .max(5000u16)
}

/// Get the beacon broadcast port, either from environment or default 5065
pub fn get_default_beacon_port() -> u16 {
    env::var("EPICS_CA_REPEATER_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(DEFAULT_REPEATER_PORT)
        .max(5000u16)
}

pub fn get_default_connection_timeout() -> Duration {
    Duration::from_secs_f32(
        env::var("EPICS_CA_CONN_TMO")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30.0f32)
            .max(0.1f32),
    )
}

pub fn get_default_beacon_period() -> Duration {
    Duration::from_secs_f32(
        env::var("EPICS_CA_BEACON_PERIOD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(15.0f32)
            .max(0.1f32),
    )
}

pub fn get_default_max_search_interval() -> Duration {
    Duration::from_secs_f32(
        env::var("EPICS_CA_MAX_SEARCH_PERIOD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(300.0f32)
            .max(60f32),
    )
}

pub fn get_default_max_array_bytes() -> usize {
    env::var("EPICS_CA_MAX_ARRAY_BYTES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_ARRAY_BYTES)
        .max(DEFAULT_MAX_ARRAY_BYTES)
}

pub fn get_default_monitor_engine() -> MonitorEngine {
    match env::var("EPICARS_MONITOR_NOTIFIER") {
        Ok(specifier) => specifier.parse().unwrap_or_else(|e| {
            warn!("Ignoring EPICARS_MONITOR_NOTIFIER: {e}");
            MonitorEngine::default()
        }),
        Err(_) => MonitorEngine::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_engine_specifiers() {
        assert_eq!(
            "BlockingQueueSingleThread".parse(),
            Ok(MonitorEngine::BlockingQueue {
                threads: 1,
                buffer_size: DEFAULT_QUEUE_SIZE
            })
        );
        assert_eq!(
            "BlockingQueueMultipleWorker,8,100".parse(),
            Ok(MonitorEngine::BlockingQueue {
                threads: 8,
                buffer_size: 100
            })
        );
        assert_eq!("ringbuffer".parse(), Ok(MonitorEngine::RingBuffer));
        assert_eq!(
            "StripedExecutor, 3".parse(),
            Ok(MonitorEngine::Striped { threads: 3 })
        );
    }

    #[test]
    fn reject_bad_engine_specifiers() {
        assert!(matches!(
            "Disruptor".parse::<MonitorEngine>(),
            Err(ConfigError::UnknownEngine(_))
        ));
        assert!(matches!(
            "StripedExecutor,0".parse::<MonitorEngine>(),
            Err(ConfigError::InvalidArgument(_, _))
        ));
        assert!(matches!(
            "RingBuffer,2".parse::<MonitorEngine>(),
            Err(ConfigError::TooManyArguments(_))
        ));
    }

    #[test]
    fn receive_buffer_fits_largest_frame() {
        let config = ContextConfig {
            max_array_bytes: 1000,
            ..Default::default()
        };
        assert_eq!(config.receive_buffer_size(), 1024);
    }
}

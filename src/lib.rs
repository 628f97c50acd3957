//! The I/O and concurrency core of a pure-rust EPICS Channel Access client.
//!
//! This crate holds everything underneath a channel API: it moves [EPICS CA
//! protocol] frames between sockets and the code that understands them, but has
//! no notion of a channel object itself. It does not depend on the C-based
//! [epics-base] project at all.
//!
//! The pieces are:
//!
//! - A [`reactor::Reactor`] multiplexing socket readiness, driven either directly
//!   or by a [`reactor::LeaderFollowersThreadPool`] so that event handlers run on
//!   pool threads but never two at once for the same socket.
//! - Framing ([messages]) and two kinds of transport ([transport]): a TCP circuit
//!   per server and priority, with flow control and liveness checks, and the UDP
//!   transport used for searches and beacons.
//! - A [`search::ChannelSearchManager`] that batches search requests into
//!   datagrams and backs off exponentially on a private [`timer::Timer`].
//! - A [`beacon::BeaconHandler`] per server that spots restarts and network
//!   changes in the beacon timing, which restarts outstanding searches.
//! - [monitor]: three engines delivering subscription updates to consumers, each
//!   with a different buffering and overflow policy.
//!
//! [`context::CoreContext`] wires all of these together from a
//! [`config::ContextConfig`], and reports what servers say through a stream of
//! [`context::ContextEvent`]s.
//!
//! ## Example
//!
//! ```no_run
//! use epicars_client::{config::ContextConfig, context::CoreContext};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let context = CoreContext::new(ContextConfig::from_env())?;
//! let reply = context.search_with_reply(1, "NUMERIC_VALUE")?;
//! let found = reply.blocking_recv()?;
//! println!("NUMERIC_VALUE is served by {}", found.server_address);
//! context.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! [EPICS CA protocol]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html
//! [epics-base]: https://github.com/epics-base/epics-base

pub mod beacon;
pub mod codec;
pub mod config;
pub mod context;
pub mod handler;
pub mod messages;
pub mod monitor;
pub mod reactor;
pub mod search;
pub mod thread_pool;
pub mod timer;
pub mod transport;
mod utils;

pub use crate::context::{ContextEvent, CoreContext};
pub use crate::utils::{interface_broadcast_addresses, parse_address_list};

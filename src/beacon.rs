//! Beacon anomaly detection.
//!
//! Servers announce themselves with periodic beacons. A server that has just
//! started (or restarted) beacons quickly at first and then slows down to its
//! steady period, and a network partition shows up as a long gap. Both are
//! reported as *anomalies*, which make the search manager retry unresolved
//! channels immediately.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tracing::{debug, trace};

/// Minor revision from which beacons carry a sequence number
const SEQUENCE_MINOR_REVISION: u16 = 10;
const LONG_PERIOD_FACTOR: f64 = 3.25;
const WARMUP_PERIOD_FACTOR: f64 = 1.25;
const SHORT_PERIOD_FACTOR: f64 = 0.8;
const AVERAGE_WEIGHT: f64 = 0.125;

#[derive(Debug, Default)]
struct BeaconState {
    average_period: Option<Duration>,
    period_stabilized: bool,
    last_sequence_id: u32,
    last_timestamp: Option<Instant>,
}

/// Tracks the beacon timing of one server
#[derive(Debug)]
pub struct BeaconHandler {
    server: SocketAddr,
    state: Mutex<BeaconState>,
}

/// Should a beacon be ignored, given how far its sequence id advanced
fn is_out_of_sequence(last_sequence_id: u32, sequence_id: u32) -> bool {
    let advance = sequence_id.wrapping_sub(last_sequence_id);
    // Zero is a duplicate, two or three are re-ordered duplicates via another
    // route, and a huge advance is really a step backwards
    advance == 0 || advance == 2 || advance == 3 || advance > u32::MAX - 256
}

impl BeaconHandler {
    pub fn new(server: SocketAddr) -> Self {
        BeaconHandler {
            server,
            state: Mutex::new(BeaconState::default()),
        }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// The current running average, once one exists
    pub fn average_period(&self) -> Option<Duration> {
        self.state.lock().average_period
    }

    /// Record a beacon received at `timestamp`. Returns true for an anomaly.
    pub fn beacon_notify(&self, minor_revision: u16, sequence_id: u32, timestamp: Instant) -> bool {
        let mut state = self.state.lock();

        let Some(last_timestamp) = state.last_timestamp else {
            debug!("First beacon from {}", self.server);
            state.last_sequence_id = sequence_id;
            state.last_timestamp = Some(timestamp);
            return true;
        };

        if minor_revision >= SEQUENCE_MINOR_REVISION {
            let discard = is_out_of_sequence(state.last_sequence_id, sequence_id);
            state.last_sequence_id = sequence_id;
            if discard {
                trace!("Ignoring out-of-sequence beacon {sequence_id} from {}", self.server);
                return false;
            }
        }

        let current_period = timestamp.saturating_duration_since(last_timestamp);
        state.last_timestamp = Some(timestamp);

        let Some(average) = state.average_period else {
            state.average_period = Some(current_period);
            return false;
        };

        let ratio = current_period.as_secs_f64() / average.as_secs_f64().max(f64::EPSILON);
        if ratio >= LONG_PERIOD_FACTOR {
            debug!(
                "Beacon from {} late: {current_period:?} vs average {average:?}",
                self.server
            );
            state.average_period = Some(current_period);
            state.period_stabilized = false;
            true
        } else if ratio >= WARMUP_PERIOD_FACTOR && !state.period_stabilized {
            // Still warming up: servers slow their beacons after starting
            state.average_period = Some(current_period);
            false
        } else if ratio <= SHORT_PERIOD_FACTOR {
            debug!(
                "Beacon from {} early: {current_period:?} vs average {average:?}",
                self.server
            );
            state.average_period = Some(current_period);
            state.period_stabilized = false;
            true
        } else {
            state.period_stabilized = true;
            state.average_period = Some(
                average.mul_f64(1.0 - AVERAGE_WEIGHT) + current_period.mul_f64(AVERAGE_WEIGHT),
            );
            false
        }
    }
}

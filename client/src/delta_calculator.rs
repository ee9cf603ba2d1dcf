//! Clock delta estimation.
//!
//! The server and client clocks are never in agreement. After logon (and
//! periodically thereafter) the client exchanges a short burst of pings with
//! the server, computes a candidate delta from each pong, and adopts the
//! median candidate so that a single congested exchange cannot skew the
//! estimate.

use tether_shared::PongResponse;

/// Number of ping/pong exchanges per estimation round.
pub const CLOCK_SYNC_PINGS: usize = 3;

/// Runs one estimation round. Feed it pongs until [`should_send_ping`]
/// returns `false`, then read off [`time_delta`].
///
/// [`should_send_ping`]: DeltaCalculator::should_send_ping
/// [`time_delta`]: DeltaCalculator::time_delta
pub struct DeltaCalculator {
    deltas: Vec<i64>,
    ping_stamp: Option<i64>,
}

impl DeltaCalculator {
    pub fn new() -> Self {
        Self {
            deltas: Vec::with_capacity(CLOCK_SYNC_PINGS),
            ping_stamp: None,
        }
    }

    /// Whether another ping is owed in this round.
    pub fn should_send_ping(&self) -> bool {
        self.ping_stamp.is_none() && !self.done()
    }

    /// Records that a ping just went out, stamped with the local send time
    /// in millis.
    pub fn sent_ping(&mut self, now_millis: i64) {
        self.ping_stamp = Some(now_millis);
    }

    /// Folds a pong into the running estimate. A pong arriving with no ping
    /// outstanding (a straggler from an abandoned round) is ignored.
    pub fn pong_received(&mut self, pong: &PongResponse) {
        let Some(sent) = self.ping_stamp.take() else {
            return;
        };
        // Round trip time minus the server's processing delay, split evenly
        // between the two directions.
        let rtt = pong.unpack_stamp - sent;
        let nettime = (rtt - pong.process_delay) / 2;
        self.deltas.push(pong.pack_stamp + nettime - pong.unpack_stamp);
    }

    /// Whether the round has gathered all of its samples.
    pub fn done(&self) -> bool {
        self.deltas.len() >= CLOCK_SYNC_PINGS
    }

    /// The median of the gathered candidate deltas, in millis to be added
    /// to local time to approximate server time. Zero if no samples were
    /// gathered.
    pub fn time_delta(&self) -> i64 {
        if self.deltas.is_empty() {
            return 0;
        }
        let mut sorted = self.deltas.clone();
        sorted.sort_unstable();
        sorted[sorted.len() / 2]
    }
}

impl Default for DeltaCalculator {
    fn default() -> Self {
        Self::new()
    }
}

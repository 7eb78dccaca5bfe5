//! Clock offset tracking against the sync server
//!
//! Measures round-trip time to the server using ping/pong messages and
//! estimates how far the local wall clock is from the server's, so remote
//! reference timestamps can be extrapolated against a corrected `now`.

use std::collections::HashSet;

use crate::sync::current_time_ms;

/// Number of samples to keep for averaging
const SAMPLE_COUNT: usize = 5;

/// Pings older than this are forgotten (ms)
const PENDING_PING_TTL_MS: u64 = 10_000;

/// A single measurement derived from one pong
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OffsetSample {
    rtt_ms: u64,
    /// server clock minus local clock
    offset_ms: i64,
}

/// Estimates `server_time - local_time` from recent ping/pong exchanges
#[derive(Debug, Default)]
pub struct ClockOffsetTracker {
    /// Pending pings awaiting pong response, keyed by their send timestamp
    pending_pings: HashSet<u64>,
    samples: Vec<OffsetSample>,
}

impl ClockOffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget pings and samples from a previous connection
    pub fn clear(&mut self) {
        self.pending_pings.clear();
        self.samples.clear();
    }

    /// Create a ping to send. Returns the timestamp to include in the Ping message.
    pub fn create_ping(&mut self) -> u64 {
        self.create_ping_at(current_time_ms())
    }

    fn create_ping_at(&mut self, now_ms: u64) -> u64 {
        self.pending_pings
            .retain(|sent| now_ms.saturating_sub(*sent) < PENDING_PING_TTL_MS);
        self.pending_pings.insert(now_ms);
        now_ms
    }

    /// Handle a pong response. Returns the new averaged offset if the pong
    /// matched a ping we sent.
    pub fn handle_pong(&mut self, ping_sent_at_ms: u64, server_time_ms: u64) -> Option<i64> {
        self.handle_pong_at(ping_sent_at_ms, server_time_ms, current_time_ms())
    }

    fn handle_pong_at(
        &mut self,
        ping_sent_at_ms: u64,
        server_time_ms: u64,
        now_ms: u64,
    ) -> Option<i64> {
        if !self.pending_pings.remove(&ping_sent_at_ms) {
            return None;
        }
        let rtt_ms = now_ms.saturating_sub(ping_sent_at_ms);
        // Assume the server stamped its clock halfway through the round trip
        let local_at_server_stamp = ping_sent_at_ms + rtt_ms / 2;
        let offset_ms = server_time_ms as i64 - local_at_server_stamp as i64;

        if self.samples.len() >= SAMPLE_COUNT {
            self.samples.remove(0);
        }
        self.samples.push(OffsetSample { rtt_ms, offset_ms });

        tracing::debug!(
            "Clock sample: RTT={}ms, offset={:+}ms, avg offset={:+}ms",
            rtt_ms,
            offset_ms,
            self.offset_ms()
        );

        Some(self.offset_ms())
    }

    /// Averaged server-minus-local offset in milliseconds, zero until a pong
    /// has been seen
    pub fn offset_ms(&self) -> i64 {
        if self.samples.is_empty() {
            return 0;
        }
        let sum: i64 = self.samples.iter().map(|s| s.offset_ms).sum();
        sum / self.samples.len() as i64
    }

    /// Averaged round-trip time, if any samples exist
    pub fn rtt_ms(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().map(|s| s.rtt_ms).sum();
        Some(sum / self.samples.len() as u64)
    }
}

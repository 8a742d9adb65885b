//! Traffic and flood counters for a node

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Snapshot of the node counters
#[derive(Debug, Clone)]
pub struct NodeStats {
    /// Datagram bytes received
    pub input_bytes: u64,
    /// Datagram bytes sent
    pub output_bytes: u64,
    /// Envelopes relayed onward
    pub relayed: u64,
    /// Sends dropped because the id was already seen or ttl was exhausted
    pub dropped: u64,
    /// Envelopes discarded on arrival because their id was cancelled
    pub cancelled_dropped: u64,
    /// Scheduled responder tasks interrupted by a cancel notice
    pub responders_aborted: u64,
    /// Local matches that produced a response
    pub responses: u64,
    /// Seconds since the tracker started or was reset
    pub uptime_secs: f64,
}

impl std::fmt::Display for NodeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "in: {} B, out: {} B, relayed: {}, dropped: {}, cancelled: {}, aborted: {}, responses: {} ({:.1}s)",
            self.input_bytes,
            self.output_bytes,
            self.relayed,
            self.dropped,
            self.cancelled_dropped,
            self.responders_aborted,
            self.responses,
            self.uptime_secs
        )
    }
}

/// Thread-safe counters, updated lock-free from the receiver loop and responder tasks
#[derive(Debug)]
pub struct StatsTracker {
    input_bytes: AtomicU64,
    output_bytes: AtomicU64,
    relayed: AtomicU64,
    dropped: AtomicU64,
    cancelled_dropped: AtomicU64,
    responders_aborted: AtomicU64,
    responses: AtomicU64,
    start_time: std::sync::Mutex<Instant>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self {
            input_bytes: AtomicU64::new(0),
            output_bytes: AtomicU64::new(0),
            relayed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            cancelled_dropped: AtomicU64::new(0),
            responders_aborted: AtomicU64::new(0),
            responses: AtomicU64::new(0),
            start_time: std::sync::Mutex::new(Instant::now()),
        }
    }

    pub fn add_input_bytes(&self, bytes: usize) {
        self.input_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn add_output_bytes(&self, bytes: usize) {
        self.output_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_relay(&self) {
        self.relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled_drop(&self) {
        self.cancelled_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_responder_abort(&self) {
        self.responders_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response(&self) {
        self.responses.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current statistics snapshot
    pub fn get_stats(&self) -> NodeStats {
        let started = self
            .start_time
            .lock()
            .map(|t| *t)
            .unwrap_or_else(|poisoned| *poisoned.into_inner());
        NodeStats {
            input_bytes: self.input_bytes.load(Ordering::Relaxed),
            output_bytes: self.output_bytes.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            cancelled_dropped: self.cancelled_dropped.load(Ordering::Relaxed),
            responders_aborted: self.responders_aborted.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            uptime_secs: started.elapsed().as_secs_f64(),
        }
    }

    /// Reset all counters to zero and restart the uptime clock
    pub fn reset(&self) {
        for counter in [
            &self.input_bytes,
            &self.output_bytes,
            &self.relayed,
            &self.dropped,
            &self.cancelled_dropped,
            &self.responders_aborted,
            &self.responses,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        if let Ok(mut started) = self.start_time.lock() {
            *started = Instant::now();
        }
    }
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_operations() {
        let tracker = StatsTracker::new();

        tracker.add_input_bytes(1024);
        tracker.add_output_bytes(2048);
        tracker.record_relay();
        tracker.record_relay();
        tracker.record_response();

        let stats = tracker.get_stats();
        assert_eq!(stats.input_bytes, 1024);
        assert_eq!(stats.output_bytes, 2048);
        assert_eq!(stats.relayed, 2);
        assert_eq!(stats.responses, 1);

        tracker.reset();
        let stats = tracker.get_stats();
        assert_eq!(stats.input_bytes, 0);
        assert_eq!(stats.relayed, 0);
    }

    #[test]
    fn test_stats_display() {
        let tracker = StatsTracker::new();
        tracker.record_drop();
        let display = format!("{}", tracker.get_stats());
        assert!(display.contains("dropped: 1"));
    }
}

//! Client-side metrics.
//!
//! Lock-free counters recorded on the hot paths and read through
//! [`ClientMetrics::snapshot`]. Every client instance owns its own recorder.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one client instance
#[derive(Debug, Default)]
pub struct ClientMetrics {
    envelopes_sent: AtomicU64,
    send_errors: AtomicU64,
    envelopes_delivered: AtomicU64,
    envelopes_dropped: AtomicU64,
    decode_errors: AtomicU64,
    consumer_errors: AtomicU64,
    offsets_marked: AtomicU64,
    loops_started: AtomicU64,
    loops_stopped: AtomicU64,
    subscriptions_created: AtomicU64,
    subscriptions_removed: AtomicU64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an envelope accepted by the producer
    pub fn record_envelope_sent(&self) {
        self.envelopes_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed send
    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one envelope delivered to one subscriber channel
    pub fn record_envelope_delivered(&self) {
        self.envelopes_delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an envelope dropped because a subscriber buffer was full
    pub fn record_envelope_dropped(&self) {
        self.envelopes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a record that failed to decode as an envelope
    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error reported on a consumer's error stream
    pub fn record_consumer_error(&self) {
        self.consumer_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a group offset marked consumed
    pub fn record_offset_marked(&self) {
        self.offsets_marked.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a consumption loop entering its select loop
    pub fn record_loop_started(&self) {
        self.loops_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a consumption loop terminating
    pub fn record_loop_stopped(&self) {
        self.loops_stopped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a subscriber channel created
    pub fn record_subscription_created(&self) {
        self.subscriptions_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a subscriber channel removed
    pub fn record_subscription_removed(&self) {
        self.subscriptions_removed.fetch_add(1, Ordering::Relaxed);
    }

    /// Consumption loops currently running
    pub fn active_loops(&self) -> u64 {
        let started = self.loops_started.load(Ordering::Relaxed);
        let stopped = self.loops_stopped.load(Ordering::Relaxed);
        started.saturating_sub(stopped)
    }

    /// Read every counter at once
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            envelopes_sent: self.envelopes_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            envelopes_delivered: self.envelopes_delivered.load(Ordering::Relaxed),
            envelopes_dropped: self.envelopes_dropped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            consumer_errors: self.consumer_errors.load(Ordering::Relaxed),
            offsets_marked: self.offsets_marked.load(Ordering::Relaxed),
            loops_started: self.loops_started.load(Ordering::Relaxed),
            loops_stopped: self.loops_stopped.load(Ordering::Relaxed),
            subscriptions_created: self.subscriptions_created.load(Ordering::Relaxed),
            subscriptions_removed: self.subscriptions_removed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`ClientMetrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub envelopes_sent: u64,
    pub send_errors: u64,
    pub envelopes_delivered: u64,
    pub envelopes_dropped: u64,
    pub decode_errors: u64,
    pub consumer_errors: u64,
    pub offsets_marked: u64,
    pub loops_started: u64,
    pub loops_stopped: u64,
    pub subscriptions_created: u64,
    pub subscriptions_removed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let metrics = ClientMetrics::new();
        metrics.record_envelope_sent();
        metrics.record_envelope_sent();
        metrics.record_envelope_delivered();
        metrics.record_envelope_dropped();
        metrics.record_decode_error();
        metrics.record_subscription_created();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.envelopes_sent, 2);
        assert_eq!(snapshot.envelopes_delivered, 1);
        assert_eq!(snapshot.envelopes_dropped, 1);
        assert_eq!(snapshot.decode_errors, 1);
        assert_eq!(snapshot.subscriptions_created, 1);
        assert_eq!(snapshot.send_errors, 0);
    }

    #[test]
    fn test_active_loops() {
        let metrics = ClientMetrics::new();
        assert_eq!(metrics.active_loops(), 0);
        metrics.record_loop_started();
        metrics.record_loop_started();
        assert_eq!(metrics.active_loops(), 2);
        metrics.record_loop_stopped();
        assert_eq!(metrics.active_loops(), 1);
        metrics.record_loop_stopped();
        assert_eq!(metrics.active_loops(), 0);
    }
}

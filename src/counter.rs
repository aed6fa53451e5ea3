//! Structured counters for diagnostics, updated by peer sessions and read by
//! the session as a whole.

use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals kept for the lifetime of a session.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    pieces_received: AtomicU64,
}

impl Counters {
    pub fn record_packet(&self, bytes: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_piece(&self) {
        self.pieces_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn pieces_received(&self) -> u64 {
        self.pieces_received.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_across_calls() {
        let counters = Counters::default();
        counters.record_packet(10);
        counters.record_packet(5);
        counters.record_piece();
        assert_eq!(counters.packets_received(), 2);
        assert_eq!(counters.bytes_received(), 15);
        assert_eq!(counters.pieces_received(), 1);
    }
}

//! Running totals of bytes moved by the transports a session manages.

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counter shared by every transport the session owns,
/// experiments included.
#[derive(Debug, Default)]
pub struct ByteCounter {
    sent: AtomicU64,
    received: AtomicU64,
}

impl ByteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_sent(&self, n: u64) {
        self.sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn count_received(&self, n: u64) {
        self.received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn kibi_bytes_sent(&self) -> f64 {
        self.bytes_sent() as f64 / 1024.0
    }

    pub fn kibi_bytes_received(&self) -> f64 {
        self.bytes_received() as f64 / 1024.0
    }
}

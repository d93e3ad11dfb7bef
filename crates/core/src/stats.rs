//! Server-wide delivery counters.
//!
//! Sessions report into a [`DeliveryCounters`] handed to them at
//! construction. The host owns the implementation; [`AtomicCounters`] is the
//! lock-free default.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Sink for server-wide delivery statistics.
pub trait DeliveryCounters: Send + Sync {
    fn add_rtp_bytes(&self, bytes: u64);

    fn add_rtp_packets(&self, packets: u64);

    /// Lateness of a sent packet (ms, negative when early).
    fn add_packet_lateness(&self, delay_ms: i64);

    /// Quality level a packet was sent at.
    fn add_packet_quality(&self, level: u64);

    fn add_packets_lost(&self, packets: u64);

    fn alter_playing_sessions(&self, delta: i64);

    /// Sessions currently running below full quality.
    fn alter_thinned_sessions(&self, delta: i64);

    fn alter_session_count(&self, delta: i64);
}

/// Point-in-time copy of [`AtomicCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub rtp_bytes: u64,
    pub rtp_packets: u64,
    pub total_lateness_ms: i64,
    pub total_quality: u64,
    pub packets_lost: u64,
    pub playing_sessions: i64,
    pub thinned_sessions: i64,
    pub sessions: i64,
}

impl CountersSnapshot {
    /// Mean lateness per sent packet.
    pub fn avg_lateness_ms(&self) -> i64 {
        if self.rtp_packets == 0 {
            0
        } else {
            self.total_lateness_ms / self.rtp_packets as i64
        }
    }

    pub fn avg_quality(&self) -> f64 {
        if self.rtp_packets == 0 {
            0.0
        } else {
            self.total_quality as f64 / self.rtp_packets as f64
        }
    }
}

#[derive(Debug, Default)]
pub struct AtomicCounters {
    rtp_bytes: AtomicU64,
    rtp_packets: AtomicU64,
    total_lateness_ms: AtomicI64,
    total_quality: AtomicU64,
    packets_lost: AtomicU64,
    playing_sessions: AtomicI64,
    thinned_sessions: AtomicI64,
    sessions: AtomicI64,
}

impl AtomicCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            rtp_bytes: self.rtp_bytes.load(Ordering::Relaxed),
            rtp_packets: self.rtp_packets.load(Ordering::Relaxed),
            total_lateness_ms: self.total_lateness_ms.load(Ordering::Relaxed),
            total_quality: self.total_quality.load(Ordering::Relaxed),
            packets_lost: self.packets_lost.load(Ordering::Relaxed),
            playing_sessions: self.playing_sessions.load(Ordering::Relaxed),
            thinned_sessions: self.thinned_sessions.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
        }
    }
}

impl DeliveryCounters for AtomicCounters {
    fn add_rtp_bytes(&self, bytes: u64) {
        self.rtp_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn add_rtp_packets(&self, packets: u64) {
        self.rtp_packets.fetch_add(packets, Ordering::Relaxed);
    }

    fn add_packet_lateness(&self, delay_ms: i64) {
        self.total_lateness_ms.fetch_add(delay_ms, Ordering::Relaxed);
    }

    fn add_packet_quality(&self, level: u64) {
        self.total_quality.fetch_add(level, Ordering::Relaxed);
    }

    fn add_packets_lost(&self, packets: u64) {
        self.packets_lost.fetch_add(packets, Ordering::Relaxed);
    }

    fn alter_playing_sessions(&self, delta: i64) {
        self.playing_sessions.fetch_add(delta, Ordering::Relaxed);
    }

    fn alter_thinned_sessions(&self, delta: i64) {
        self.thinned_sessions.fetch_add(delta, Ordering::Relaxed);
    }

    fn alter_session_count(&self, delta: i64) {
        self.sessions.fetch_add(delta, Ordering::Relaxed);
    }
}

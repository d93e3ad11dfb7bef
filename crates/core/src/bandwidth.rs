//! Round-trip estimation and congestion window for reliable UDP.
//!
//! The RTT estimator follows Karn/Jacobson (RFC 6298) with the classic BSD
//! fixed-point scaling: the smoothed average is kept ×8 and the mean
//! deviation ×4, so all updates are integer shifts of the error term.
//!
//! The congestion window is TCP-shaped (RFC 5681): exponential growth below
//! the slow-start threshold, roughly one segment per window of acked bytes
//! above it, multiplicative backoff on retransmit. It is capped by the
//! client-advertised window, which the session sets once at play time.

/// Maximum segment size assumed for window arithmetic (bytes).
pub const MAX_SEGMENT_SIZE: i32 = 1466;

/// Retransmit timeout bounds (ms).
pub const MIN_RETRANSMIT_TIMEOUT_MS: i32 = 600;
pub const MAX_RETRANSMIT_TIMEOUT_MS: i32 = 24_000;

/// Recommended client ACK timeout bounds (ms).
pub const MIN_ACK_TIMEOUT_MS: u32 = 20;
pub const MAX_ACK_TIMEOUT_MS: u32 = 100;

/// Running min/max/total over periodic samples of cwnd and RTO.
#[derive(Debug, Clone, Default)]
pub struct WindowStats {
    pub num_samples: u32,
    pub min_congestion_window: i32,
    pub max_congestion_window: i32,
    pub total_congestion_window: i64,
    pub min_rto: i32,
    pub max_rto: i32,
    pub total_rto: i64,
}

impl WindowStats {
    pub fn avg_congestion_window(&self) -> i32 {
        if self.num_samples == 0 {
            return 0;
        }
        (self.total_congestion_window / self.num_samples as i64) as i32
    }

    pub fn avg_rto(&self) -> i32 {
        if self.num_samples == 0 {
            return 0;
        }
        (self.total_rto / self.num_samples as i64) as i32
    }
}

/// Per-session RTT/RTO estimator and congestion window.
#[derive(Debug, Clone)]
pub struct BandwidthTracker {
    bytes_in_flight: i32,
    congestion_window: i32,
    slow_start_threshold: i32,
    client_window: i32,
    use_slow_start: bool,
    is_retransmitting: bool,

    /// Smoothed RTT, scaled ×8.
    running_average: i32,
    /// Mean deviation, scaled ×4.
    running_mean_deviation: i32,
    cur_retransmit_timeout: i32,
    unadjusted_rto: i32,

    ack_timeout: u32,
    stats: WindowStats,
}

impl BandwidthTracker {
    pub fn new(use_slow_start: bool) -> Self {
        Self {
            bytes_in_flight: 0,
            congestion_window: MAX_SEGMENT_SIZE,
            slow_start_threshold: 0,
            client_window: 0,
            use_slow_start,
            is_retransmitting: false,
            running_average: 0,
            running_mean_deviation: 0,
            cur_retransmit_timeout: MIN_RETRANSMIT_TIMEOUT_MS,
            unadjusted_rto: MIN_RETRANSMIT_TIMEOUT_MS,
            ack_timeout: MIN_ACK_TIMEOUT_MS,
            stats: WindowStats::default(),
        }
    }

    /// Set the client-advertised receive window.
    ///
    /// Only the first positive value takes effect; later calls are ignored so
    /// a re-Play does not restart slow start.
    pub fn set_window_size(&mut self, client_window: i32) {
        if self.client_window > 0 || client_window <= 0 {
            return;
        }
        self.client_window = client_window;
        if self.use_slow_start {
            self.slow_start_threshold = client_window * 3 / 4;
            self.congestion_window = MAX_SEGMENT_SIZE;
        } else {
            self.slow_start_threshold = client_window;
            self.congestion_window = client_window;
        }
        self.slow_start_threshold = self.slow_start_threshold.max(MAX_SEGMENT_SIZE);

        tracing::debug!(
            client_window,
            cwnd = self.congestion_window,
            ssthresh = self.slow_start_threshold,
            slow_start = self.use_slow_start,
            "client window established"
        );
    }

    /// Account for `bytes` newly handed to the transport.
    pub fn fill_window(&mut self, bytes: u32) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_add(bytes as i32);
        self.is_retransmitting = false;
    }

    /// Account for `bytes` acknowledged by the client and grow the window.
    ///
    /// With `update_in_flight` false only the window grows; the caller has
    /// already removed the bytes from flight.
    pub fn empty_window(&mut self, bytes: u32, update_in_flight: bool) {
        if self.bytes_in_flight == 0 || bytes == 0 {
            return;
        }
        let acked = (bytes as i32).min(self.bytes_in_flight);
        if update_in_flight {
            self.bytes_in_flight -= acked;
        }

        if self.congestion_window >= self.slow_start_threshold {
            // congestion avoidance: mss^2 / cwnd per segment acked
            let growth = (MAX_SEGMENT_SIZE as i64 * acked as i64) / self.congestion_window as i64;
            self.congestion_window += (growth as i32).max(1);
        } else {
            self.congestion_window += acked;
        }

        if self.client_window > 0 && self.congestion_window > self.client_window {
            self.congestion_window = self.client_window;
        }
    }

    /// Multiplicative backoff on a detected loss.
    ///
    /// The threshold is lowered only on entry to a retransmit episode, so a
    /// burst of retransmits caused by one mis-estimated RTO backs off once.
    pub fn adjust_window_for_retransmit(&mut self) {
        if !self.is_retransmitting {
            self.slow_start_threshold = (self.congestion_window / 2).max(MAX_SEGMENT_SIZE);
            self.congestion_window = self.slow_start_threshold;
        }
        self.congestion_window = self.congestion_window.max(MAX_SEGMENT_SIZE);
        self.is_retransmitting = true;

        tracing::trace!(
            cwnd = self.congestion_window,
            ssthresh = self.slow_start_threshold,
            "window reduced for retransmit"
        );
    }

    /// Fold an RTT sample into the smoothed estimate.
    ///
    /// Samples arriving during a retransmit episode are ambiguous and are
    /// ignored (Karn).
    pub fn add_rtt_sample(&mut self, rtt_ms: i32) {
        if self.is_retransmitting {
            return;
        }
        if self.running_average == 0 {
            self.running_average = rtt_ms * 8;
        }
        let mut delta = rtt_ms - self.running_average / 8;
        self.running_average += delta;
        delta = delta.abs();
        self.running_mean_deviation += delta - self.running_mean_deviation / 4;

        self.cur_retransmit_timeout = self.running_average / 8 + self.running_mean_deviation;
        self.unadjusted_rto = self.cur_retransmit_timeout;
        self.cur_retransmit_timeout = self
            .cur_retransmit_timeout
            .clamp(MIN_RETRANSMIT_TIMEOUT_MS, MAX_RETRANSMIT_TIMEOUT_MS);
    }

    /// Derive the ACK cadence to recommend to the client from recent throughput.
    pub fn update_ack_timeout(&mut self, bits_sent_in_interval: u64, interval_ms: i64) {
        let unadjusted = if bits_sent_in_interval > 0 {
            (interval_ms.max(0) as u64 * self.congestion_window as u64) / bits_sent_in_interval
        } else {
            0
        };
        // ask for an ack at half the time it takes to fill the window
        let timeout = (unadjusted / 2).min(u32::MAX as u64) as u32;
        self.ack_timeout = timeout.clamp(MIN_ACK_TIMEOUT_MS, MAX_ACK_TIMEOUT_MS);
    }

    /// Sample cwnd and RTO into the running statistics.
    pub fn update_stats(&mut self) {
        let s = &mut self.stats;
        if s.num_samples == 0 {
            s.min_congestion_window = self.congestion_window;
            s.max_congestion_window = self.congestion_window;
            s.min_rto = self.unadjusted_rto;
            s.max_rto = self.unadjusted_rto;
        } else {
            s.min_congestion_window = s.min_congestion_window.min(self.congestion_window);
            s.max_congestion_window = s.max_congestion_window.max(self.congestion_window);
            s.min_rto = s.min_rto.min(self.unadjusted_rto);
            s.max_rto = s.max_rto.max(self.unadjusted_rto);
        }
        s.num_samples += 1;
        s.total_congestion_window += self.congestion_window as i64;
        s.total_rto += self.unadjusted_rto as i64;
    }

    /// Whether a window has been established so ACKs mean something.
    pub fn ready_for_ack_processing(&self) -> bool {
        self.client_window > 0 && self.congestion_window > 0
    }

    pub fn is_flow_controlled(&self) -> bool {
        self.bytes_in_flight >= self.congestion_window
    }

    pub fn recommended_client_ack_timeout(&self) -> u32 {
        self.ack_timeout
    }

    /// Smoothed RTT in ms.
    pub fn running_average_ms(&self) -> i32 {
        self.running_average / 8
    }

    /// Mean RTT deviation in ms.
    pub fn running_mean_deviation_ms(&self) -> i32 {
        self.running_mean_deviation / 4
    }

    pub fn cur_retransmit_timeout(&self) -> i32 {
        self.cur_retransmit_timeout
    }

    /// RTO before clamping, as last computed.
    pub fn unadjusted_rto(&self) -> i32 {
        self.unadjusted_rto
    }

    pub fn congestion_window(&self) -> i32 {
        self.congestion_window
    }

    pub fn slow_start_threshold(&self) -> i32 {
        self.slow_start_threshold
    }

    pub fn client_window(&self) -> i32 {
        self.client_window
    }

    pub fn bytes_in_flight(&self) -> i32 {
        self.bytes_in_flight
    }

    pub fn is_retransmitting(&self) -> bool {
        self.is_retransmitting
    }

    /// Bandwidth one congestion window per RTT would sustain.
    pub fn current_bandwidth_bps(&self) -> i64 {
        if self.unadjusted_rto <= 0 {
            return 0;
        }
        self.congestion_window as i64 * 1000 / self.unadjusted_rto as i64
    }

    pub fn stats(&self) -> &WindowStats {
        &self.stats
    }
}

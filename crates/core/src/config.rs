//! Delivery preferences.
//!
//! A single typed struct carries every tunable the pipeline reads. It is
//! deserializable with `#[serde(default)]`, so a partial TOML file only has
//! to name the keys it overrides:
//!
//! ```toml
//! overbuffer_rate = 1.5
//! send_interval_ms = 20
//! disable_thinning = true
//! ```

use serde::Deserialize;

/// Late tolerance assumed for streams whose client did not declare one.
pub const DEFAULT_LATE_TOLERANCE_SECS: f32 = 1.5;

/// Pacing interval used when overbuffering is configured off (`send_interval_ms = 0`).
pub const FALLBACK_SEND_INTERVAL_MS: i64 = 200;

/// Server-wide delivery preferences, injected into every session.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeliveryPrefs {
    /// Start the congestion window at one segment rather than the full client window.
    pub slow_start_enabled: bool,
    /// Honor client requests for reliable UDP; when off they get plain UDP.
    pub reliable_udp_enabled: bool,
    /// Pin every stream at quality level 0.
    pub disable_thinning: bool,

    /// Maximum rate multiplier at which the send-ahead lead may grow (>= 1.0).
    pub overbuffer_rate: f32,
    /// Farthest a packet may be sent ahead of its ideal transmit time.
    pub max_send_ahead_secs: u32,
    /// Lookahead within which a packet is sent immediately when overbuffering.
    pub send_ahead_duration_ms: u32,
    /// Pacing granularity. Zero disables overbuffering entirely.
    pub send_interval_ms: u32,

    /// Client window for low-bitrate movies.
    pub small_window_size_kb: u32,
    /// Client window for medium-bitrate movies.
    pub medium_window_size_kb: u32,
    /// Client window for high-bitrate or unknown-bitrate movies.
    pub large_window_size_kb: u32,
    /// Movies above this bitrate get at least the medium window.
    pub window_size_threshold_kbits: u32,
    /// Movies above this bitrate get the large window.
    pub window_size_max_threshold_kbits: u32,

    /// Lower bound for the transport send buffer.
    pub min_tcp_buffer_size_bytes: u32,
    /// Upper bound for the transport send buffer.
    pub max_tcp_buffer_size_bytes: u32,
    /// Seconds of media the transport send buffer should hold.
    pub tcp_seconds_to_buffer: f32,

    /// Audio/other packets later than this are dropped.
    pub drop_all_packets_delay_ms: i32,
    /// Video packets later than this are dropped.
    pub drop_all_video_packets_delay_ms: i32,
    /// Beyond this lateness quality jumps to the thinnest level.
    pub thin_all_the_way_delay_ms: i32,
    /// Beyond this lateness quality drops one level per check interval.
    pub always_thin_delay_ms: i32,
    /// Beyond this lateness a worsening trend drops one level.
    pub start_thinning_delay_ms: i32,
    /// Below this lateness an improving trend raises one level.
    pub start_thicking_delay_ms: i32,
    /// Below this lateness quality snaps back to full.
    pub thick_all_the_way_delay_ms: i32,
    /// Minimum wall-clock or media time between two level adjustments.
    pub quality_check_interval_ms: u32,

    /// Longest the scheduler may sleep while retransmits could be pending.
    pub max_retransmit_delay_ms: u32,
    /// Idle time without RTCP or TCP traffic before a session times out.
    pub rtp_timeout_secs: u32,
    /// Minimum spacing between RTCP sender reports on a stream.
    pub sender_report_interval_secs: u32,
    /// Emit sender reports while playing and SR+BYE at teardown.
    pub send_rtcp_reports: bool,

    /// First server port handed out for RTP/RTCP pairs.
    pub server_port_min: u16,
    /// Last server port handed out for RTP/RTCP pairs.
    pub server_port_max: u16,
}

impl Default for DeliveryPrefs {
    fn default() -> Self {
        Self {
            slow_start_enabled: true,
            reliable_udp_enabled: true,
            disable_thinning: false,
            overbuffer_rate: 2.0,
            max_send_ahead_secs: 25,
            send_ahead_duration_ms: 1000,
            send_interval_ms: 50,
            small_window_size_kb: 24,
            medium_window_size_kb: 48,
            large_window_size_kb: 64,
            window_size_threshold_kbits: 200,
            window_size_max_threshold_kbits: 1000,
            min_tcp_buffer_size_bytes: 8192,
            max_tcp_buffer_size_bytes: 200_000,
            tcp_seconds_to_buffer: 0.5,
            drop_all_packets_delay_ms: 2500,
            drop_all_video_packets_delay_ms: 1750,
            thin_all_the_way_delay_ms: 1500,
            always_thin_delay_ms: 750,
            start_thinning_delay_ms: 0,
            start_thicking_delay_ms: 250,
            thick_all_the_way_delay_ms: -2000,
            quality_check_interval_ms: 1000,
            max_retransmit_delay_ms: 500,
            rtp_timeout_secs: 120,
            sender_report_interval_secs: 7,
            send_rtcp_reports: true,
            server_port_min: 5000,
            server_port_max: 65534,
        }
    }
}

impl DeliveryPrefs {
    /// Clamp out-of-range values into something the pipeline can run with.
    pub fn validate(mut self) -> Self {
        if self.overbuffer_rate.is_nan() || self.overbuffer_rate < 1.0 {
            tracing::warn!(rate = self.overbuffer_rate, "overbuffer rate below 1.0, clamping");
            self.overbuffer_rate = 1.0;
        }
        if self.min_tcp_buffer_size_bytes > self.max_tcp_buffer_size_bytes {
            std::mem::swap(
                &mut self.min_tcp_buffer_size_bytes,
                &mut self.max_tcp_buffer_size_bytes,
            );
        }
        if self.server_port_min > self.server_port_max {
            std::mem::swap(&mut self.server_port_min, &mut self.server_port_max);
        }
        if self.tcp_seconds_to_buffer < 0.0 {
            self.tcp_seconds_to_buffer = 0.0;
        }
        self
    }

    /// Effective pacing interval and whether overbuffering is allowed at all.
    pub fn send_interval(&self) -> (i64, bool) {
        if self.send_interval_ms == 0 {
            (FALLBACK_SEND_INTERVAL_MS, false)
        } else {
            (self.send_interval_ms as i64, true)
        }
    }

    pub fn max_send_ahead_ms(&self) -> i64 {
        self.max_send_ahead_secs as i64 * 1000
    }

    pub fn rtp_timeout_ms(&self) -> i64 {
        self.rtp_timeout_secs as i64 * 1000
    }

    pub fn sender_report_interval_ms(&self) -> i64 {
        self.sender_report_interval_secs as i64 * 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let prefs = DeliveryPrefs::default();
        assert_eq!(prefs.overbuffer_rate, 2.0);
        assert_eq!(prefs.max_send_ahead_ms(), 25_000);
        assert_eq!(prefs.quality_check_interval_ms, 1000);
        assert_eq!(prefs.send_interval(), (50, true));
    }

    #[test]
    fn zero_send_interval_disables_overbuffering() {
        let prefs = DeliveryPrefs {
            send_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(prefs.send_interval(), (FALLBACK_SEND_INTERVAL_MS, false));
    }

    #[test]
    fn partial_toml_overrides() {
        let prefs: DeliveryPrefs = toml::from_str(
            r#"
            overbuffer_rate = 1.5
            disable_thinning = true
            "#,
        )
        .unwrap();
        assert_eq!(prefs.overbuffer_rate, 1.5);
        assert!(prefs.disable_thinning);
        assert_eq!(prefs.max_retransmit_delay_ms, 500);
    }

    #[test]
    fn validate_clamps_rate() {
        let prefs = DeliveryPrefs {
            overbuffer_rate: 0.5,
            ..Default::default()
        }
        .validate();
        assert_eq!(prefs.overbuffer_rate, 1.0);
    }

    #[test]
    fn validate_orders_bounds() {
        let prefs = DeliveryPrefs {
            min_tcp_buffer_size_bytes: 10,
            max_tcp_buffer_size_bytes: 5,
            ..Default::default()
        }
        .validate();
        assert_eq!(prefs.min_tcp_buffer_size_bytes, 5);
        assert_eq!(prefs.max_tcp_buffer_size_bytes, 10);
    }
}

//! Send-ahead pacing ("overbuffering").
//!
//! Packets carry an ideal transmit time. Sending them early lets the client
//! build up a playout buffer, but sending too early overflows it. The window
//! decides per packet whether to send now or defer, bounded by:
//!
//! - the client-reported buffer capacity (`window_size`),
//! - a hard cap on how far ahead of real time we may get (`max_send_ahead`),
//! - a growth limit: per pacing bucket, the lead over real time may only grow
//!   by `(overbuffer_rate - 1)` times the elapsed time.
//!
//! ```text
//!   now      now+interval    now+interval+send_ahead          now+max_send_ahead
//!    |-----------|-----------------|--------------------------------|
//!    |  send now (always)          |  paced by growth limit         |  deferred
//!                 send now if overbuffering enabled
//! ```

use crate::config::{DeliveryPrefs, FALLBACK_SEND_INTERVAL_MS};

/// Outcome of [`OverbufferWindow::check_transmit_time`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitDecision {
    /// Hand the packet to the transport now.
    SendNow,
    /// Hold the packet; retry at this absolute time (ms).
    Defer(i64),
}

/// Per-session send-ahead pacing controller.
#[derive(Debug, Clone)]
pub struct OverbufferWindow {
    /// Client buffer capacity in bytes; `None` is unlimited.
    window_size: Option<i64>,
    bytes_sent_since_last_report: i64,
    send_interval: i64,
    send_ahead_duration: i64,
    max_send_ahead: i64,
    overbuffer_rate: f64,
    enabled: bool,
    write_burst_beginning: bool,

    bucket_begin: i64,
    previous_bucket_begin: i64,
    bucket_time_ahead: i64,
    previous_bucket_time_ahead: i64,
    bytes_during_bucket: i64,

    last_second_start: i64,
    previous_second_start: i64,
    bytes_during_last_second: i64,
    bytes_during_previous_second: i64,
}

impl OverbufferWindow {
    /// Create a window. A zero `send_interval_ms` disables overbuffering and
    /// paces on a 200 ms grid instead.
    pub fn new(
        send_interval_ms: u32,
        send_ahead_duration_ms: u32,
        max_send_ahead_secs: u32,
        overbuffer_rate: f32,
    ) -> Self {
        let (send_interval, enabled) = match send_interval_ms {
            0 => (FALLBACK_SEND_INTERVAL_MS, false),
            ms => (ms as i64, true),
        };
        let mut window = Self {
            window_size: None,
            bytes_sent_since_last_report: 0,
            send_interval,
            send_ahead_duration: send_ahead_duration_ms as i64,
            max_send_ahead: max_send_ahead_secs as i64 * 1000,
            overbuffer_rate: (overbuffer_rate as f64).max(1.0),
            enabled,
            write_burst_beginning: false,
            bucket_begin: 0,
            previous_bucket_begin: 0,
            bucket_time_ahead: 0,
            previous_bucket_time_ahead: 0,
            bytes_during_bucket: 0,
            last_second_start: -1,
            previous_second_start: -1,
            bytes_during_last_second: 0,
            bytes_during_previous_second: 0,
        };
        window.reset_overbuffer_window();
        window
    }

    pub fn from_prefs(prefs: &DeliveryPrefs) -> Self {
        Self::new(
            prefs.send_interval_ms,
            prefs.send_ahead_duration_ms,
            prefs.max_send_ahead_secs,
            prefs.overbuffer_rate,
        )
    }

    /// Decide whether a packet with ideal time `transmit_time` goes out now.
    ///
    /// A deferral never lies more than the max send-ahead beyond `now`.
    pub fn check_transmit_time(
        &mut self,
        transmit_time: i64,
        now: i64,
        packet_size: usize,
    ) -> TransmitDecision {
        self.roll_buckets(now);

        if transmit_time <= now + self.send_interval
            || (self.enabled && transmit_time <= now + self.send_interval + self.send_ahead_duration)
        {
            return TransmitDecision::SendNow;
        }

        if !self.enabled || self.window_size == Some(0) {
            return self.defer(transmit_time, now);
        }

        // client buffer running low; wait for its next report
        if let Some(window) = self.window_size {
            if packet_size as i64 * 5 > window - self.bytes_sent_since_last_report {
                return self.defer(now + self.send_interval * 5, now);
            }
        }

        if transmit_time - now > self.max_send_ahead {
            return self.defer(transmit_time - self.max_send_ahead + self.send_interval, now);
        }

        self.bucket_time_ahead = transmit_time - now;
        if self.bucket_time_ahead < self.previous_bucket_time_ahead {
            return TransmitDecision::SendNow;
        }

        let allowed_growth =
            ((now - self.previous_bucket_begin) as f64 * (self.overbuffer_rate - 1.0)) as i64;
        if self.bucket_time_ahead - self.previous_bucket_time_ahead > allowed_growth {
            self.bucket_time_ahead = self.previous_bucket_time_ahead + allowed_growth;
            return self.defer(now + self.send_interval, now);
        }

        TransmitDecision::SendNow
    }

    fn roll_buckets(&mut self, now: i64) {
        if now - self.bucket_begin <= self.send_interval {
            return;
        }
        self.previous_bucket_begin = self.bucket_begin;
        self.bucket_begin = now;
        if self.previous_bucket_begin == 0 {
            self.previous_bucket_begin = now - 1;
        }
        self.bytes_during_bucket = 0;
        if now - self.last_second_start > 1000 {
            self.bytes_during_previous_second = self.bytes_during_last_second;
            self.bytes_during_last_second = 0;
            self.previous_second_start = self.last_second_start;
            self.last_second_start = now;
        }
        self.previous_bucket_time_ahead = self.bucket_time_ahead;
    }

    fn defer(&self, wakeup: i64, now: i64) -> TransmitDecision {
        let wakeup = wakeup.min(now + self.max_send_ahead);
        if wakeup <= now {
            TransmitDecision::SendNow
        } else {
            TransmitDecision::Defer(wakeup)
        }
    }

    /// Account for a packet handed to the transport.
    pub fn add_packet_to_window(&mut self, size: usize) {
        let size = size as i64;
        self.bytes_during_bucket += size;
        self.bytes_during_last_second += size;
        self.bytes_sent_since_last_report += size;
    }

    /// Clear all pacing drift. Called on every Play.
    pub fn reset_overbuffer_window(&mut self) {
        self.bytes_during_last_second = 0;
        self.last_second_start = -1;
        self.bytes_during_previous_second = 0;
        self.previous_second_start = -1;
        self.bytes_during_bucket = 0;
        self.bucket_begin = 0;
        self.previous_bucket_begin = 0;
        self.bucket_time_ahead = 0;
        self.previous_bucket_time_ahead = 0;
        self.bytes_sent_since_last_report = 0;
        self.write_burst_beginning = false;
    }

    /// Set the client buffer capacity; `None` is unlimited.
    pub fn set_window_size(&mut self, bytes: Option<i64>) {
        self.window_size = bytes;
        self.bytes_sent_since_last_report = 0;
    }

    /// Forget what was sent since the last client report.
    pub fn empty_out_window(&mut self) {
        self.bytes_sent_since_last_report = 0;
    }

    pub fn mark_beginning_of_write_burst(&mut self) {
        self.write_burst_beginning = true;
    }

    pub fn turn_off_overbuffering(&mut self) {
        if self.enabled {
            tracing::debug!("overbuffering disabled for session");
        }
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn send_interval(&self) -> i64 {
        self.send_interval
    }

    pub fn max_send_ahead(&self) -> i64 {
        self.max_send_ahead
    }

    pub fn window_size(&self) -> Option<i64> {
        self.window_size
    }

    pub fn write_burst_beginning(&self) -> bool {
        self.write_burst_beginning
    }

    /// Remaining client buffer capacity; `None` when unlimited.
    pub fn available_space_in_window(&self) -> Option<i64> {
        self.window_size
            .map(|w| w - self.bytes_sent_since_last_report)
    }

    /// Bytes sent during the last complete one-second window.
    pub fn bytes_during_previous_second(&self) -> i64 {
        self.bytes_during_previous_second
    }

    pub fn bytes_during_bucket(&self) -> i64 {
        self.bytes_during_bucket
    }

    /// Send rate over the last complete one-second window, once two windows
    /// have been observed.
    pub fn previous_second_rate_bps(&self) -> Option<i64> {
        if self.previous_second_start < 0 || self.last_second_start <= self.previous_second_start {
            return None;
        }
        let elapsed = self.last_second_start - self.previous_second_start;
        Some(self.bytes_during_previous_second * 8 * 1000 / elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_000_000;

    fn window() -> OverbufferWindow {
        OverbufferWindow::new(200, 1000, 25, 2.0)
    }

    #[test]
    fn due_packet_sends_now() {
        let mut w = window();
        assert_eq!(w.check_transmit_time(NOW, NOW, 1000), TransmitDecision::SendNow);
        assert_eq!(w.check_transmit_time(NOW + 200, NOW, 1000), TransmitDecision::SendNow);
    }

    #[test]
    fn send_ahead_duration_sends_now_when_enabled() {
        let mut w = window();
        assert_eq!(w.check_transmit_time(NOW + 1200, NOW, 1000), TransmitDecision::SendNow);
        w.turn_off_overbuffering();
        assert_eq!(
            w.check_transmit_time(NOW + 1200, NOW, 1000),
            TransmitDecision::Defer(NOW + 1200)
        );
    }

    #[test]
    fn disabled_paces_at_ideal_time() {
        let mut w = OverbufferWindow::new(0, 1000, 25, 2.0);
        assert!(!w.is_enabled());
        assert_eq!(w.send_interval(), 200);
        assert_eq!(
            w.check_transmit_time(NOW + 800, NOW, 100),
            TransmitDecision::Defer(NOW + 800)
        );
    }

    #[test]
    fn zero_window_paces_at_ideal_time() {
        let mut w = window();
        w.set_window_size(Some(0));
        assert_eq!(
            w.check_transmit_time(NOW + 3000, NOW, 100),
            TransmitDecision::Defer(NOW + 3000)
        );
    }

    #[test]
    fn full_client_window_backs_off() {
        let mut w = window();
        w.set_window_size(Some(10_000));
        w.add_packet_to_window(6_000);
        assert_eq!(w.available_space_in_window(), Some(4_000));
        assert_eq!(
            w.check_transmit_time(NOW + 3000, NOW, 1000),
            TransmitDecision::Defer(NOW + 1000)
        );
        // a fresh client report frees the window
        w.set_window_size(Some(10_000));
        assert_eq!(w.available_space_in_window(), Some(10_000));
    }

    #[test]
    fn far_future_clamps_to_max_send_ahead() {
        let mut w = window();
        assert_eq!(
            w.check_transmit_time(NOW + 30_000, NOW, 1000),
            TransmitDecision::Defer(NOW + 30_000 - 25_000 + 200)
        );
    }

    #[test]
    fn wakeup_never_beyond_max_send_ahead() {
        let mut w = window();
        w.turn_off_overbuffering();
        for ahead in [30_000, 1_000_000, i64::MAX / 4] {
            match w.check_transmit_time(NOW + ahead, NOW, 1000) {
                TransmitDecision::Defer(at) => assert!(at <= NOW + 25_000),
                TransmitDecision::SendNow => panic!("far packet sent"),
            }
        }
    }

    #[test]
    fn reset_then_due_packet_sends() {
        let mut w = window();
        w.set_window_size(Some(1));
        w.check_transmit_time(NOW + 5000, NOW, 1000);
        w.reset_overbuffer_window();
        assert_eq!(w.check_transmit_time(NOW + 10, NOW + 10, 1000), TransmitDecision::SendNow);
    }

    #[test]
    fn growth_limited_per_bucket() {
        let mut w = window();
        // first bucket: no history, lead may only grow by the elapsed ms
        assert_eq!(
            w.check_transmit_time(NOW + 5000, NOW, 1000),
            TransmitDecision::Defer(NOW + 200)
        );
        // next bucket: growth capped at the 250 ms that elapsed
        let t = NOW + 250;
        assert_eq!(w.check_transmit_time(t + 1300, t, 1000), TransmitDecision::Defer(t + 200));
    }

    #[test]
    fn rate_one_never_gets_ahead() {
        let mut w = OverbufferWindow::new(200, 1000, 25, 1.0);
        let mut now = NOW;
        for _ in 0..10 {
            assert_eq!(
                w.check_transmit_time(now + 4000, now, 500),
                TransmitDecision::Defer(now + 200)
            );
            now += 250;
        }
    }

    #[test]
    fn repeated_checks_give_increasing_wakeups() {
        let mut w = window();
        let transmit = NOW + 5000;
        let mut now = NOW;
        let mut last_wakeup = i64::MIN;
        loop {
            match w.check_transmit_time(transmit, now, 1000) {
                TransmitDecision::Defer(at) => {
                    assert!(at > last_wakeup);
                    assert!(at <= now + 25_000);
                    last_wakeup = at;
                }
                TransmitDecision::SendNow => break,
            }
            now += 250;
            assert!(now < transmit, "packet never released");
        }
    }

    #[test]
    fn one_second_byte_windows_rotate() {
        let mut w = window();
        w.check_transmit_time(NOW, NOW, 0);
        w.add_packet_to_window(700);
        w.check_transmit_time(NOW + 1500, NOW + 1500, 0);
        assert_eq!(w.bytes_during_previous_second(), 700);
        assert_eq!(w.bytes_during_bucket(), 0);
        assert_eq!(w.previous_second_rate_bps(), Some(700 * 8 * 1000 / 1500));
        w.add_packet_to_window(1000);
        w.check_transmit_time(NOW + 3500, NOW + 3500, 0);
        assert_eq!(w.previous_second_rate_bps(), Some(1000 * 8 * 1000 / 2000));
    }
}

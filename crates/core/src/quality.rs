//! Adaptive thinning.
//!
//! Every RTP packet arrives with its lateness (`now - ideal transmit time`).
//! The controller maps lateness to a discrete quality level, 0 being full
//! quality and `num_levels` the thinnest (typically key frames only), and
//! drops packets that are too stale to be useful.
//!
//! Transitions depend on both the absolute delay and its trend against the
//! previous checkpoint, and are rate-limited to one step per check interval:
//!
//! ```text
//!  delay:  thick_all_the_way  start_thicking  start_thinning  always_thin  thin_all_the_way  drop
//!  ---------------|-----------------|---------------|---------------|---------------|----------|--->
//!   snap to 0      -1 if improving     (hold)       +1 if worsening     +1 per check   jump to max  drop
//! ```
//!
//! Streams on reliable transports share the session level; plain UDP streams
//! keep their own level and are never thinned or dropped here.

use crate::config::{DEFAULT_LATE_TOLERANCE_SECS, DeliveryPrefs};
use crate::stream::PayloadKind;

/// Lateness tolerance the configured thresholds are calibrated for (ms).
const REFERENCE_LATE_TOLERANCE_MS: i64 = 1500;

/// Growth in delay that ends the grace period before thinning starts (ms).
const THINNING_GRACE_MS: i64 = 250;

/// Delay breakpoints for one stream, recomputed on every Play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThinningParams {
    pub drop_all_packets_delay: i64,
    pub thin_all_the_way_delay: i64,
    pub always_thin_delay: i64,
    pub start_thinning_delay: i64,
    pub start_thicking_delay: i64,
    pub thick_all_the_way_delay: i64,
    pub quality_check_interval: i64,
}

impl ThinningParams {
    /// Derive thresholds from preferences, shifted by how much more (or less)
    /// lateness this client tolerates than the reference 1.5 s.
    pub fn compute(prefs: &DeliveryPrefs, payload: PayloadKind, late_tolerance_secs: f32) -> Self {
        let tolerance_adjust = REFERENCE_LATE_TOLERANCE_MS - (late_tolerance_secs * 1000.0) as i64;
        let drop_all = match payload {
            PayloadKind::Video => prefs.drop_all_video_packets_delay_ms,
            _ => prefs.drop_all_packets_delay_ms,
        };
        Self {
            drop_all_packets_delay: drop_all as i64 - tolerance_adjust,
            thin_all_the_way_delay: prefs.thin_all_the_way_delay_ms as i64 - tolerance_adjust,
            always_thin_delay: prefs.always_thin_delay_ms as i64 - tolerance_adjust,
            start_thinning_delay: prefs.start_thinning_delay_ms as i64 - tolerance_adjust,
            start_thicking_delay: prefs.start_thicking_delay_ms as i64 - tolerance_adjust,
            thick_all_the_way_delay: prefs.thick_all_the_way_delay_ms as i64 - tolerance_adjust,
            quality_check_interval: prefs.quality_check_interval_ms as i64,
        }
    }
}

impl Default for ThinningParams {
    fn default() -> Self {
        Self::compute(
            &DeliveryPrefs::default(),
            PayloadKind::Other,
            DEFAULT_LATE_TOLERANCE_SECS,
        )
    }
}

/// Quality state shared by all streams of a session.
#[derive(Debug, Clone, Default)]
pub struct SessionQuality {
    level: u32,
    last_check_time: i64,
    last_check_media_time: i64,
    started_thinning: bool,
}

impl SessionQuality {
    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn started_thinning(&self) -> bool {
        self.started_thinning
    }

    /// Forget the check window so the next packet sets fresh baselines.
    pub fn reset_checks(&mut self) {
        self.last_check_time = 0;
        self.last_check_media_time = 0;
        self.started_thinning = false;
    }

    fn checkpoint(&mut self, now: i64, transmit_time: i64) {
        self.last_check_time = now;
        self.last_check_media_time = transmit_time;
    }
}

/// Timing of one packet as seen by the write path.
#[derive(Debug, Clone, Copy)]
pub struct PacketTiming {
    /// Ideal transmit time (ms).
    pub transmit_time: i64,
    /// `now - transmit_time`; negative when early.
    pub delay: i64,
    pub now: i64,
    /// Session play-time origin.
    pub play_time: i64,
}

/// Per-stream thinning state machine.
#[derive(Debug, Clone)]
pub struct QualityController {
    params: ThinningParams,
    num_levels: u32,
    per_stream_level: bool,
    disable_thinning: bool,
    level: u32,
    last_delay: i64,
    wait_on_level_adjustment: bool,
    stale_packets_dropped: u64,
}

impl QualityController {
    /// `per_stream_level` is set for plain UDP streams, which keep their own
    /// level instead of following the session.
    pub fn new(num_levels: u32, per_stream_level: bool, disable_thinning: bool) -> Self {
        Self {
            params: ThinningParams::default(),
            num_levels: num_levels.max(1),
            per_stream_level,
            disable_thinning,
            level: 0,
            last_delay: 0,
            wait_on_level_adjustment: false,
            stale_packets_dropped: 0,
        }
    }

    /// Install fresh thresholds and restart the session check window.
    pub fn set_thinning_params(&mut self, params: ThinningParams, shared: &mut SessionQuality) {
        self.params = params;
        self.last_delay = 0;
        self.wait_on_level_adjustment = false;
        shared.reset_checks();
    }

    pub fn params(&self) -> &ThinningParams {
        &self.params
    }

    pub fn num_levels(&self) -> u32 {
        self.num_levels
    }

    pub fn stale_packets_dropped(&self) -> u64 {
        self.stale_packets_dropped
    }

    pub fn quality_level(&self, shared: &SessionQuality) -> u32 {
        if self.per_stream_level {
            self.level
        } else {
            shared.level
        }
    }

    /// Set the level, clamped to `[0, num_levels]`; pinned at 0 when
    /// thinning is disabled.
    pub fn set_quality_level(&mut self, shared: &mut SessionQuality, level: i64) {
        let level = if self.disable_thinning {
            0
        } else {
            level.clamp(0, self.num_levels as i64) as u32
        };
        if self.per_stream_level {
            self.level = level;
        } else {
            shared.level = level;
        }
    }

    /// Update the quality level for one packet; `false` means drop it.
    pub fn update_quality_level(&mut self, shared: &mut SessionQuality, t: &PacketTiming) -> bool {
        if t.transmit_time <= t.play_time || self.per_stream_level {
            return true;
        }

        if shared.last_check_time == 0 {
            shared.checkpoint(t.now, t.transmit_time);
            self.last_delay = t.delay;
            return true;
        }

        if !shared.started_thinning {
            // still behind but not falling further behind
            if t.delay > self.params.start_thinning_delay
                && t.delay - self.last_delay < THINNING_GRACE_MS
            {
                if t.delay < self.last_delay {
                    self.last_delay = t.delay;
                }
                return true;
            }
            shared.started_thinning = true;
        }

        if t.delay > self.params.thin_all_the_way_delay {
            shared.checkpoint(t.now, t.transmit_time);
            self.last_delay = t.delay;
            let max = self.num_levels as i64;
            self.set_quality_level(shared, max);
            if t.delay > self.params.drop_all_packets_delay {
                self.stale_packets_dropped += 1;
                tracing::trace!(delay_ms = t.delay, dropped = self.stale_packets_dropped, "stale packet dropped");
                return false;
            }
        }

        let current = self.quality_level(shared) as i64;
        if self.num_levels <= 2 {
            if t.delay < self.params.start_thicking_delay && current > 0 {
                self.set_quality_level(shared, 0);
            }
            return true;
        }

        let interval = self.params.quality_check_interval;
        if t.now - shared.last_check_time > interval
            || t.transmit_time - shared.last_check_media_time > interval
        {
            self.adjust_level(shared, t.delay);
            self.last_delay = t.delay;
            shared.checkpoint(t.now, t.transmit_time);
        }

        true
    }

    fn adjust_level(&mut self, shared: &mut SessionQuality, delay: i64) {
        let before = self.quality_level(shared);
        let max = self.num_levels;

        if delay > self.params.always_thin_delay && before < max {
            self.set_quality_level(shared, before as i64 + 1);
        } else if delay > self.params.start_thinning_delay && delay > self.last_delay {
            if !self.wait_on_level_adjustment && before < max {
                self.set_quality_level(shared, before as i64 + 1);
                self.wait_on_level_adjustment = true;
            } else {
                self.wait_on_level_adjustment = false;
            }
        }

        let level = self.quality_level(shared);
        if delay < self.params.start_thicking_delay && level > 0 && delay < self.last_delay {
            self.set_quality_level(shared, level as i64 - 1);
            self.wait_on_level_adjustment = true;
        }

        if delay < self.params.thick_all_the_way_delay {
            self.set_quality_level(shared, 0);
            self.wait_on_level_adjustment = false;
        }

        let after = self.quality_level(shared);
        if after != before {
            tracing::debug!(from = before, to = after, delay_ms = delay, "quality level changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAY: i64 = 1_000_000;

    fn scenario_prefs() -> DeliveryPrefs {
        DeliveryPrefs {
            start_thinning_delay_ms: 1500,
            always_thin_delay_ms: 2250,
            thin_all_the_way_delay_ms: 3000,
            ..Default::default()
        }
    }

    fn controller(prefs: &DeliveryPrefs, levels: u32) -> (QualityController, SessionQuality) {
        let mut shared = SessionQuality::default();
        let mut q = QualityController::new(levels, false, prefs.disable_thinning);
        q.set_thinning_params(ThinningParams::compute(prefs, PayloadKind::Audio, 1.5), &mut shared);
        (q, shared)
    }

    fn timing(i: i64, delay: i64) -> PacketTiming {
        let now = PLAY + 1 + i * 50;
        PacketTiming {
            transmit_time: now - delay,
            delay,
            now,
            play_time: PLAY,
        }
    }

    #[test]
    fn tolerance_shifts_thresholds() {
        let prefs = DeliveryPrefs::default();
        let base = ThinningParams::compute(&prefs, PayloadKind::Audio, 1.5);
        let lenient = ThinningParams::compute(&prefs, PayloadKind::Audio, 3.0);
        assert_eq!(base.thin_all_the_way_delay, 1500);
        assert_eq!(lenient.thin_all_the_way_delay, 3000);
        assert_eq!(lenient.drop_all_packets_delay, 4000);
        assert_eq!(lenient.thick_all_the_way_delay, -500);
        assert_eq!(lenient.quality_check_interval, 1000);
    }

    #[test]
    fn video_uses_its_own_drop_threshold() {
        let prefs = DeliveryPrefs::default();
        let video = ThinningParams::compute(&prefs, PayloadKind::Video, 1.5);
        assert_eq!(video.drop_all_packets_delay, 1750);
    }

    #[test]
    fn udp_streams_always_send() {
        let mut shared = SessionQuality::default();
        let mut q = QualityController::new(5, true, false);
        q.set_thinning_params(ThinningParams::default(), &mut shared);
        assert!(q.update_quality_level(&mut shared, &timing(1, 10_000)));
        assert!(q.update_quality_level(&mut shared, &timing(2, 10_000)));
        assert_eq!(q.stale_packets_dropped(), 0);
    }

    #[test]
    fn packets_before_play_origin_always_send() {
        let (mut q, mut shared) = controller(&DeliveryPrefs::default(), 5);
        let t = PacketTiming {
            transmit_time: PLAY,
            delay: 10_000,
            now: PLAY + 10_000,
            play_time: PLAY,
        };
        assert!(q.update_quality_level(&mut shared, &t));
        assert_eq!(shared.level(), 0);
    }

    #[test]
    fn first_packet_sets_baseline() {
        let (mut q, mut shared) = controller(&DeliveryPrefs::default(), 5);
        assert!(q.update_quality_level(&mut shared, &timing(0, 9_000)));
        assert_eq!(shared.level(), 0);
        assert!(!shared.started_thinning());
    }

    #[test]
    fn grace_period_while_not_falling_behind() {
        let (mut q, mut shared) = controller(&scenario_prefs(), 5);
        q.update_quality_level(&mut shared, &timing(0, 1600));
        assert!(q.update_quality_level(&mut shared, &timing(1, 1700)));
        assert!(!shared.started_thinning());
        // jumped more than 250 ms past the last sample
        q.update_quality_level(&mut shared, &timing(2, 1900));
        assert!(shared.started_thinning());
    }

    #[test]
    fn steadily_increasing_delay_reaches_max_then_drops() {
        let prefs = scenario_prefs();
        let (mut q, mut shared) = controller(&prefs, 5);
        let mut first_drop = None;
        for i in 0..=350 {
            let delay = i * 10;
            let sent = q.update_quality_level(&mut shared, &timing(i, delay));
            assert!(shared.level() <= 5);
            if delay > 3000 {
                assert_eq!(shared.level(), 5, "delay {delay}");
                assert!(!sent, "delay {delay} should drop");
                if first_drop.is_none() {
                    first_drop = Some(i);
                }
            } else {
                assert!(sent, "delay {delay} should send");
            }
        }
        let first = first_drop.unwrap();
        assert_eq!(q.stale_packets_dropped(), (350 - first + 1) as u64);
    }

    #[test]
    fn each_drop_counts_once() {
        let (mut q, mut shared) = controller(&DeliveryPrefs::default(), 5);
        q.update_quality_level(&mut shared, &timing(0, 0));
        assert!(!q.update_quality_level(&mut shared, &timing(1, 2600)));
        assert_eq!(q.stale_packets_dropped(), 1);
        assert!(!q.update_quality_level(&mut shared, &timing(2, 2600)));
        assert_eq!(q.stale_packets_dropped(), 2);
    }

    #[test]
    fn level_changes_are_rate_limited() {
        let prefs = scenario_prefs();
        let (mut q, mut shared) = controller(&prefs, 5);
        let mut last_change: Option<i64> = None;
        let mut level = 0;
        for i in 0..=300 {
            let t = timing(i, i * 10);
            q.update_quality_level(&mut shared, &t);
            if shared.level() != level {
                if let Some(prev) = last_change {
                    assert!(t.now - prev > 1000, "changes at {prev} and {}", t.now);
                }
                last_change = Some(t.now);
                level = shared.level();
            }
        }
        assert!(level > 0);
    }

    #[test]
    fn recovers_when_delay_improves() {
        let (mut q, mut shared) = controller(&DeliveryPrefs::default(), 5);
        q.update_quality_level(&mut shared, &timing(0, 0));
        // thin all the way without dropping
        q.update_quality_level(&mut shared, &timing(1, 1600));
        assert_eq!(shared.level(), 5);
        // improving and below start_thicking: one step per interval
        q.update_quality_level(&mut shared, &timing(30, 100));
        assert_eq!(shared.level(), 4);
        q.update_quality_level(&mut shared, &timing(60, 50));
        assert_eq!(shared.level(), 3);
        // far ahead of schedule snaps back to full quality
        q.update_quality_level(&mut shared, &timing(90, -2500));
        assert_eq!(shared.level(), 0);
    }

    #[test]
    fn two_level_streams_only_reset() {
        let (mut q, mut shared) = controller(&DeliveryPrefs::default(), 2);
        q.update_quality_level(&mut shared, &timing(0, 0));
        q.update_quality_level(&mut shared, &timing(1, 1600));
        assert_eq!(shared.level(), 2);
        q.update_quality_level(&mut shared, &timing(2, 1400));
        assert_eq!(shared.level(), 2);
        q.update_quality_level(&mut shared, &timing(3, 100));
        assert_eq!(shared.level(), 0);
    }

    #[test]
    fn disable_thinning_pins_level() {
        let prefs = DeliveryPrefs {
            disable_thinning: true,
            ..Default::default()
        };
        let (mut q, mut shared) = controller(&prefs, 5);
        q.update_quality_level(&mut shared, &timing(0, 0));
        q.update_quality_level(&mut shared, &timing(1, 1600));
        assert_eq!(shared.level(), 0);
    }

    #[test]
    fn set_level_clamps() {
        let mut shared = SessionQuality::default();
        let mut q = QualityController::new(5, true, false);
        q.set_quality_level(&mut shared, 9);
        assert_eq!(q.quality_level(&shared), 5);
        q.set_quality_level(&mut shared, -3);
        assert_eq!(q.quality_level(&shared), 0);
        // per-stream level leaves the session untouched
        q.set_quality_level(&mut shared, 2);
        assert_eq!(shared.level(), 0);
    }

    #[test]
    fn new_params_restart_check_window() {
        let (mut q, mut shared) = controller(&DeliveryPrefs::default(), 5);
        q.update_quality_level(&mut shared, &timing(0, 0));
        q.update_quality_level(&mut shared, &timing(1, 400));
        assert!(shared.started_thinning());
        q.set_thinning_params(ThinningParams::default(), &mut shared);
        assert!(!shared.started_thinning());
    }
}

//! Playback sessions.
//!
//! A session is one client's playback context. It owns its streams and the
//! session-wide pacing and congestion state, and moves through:
//!
//! ```text
//! new / add_stream  -> Starting
//! play              -> Playing
//! pause             -> Paused   (from Playing)
//! play              -> Playing  (from Paused)
//! teardown / Kill / Timeout -> Closing -> disposed by the scheduler
//! ```
//!
//! Everything the packet path mutates lives behind one per-session mutex.
//! Writers take it with `try_lock` and report `WouldBlock` when it is held,
//! so a busy session never stalls a shared worker thread.

pub mod registry;

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use crate::bandwidth::BandwidthTracker;
use crate::clock::{Clock, unix_ms_to_ntp};
use crate::config::{DEFAULT_LATE_TOLERANCE_SECS, DeliveryPrefs};
use crate::error::{DeliveryError, Result};
use crate::overbuffer::OverbufferWindow;
use crate::quality::SessionQuality;
use crate::scheduler::PacketProducer;
use crate::stats::DeliveryCounters;
use crate::stream::{
    DecodedRtcp, OutgoingPacket, Stream, StreamId, StreamSetup, StreamSnapshot, TransportKind,
    WriteStatus,
};
use crate::transport::{PacketSink, ResendBuffer};

pub use registry::{PortPair, SessionLease, SessionRegistry};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Minimum spacing between two current-bitrate recomputations.
const BITRATE_UPDATE_INTERVAL_MS: i64 = 10_000;

/// Largest transport buffer the power-of-two rounding considers.
const MAX_POWER_OF_TWO_BUFFER: u32 = 0x1000_0000;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Streams may be added; nothing is sent yet.
    Starting,
    Playing,
    Paused,
    /// Teardown requested; the scheduler is unwinding the session.
    Closing,
}

/// Events delivered to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Start,
    Kill,
    Timeout,
}

impl Event {
    fn bit(self) -> u32 {
        match self {
            Event::Start => 1,
            Event::Kill => 1 << 1,
            Event::Timeout => 1 << 2,
        }
    }
}

/// Pending event set taken by the scheduler on each run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Events(u32);

impl Events {
    pub fn contains(self, event: Event) -> bool {
        self.0 & event.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Parameters of a Play request.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlayParams {
    /// Media position the client asked to start from.
    pub start_offset_secs: f64,
    /// Average bitrate of the movie (bits/s); 0 when unknown.
    pub movie_avg_bitrate: u32,
}

/// Wall-clock anchors for the current play.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayTiming {
    pub play_time: i64,
    /// `play_time` minus the requested start offset.
    pub adjusted_play_time: i64,
    pub first_play_time: Option<i64>,
    /// `play_time` as a 1900-epoch 32.32 fixed-point value.
    pub ntp_play_time: u64,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct BitrateMeter {
    pub(crate) packets_sent: u64,
    pub(crate) bytes_sent: u64,
    last_update_time: i64,
    last_update_bytes: u64,
    current_bps: u32,
    movie_avg_bitrate: u32,
}

/// Session-wide state every stream's write path reads and mutates.
pub struct SessionShared {
    pub(crate) tracker: BandwidthTracker,
    pub(crate) overbuffer: OverbufferWindow,
    pub(crate) quality: SessionQuality,
    pub(crate) timing: PlayTiming,
    pub(crate) bitrate: BitrateMeter,
    pub(crate) next_send_time: i64,
    pub(crate) last_stats_update: i64,
}

impl SessionShared {
    fn new(prefs: &DeliveryPrefs) -> Self {
        Self {
            tracker: BandwidthTracker::new(prefs.slow_start_enabled),
            overbuffer: OverbufferWindow::from_prefs(prefs),
            quality: SessionQuality::default(),
            timing: PlayTiming::default(),
            bitrate: BitrateMeter::default(),
            next_send_time: 0,
            last_stats_update: 0,
        }
    }

    pub fn tracker(&self) -> &BandwidthTracker {
        &self.tracker
    }

    pub fn overbuffer(&self) -> &OverbufferWindow {
        &self.overbuffer
    }

    pub fn timing(&self) -> &PlayTiming {
        &self.timing
    }

    pub fn quality_level(&self) -> u32 {
        self.quality.level()
    }

    /// Recompute the current bitrate, at most every 10 s.
    pub(crate) fn update_current_bitrate(&mut self, now: i64) {
        let meter = &mut self.bitrate;
        if now <= meter.last_update_time + BITRATE_UPDATE_INTERVAL_MS {
            return;
        }
        let bits = (meter.bytes_sent - meter.last_update_bytes) * 8;
        let elapsed = now - meter.last_update_time;
        let secs = elapsed / 1000;
        if secs > 0 {
            meter.current_bps = (bits / secs as u64).min(u32::MAX as u64) as u32;
        }
        self.tracker.update_ack_timeout(bits, elapsed);
        meter.last_update_bytes = meter.bytes_sent;
        meter.last_update_time = now;
    }

    fn reset_bitrate(&mut self, now: i64) {
        self.bitrate.current_bps = 0;
        self.bitrate.last_update_time = now;
        self.bitrate.last_update_bytes = self.bitrate.bytes_sent;
    }

    /// Track sessions entering or leaving thinned delivery.
    pub(crate) fn note_session_level_change(&self, before: u32, env: &WriteEnv<'_>) {
        let after = self.quality.level();
        if before == 0 && after != 0 {
            env.counters.alter_thinned_sessions(1);
        } else if before != 0 && after == 0 {
            env.counters.alter_thinned_sessions(-1);
        }
    }
}

/// Idle timer refreshed by client traffic.
#[derive(Debug)]
pub(crate) struct SessionTimeout {
    last_refresh: AtomicI64,
    timeout_ms: i64,
}

impl SessionTimeout {
    fn new(timeout_ms: i64, now: i64) -> Self {
        Self {
            last_refresh: AtomicI64::new(now),
            timeout_ms,
        }
    }

    pub(crate) fn refresh(&self, now: i64) {
        self.last_refresh.store(now, Ordering::Relaxed);
    }

    fn is_expired(&self, now: i64) -> bool {
        self.timeout_ms > 0 && now - self.last_refresh.load(Ordering::Relaxed) >= self.timeout_ms
    }
}

/// Per-call context passed down the write path.
pub(crate) struct WriteEnv<'a> {
    pub(crate) session_id: &'a str,
    pub(crate) now: i64,
    pub(crate) prefs: &'a DeliveryPrefs,
    pub(crate) counters: &'a dyn DeliveryCounters,
    pub(crate) timeout: &'a SessionTimeout,
}

impl WriteEnv<'_> {
    pub(crate) fn refresh_timeout(&self) {
        self.timeout.refresh(self.now);
    }
}

/// Everything guarded by the session mutex.
pub(crate) struct Pipeline {
    pub(crate) streams: Vec<Stream>,
    pub(crate) shared: SessionShared,
    pub(crate) producer: Option<Box<dyn PacketProducer>>,
}

/// Write access to a session's streams for the duration of one producer call.
pub struct PacketWriter<'a> {
    streams: &'a mut [Stream],
    shared: &'a mut SessionShared,
    env: WriteEnv<'a>,
}

impl<'a> PacketWriter<'a> {
    pub(crate) fn new(streams: &'a mut [Stream], shared: &'a mut SessionShared, env: WriteEnv<'a>) -> Self {
        Self { streams, shared, env }
    }

    /// Clock reading this writer was opened at.
    pub fn now(&self) -> i64 {
        self.env.now
    }

    pub fn session_id(&self) -> &str {
        self.env.session_id
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn timing(&self) -> &PlayTiming {
        &self.shared.timing
    }

    pub fn quality_level(&self, stream: StreamId) -> Option<u32> {
        self.streams.get(stream.0).map(|s| s.quality_level(self.shared))
    }

    /// Set the quality level a producer thins to on `stream`.
    pub fn set_quality_level(&mut self, stream: StreamId, level: i64) -> Result<()> {
        let before = self.shared.quality.level();
        let s = self
            .streams
            .get_mut(stream.0)
            .ok_or_else(|| stream_not_found(self.env.session_id, stream))?;
        s.set_quality_level(self.shared, level);
        self.shared.note_session_level_change(before, &self.env);
        Ok(())
    }

    /// Send one packet on `stream` through pacing, thinning and the transport.
    pub fn write(&mut self, stream: StreamId, packet: OutgoingPacket<'_>) -> Result<WriteStatus> {
        let target = self
            .streams
            .get(stream.0)
            .ok_or_else(|| stream_not_found(self.env.session_id, stream))?
            .transport();

        // retransmits go out before new data competes for the window
        if target == TransportKind::ReliableUdp {
            for s in self.streams.iter_mut() {
                s.send_retransmits(self.shared, self.env.now);
            }
        }

        self.streams[stream.0].write(self.shared, &self.env, &packet)
    }
}

fn stream_not_found(session_id: &str, stream: StreamId) -> DeliveryError {
    DeliveryError::StreamNotFound {
        session_id: session_id.to_string(),
        index: stream.0,
    }
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub id: String,
    pub state: SessionState,
    pub timing: PlayTiming,
    pub quality_level: u32,
    pub movie_avg_bitrate: u32,
    pub current_bitrate_bps: u32,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub overbuffering: bool,
    pub overbuffer_window_size: Option<i64>,
    pub congestion_window: i32,
    pub retransmit_timeout_ms: i32,
    pub streams: Vec<StreamSnapshot>,
}

/// One client playback session.
pub struct Session {
    id: String,
    prefs: Arc<DeliveryPrefs>,
    clock: Arc<dyn Clock>,
    counters: Arc<dyn DeliveryCounters>,
    state: RwLock<SessionState>,
    events: AtomicU32,
    timeout: SessionTimeout,
    pipeline: Mutex<Pipeline>,
}

impl Session {
    /// Create a session with a unique 16-char hex id.
    pub fn new(
        prefs: Arc<DeliveryPrefs>,
        clock: Arc<dyn Clock>,
        counters: Arc<dyn DeliveryCounters>,
    ) -> Self {
        let id = SESSION_COUNTER.fetch_add(1, Ordering::SeqCst);
        let now = clock.now_ms();
        counters.alter_session_count(1);
        Session {
            id: format!("{:016X}", id),
            timeout: SessionTimeout::new(prefs.rtp_timeout_ms(), now),
            pipeline: Mutex::new(Pipeline {
                streams: Vec::new(),
                shared: SessionShared::new(&prefs),
                producer: None,
            }),
            prefs,
            clock,
            counters,
            state: RwLock::new(SessionState::Starting),
            events: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == SessionState::Playing
    }

    pub fn prefs(&self) -> &DeliveryPrefs {
        &self.prefs
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn stream_count(&self) -> usize {
        self.pipeline.lock().streams.len()
    }

    fn set_state(&self, state: SessionState) -> SessionState {
        let mut guard = self.state.write();
        let old = *guard;
        *guard = state;
        tracing::debug!(session_id = %self.id, old_state = ?old, new_state = ?state, "state transition");
        old
    }

    fn env(&self, now: i64) -> WriteEnv<'_> {
        WriteEnv {
            session_id: &self.id,
            now,
            prefs: &self.prefs,
            counters: self.counters.as_ref(),
            timeout: &self.timeout,
        }
    }

    /// Attach the collaborator that produces packets on every scheduler tick.
    pub fn set_packet_producer(&self, producer: Box<dyn PacketProducer>) {
        self.pipeline.lock().producer = Some(producer);
    }

    /// Set up a new track.
    ///
    /// Plain UDP streams, and any stream whose client opted out of dynamic
    /// rate, turn overbuffering off for the whole session.
    pub fn add_stream(
        &self,
        mut setup: StreamSetup,
        sink: Box<dyn PacketSink>,
        resender: Option<Box<dyn ResendBuffer>>,
    ) -> Result<StreamId> {
        if self.state() == SessionState::Closing {
            return Err(DeliveryError::InvalidArgument("session is closing"));
        }
        if setup.transport == TransportKind::ReliableUdp && !self.prefs.reliable_udp_enabled {
            tracing::debug!(session_id = %self.id, "reliable UDP disabled, using plain UDP");
            setup.transport = TransportKind::Udp;
        }
        if setup.transport == TransportKind::ReliableUdp && resender.is_none() {
            return Err(DeliveryError::InvalidArgument(
                "reliable UDP stream needs a resend buffer",
            ));
        }
        let late_tolerance = setup
            .late_tolerance_secs
            .filter(|t| t.is_finite() && *t > 0.0)
            .unwrap_or(DEFAULT_LATE_TOLERANCE_SECS);

        let mut pipeline = self.pipeline.lock();
        let Pipeline { streams, shared, .. } = &mut *pipeline;

        let ssrc = loop {
            let candidate = rand::random::<u32>();
            if candidate != 0 && streams.iter().all(|s| s.ssrc() != candidate) {
                break candidate;
            }
        };

        let overbuffer_allowed = match setup.transport {
            TransportKind::Udp => false,
            TransportKind::ReliableUdp | TransportKind::Tcp => setup.dynamic_rate != Some(false),
        };
        if !overbuffer_allowed {
            shared.overbuffer.turn_off_overbuffering();
        }
        if setup.transport == TransportKind::Tcp {
            shared.overbuffer.set_window_size(None);
        }

        let stream = Stream::new(ssrc, &setup, late_tolerance, self.prefs.disable_thinning, sink, resender);
        streams.push(stream);
        let id = StreamId(streams.len() - 1);
        tracing::debug!(
            session_id = %self.id,
            stream = id.0,
            ssrc,
            transport = ?setup.transport,
            payload = ?setup.payload,
            late_tolerance,
            overbuffering = shared.overbuffer.is_enabled(),
            "stream added"
        );
        Ok(id)
    }

    /// Start or resume playback.
    pub fn play(&self, params: PlayParams) -> Result<()> {
        let now = self.clock.now_ms();
        let mut pipeline = self.pipeline.lock();
        if pipeline.producer.is_none() {
            return Err(DeliveryError::NoPacketProducer(self.id.clone()));
        }
        if self.state() == SessionState::Closing {
            return Err(DeliveryError::InvalidArgument("session is closing"));
        }
        let env = self.env(now);
        let prefs = &*self.prefs;
        let Pipeline { streams, shared, .. } = &mut *pipeline;

        shared.timing.play_time = now;
        shared.bitrate.last_update_time = now;
        shared.next_send_time = now;
        if shared.timing.first_play_time.is_none() {
            shared.timing.first_play_time = Some(now);
        }
        shared.timing.adjusted_play_time = now - (params.start_offset_secs * 1000.0) as i64;
        shared.timing.ntp_play_time = unix_ms_to_ntp(now);
        shared.bitrate.movie_avg_bitrate = params.movie_avg_bitrate;

        let window = client_window_for_bitrate(prefs, params.movie_avg_bitrate);
        shared.tracker.set_window_size(window);
        shared.overbuffer.reset_overbuffer_window();
        tracing::debug!(
            session_id = %self.id,
            bitrate = params.movie_avg_bitrate,
            window,
            "client window selected"
        );

        for stream in streams.iter_mut() {
            stream.prepare_for_play(shared, &env, prefs.send_rtcp_reports);
        }

        let buffer_size = transport_buffer_size(prefs, params.movie_avg_bitrate);
        for stream in streams.iter_mut() {
            stream.set_send_buffer_size(buffer_size);
        }
        drop(pipeline);

        if self.set_state(SessionState::Playing) != SessionState::Playing {
            self.counters.alter_playing_sessions(1);
        }
        tracing::info!(session_id = %self.id, start_offset = params.start_offset_secs, "playing");
        self.signal(Event::Start);
        Ok(())
    }

    /// Suspend playback. The scheduler idles until the next Play.
    pub fn pause(&self) {
        if self.state() != SessionState::Playing {
            return;
        }
        let now = self.clock.now_ms();
        self.pipeline.lock().shared.reset_bitrate(now);
        if self.set_state(SessionState::Paused) == SessionState::Playing {
            self.counters.alter_playing_sessions(-1);
        }
    }

    /// Begin closing; the scheduler finishes the job on its next run.
    pub fn teardown(&self) {
        if self.set_state(SessionState::Closing) == SessionState::Playing {
            self.counters.alter_playing_sessions(-1);
        }
        tracing::info!(session_id = %self.id, "teardown requested");
        self.signal(Event::Kill);
    }

    pub fn signal(&self, event: Event) {
        self.events.fetch_or(event.bit(), Ordering::AcqRel);
    }

    /// Whether an event is waiting for the scheduler.
    pub fn has_pending_events(&self) -> bool {
        self.events.load(Ordering::Acquire) != 0
    }

    pub(crate) fn take_events(&self) -> Events {
        Events(self.events.swap(0, Ordering::AcqRel))
    }

    pub(crate) fn timed_out(&self, now: i64) -> bool {
        self.timeout.is_expired(now)
    }

    /// Mark the session closing from the scheduler side.
    pub(crate) fn enter_closing(&self) {
        if self.set_state(SessionState::Closing) == SessionState::Playing {
            self.counters.alter_playing_sessions(-1);
        }
    }

    /// Apply a decoded RTCP datagram from the client.
    ///
    /// Every datagram refreshes the session timeout. When the session mutex
    /// is busy the datagram is dropped and `WouldBlock` returned.
    pub fn process_rtcp(&self, stream: StreamId, reports: DecodedRtcp) -> Result<()> {
        let now = self.clock.now_ms();
        self.timeout.refresh(now);
        let Some(mut pipeline) = self.pipeline.try_lock() else {
            tracing::trace!(session_id = %self.id, "session busy, RTCP dropped");
            return Err(DeliveryError::would_block());
        };
        let env = self.env(now);
        let Pipeline { streams, shared, .. } = &mut *pipeline;
        let s = streams
            .get_mut(stream.0)
            .ok_or_else(|| stream_not_found(&self.id, stream))?;
        s.process_rtcp(shared, &env, reports);
        Ok(())
    }

    /// Write one packet outside of a scheduler tick.
    pub fn try_write(&self, stream: StreamId, packet: OutgoingPacket<'_>) -> Result<WriteStatus> {
        if !self.is_playing() {
            return Err(DeliveryError::SessionNotPlaying(self.id.clone()));
        }
        let mut pipeline = self.pipeline.try_lock().ok_or_else(DeliveryError::would_block)?;
        let Pipeline { streams, shared, .. } = &mut *pipeline;
        let mut writer = PacketWriter::new(streams, shared, self.env(self.clock.now_ms()));
        writer.write(stream, packet)
    }

    /// Loss over the last RTCP interval across all streams, in percent.
    pub fn packet_loss_percent(&self) -> f32 {
        let pipeline = self.pipeline.lock();
        let (lost, sent) = pipeline.streams.iter().fold((0u64, 0u64), |(lost, sent), s| {
            let r = s.reception();
            (
                lost + r.cur_packets_lost_in_rtcp_interval as u64,
                sent + r.packet_count_in_rtcp_interval as u64,
            )
        });
        loss_percent(lost, sent)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let pipeline = self.pipeline.lock();
        let shared = &pipeline.shared;
        SessionSnapshot {
            id: self.id.clone(),
            state: self.state(),
            timing: shared.timing,
            quality_level: shared.quality.level(),
            movie_avg_bitrate: shared.bitrate.movie_avg_bitrate,
            current_bitrate_bps: shared.bitrate.current_bps,
            packets_sent: shared.bitrate.packets_sent,
            bytes_sent: shared.bitrate.bytes_sent,
            overbuffering: shared.overbuffer.is_enabled(),
            overbuffer_window_size: shared.overbuffer.window_size(),
            congestion_window: shared.tracker.congestion_window(),
            retransmit_timeout_ms: shared.tracker.cur_retransmit_timeout(),
            streams: pipeline.streams.iter().map(|s| s.snapshot(shared)).collect(),
        }
    }

    /// Server ports reserved by this session's streams.
    pub fn server_ports(&self) -> Vec<PortPair> {
        self.pipeline
            .lock()
            .streams
            .iter()
            .filter_map(|s| s.server_ports())
            .collect()
    }

    pub(crate) fn pipeline(&self) -> &Mutex<Pipeline> {
        &self.pipeline
    }

    pub(crate) fn write_env(&self, now: i64) -> WriteEnv<'_> {
        self.env(now)
    }

    /// Final SR+BYE on every stream that sends reports. `false` when the
    /// session mutex is busy and nothing was sent.
    pub(crate) fn try_send_goodbyes(&self, now: i64) -> bool {
        let Some(mut pipeline) = self.pipeline.try_lock() else {
            tracing::trace!(session_id = %self.id, "session busy, goodbyes deferred");
            return false;
        };
        let Pipeline { streams, shared, .. } = &mut *pipeline;
        for stream in streams.iter_mut().filter(|s| s.sender_reports_enabled()) {
            stream.send_sender_report(shared, now, true);
        }
        true
    }

    /// Log the window and RTO statistics gathered over the session and hand
    /// back the server ports to release. `None` when the session mutex is busy.
    pub(crate) fn try_close_out(&self) -> Option<Vec<PortPair>> {
        let pipeline = self.pipeline.try_lock()?;
        let stats = pipeline.shared.tracker.stats();
        let stale: u64 = pipeline.streams.iter().map(|s| s.stale_packets_dropped()).sum();
        tracing::info!(
            session_id = %self.id,
            cwnd_min = stats.min_congestion_window,
            cwnd_max = stats.max_congestion_window,
            cwnd_avg = stats.avg_congestion_window(),
            rto_min = stats.min_rto,
            rto_max = stats.max_rto,
            rto_avg = stats.avg_rto(),
            stale_dropped = stale,
            packets_sent = pipeline.shared.bitrate.packets_sent,
            "session closed"
        );
        Some(pipeline.streams.iter().filter_map(|s| s.server_ports()).collect())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.pipeline.get_mut().shared.quality.level() != 0 {
            self.counters.alter_thinned_sessions(-1);
        }
        if *self.state.get_mut() == SessionState::Playing {
            self.counters.alter_playing_sessions(-1);
        }
        self.counters.alter_session_count(-1);
    }
}

/// Client window for a movie bitrate: large for unknown or high rates.
fn client_window_for_bitrate(prefs: &DeliveryPrefs, bitrate: u32) -> i32 {
    let bitrate = bitrate as u64;
    let kb = if bitrate == 0 || bitrate > prefs.window_size_max_threshold_kbits as u64 * 1024 {
        prefs.large_window_size_kb
    } else if bitrate > prefs.window_size_threshold_kbits as u64 * 1024 {
        prefs.medium_window_size_kb
    } else {
        prefs.small_window_size_kb
    };
    (kb as i64 * 1024).min(i32::MAX as i64) as i32
}

/// Send buffer holding `tcp_seconds_to_buffer` of media, rounded down to a
/// power of two and clamped to the configured bounds.
fn transport_buffer_size(prefs: &DeliveryPrefs, bitrate: u32) -> usize {
    let max = prefs.max_tcp_buffer_size_bytes;
    if bitrate == 0 {
        return max as usize;
    }
    let bytes = ((bitrate as f64 * prefs.tcp_seconds_to_buffer as f64) as u64 >> 3)
        .min(MAX_POWER_OF_TWO_BUFFER as u64) as u32;
    power_of_two_floor(bytes).clamp(prefs.min_tcp_buffer_size_bytes, max) as usize
}

fn power_of_two_floor(n: u32) -> u32 {
    if n == 0 { 0 } else { 1 << (31 - n.leading_zeros()) }
}

fn loss_percent(lost: u64, sent: u64) -> f32 {
    if sent == 0 {
        0.0
    } else if lost > sent {
        100.0
    } else {
        lost as f32 * 100.0 / sent as f32
    }
}

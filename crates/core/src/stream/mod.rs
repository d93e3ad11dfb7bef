//! One media track within a session and its per-packet write path.
//!
//! ## Write pipeline
//!
//! ```text
//! RTP:   overbuffer pacing ──defer──> WouldBlock(wakeup)
//!            │ send
//!        thinning ──stale──> Dropped
//!            │ send
//!        transport:  TCP   interleaved write
//!                    RUDP  congestion gate ──full──> WouldBlock
//!                          resend buffer + datagram
//!                    UDP   datagram (errors ignored)
//!            │
//!        counters, last RTP timestamp, periodic sender report
//!
//! RTCP:  paced only when overbuffering is off, then sent as-is
//! ```

pub mod rtcp;

use crate::clock::ms_to_fixed64;
use crate::error::{DeliveryError, Result};
use crate::overbuffer::TransmitDecision;
use crate::quality::{PacketTiming, QualityController, ThinningParams};
use crate::session::{PortPair, SessionShared, WriteEnv};
use crate::transport::{PacketSink, ResendBuffer};

pub use rtcp::{AckReport, ClientStats, DecodedRtcp, ReceiverReport, RtcpReport, SenderReport};

/// Quality levels offered when the caller does not say otherwise.
pub const DEFAULT_NUM_QUALITY_LEVELS: u32 = 5;

const RTP_HEADER_SIZE: u32 = 12;

/// How packets reach the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Udp,
    /// UDP with acknowledgements, retransmission and a congestion window.
    ReliableUdp,
    /// Interleaved on the RTSP connection.
    Tcp,
}

/// Media type of the track; video has its own drop threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Audio,
    Video,
    Other,
}

/// Index of a stream within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub usize);

/// Client-negotiated parameters for a new stream.
#[derive(Debug, Clone)]
pub struct StreamSetup {
    pub transport: TransportKind,
    pub payload: PayloadKind,
    /// Lateness the client can absorb; 1.5 s when absent.
    pub late_tolerance_secs: Option<f32>,
    /// Client's dynamic-rate request. `Some(false)` opts out of overbuffering.
    pub dynamic_rate: Option<bool>,
    pub num_quality_levels: u32,
    /// Server RTP/RTCP ports reserved for this stream, released at disposal.
    pub server_ports: Option<PortPair>,
}

impl StreamSetup {
    pub fn new(transport: TransportKind, payload: PayloadKind) -> Self {
        Self {
            transport,
            payload,
            late_tolerance_secs: None,
            dynamic_rate: None,
            num_quality_levels: DEFAULT_NUM_QUALITY_LEVELS,
            server_ports: None,
        }
    }

    pub fn late_tolerance(mut self, secs: f32) -> Self {
        self.late_tolerance_secs = Some(secs);
        self
    }

    pub fn dynamic_rate(mut self, enabled: bool) -> Self {
        self.dynamic_rate = Some(enabled);
        self
    }

    pub fn quality_levels(mut self, levels: u32) -> Self {
        self.num_quality_levels = levels;
        self
    }

    pub fn server_ports(mut self, ports: PortPair) -> Self {
        self.server_ports = Some(ports);
        self
    }
}

/// What a packet carries, as declared by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Rtp,
    Rtcp,
}

/// A packet handed to the write path.
#[derive(Debug, Clone, Copy)]
pub struct OutgoingPacket<'a> {
    pub data: &'a [u8],
    pub kind: PacketKind,
    /// Ideal transmit time (ms, same clock as the session).
    pub transmit_time: i64,
    /// First packet of a batch written in one tick.
    pub burst_begin: bool,
}

impl<'a> OutgoingPacket<'a> {
    pub fn rtp(data: &'a [u8], transmit_time: i64) -> Self {
        Self {
            data,
            kind: PacketKind::Rtp,
            transmit_time,
            burst_begin: false,
        }
    }

    pub fn rtcp(data: &'a [u8], transmit_time: i64) -> Self {
        Self {
            data,
            kind: PacketKind::Rtcp,
            transmit_time,
            burst_begin: false,
        }
    }

    pub fn starting_burst(mut self) -> Self {
        self.burst_begin = true;
        self
    }
}

/// Successful outcome of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Sent,
    /// Too late to be useful; discarded and counted.
    Dropped,
}

/// Receiver-side statistics gathered from RTCP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceptionStats {
    pub fraction_lost: u8,
    pub jitter: u32,
    pub total_lost_packets: u32,
    pub cur_packets_lost_in_rtcp_interval: u32,
    pub packet_count_in_rtcp_interval: u32,
    last_packet_count: u32,
    pub client: ClientStats,
}

/// Read-only view of a stream for introspection.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSnapshot {
    pub ssrc: u32,
    pub client_ssrc: u32,
    pub transport: TransportKind,
    pub payload: PayloadKind,
    pub quality_level: u32,
    pub packet_count: u32,
    pub byte_count: u64,
    pub stale_packets_dropped: u64,
    pub reception: ReceptionStats,
}

/// One media track of a session.
pub struct Stream {
    ssrc: u32,
    client_ssrc: u32,
    transport: TransportKind,
    payload: PayloadKind,
    late_tolerance_secs: f32,
    server_ports: Option<PortPair>,
    quality: QualityController,
    sink: Box<dyn PacketSink>,
    resender: Option<Box<dyn ResendBuffer>>,

    packet_count: u32,
    byte_count: u64,
    last_rtp_timestamp: u32,
    last_sender_report_time: i64,
    sender_reports_enabled: bool,
    reception: ReceptionStats,
}

impl Stream {
    pub(crate) fn new(
        ssrc: u32,
        setup: &StreamSetup,
        late_tolerance_secs: f32,
        disable_thinning: bool,
        sink: Box<dyn PacketSink>,
        resender: Option<Box<dyn ResendBuffer>>,
    ) -> Self {
        let per_stream_level = setup.transport == TransportKind::Udp;
        Self {
            ssrc,
            client_ssrc: 0,
            transport: setup.transport,
            payload: setup.payload,
            late_tolerance_secs,
            server_ports: setup.server_ports,
            quality: QualityController::new(setup.num_quality_levels, per_stream_level, disable_thinning),
            sink,
            resender,
            packet_count: 0,
            byte_count: 0,
            last_rtp_timestamp: 0,
            last_sender_report_time: 0,
            sender_reports_enabled: false,
            reception: ReceptionStats::default(),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn payload(&self) -> PayloadKind {
        self.payload
    }

    pub fn server_ports(&self) -> Option<PortPair> {
        self.server_ports
    }

    pub fn reception(&self) -> &ReceptionStats {
        &self.reception
    }

    pub fn quality_level(&self, shared: &SessionShared) -> u32 {
        self.quality.quality_level(&shared.quality)
    }

    /// Set the level a producer should thin to.
    pub fn set_quality_level(&mut self, shared: &mut SessionShared, level: i64) {
        self.quality.set_quality_level(&mut shared.quality, level);
    }

    pub fn snapshot(&self, shared: &SessionShared) -> StreamSnapshot {
        StreamSnapshot {
            ssrc: self.ssrc,
            client_ssrc: self.client_ssrc,
            transport: self.transport,
            payload: self.payload,
            quality_level: self.quality_level(shared),
            packet_count: self.packet_count,
            byte_count: self.byte_count,
            stale_packets_dropped: self.quality.stale_packets_dropped(),
            reception: self.reception,
        }
    }

    /// Recompute thinning thresholds and drop any retransmit backlog.
    pub(crate) fn prepare_for_play(&mut self, shared: &mut SessionShared, env: &WriteEnv<'_>, send_reports: bool) {
        let params = ThinningParams::compute(env.prefs, self.payload, self.late_tolerance_secs);
        self.quality.set_thinning_params(params, &mut shared.quality);
        if let Some(resender) = self.resender.as_mut() {
            resender.clear(&mut shared.tracker);
        }
        self.sender_reports_enabled = send_reports;
    }

    pub(crate) fn set_send_buffer_size(&mut self, bytes: usize) {
        self.sink.set_send_buffer_size(bytes);
    }

    pub(crate) fn send_retransmits(&mut self, shared: &mut SessionShared, now: i64) {
        if self.transport != TransportKind::ReliableUdp {
            return;
        }
        if let Some(resender) = self.resender.as_mut() {
            resender.resend_due_entries(now, &mut shared.tracker, self.sink.as_mut());
        }
    }

    pub(crate) fn stale_packets_dropped(&self) -> u64 {
        self.quality.stale_packets_dropped()
    }

    pub(crate) fn sender_reports_enabled(&self) -> bool {
        self.sender_reports_enabled
    }

    /// Run one packet through pacing, thinning and the transport.
    pub(crate) fn write(
        &mut self,
        shared: &mut SessionShared,
        env: &WriteEnv<'_>,
        packet: &OutgoingPacket<'_>,
    ) -> Result<WriteStatus> {
        let now = env.now;
        let delay = now - packet.transmit_time;

        shared.update_current_bitrate(now);
        if packet.burst_begin {
            shared.overbuffer.mark_beginning_of_write_burst();
        }

        match packet.kind {
            PacketKind::Rtcp => self.write_rtcp(shared, env, packet),
            PacketKind::Rtp => self.write_rtp(shared, env, packet, delay),
        }
    }

    fn write_rtcp(
        &mut self,
        shared: &mut SessionShared,
        env: &WriteEnv<'_>,
        packet: &OutgoingPacket<'_>,
    ) -> Result<WriteStatus> {
        // with overbuffering on, RTCP rides along with whatever is sent early
        if !shared.overbuffer.is_enabled() {
            let decision =
                shared
                    .overbuffer
                    .check_transmit_time(packet.transmit_time, env.now, packet.data.len());
            if let TransmitDecision::Defer(at) = decision {
                return Err(DeliveryError::WouldBlock {
                    wakeup_at_ms: Some(at),
                });
            }
        }

        if packet.data.is_empty() {
            return Ok(WriteStatus::Sent);
        }
        match self.transport {
            TransportKind::Tcp => self
                .sink
                .send_rtcp(packet.data)
                .map_err(DeliveryError::from_transport)?,
            _ => {
                if let Err(e) = self.sink.send_rtcp(packet.data) {
                    tracing::trace!(ssrc = self.ssrc, error = %e, "RTCP datagram not sent");
                }
            }
        }
        Ok(WriteStatus::Sent)
    }

    fn write_rtp(
        &mut self,
        shared: &mut SessionShared,
        env: &WriteEnv<'_>,
        packet: &OutgoingPacket<'_>,
        delay: i64,
    ) -> Result<WriteStatus> {
        let now = env.now;
        let len = packet.data.len();

        if let TransmitDecision::Defer(at) =
            shared.overbuffer.check_transmit_time(packet.transmit_time, now, len)
        {
            tracing::trace!(
                ssrc = self.ssrc,
                wakeup_in_ms = at - now,
                available = ?shared.overbuffer.available_space_in_window(),
                "packet held by overbuffer window"
            );
            return Err(DeliveryError::WouldBlock {
                wakeup_at_ms: Some(at),
            });
        }

        let timing = PacketTiming {
            transmit_time: packet.transmit_time,
            delay,
            now,
            play_time: shared.timing.play_time,
        };
        let level_before = shared.quality.level();
        let send = self.quality.update_quality_level(&mut shared.quality, &timing);
        shared.note_session_level_change(level_before, env);
        if !send {
            return Ok(WriteStatus::Dropped);
        }

        match self.transport {
            TransportKind::Tcp => {
                self.sink
                    .send_rtp(packet.data)
                    .map_err(DeliveryError::from_transport)?;
                env.refresh_timeout();
            }
            TransportKind::ReliableUdp => self.reliable_write(shared, packet.data, delay, now)?,
            TransportKind::Udp => {
                if len > 0 {
                    if let Err(e) = self.sink.send_rtp(packet.data) {
                        tracing::trace!(ssrc = self.ssrc, error = %e, "RTP datagram not sent");
                    }
                }
            }
        }

        if len > 0 {
            self.account_sent(shared, env, packet, delay);
        }
        Ok(WriteStatus::Sent)
    }

    fn reliable_write(
        &mut self,
        shared: &mut SessionShared,
        data: &[u8],
        delay: i64,
        now: i64,
    ) -> Result<()> {
        if shared.tracker.is_flow_controlled() {
            tracing::trace!(
                ssrc = self.ssrc,
                in_flight = shared.tracker.bytes_in_flight(),
                cwnd = shared.tracker.congestion_window(),
                "flow controlled"
            );
            return Err(DeliveryError::would_block());
        }

        shared.tracker.fill_window(data.len() as u32);
        if let Some(resender) = self.resender.as_mut() {
            let age_limit = self.quality.params().drop_all_packets_delay - delay;
            resender.add_packet(data, age_limit, now);
        }
        if let Err(e) = self.sink.send_rtp(data) {
            tracing::trace!(ssrc = self.ssrc, error = %e, "reliable RTP datagram not sent");
        }
        Ok(())
    }

    fn account_sent(
        &mut self,
        shared: &mut SessionShared,
        env: &WriteEnv<'_>,
        packet: &OutgoingPacket<'_>,
        delay: i64,
    ) {
        let len = packet.data.len();
        shared.overbuffer.add_packet_to_window(len);
        shared.bitrate.packets_sent += 1;
        shared.bitrate.bytes_sent += len as u64;

        env.counters.add_rtp_bytes(len as u64);
        env.counters.add_rtp_packets(1);
        env.counters.add_packet_lateness(delay);
        env.counters.add_packet_quality(self.quality_level(shared) as u64);

        if let Some(ts) = packet.data.get(4..8) {
            self.last_rtp_timestamp = u32::from_be_bytes([ts[0], ts[1], ts[2], ts[3]]);
        }
        self.packet_count = self.packet_count.wrapping_add(1);
        self.byte_count += len as u64;

        if self.sender_reports_enabled
            && env.now > self.last_sender_report_time + env.prefs.sender_report_interval_ms()
        {
            self.last_sender_report_time = env.now;
            self.send_sender_report(shared, packet.transmit_time, false);
        }
    }

    /// Build the sender report for a packet sent at `at`.
    pub(crate) fn sender_report(&self, shared: &SessionShared, at: i64) -> SenderReport {
        let payload_bytes = self
            .byte_count
            .saturating_sub(RTP_HEADER_SIZE as u64 * self.packet_count as u64);
        SenderReport {
            ssrc: self.ssrc,
            client_ssrc: self.client_ssrc,
            ntp_timestamp: shared
                .timing
                .ntp_play_time
                .wrapping_add(ms_to_fixed64(at - shared.timing.play_time)),
            rtp_timestamp: self.last_rtp_timestamp,
            packet_count: self.packet_count,
            payload_byte_count: payload_bytes as u32,
            ack_timeout_ms: shared.tracker.recommended_client_ack_timeout(),
        }
    }

    pub(crate) fn send_sender_report(&mut self, shared: &SessionShared, at: i64, with_bye: bool) {
        let report = self.sender_report(shared, at).to_bytes(with_bye);
        match self.sink.send_rtcp(&report) {
            Ok(()) => tracing::trace!(ssrc = self.ssrc, bye = with_bye, "sender report sent"),
            Err(e) => tracing::trace!(ssrc = self.ssrc, error = %e, "sender report not sent"),
        }
    }

    /// Apply decoded RTCP from the client. Stops at the first malformed item.
    pub(crate) fn process_rtcp(
        &mut self,
        shared: &mut SessionShared,
        env: &WriteEnv<'_>,
        reports: DecodedRtcp,
    ) {
        for report in reports {
            let report = match report {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(ssrc = self.ssrc, error = %e, "aborting RTCP datagram");
                    return;
                }
            };
            match report {
                RtcpReport::ReceiverReport(rr) => self.apply_receiver_report(&rr, env),
                RtcpReport::Ack(ack) => {
                    if self.transport != TransportKind::ReliableUdp {
                        continue;
                    }
                    if !shared.tracker.ready_for_ack_processing() {
                        tracing::warn!(ssrc = self.ssrc, "ack before any window was established");
                        return;
                    }
                    if let Some(resender) = self.resender.as_mut() {
                        for seq in ack.acked_sequences() {
                            resender.ack_packet(seq, env.now, &mut shared.tracker);
                        }
                    }
                }
                RtcpReport::ClientStats(stats) => {
                    self.reception.client = stats;
                    if self.transport != TransportKind::Udp {
                        shared
                            .overbuffer
                            .set_window_size(Some(stats.overbuffer_window_size as i64));
                    }
                }
                RtcpReport::Other { packet_type } => {
                    tracing::trace!(ssrc = self.ssrc, packet_type, "RTCP packet ignored");
                }
            }
        }
    }

    fn apply_receiver_report(&mut self, rr: &ReceiverReport, env: &WriteEnv<'_>) {
        self.client_ssrc = rr.ssrc;
        let r = &mut self.reception;
        r.fraction_lost = rr.fraction_lost;
        r.jitter = rr.jitter;

        // the client cannot have lost more than we sent since its last report
        let newly_lost = rr.cumulative_lost.wrapping_sub(r.total_lost_packets);
        let sent_since = self.packet_count.wrapping_sub(r.last_packet_count);
        if newly_lost > sent_since {
            tracing::warn!(
                ssrc = self.ssrc,
                reported = rr.cumulative_lost,
                previous = r.total_lost_packets,
                sent_since,
                "ignoring implausible loss count"
            );
            return;
        }
        if rr.cumulative_lost > r.total_lost_packets {
            env.counters.add_packets_lost(newly_lost as u64);
            r.cur_packets_lost_in_rtcp_interval = newly_lost;
            r.total_lost_packets = rr.cumulative_lost;
        } else if rr.cumulative_lost == r.total_lost_packets {
            r.cur_packets_lost_in_rtcp_interval = 0;
        }
        r.packet_count_in_rtcp_interval = sent_since;
        r.last_packet_count = self.packet_count;
    }
}

//! RTCP report fields consumed and produced by a stream.
//!
//! Binary parsing of inbound RTCP happens outside the engine; what arrives
//! here are the decoded fields ([`RtcpReport`]). Outbound, the engine builds
//! its own sender report compound ([`SenderReport::to_bytes`]):
//!
//! ```text
//! SR (PT=200, RFC 3550 §6.4.1)      sender info, no report blocks
//! APP (PT=204, name "qtak")          client SSRC + recommended ack timeout
//! BYE (PT=203, optional)             at teardown
//! ```

use crate::error::MalformedRtcp;

const RTCP_VERSION: u8 = 2;
const PT_SENDER_REPORT: u8 = 200;
const PT_BYE: u8 = 203;
const PT_APP: u8 = 204;
const ACK_TIMEOUT_APP_NAME: &[u8; 4] = b"qtak";

/// One decoded item of an inbound compound RTCP datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum RtcpReport {
    ReceiverReport(ReceiverReport),
    /// Reliable-UDP acknowledgement.
    Ack(AckReport),
    /// Server-specific APP packet carrying client playback statistics.
    ClientStats(ClientStats),
    /// SDES, BYE or anything else the engine has no use for.
    Other { packet_type: u8 },
}

/// A decoded datagram as handed to [`Session::process_rtcp`](crate::session::Session::process_rtcp).
pub type DecodedRtcp = Vec<Result<RtcpReport, MalformedRtcp>>;

/// Receiver report block for this stream (RFC 3550 §6.4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiverReport {
    /// SSRC of the reporting client.
    pub ssrc: u32,
    pub fraction_lost: u8,
    pub cumulative_lost: u32,
    pub jitter: u32,
}

/// Acknowledgement of `seq` plus up to 32 following sequence numbers.
///
/// Bit `n` of `mask`, counted from the most significant bit, acknowledges
/// `seq + n + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckReport {
    pub seq: u16,
    pub mask: u32,
    pub mask_bits: u8,
}

impl AckReport {
    pub fn single(seq: u16) -> Self {
        Self {
            seq,
            mask: 0,
            mask_bits: 0,
        }
    }

    /// Every sequence number this report acknowledges.
    pub fn acked_sequences(&self) -> impl Iterator<Item = u16> + '_ {
        let bits = self.mask_bits.min(32) as u16;
        std::iter::once(self.seq).chain(
            (0..bits)
                .filter(|n| self.mask & (0x8000_0000u32 >> n) != 0)
                .map(|n| self.seq.wrapping_add(n + 1)),
        )
    }
}

/// Client playback statistics from the server APP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientStats {
    pub receiver_bitrate: u32,
    pub avg_late_ms: u16,
    pub percent_packets_lost: u16,
    pub avg_buffer_delay_ms: u16,
    pub is_getting_better: bool,
    pub is_getting_worse: bool,
    pub num_eyes: u32,
    pub num_eyes_active: u32,
    pub num_eyes_paused: u32,
    pub total_packets_received: u32,
    pub total_packets_dropped: u16,
    pub total_packets_lost: u16,
    pub client_buffer_fill: u16,
    pub frame_rate: u16,
    pub expected_frame_rate: u16,
    pub audio_dry_count: u16,
    /// Client buffer capacity in bytes.
    pub overbuffer_window_size: u32,
}

/// Fields of an outbound sender report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub client_ssrc: u32,
    /// 32.32 fixed-point seconds since 1900.
    pub ntp_timestamp: u64,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    /// Payload octets, excluding the 12-byte fixed RTP headers.
    pub payload_byte_count: u32,
    pub ack_timeout_ms: u32,
}

impl SenderReport {
    /// Serialize SR + ack-timeout APP, optionally followed by BYE.
    pub fn to_bytes(&self, with_bye: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(28 + 20 + 8);

        write_header(&mut buf, 0, PT_SENDER_REPORT, 6);
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        buf.extend_from_slice(&self.ntp_timestamp.to_be_bytes());
        buf.extend_from_slice(&self.rtp_timestamp.to_be_bytes());
        buf.extend_from_slice(&self.packet_count.to_be_bytes());
        buf.extend_from_slice(&self.payload_byte_count.to_be_bytes());

        write_header(&mut buf, 0, PT_APP, 4);
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        buf.extend_from_slice(ACK_TIMEOUT_APP_NAME);
        buf.extend_from_slice(&self.client_ssrc.to_be_bytes());
        buf.extend_from_slice(&self.ack_timeout_ms.to_be_bytes());

        if with_bye {
            write_header(&mut buf, 1, PT_BYE, 1);
            buf.extend_from_slice(&self.ssrc.to_be_bytes());
        }

        buf
    }
}

fn write_header(buf: &mut Vec<u8>, count: u8, packet_type: u8, words_less_one: u16) {
    buf.push((RTCP_VERSION << 6) | (count & 0x1f));
    buf.push(packet_type);
    buf.extend_from_slice(&words_less_one.to_be_bytes());
}

//! Outbound transports and the reliable-UDP resend seam.
//!
//! A stream hands finished RTP/RTCP packets to a [`PacketSink`]:
//!
//! - **UDP** ([`udp`]): plain and reliable UDP, one datagram per packet to
//!   the client's RTP/RTCP ports.
//!
//! - **Interleaved** ([`interleaved`]): RTP/RTCP multiplexed onto the RTSP
//!   TCP connection with `$` framing (RFC 2326 §10.12).
//!
//! Socket demultiplexing, RTSP and the reactor live outside the engine;
//! sinks only write.

pub mod interleaved;
pub mod udp;

use std::io;

use crate::bandwidth::BandwidthTracker;

pub use interleaved::InterleavedSink;
pub use udp::UdpSink;

/// Destination for one stream's packets.
///
/// Implementations must not block: a full socket buffer is reported as
/// `io::ErrorKind::WouldBlock`.
pub trait PacketSink: Send {
    fn send_rtp(&mut self, packet: &[u8]) -> io::Result<()>;

    fn send_rtcp(&mut self, packet: &[u8]) -> io::Result<()>;

    /// Resize the outbound buffer, called at Play from the movie bitrate.
    fn set_send_buffer_size(&mut self, _bytes: usize) {}
}

/// Retransmission bookkeeping for reliable UDP.
///
/// The engine decides what to send and gates on the congestion window; the
/// buffer tracks sent packets until acked, resends the ones whose RTO
/// expires, and feeds RTT samples and losses back into the tracker.
pub trait ResendBuffer: Send {
    /// Track a packet that was just sent. It stays eligible for resend for
    /// `age_limit_ms`.
    fn add_packet(&mut self, packet: &[u8], age_limit_ms: i64, now: i64);

    /// The client acknowledged `seq`.
    fn ack_packet(&mut self, seq: u16, now: i64, tracker: &mut BandwidthTracker);

    /// Resend every entry whose retransmit timeout has passed.
    fn resend_due_entries(
        &mut self,
        now: i64,
        tracker: &mut BandwidthTracker,
        sink: &mut dyn PacketSink,
    );

    /// Forget all outstanding packets, releasing their bytes from the window.
    fn clear(&mut self, tracker: &mut BandwidthTracker);
}

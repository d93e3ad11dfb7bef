/// Outgoing RTP fixed header state (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The sequence number wraps at 16 bits. The timestamp is derived from
/// media time and the payload clock rate, so producers work in
/// milliseconds and never touch RTP units directly.
#[derive(Debug)]
pub struct RtpHeader {
    pub pt: u8,
    pub ssrc: u32,
    clock_rate: u32,
    sequence: u16,
    timestamp: u32,
}

/// Size of the fixed header with no CSRCs.
pub const RTP_HEADER_LEN: usize = 12;

impl RtpHeader {
    pub fn new(pt: u8, ssrc: u32, clock_rate: u32) -> Self {
        tracing::trace!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            clock_rate,
            "RTP header state created"
        );
        Self {
            pt,
            ssrc,
            clock_rate,
            sequence: 0,
            timestamp: 0,
        }
    }

    /// SSRC chosen at random (RFC 3550 §8.1).
    pub fn with_random_ssrc(pt: u8, clock_rate: u32) -> Self {
        Self::new(pt, rand::random::<u32>(), clock_rate)
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Position the timestamp at `media_ms` of media time.
    pub fn set_media_time(&mut self, media_ms: i64) {
        let ticks = media_ms.max(0) as u64 * self.clock_rate as u64 / 1000;
        self.timestamp = ticks as u32;
    }

    /// Build one packet with a `payload_len`-byte filler payload and advance
    /// the sequence number.
    pub fn packet(&mut self, marker: bool, payload_len: usize) -> Vec<u8> {
        let mut packet = Vec::with_capacity(RTP_HEADER_LEN + payload_len);
        packet.push(2 << 6);
        packet.push(((marker as u8) << 7) | (self.pt & 0x7f));
        packet.extend_from_slice(&self.sequence.to_be_bytes());
        packet.extend_from_slice(&self.timestamp.to_be_bytes());
        packet.extend_from_slice(&self.ssrc.to_be_bytes());
        packet.resize(RTP_HEADER_LEN + payload_len, 0);

        self.sequence = self.sequence.wrapping_add(1);
        packet
    }
}

/// Sequence number of a serialized RTP packet.
pub fn sequence_of(packet: &[u8]) -> Option<u16> {
    packet.get(2..4).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> RtpHeader {
        RtpHeader::new(96, 0xAABBCCDD, 90_000)
    }

    #[test]
    fn fixed_fields() {
        let mut h = header();
        let p = h.packet(true, 100);
        assert_eq!(p.len(), 112);
        assert_eq!(p[0] >> 6, 2);
        assert_eq!(p[1], 0x80 | 96);
        assert_eq!(u32::from_be_bytes([p[8], p[9], p[10], p[11]]), 0xAABBCCDD);
    }

    #[test]
    fn sequence_wraps() {
        let mut h = header();
        h.sequence = u16::MAX;
        let p = h.packet(false, 0);
        assert_eq!(sequence_of(&p), Some(u16::MAX));
        assert_eq!(h.sequence(), 0);
    }

    #[test]
    fn media_time_to_timestamp() {
        let mut h = header();
        h.set_media_time(1500);
        assert_eq!(h.timestamp(), 135_000);
        let p = h.packet(false, 0);
        assert_eq!(u32::from_be_bytes([p[4], p[5], p[6], p[7]]), 135_000);
    }

    #[test]
    fn short_buffer_has_no_sequence() {
        assert_eq!(sequence_of(&[0x80, 96]), None);
    }
}

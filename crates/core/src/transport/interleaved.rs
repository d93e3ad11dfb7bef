use std::io::{self, Write};

use super::PacketSink;

/// Default outbound buffer before Play sizes it from the movie bitrate.
const DEFAULT_SEND_BUFFER_SIZE: usize = 64 * 1024;

/// Interleaved RTP/RTCP over the RTSP TCP connection (RFC 2326 §10.12).
///
/// ```text
/// +------+---------+----------------+-----------------+
/// | '$'  | channel | length (u16 BE)| packet          |
/// +------+---------+----------------+-----------------+
/// ```
///
/// Frames are queued in a bounded send buffer and flushed as the writer
/// accepts them. When the buffer cannot take another frame the write fails
/// with `WouldBlock`; a frame is never split across the accept decision, so
/// the byte stream stays well-framed.
pub struct InterleavedSink<W: Write + Send> {
    writer: W,
    rtp_channel: u8,
    rtcp_channel: u8,
    pending: Vec<u8>,
    capacity: usize,
}

impl<W: Write + Send> InterleavedSink<W> {
    /// RTCP rides on `rtp_channel + 1`.
    pub fn new(writer: W, rtp_channel: u8) -> Self {
        Self {
            writer,
            rtp_channel,
            rtcp_channel: rtp_channel.wrapping_add(1),
            pending: Vec::new(),
            capacity: DEFAULT_SEND_BUFFER_SIZE,
        }
    }

    pub fn send_buffer_size(&self) -> usize {
        self.capacity
    }

    /// Bytes accepted but not yet taken by the writer.
    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    /// Push queued bytes into the writer until it would block.
    pub fn flush_pending(&mut self) -> io::Result<()> {
        while !self.pending.is_empty() {
            match self.writer.write(&self.pending) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        self.writer.flush().or_else(|e| {
            if e.kind() == io::ErrorKind::WouldBlock {
                Ok(())
            } else {
                Err(e)
            }
        })
    }

    fn write_frame(&mut self, channel: u8, packet: &[u8]) -> io::Result<()> {
        let len = u16::try_from(packet.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "packet exceeds interleaved frame"))?;

        self.flush_pending()?;
        let frame_len = 4 + packet.len();
        if !self.pending.is_empty() && self.pending.len() + frame_len > self.capacity {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        self.pending.push(b'$');
        self.pending.push(channel);
        self.pending.extend_from_slice(&len.to_be_bytes());
        self.pending.extend_from_slice(packet);
        self.flush_pending()
    }
}

impl<W: Write + Send> PacketSink for InterleavedSink<W> {
    fn send_rtp(&mut self, packet: &[u8]) -> io::Result<()> {
        self.write_frame(self.rtp_channel, packet)
    }

    fn send_rtcp(&mut self, packet: &[u8]) -> io::Result<()> {
        self.write_frame(self.rtcp_channel, packet)
    }

    fn set_send_buffer_size(&mut self, bytes: usize) {
        tracing::debug!(bytes, "interleaved send buffer resized");
        self.capacity = bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts at most `budget` bytes, then would-block.
    struct Throttled {
        out: Vec<u8>,
        budget: usize,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.budget);
            self.out.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn frames_rtp_and_rtcp_channels() {
        let mut sink = InterleavedSink::new(Vec::new(), 2);
        sink.send_rtp(&[0xAA, 0xBB]).unwrap();
        sink.send_rtcp(&[0xCC]).unwrap();
        assert_eq!(
            sink.get_ref().as_slice(),
            &[b'$', 2, 0, 2, 0xAA, 0xBB, b'$', 3, 0, 1, 0xCC]
        );
    }

    #[test]
    fn full_buffer_would_block() {
        let writer = Throttled {
            out: Vec::new(),
            budget: 2,
        };
        let mut sink = InterleavedSink::new(writer, 0);
        sink.set_send_buffer_size(16);
        sink.send_rtp(&[0u8; 10]).unwrap();
        assert_eq!(sink.pending_bytes(), 12);
        let err = sink.send_rtp(&[0u8; 10]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(sink.pending_bytes(), 12);
    }

    #[test]
    fn oversized_packet_rejected() {
        let mut sink = InterleavedSink::new(Vec::new(), 0);
        let err = sink.send_rtp(&vec![0u8; 70_000]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn buffer_size_applied() {
        let mut sink = InterleavedSink::new(Vec::new(), 0);
        assert_eq!(sink.send_buffer_size(), DEFAULT_SEND_BUFFER_SIZE);
        sink.set_send_buffer_size(8192);
        assert_eq!(sink.send_buffer_size(), 8192);
    }
}

use crate::error::DeliveryError;
use crate::media::rtp::RtpHeader;
use crate::scheduler::PacketProducer;
use crate::session::PacketWriter;
use crate::stream::{OutgoingPacket, StreamId, WriteStatus};

/// Delay returned once every track has finished.
const FINISHED_DELAY_MS: i64 = 1000;

/// Retry delay when the write path blocked without a pacing hint.
const BLOCKED_RETRY_MS: i64 = 10;

/// Shape of one constant-bitrate track.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackConfig {
    pub payload_type: u8,
    pub clock_rate: u32,
    pub bitrate_bps: u32,
    /// Payload bytes per packet, excluding the RTP header.
    pub payload_size: usize,
    /// Media length; `None` runs forever.
    pub duration_ms: Option<i64>,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            payload_type: 96,
            clock_rate: 90_000,
            bitrate_bps: 500_000,
            payload_size: 1200,
            duration_ms: None,
        }
    }
}

impl TrackConfig {
    /// Media time between two packets; at least 1 ms.
    pub fn packet_interval_ms(&self) -> i64 {
        if self.bitrate_bps == 0 {
            return FINISHED_DELAY_MS;
        }
        ((self.payload_size as i64 * 8 * 1000) / self.bitrate_bps as i64).max(1)
    }
}

/// Per-track progress counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackStats {
    pub sent: u64,
    pub dropped: u64,
    pub blocked: u64,
}

struct Track {
    stream: StreamId,
    config: TrackConfig,
    header: RtpHeader,
    media_ms: i64,
    pending: Option<Vec<u8>>,
    finished: bool,
    stats: TrackStats,
}

impl Track {
    fn next_packet(&mut self) -> &[u8] {
        let (header, media_ms, size) = (&mut self.header, self.media_ms, self.config.payload_size);
        self.pending.get_or_insert_with(|| {
            header.set_media_time(media_ms);
            header.packet(false, size)
        })
    }
}

/// Constant-bitrate packet producer for soak runs and tests.
///
/// Each track emits fixed-size packets on a regular media-time grid,
/// anchored at the session's adjusted play time. A packet the write path
/// defers is offered again on the next call.
#[derive(Default)]
pub struct SyntheticSource {
    tracks: Vec<Track>,
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_track(mut self, stream: StreamId, config: TrackConfig) -> Self {
        self.add_track(stream, config);
        self
    }

    pub fn add_track(&mut self, stream: StreamId, config: TrackConfig) {
        self.tracks.push(Track {
            stream,
            config,
            header: RtpHeader::with_random_ssrc(config.payload_type, config.clock_rate),
            media_ms: 0,
            pending: None,
            finished: false,
            stats: TrackStats::default(),
        });
    }

    pub fn is_finished(&self) -> bool {
        self.tracks.iter().all(|t| t.finished)
    }

    pub fn stats(&self, stream: StreamId) -> Option<TrackStats> {
        self.tracks
            .iter()
            .find(|t| t.stream == stream)
            .map(|t| t.stats)
    }

    fn pump(track: &mut Track, writer: &mut PacketWriter<'_>, first: &mut bool) -> i64 {
        let now = writer.now();
        let base = writer.timing().adjusted_play_time;
        loop {
            if track.config.duration_ms.is_some_and(|d| track.media_ms >= d) {
                track.finished = true;
                return FINISHED_DELAY_MS;
            }
            let transmit_time = base + track.media_ms;
            let stream = track.stream;
            let mut packet = OutgoingPacket::rtp(track.next_packet(), transmit_time);
            if *first {
                packet = packet.starting_burst();
            }

            match writer.write(stream, packet) {
                Ok(status) => {
                    *first = false;
                    match status {
                        WriteStatus::Sent => track.stats.sent += 1,
                        WriteStatus::Dropped => track.stats.dropped += 1,
                    }
                    track.pending = None;
                    track.media_ms += track.config.packet_interval_ms();
                }
                Err(DeliveryError::WouldBlock { wakeup_at_ms }) => {
                    track.stats.blocked += 1;
                    return wakeup_at_ms.map_or(BLOCKED_RETRY_MS, |at| at - now);
                }
                Err(e) => {
                    tracing::warn!(stream = stream.0, error = %e, "track stopped");
                    track.finished = true;
                    return FINISHED_DELAY_MS;
                }
            }
        }
    }
}

impl PacketProducer for SyntheticSource {
    fn send_packets(&mut self, writer: &mut PacketWriter<'_>) -> i64 {
        let mut first = true;
        self.tracks
            .iter_mut()
            .filter(|t| !t.finished)
            .map(|t| Self::pump(t, writer, &mut first))
            .min()
            .unwrap_or(FINISHED_DELAY_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_from_bitrate() {
        let cfg = TrackConfig {
            bitrate_bps: 96_000,
            payload_size: 1200,
            ..Default::default()
        };
        assert_eq!(cfg.packet_interval_ms(), 100);
    }

    #[test]
    fn interval_never_zero() {
        let cfg = TrackConfig {
            bitrate_bps: u32::MAX,
            payload_size: 10,
            ..Default::default()
        };
        assert_eq!(cfg.packet_interval_ms(), 1);
    }

    #[test]
    fn pending_packet_is_reused() {
        let mut src = SyntheticSource::new().with_track(StreamId(0), TrackConfig::default());
        let track = &mut src.tracks[0];
        let a = track.next_packet().to_vec();
        let b = track.next_packet().to_vec();
        assert_eq!(a, b);
        assert_eq!(track.header.sequence(), 1);
    }
}

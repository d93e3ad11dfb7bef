//! End-to-end delivery: sessions driven by their scheduler on a manual clock.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use delivery::bandwidth::BandwidthTracker;
use delivery::media::rtp::{RtpHeader, sequence_of};
use delivery::media::{SyntheticSource, TrackConfig};
use delivery::stream::{AckReport, ClientStats, RtcpReport};
use delivery::{
    AtomicCounters, Clock, DeliveryError, DeliveryPrefs, DeliveryScheduler, ManualClock,
    NoCleanup, OutgoingPacket, PacketSink, PayloadKind, PlayParams, ResendBuffer, Schedule,
    SessionRegistry, StreamSetup, TransportKind, WriteStatus,
};

const START: i64 = 10_000_000;

#[derive(Clone, Default)]
struct Recorder {
    rtp: Arc<Mutex<Vec<Vec<u8>>>>,
    rtcp: Arc<Mutex<Vec<Vec<u8>>>>,
    buffer_size: Arc<Mutex<Option<usize>>>,
}

impl PacketSink for Recorder {
    fn send_rtp(&mut self, packet: &[u8]) -> io::Result<()> {
        self.rtp.lock().push(packet.to_vec());
        Ok(())
    }

    fn send_rtcp(&mut self, packet: &[u8]) -> io::Result<()> {
        self.rtcp.lock().push(packet.to_vec());
        Ok(())
    }

    fn set_send_buffer_size(&mut self, bytes: usize) {
        *self.buffer_size.lock() = Some(bytes);
    }
}

#[derive(Default)]
struct ResendLog {
    outstanding: HashMap<u16, (usize, i64)>,
    age_limits: Vec<i64>,
    sweeps: usize,
}

/// Keeps sent packets until acked and feeds acks back into the tracker.
#[derive(Clone, Default)]
struct FakeResender(Arc<Mutex<ResendLog>>);

impl ResendBuffer for FakeResender {
    fn add_packet(&mut self, packet: &[u8], age_limit_ms: i64, now: i64) {
        let mut log = self.0.lock();
        if let Some(seq) = sequence_of(packet) {
            log.outstanding.insert(seq, (packet.len(), now));
        }
        log.age_limits.push(age_limit_ms);
    }

    fn ack_packet(&mut self, seq: u16, now: i64, tracker: &mut BandwidthTracker) {
        if let Some((len, sent_at)) = self.0.lock().outstanding.remove(&seq) {
            tracker.add_rtt_sample((now - sent_at) as i32);
            tracker.empty_window(len as u32, true);
        }
    }

    fn resend_due_entries(&mut self, _now: i64, _tracker: &mut BandwidthTracker, _sink: &mut dyn PacketSink) {
        self.0.lock().sweeps += 1;
    }

    fn clear(&mut self, tracker: &mut BandwidthTracker) {
        let mut log = self.0.lock();
        for (_, (len, _)) in log.outstanding.drain() {
            tracker.empty_window(len as u32, true);
        }
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    counters: Arc<AtomicCounters>,
    registry: SessionRegistry,
}

impl Harness {
    fn new(prefs: DeliveryPrefs) -> Self {
        let clock = Arc::new(ManualClock::new(START));
        let counters = Arc::new(AtomicCounters::new());
        let registry = SessionRegistry::new(Arc::new(prefs), clock.clone(), counters.clone());
        Self {
            clock,
            counters,
            registry,
        }
    }
}

#[test]
fn tcp_session_streams_reports_and_tears_down() {
    let h = Harness::new(DeliveryPrefs::default());
    let session = h.registry.create_session();
    let ports = h.registry.allocate_server_ports().unwrap();
    let sink = Recorder::default();
    let id = session
        .add_stream(
            StreamSetup::new(TransportKind::Tcp, PayloadKind::Video).server_ports(ports),
            Box::new(sink.clone()),
            None,
        )
        .unwrap();

    // 1000-byte payloads at 800 kbit/s: one packet every 10 ms for 3 s
    let track = TrackConfig {
        bitrate_bps: 800_000,
        payload_size: 1000,
        duration_ms: Some(3000),
        ..Default::default()
    };
    session.set_packet_producer(Box::new(SyntheticSource::new().with_track(id, track)));
    session
        .play(PlayParams {
            start_offset_secs: 0.0,
            movie_avg_bitrate: 800_000,
        })
        .unwrap();
    // 800 kbit/s * 0.5 s = 50000 bytes -> 32768
    assert_eq!(*sink.buffer_size.lock(), Some(32_768));

    let mut sched = DeliveryScheduler::new(session.clone(), h.registry.clone(), Box::new(NoCleanup));
    match sched.run() {
        Schedule::After(ms) => assert!(ms > 0 && ms <= 550),
        other => panic!("unexpected schedule {other:?}"),
    }
    // everything due within the send-ahead lookahead went out at once
    assert!(sink.rtp.lock().len() >= 100);
    {
        let rtcp = sink.rtcp.lock();
        assert_eq!(rtcp.len(), 1);
        assert_eq!(rtcp[0][1], 200);
        assert_eq!(&rtcp[0][36..40], b"qtak");
    }

    for _ in 0..100 {
        h.clock.advance(50);
        assert_ne!(sched.run(), Schedule::Dispose);
    }
    {
        let rtp = sink.rtp.lock();
        assert_eq!(rtp.len(), 300);
        let first = sequence_of(&rtp[0]).unwrap();
        for (i, p) in rtp.iter().enumerate() {
            assert_eq!(sequence_of(p), Some(first.wrapping_add(i as u16)));
        }
    }
    let snap = session.snapshot();
    assert_eq!(snap.packets_sent, 300);
    assert_eq!(snap.streams[0].packet_count, 300);
    assert_eq!(snap.quality_level, 0);
    assert_eq!(h.counters.snapshot().rtp_packets, 300);
    assert_eq!(h.counters.snapshot().playing_sessions, 1);

    session.teardown();
    assert_eq!(sched.run(), Schedule::Dispose);
    assert!(h.registry.is_empty());
    {
        let rtcp = sink.rtcp.lock();
        let last = rtcp.last().unwrap();
        assert_eq!(last[last.len() - 7], 203);
    }
    // ports were handed back
    assert_eq!(h.registry.allocate_server_ports().unwrap(), ports);
    assert_eq!(h.counters.snapshot().playing_sessions, 0);

    drop(sched);
    drop(session);
    assert_eq!(h.counters.snapshot().sessions, 0);
}

#[test]
fn reliable_udp_is_gated_by_congestion_window() {
    let h = Harness::new(DeliveryPrefs::default());
    let session = h.registry.create_session();
    let resender = FakeResender::default();
    let log = resender.0.clone();
    let id = session
        .add_stream(
            StreamSetup::new(TransportKind::ReliableUdp, PayloadKind::Video),
            Box::new(Recorder::default()),
            Some(Box::new(resender)),
        )
        .unwrap();
    session.set_packet_producer(Box::new(SyntheticSource::new()));
    session.play(PlayParams::default()).unwrap();

    // slow start: one 1466-byte segment of window
    let mut header = RtpHeader::new(96, 1, 90_000);
    let packets: Vec<Vec<u8>> = (0..5).map(|_| header.packet(false, 488)).collect();
    let now = h.clock.now_ms();
    for p in &packets[..3] {
        assert_eq!(
            session.try_write(id, OutgoingPacket::rtp(p, now)).unwrap(),
            WriteStatus::Sent
        );
    }
    let err = session
        .try_write(id, OutgoingPacket::rtp(&packets[3], now))
        .unwrap_err();
    assert!(matches!(err, DeliveryError::WouldBlock { wakeup_at_ms: None }));
    assert_eq!(session.snapshot().congestion_window, 1466);

    {
        let log = log.lock();
        assert_eq!(log.outstanding.len(), 3);
        // video drop threshold with the default 1.5 s tolerance, on-time packets
        assert!(log.age_limits.iter().all(|&a| a == 1750));
        assert_eq!(log.sweeps, 4);
    }

    h.clock.advance(40);
    session
        .process_rtcp(id, vec![Ok(RtcpReport::Ack(AckReport::single(0)))])
        .unwrap();
    assert_eq!(log.lock().outstanding.len(), 2);
    let snap = session.snapshot();
    assert!(snap.congestion_window > 1466);
    assert_eq!(
        session
            .try_write(id, OutgoingPacket::rtp(&packets[3], h.clock.now_ms()))
            .unwrap(),
        WriteStatus::Sent
    );
}

#[test]
fn late_packets_are_dropped_and_session_thinned() {
    let h = Harness::new(DeliveryPrefs::default());
    let session = h.registry.create_session();
    let id = session
        .add_stream(
            StreamSetup::new(TransportKind::Tcp, PayloadKind::Audio),
            Box::new(Recorder::default()),
            None,
        )
        .unwrap();
    session.set_packet_producer(Box::new(SyntheticSource::new()));
    session.play(PlayParams::default()).unwrap();
    let play = START;
    let mut header = RtpHeader::new(0, 7, 8000);

    h.clock.set(play + 10);
    let p = header.packet(false, 160);
    assert_eq!(
        session.try_write(id, OutgoingPacket::rtp(&p, play + 10)).unwrap(),
        WriteStatus::Sent
    );

    // 2990 ms late: past the 2500 ms drop threshold
    h.clock.set(play + 3010);
    let p = header.packet(false, 160);
    assert_eq!(
        session.try_write(id, OutgoingPacket::rtp(&p, play + 20)).unwrap(),
        WriteStatus::Dropped
    );
    let snap = session.snapshot();
    assert_eq!(snap.quality_level, 5);
    assert_eq!(snap.streams[0].stale_packets_dropped, 1);
    assert_eq!(h.counters.snapshot().thinned_sessions, 1);

    // running early again: one level back per check interval
    let p = header.packet(false, 160);
    assert_eq!(
        session
            .try_write(id, OutgoingPacket::rtp(&p, play + 4010))
            .unwrap(),
        WriteStatus::Sent
    );
    assert_eq!(session.snapshot().quality_level, 4);
}

#[test]
fn client_stats_resize_overbuffer_window() {
    let h = Harness::new(DeliveryPrefs::default());
    let session = h.registry.create_session();
    let id = session
        .add_stream(
            StreamSetup::new(TransportKind::ReliableUdp, PayloadKind::Video),
            Box::new(Recorder::default()),
            Some(Box::new(FakeResender::default())),
        )
        .unwrap();
    let stats = ClientStats {
        overbuffer_window_size: 4000,
        receiver_bitrate: 300_000,
        ..Default::default()
    };
    session
        .process_rtcp(id, vec![Ok(RtcpReport::ClientStats(stats))])
        .unwrap();
    let snap = session.snapshot();
    assert_eq!(snap.streams[0].reception.client.receiver_bitrate, 300_000);
    assert!(snap.overbuffering);
    assert_eq!(snap.overbuffer_window_size, Some(4000));
}

#[test]
fn malformed_rtcp_stops_processing() {
    use delivery::error::{MalformedRtcp, MalformedRtcpKind};
    use delivery::stream::ReceiverReport;

    let h = Harness::new(DeliveryPrefs::default());
    let session = h.registry.create_session();
    let id = session
        .add_stream(
            StreamSetup::new(TransportKind::Udp, PayloadKind::Audio),
            Box::new(Recorder::default()),
            None,
        )
        .unwrap();
    let reports = vec![
        Err(MalformedRtcp {
            kind: MalformedRtcpKind::InvalidHeader,
        }),
        Ok(RtcpReport::ReceiverReport(ReceiverReport {
            ssrc: 99,
            ..Default::default()
        })),
    ];
    session.process_rtcp(id, reports).unwrap();
    assert_eq!(session.snapshot().streams[0].client_ssrc, 0);
}

#[test]
fn paused_session_idles_until_played_again() {
    let h = Harness::new(DeliveryPrefs::default());
    let session = h.registry.create_session();
    let sink = Recorder::default();
    let id = session
        .add_stream(
            StreamSetup::new(TransportKind::Udp, PayloadKind::Audio),
            Box::new(sink.clone()),
            None,
        )
        .unwrap();
    let track = TrackConfig {
        bitrate_bps: 64_000,
        payload_size: 160,
        ..Default::default()
    };
    session.set_packet_producer(Box::new(SyntheticSource::new().with_track(id, track)));
    session.play(PlayParams::default()).unwrap();
    let mut sched = DeliveryScheduler::new(session.clone(), h.registry.clone(), Box::new(NoCleanup));

    assert!(matches!(sched.run(), Schedule::After(_)));
    let sent = sink.rtp.lock().len();
    assert!(sent > 0);

    session.pause();
    h.clock.advance(1000);
    assert_eq!(sched.run(), Schedule::Idle);
    assert_eq!(sink.rtp.lock().len(), sent);
    assert_eq!(session.snapshot().current_bitrate_bps, 0);

    // resume half a second into the media
    session
        .play(PlayParams {
            start_offset_secs: 0.5,
            movie_avg_bitrate: 0,
        })
        .unwrap();
    assert!(session.has_pending_events());
    assert!(matches!(sched.run(), Schedule::After(_)));
    assert!(sink.rtp.lock().len() > sent);
}

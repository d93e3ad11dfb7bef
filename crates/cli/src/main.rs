use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use delivery::media::{SyntheticSource, TrackConfig};
use delivery::{
    AtomicCounters, DeliveryPrefs, DeliveryScheduler, NoCleanup, PayloadKind, PlayParams,
    SessionRegistry, StreamSetup, SystemClock, TaskRunner, TransportKind, UdpSink,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "rtp-deliver",
    about = "Drive synthetic RTP sessions through the delivery engine"
)]
struct Args {
    /// Receiver host
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// First RTP port; session N sends to port + 2N (RTCP one above)
    #[arg(long, short, default_value_t = 6970)]
    port: u16,

    /// Number of concurrent sessions
    #[arg(long, short, default_value_t = 1)]
    sessions: u16,

    /// Per-session bitrate in bits per second
    #[arg(long, short, default_value_t = 1_000_000)]
    bitrate: u32,

    /// RTP payload bytes per packet
    #[arg(long, default_value_t = 1200)]
    packet_size: usize,

    /// Run time in seconds
    #[arg(long, short, default_value_t = 30)]
    duration: u64,

    /// TOML file with delivery preferences
    #[arg(long, short)]
    config: Option<String>,
}

fn load_prefs(path: Option<&str>) -> Result<DeliveryPrefs, String> {
    let Some(path) = path else {
        return Ok(DeliveryPrefs::default());
    };
    let text = std::fs::read_to_string(path).map_err(|e| format!("{path}: {e}"))?;
    let prefs: DeliveryPrefs = toml::from_str(&text).map_err(|e| format!("{path}: {e}"))?;
    Ok(prefs.validate())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let prefs = match load_prefs(args.config.as_deref()) {
        Ok(prefs) => prefs,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    let clock = Arc::new(SystemClock);
    let counters = Arc::new(AtomicCounters::new());
    let registry = SessionRegistry::new(Arc::new(prefs), clock.clone(), counters.clone());
    let mut runner = TaskRunner::new(clock);
    if let Err(e) = runner.start() {
        eprintln!("Failed to start task runner: {e}");
        return ExitCode::FAILURE;
    }

    let track = TrackConfig {
        bitrate_bps: args.bitrate,
        payload_size: args.packet_size,
        duration_ms: Some(args.duration as i64 * 1000),
        ..Default::default()
    };

    let mut sessions = Vec::new();
    for n in 0..args.sessions {
        let Some(rtp_port) = n.checked_mul(2).and_then(|off| args.port.checked_add(off)) else {
            eprintln!("Port range overflows at session {n}");
            break;
        };
        let rtp = SocketAddr::new(args.host, rtp_port);
        let rtcp = SocketAddr::new(args.host, rtp_port.wrapping_add(1));

        let session = registry.create_session();
        let started = registry.allocate_server_ports().and_then(|ports| {
            let sink = UdpSink::bind(rtp, rtcp)?;
            let setup = StreamSetup::new(TransportKind::Udp, PayloadKind::Video).server_ports(ports);
            let id = session.add_stream(setup, Box::new(sink), None)?;
            session.set_packet_producer(Box::new(SyntheticSource::new().with_track(id, track)));
            session.play(PlayParams {
                start_offset_secs: 0.0,
                movie_avg_bitrate: args.bitrate,
            })
        });
        if let Err(e) = started {
            eprintln!("Session {n} failed to start: {e}");
            session.teardown();
        } else {
            println!("session {} -> {rtp}", session.id());
        }
        runner.spawn(DeliveryScheduler::new(
            session.clone(),
            registry.clone(),
            Box::new(NoCleanup),
        ));
        sessions.push(session);
    }

    let deadline = Instant::now() + Duration::from_secs(args.duration);
    while Instant::now() < deadline && runner.active() > 0 {
        thread::sleep(Duration::from_millis(200));
    }

    for session in &sessions {
        println!(
            "session {}: {:.1}% loss reported",
            session.id(),
            session.packet_loss_percent()
        );
        session.teardown();
    }
    let wind_down = Instant::now() + Duration::from_secs(2);
    while runner.active() > 0 && Instant::now() < wind_down {
        thread::sleep(Duration::from_millis(20));
    }
    runner.stop();

    let stats = counters.snapshot();
    println!(
        "sent {} packets ({} bytes), avg lateness {} ms, avg quality {:.2}",
        stats.rtp_packets,
        stats.rtp_bytes,
        stats.avg_lateness_ms(),
        stats.avg_quality()
    );
    ExitCode::SUCCESS
}

//! RTP packet construction and a synthetic media source.
//!
//! The engine is codec-agnostic: it paces and thins whatever packets a
//! [`PacketProducer`](crate::scheduler::PacketProducer) hands it. This
//! module supplies the pieces a producer needs:
//!
//! - [`rtp::RtpHeader`]: fixed header state (sequence, media-clock
//!   timestamp, SSRC).
//! - [`synthetic::SyntheticSource`]: constant-bitrate tracks on a regular
//!   media-time grid, used by the CLI soak driver and the integration tests.

pub mod rtp;
pub mod synthetic;

pub use synthetic::{SyntheticSource, TrackConfig, TrackStats};

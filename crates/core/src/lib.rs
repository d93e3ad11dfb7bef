pub mod bandwidth;
pub mod clock;
pub mod config;
pub mod error;
pub mod media;
pub mod overbuffer;
pub mod quality;
pub mod runner;
pub mod scheduler;
pub mod session;
pub mod stats;
pub mod stream;
pub mod transport;

pub use bandwidth::BandwidthTracker;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::DeliveryPrefs;
pub use error::{DeliveryError, Result};
pub use overbuffer::{OverbufferWindow, TransmitDecision};
pub use quality::{QualityController, ThinningParams};
pub use runner::{TaskRunner, Worker};
pub use scheduler::{
    CleanupStatus, CloseReason, DeliveryScheduler, NoCleanup, PacketProducer, Schedule,
    SessionCleanup,
};
pub use session::{
    Event, PacketWriter, PlayParams, Session, SessionRegistry, SessionSnapshot, SessionState,
};
pub use stats::{AtomicCounters, DeliveryCounters};
pub use stream::{
    OutgoingPacket, PayloadKind, StreamId, StreamSetup, TransportKind, WriteStatus,
};
pub use transport::{InterleavedSink, PacketSink, ResendBuffer, UdpSink};

//! Error types for the delivery engine.

use std::fmt;

/// Errors that can occur in the delivery engine.
///
/// Variants map to the failure classes of the packet pipeline:
///
/// - **Back-pressure**: [`WouldBlock`](Self::WouldBlock): session lock busy,
///   congestion or overbuffer window full, or the transport refused the write.
///   Never fatal; the caller retries on a later tick.
/// - **Transport**: [`Io`](Self::Io): socket/stream failures other than
///   would-block.
/// - **Session**: [`SessionNotFound`](Self::SessionNotFound),
///   [`SessionNotPlaying`](Self::SessionNotPlaying),
///   [`StreamNotFound`](Self::StreamNotFound),
///   [`NoPacketProducer`](Self::NoPacketProducer).
/// - **Setup**: [`PortRangeExhausted`](Self::PortRangeExhausted),
///   [`InvalidArgument`](Self::InvalidArgument).
///
/// Stale packets are not errors: they surface as
/// [`WriteStatus::Dropped`](crate::stream::WriteStatus::Dropped).
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transient back-pressure. `wakeup_at_ms` is the absolute clock time at
    /// which the write is worth retrying, when the pacer knows one.
    #[error("operation would block (retry at {wakeup_at_ms:?})")]
    WouldBlock { wakeup_at_ms: Option<i64> },

    /// No session with the given ID exists in the [`SessionRegistry`](crate::session::SessionRegistry).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Attempted to write media to a session that is not in the Playing state.
    #[error("session not in playing state: {0}")]
    SessionNotPlaying(String),

    /// The stream index does not belong to the session.
    #[error("stream {index} not found in session {session_id}")]
    StreamNotFound { session_id: String, index: usize },

    /// Play was requested before a packet producer was attached.
    #[error("no packet producer attached to session: {0}")]
    NoPacketProducer(String),

    /// Server-side RTP/RTCP port allocation found no free pair.
    #[error("port range exhausted ({min}-{max})")]
    PortRangeExhausted { min: u16, max: u16 },

    /// A caller-supplied argument is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl DeliveryError {
    /// Back-pressure without a pacing hint.
    pub fn would_block() -> Self {
        Self::WouldBlock { wakeup_at_ms: None }
    }

    /// Whether this error is transient back-pressure.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock { .. })
    }

    /// Map transport errors, folding `io::ErrorKind::WouldBlock` into
    /// [`WouldBlock`](Self::WouldBlock).
    pub fn from_transport(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::WouldBlock {
            Self::would_block()
        } else {
            Self::Io(err)
        }
    }
}

/// A decoded RTCP item that failed structural validation.
///
/// Produced by the external RTCP parser; processing of the enclosing
/// datagram stops at the first one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRtcp {
    /// What the parser rejected.
    pub kind: MalformedRtcpKind,
}

/// Specific kind of RTCP validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedRtcpKind {
    /// Common header had the wrong version or a length past the datagram end.
    InvalidHeader,
    /// Receiver report block was truncated.
    InvalidReceiverReport,
    /// Application-defined packet could not be decoded.
    InvalidApp,
}

impl fmt::Display for MalformedRtcpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHeader => write!(f, "invalid RTCP header"),
            Self::InvalidReceiverReport => write!(f, "invalid receiver report"),
            Self::InvalidApp => write!(f, "invalid APP packet"),
        }
    }
}

impl fmt::Display for MalformedRtcp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed RTCP: {}", self.kind)
    }
}

impl std::error::Error for MalformedRtcp {}

/// Convenience alias for `Result<T, DeliveryError>`.
pub type Result<T> = std::result::Result<T, DeliveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_would_block_maps_to_back_pressure() {
        let err = DeliveryError::from_transport(std::io::ErrorKind::WouldBlock.into());
        assert!(err.is_would_block());
    }

    #[test]
    fn other_io_errors_stay_io() {
        let err = DeliveryError::from_transport(std::io::ErrorKind::ConnectionReset.into());
        assert!(matches!(err, DeliveryError::Io(_)));
    }

    #[test]
    fn malformed_display() {
        let err = MalformedRtcp {
            kind: MalformedRtcpKind::InvalidReceiverReport,
        };
        assert_eq!(err.to_string(), "malformed RTCP: invalid receiver report");
    }
}

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use super::PacketSink;
use crate::error::Result;

/// UDP sink for one stream.
///
/// Sends RTP to the client's RTP port and RTCP to its RTCP port. The socket
/// can be shared across streams and sessions; it is put in non-blocking mode
/// so a full send buffer surfaces as would-block instead of stalling the
/// worker.
pub struct UdpSink {
    socket: Arc<UdpSocket>,
    rtp_addr: SocketAddr,
    rtcp_addr: SocketAddr,
}

impl UdpSink {
    /// Bind an ephemeral UDP socket for one stream.
    pub fn bind(rtp_addr: SocketAddr, rtcp_addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        Ok(Self::with_socket(Arc::new(socket), rtp_addr, rtcp_addr))
    }

    /// Send through an existing (shared) socket.
    pub fn with_socket(socket: Arc<UdpSocket>, rtp_addr: SocketAddr, rtcp_addr: SocketAddr) -> Self {
        Self {
            socket,
            rtp_addr,
            rtcp_addr,
        }
    }

    pub fn rtp_addr(&self) -> SocketAddr {
        self.rtp_addr
    }

    pub fn rtcp_addr(&self) -> SocketAddr {
        self.rtcp_addr
    }
}

impl PacketSink for UdpSink {
    fn send_rtp(&mut self, packet: &[u8]) -> io::Result<()> {
        self.socket.send_to(packet, self.rtp_addr).map(|_| ())
    }

    fn send_rtcp(&mut self, packet: &[u8]) -> io::Result<()> {
        self.socket.send_to(packet, self.rtcp_addr).map(|_| ())
    }
}

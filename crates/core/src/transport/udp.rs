use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use crate::error::Result;

/// Shared UDP socket for outbound RTP.
///
/// Address-only: callers resolve sessions to client addresses before
/// calling [`send_to`](Self::send_to). Clones share one socket.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind an ephemeral socket on all interfaces.
    pub fn bind() -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        tracing::debug!(local = %socket.local_addr()?, "RTP socket bound");
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn send_to(&self, payload: &[u8], addr: SocketAddr) -> Result<usize> {
        Ok(self.socket.send_to(payload, addr)?)
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }
}

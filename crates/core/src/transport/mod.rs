//! Network plumbing for RTSP signalling and RTP media.
//!
//! - [`tcp`]: non-blocking RTSP connections, polled by the event loop.
//! - [`tunnel`]: RTSP carried over a pair of HTTP connections.
//! - [`udp`]: the single socket all outbound RTP leaves from.
//!
//! Nothing here blocks or spawns threads; the [`RtspServer`](crate::server::RtspServer)
//! drives every socket from the event-loop thread.

pub mod tcp;
pub mod tunnel;
pub mod udp;

pub use tcp::Connection;
pub use tunnel::HttpTunnel;
pub use udp::UdpTransport;

//! RTSP protocol implementation (RFC 2326).
//!
//! Parses request heads, routes methods to the published camera streams,
//! builds responses and generates SDP. Transport-agnostic: the same
//! [`MethodHandler`] serves plain TCP connections and HTTP tunnels.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! RTSP messages follow HTTP/1.1 syntax with a different method set:
//!
//! ```text
//! DESCRIBE rtsp://server:8554/cam0 RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Accept: application/sdp\r\n
//! \r\n
//! ```
//!
//! ## Supported methods
//!
//! | Method | RFC section | Purpose |
//! |--------|-------------|---------|
//! | OPTIONS | §10.1 | Capability discovery |
//! | DESCRIBE | §10.2 | Retrieve SDP session description |
//! | SETUP | §10.4 | Negotiate UDP unicast transport |
//! | PLAY | §10.5 | Start pulling frames for the stream |
//! | PAUSE | §10.6 | Stop pulling once nobody plays |
//! | TEARDOWN | §10.7 | Destroy session |
//! | GET_PARAMETER | §10.8 | Keepalive / parameter query |

pub mod handler;
pub mod request;
pub mod response;
pub mod sdp;

pub use handler::MethodHandler;
pub use request::RtspRequest;
pub use response::RtspResponse;

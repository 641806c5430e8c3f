//! Error types for the camera streaming library.

use std::fmt;

/// Errors that can occur while publishing camera streams.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse): malformed RTSP messages.
/// - **Transport**: [`Io`](Self::Io), [`Bind`](Self::Bind): socket failures.
///   `Bind` is the one startup-fatal condition: without a listening socket
///   there is nothing to serve.
/// - **Session**: [`SessionNotFound`](Self::SessionNotFound).
/// - **Lifecycle**: [`AlreadyRunning`](Self::AlreadyRunning),
///   [`DuplicateCamera`](Self::DuplicateCamera), [`Closed`](Self::Closed).
/// - **Producer**: [`Producer`](Self::Producer): an encoder failed to start.
///
/// Conditions inside the frame bridge (empty queue, truncation, overflow)
/// are never errors; they surface through counters and log events.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// No session with the given ID exists in the [`SessionManager`](crate::session::SessionManager).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Cameras can only be added before [`CameraServer::run`](crate::CameraServer::run).
    #[error("server already running")]
    AlreadyRunning,

    /// The server has been shut down and cannot be reused.
    #[error("server has been shut down")]
    Closed,

    /// Two producers were registered under the same stream name.
    #[error("duplicate camera stream name: {0}")]
    DuplicateCamera(String),

    /// An encoded-frame producer failed to start.
    #[error("producer for camera '{camera}' failed: {reason}")]
    Producer { camera: String, reason: String },

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
        }
    }
}

/// Convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

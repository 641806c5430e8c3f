use std::time::Duration;

/// Default RTSP listening port (RFC 2326 §3.2 registers 554; 8554 avoids root).
pub const DEFAULT_RTSP_PORT: u16 = 8554;

/// Default upper bound for one outbound RTP datagram, header included.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1400;

/// Default capacity of the buffer a consumer hands to a bridge.
///
/// Frames larger than this are truncated. Sized for 1080p keyframes at
/// typical surveillance bitrates; raise it if the "max frame size" figure
/// logged on shutdown exceeds it.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 300_000;

/// Default bound on staged frames per camera (0 means unbounded).
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 30;

/// Server-wide settings shared by the orchestrator, the RTSP server and
/// every frame bridge.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface the RTSP (and tunnelling) listeners bind to.
    pub bind_host: String,
    /// RTSP listening port. `0` lets the OS pick one.
    pub rtsp_port: u16,
    /// Optional secondary port for RTSP-over-HTTP tunnelling.
    pub http_tunnel_port: Option<u16>,
    /// Maximum size of one outbound RTP packet in bytes.
    pub max_packet_size: usize,
    /// Capacity of each consumer's frame buffer in bytes.
    pub max_buffer_size: usize,
    /// Maximum staged frames per bridge before the oldest is discarded.
    pub max_pending_frames: usize,
    /// Upper bound on how long the event loop sleeps waiting for work.
    pub poll_interval: Duration,
    /// Public host advertised in access URLs and SDP `o=`/`c=` lines.
    /// When `None`, the host is inferred from the local interface.
    pub public_host: Option<String>,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field (`o=... <session-id> ...`).
    pub sdp_session_id: String,
    /// SDP origin session version field (`o=... ... <session-version> ...`).
    pub sdp_session_version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            rtsp_port: DEFAULT_RTSP_PORT,
            http_tunnel_port: None,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            poll_interval: Duration::from_millis(10),
            public_host: None,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn bind_host(mut self, host: impl Into<String>) -> Self {
        self.bind_host = host.into();
        self
    }

    pub fn rtsp_port(mut self, port: u16) -> Self {
        self.rtsp_port = port;
        self
    }

    /// Enable RTSP-over-HTTP tunnelling on a secondary port.
    pub fn http_tunnel_port(mut self, port: u16) -> Self {
        self.http_tunnel_port = Some(port);
        self
    }

    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    pub fn max_pending_frames(mut self, frames: usize) -> Self {
        self.max_pending_frames = frames;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn public_host(mut self, host: impl Into<String>) -> Self {
        self.public_host = Some(host.into());
        self
    }

    /// `host:port` string for the RTSP listener.
    pub fn rtsp_bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.rtsp_port)
    }
}

/// Immutable description of one camera stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraConfig {
    /// Stream name, used as the mount path (`rtsp://host:port/<name>`).
    pub name: String,
    /// Free-form description published in the SDP `i=` line.
    pub description: String,
    /// Target encoder bitrate in kbit/s.
    pub bitrate_kbps: u32,
    /// Nominal frame rate.
    pub fps: u32,
}

impl CameraConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: "live camera stream".to_string(),
            bitrate_kbps: 1000,
            fps: 30,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn bitrate_kbps(mut self, kbps: u32) -> Self {
        self.bitrate_kbps = kbps;
        self
    }

    pub fn fps(mut self, fps: u32) -> Self {
        self.fps = fps.max(1);
        self
    }

    /// Mount path for this camera (`cam0` → `/cam0`).
    pub fn mount_path(&self) -> String {
        format!("/{}", self.name.trim_start_matches('/'))
    }

    /// RTP timestamp increment for one nominal frame at 90 kHz.
    pub fn frame_duration_ticks(&self) -> u32 {
        90_000 / self.fps.max(1)
    }
}

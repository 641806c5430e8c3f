use std::net::{IpAddr, SocketAddr, TcpListener, UdpSocket};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::event_loop::IoSource;
use crate::mount::{Mount, MountRegistry};
use crate::protocol::MethodHandler;
use crate::session::SessionManager;
use crate::transport::{Connection, HttpTunnel, UdpTransport, tcp};

const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// RTSP server driven by the event loop.
///
/// Owns the listening socket(s), every client connection, the session
/// registry and the published camera streams. Registered with the loop as
/// an [`IoSource`]; each poll accepts new clients, serves complete requests
/// and reclaims sessions that went silent.
pub struct RtspServer {
    config: Arc<ServerConfig>,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    tunnel: Option<HttpTunnel>,
    connections: Vec<Connection>,
    sessions: SessionManager,
    mounts: MountRegistry,
    udp: UdpTransport,
    rtp_port: u16,
    last_reap: Instant,
}

impl RtspServer {
    /// Bind the RTSP listener on `config.bind_host:config.rtsp_port`.
    ///
    /// Port `0` picks a free port; see [`local_addr`](Self::local_addr).
    pub fn bind(config: Arc<ServerConfig>) -> Result<Self> {
        let addr = config.rtsp_bind_addr();
        let listener = TcpListener::bind(&addr).map_err(|source| Error::Bind {
            addr: addr.clone(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let udp = UdpTransport::bind()?;
        let rtp_port = udp.local_port()?;

        tracing::info!(addr = %local_addr, "RTSP server listening");
        Ok(Self {
            config,
            listener: Some(listener),
            local_addr,
            tunnel: None,
            connections: Vec::new(),
            sessions: SessionManager::new(),
            mounts: MountRegistry::new(),
            udp,
            rtp_port,
            last_reap: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept RTSP-over-HTTP tunnels on a secondary port.
    pub fn enable_http_tunneling(&mut self, port: u16) -> Result<SocketAddr> {
        let tunnel = HttpTunnel::bind(
            port,
            self.sessions.clone(),
            self.mounts.clone(),
            self.config.clone(),
            self.rtp_port,
        )?;
        let addr = tunnel.local_addr();
        self.tunnel = Some(tunnel);
        tracing::info!(%addr, "RTSP-over-HTTP tunnelling enabled");
        Ok(addr)
    }

    pub fn tunnel_addr(&self) -> Option<SocketAddr> {
        self.tunnel.as_ref().map(HttpTunnel::local_addr)
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn udp(&self) -> &UdpTransport {
        &self.udp
    }

    pub fn mounts(&self) -> &MountRegistry {
        &self.mounts
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_closed(&self) -> bool {
        self.listener.is_none()
    }

    /// Make a stream reachable at its mount path.
    pub fn publish(&mut self, mount: Mount) -> Rc<Mount> {
        let mount = self.mounts.add(mount);
        tracing::debug!(path = %mount.path(), "stream published");
        mount
    }

    /// `rtsp://<host>:<port>/<name>` for a published stream.
    pub fn access_url(&self, mount: &Mount) -> String {
        format!("rtsp://{}:{}{}", self.url_host(), self.local_addr.port(), mount.path())
    }

    fn url_host(&self) -> String {
        if let Some(host) = &self.config.public_host {
            return host.clone();
        }
        match self.local_addr.ip() {
            ip if ip.is_unspecified() => outbound_ip()
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            ip => ip.to_string(),
        }
    }

    pub fn get_viewers(&self) -> Vec<Viewer> {
        self.sessions
            .get_playing_sessions()
            .iter()
            .filter_map(|session| {
                session.get_transport().map(|transport| Viewer {
                    session_id: session.id.clone(),
                    uri: session.uri.clone(),
                    client_addr: transport.client_addr.to_string(),
                    client_rtp_port: transport.client_rtp_port,
                })
            })
            .collect()
    }

    /// Stop listening, drop every client and detach every stream from its
    /// frame bridge. Idempotent.
    pub fn close(&mut self) {
        if self.listener.take().is_none() {
            return;
        }

        if let Some(mut tunnel) = self.tunnel.take() {
            tunnel.close();
        }
        for mut conn in self.connections.drain(..) {
            conn.cleanup("server shutting down");
        }
        self.mounts.close_all();
        let dropped = self.sessions.clear();
        tracing::info!(addr = %self.local_addr, dropped_sessions = dropped, "RTSP server closed");
    }

    fn accept_connections(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };
        for (stream, peer) in tcp::accept_pending(listener) {
            let handler = MethodHandler::new(
                self.sessions.clone(),
                peer,
                self.mounts.clone(),
                self.config.clone(),
                self.rtp_port,
            );
            self.connections.push(Connection::new(stream, peer, handler));
        }
    }

    fn serve_connections(&mut self) {
        let mut i = 0;
        while i < self.connections.len() {
            match self.connections[i].poll() {
                Some(reason) => {
                    let mut conn = self.connections.swap_remove(i);
                    conn.cleanup(reason);
                }
                None => i += 1,
            }
        }
    }

    fn reap_expired_sessions(&mut self) {
        if self.last_reap.elapsed() < REAP_INTERVAL {
            return;
        }
        self.last_reap = Instant::now();

        for id in self.sessions.expired_sessions() {
            self.mounts.unsubscribe_all(&id);
            self.sessions.remove_session(&id);
            for conn in &mut self.connections {
                conn.handler_mut().forget_session(&id);
            }
            if let Some(tunnel) = &mut self.tunnel {
                tunnel.forget_session(&id);
            }
            tracing::info!(session_id = %id, "session timed out");
        }
    }
}

impl IoSource for RtspServer {
    fn poll_io(&mut self) {
        if self.is_closed() {
            return;
        }
        self.accept_connections();
        self.serve_connections();
        if let Some(tunnel) = &mut self.tunnel {
            tunnel.poll();
        }
        self.reap_expired_sessions();
    }
}

impl Drop for RtspServer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Address of the interface that routes to the outside world. Connecting a
/// UDP socket sends nothing; it only selects a route.
fn outbound_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

/// A client currently receiving media.
#[derive(Debug, Clone)]
pub struct Viewer {
    pub session_id: String,
    pub uri: String,
    pub client_addr: String,
    pub client_rtp_port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::FrameBridge;
    use crate::config::CameraConfig;
    use crate::event_loop::EventLoop;
    use crate::fanout::StreamFanout;
    use crate::media::h264::H264Packetizer;
    use crate::producer::PushProducer;

    fn local_config() -> Arc<ServerConfig> {
        Arc::new(ServerConfig::default().bind_host("127.0.0.1").rtsp_port(0))
    }

    #[test]
    fn bind_reports_actual_port() {
        let server = RtspServer::bind(local_config()).unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert!(!server.is_closed());
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn bind_conflict_is_reported() {
        let first = RtspServer::bind(local_config()).unwrap();
        let config = ServerConfig::default()
            .bind_host("127.0.0.1")
            .rtsp_port(first.local_addr().port());
        match RtspServer::bind(Arc::new(config)) {
            Err(Error::Bind { addr, .. }) => assert!(addr.starts_with("127.0.0.1:")),
            other => panic!("expected bind error, got {:?}", other.map(|s| s.local_addr())),
        }
    }

    #[test]
    fn publish_and_access_url() {
        let event_loop = EventLoop::new(Duration::from_millis(5));
        let mut server = RtspServer::bind(local_config()).unwrap();

        let camera = CameraConfig::new("cam0");
        let (producer, _feeder) = PushProducer::new(camera.clone());
        let bridge = FrameBridge::create(Box::new(producer), &event_loop, 0).unwrap();
        let fanout = StreamFanout::new(
            bridge.clone(),
            Box::new(H264Packetizer::with_random_ssrc(96)),
            server.sessions().clone(),
            server.udp().clone(),
            1024,
        );
        let mount = server.publish(Mount::new(camera, fanout));

        let url = server.access_url(&mount);
        assert_eq!(url, format!("rtsp://127.0.0.1:{}/cam0", server.local_addr().port()));

        server.close();
        server.close();
        assert!(server.is_closed());
        assert!(server.mounts().is_empty());
        assert!(!bridge.borrow().is_attached());
    }

    #[test]
    fn public_host_overrides_url() {
        let config = ServerConfig::default()
            .bind_host("127.0.0.1")
            .rtsp_port(0)
            .public_host("camera.example");
        let server = RtspServer::bind(Arc::new(config)).unwrap();
        assert_eq!(server.url_host(), "camera.example");
    }

    #[test]
    fn tunnel_is_optional() {
        let mut server = RtspServer::bind(local_config()).unwrap();
        assert!(server.tunnel_addr().is_none());
        let addr = server.enable_http_tunneling(0).unwrap();
        assert_eq!(server.tunnel_addr(), Some(addr));
    }
}

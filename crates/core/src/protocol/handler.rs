use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::mount::MountRegistry;
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp;
use crate::session::transport::TransportRequest;
use crate::session::{Session, SessionManager, SessionState, Transport};

const PUBLIC_METHODS: &str = "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER";

/// Answers RTSP requests arriving on one client connection (plain TCP or
/// HTTP tunnel) and remembers the sessions it created so they can be
/// released when the connection goes away.
pub struct MethodHandler {
    session_manager: SessionManager,
    mounts: MountRegistry,
    client_addr: SocketAddr,
    config: Arc<ServerConfig>,
    rtp_port: u16,
    session_ids: Vec<String>,
}

impl MethodHandler {
    pub fn new(
        session_manager: SessionManager,
        client_addr: SocketAddr,
        mounts: MountRegistry,
        config: Arc<ServerConfig>,
        rtp_port: u16,
    ) -> Self {
        MethodHandler {
            session_manager,
            mounts,
            client_addr,
            config,
            rtp_port,
            session_ids: Vec::new(),
        }
    }

    pub fn session_ids(&self) -> &[String] {
        &self.session_ids
    }

    pub fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0");

        let response = match request.method.as_str() {
            "OPTIONS" => self.handle_options(),
            "DESCRIBE" => self.handle_describe(&request.uri),
            "SETUP" => self.handle_setup(request),
            "PLAY" => self.handle_play(request),
            "PAUSE" => self.handle_pause(request),
            "TEARDOWN" => self.handle_teardown(request),
            "GET_PARAMETER" => self.handle_get_parameter(request),
            _ => {
                tracing::warn!(method = %request.method, %cseq, "unsupported RTSP method");
                RtspResponse::not_implemented().add_header("Public", PUBLIC_METHODS)
            }
        };
        response.add_header("CSeq", cseq)
    }

    /// Drop every session this connection created. Returns how many existed.
    pub fn release_sessions(&mut self) -> usize {
        let orphaned = std::mem::take(&mut self.session_ids);
        for id in &orphaned {
            self.mounts.unsubscribe_all(id);
        }
        self.session_manager.remove_sessions(&orphaned)
    }

    /// Forget a session removed elsewhere (e.g. expired).
    pub fn forget_session(&mut self, id: &str) {
        self.session_ids.retain(|s| s != id);
    }

    fn handle_options(&self) -> RtspResponse {
        RtspResponse::ok().add_header("Public", PUBLIC_METHODS)
    }

    /// Host for SDP `o=`/`c=`: configured public host, else the host the
    /// client addressed, else the client's own address.
    fn host_from_uri_or_client(&self, uri: &str) -> String {
        if let Some(host) = &self.config.public_host {
            return host.clone();
        }

        let from_uri = uri
            .strip_prefix("rtsp://")
            .or_else(|| uri.strip_prefix("rtsps://"))
            .and_then(|rest| rest.split('/').next())
            .and_then(|host_port| host_port.split(':').next())
            .map(str::trim)
            .filter(|host| !host.is_empty());

        match from_uri {
            Some(host) => host.to_string(),
            None => self.client_addr.ip().to_string(),
        }
    }

    fn handle_describe(&self, uri: &str) -> RtspResponse {
        let Some(mount) = self.mounts.resolve_from_uri(uri) else {
            tracing::warn!(uri, "DESCRIBE for unknown stream");
            return RtspResponse::not_found();
        };

        let host = self.host_from_uri_or_client(uri);
        let body = sdp::generate_sdp(&mount, &host, &self.config);
        let base = if uri.ends_with('/') {
            uri.to_string()
        } else {
            format!("{uri}/")
        };

        tracing::debug!(uri, mount = %mount.path(), "DESCRIBE");
        RtspResponse::ok()
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", &base)
            .with_body(body)
    }

    fn handle_setup(&mut self, request: &RtspRequest) -> RtspResponse {
        let Some(mount) = self.mounts.resolve_from_uri(&request.uri) else {
            tracing::warn!(uri = %request.uri, "SETUP for unknown stream");
            return RtspResponse::not_found();
        };

        let Some(transport_header) = request.get_header("Transport") else {
            tracing::warn!("SETUP missing Transport header");
            return RtspResponse::bad_request();
        };

        let (client_rtp_port, client_rtcp_port) = match TransportRequest::parse(transport_header) {
            Some(TransportRequest::Udp {
                client_rtp_port,
                client_rtcp_port,
            }) => (client_rtp_port, client_rtcp_port),
            Some(other) => {
                tracing::warn!(transport = %transport_header, kind = ?other, "unsupported transport requested");
                return RtspResponse::unsupported_transport().add_header(
                    "Unsupported",
                    "only RTP/AVP over UDP unicast is served, e.g. ffplay -rtsp_transport udp <url>",
                );
            }
            None => {
                tracing::warn!(transport = %transport_header, "SETUP invalid Transport header");
                return RtspResponse::bad_request();
            }
        };

        let existing = request
            .session_id()
            .and_then(|id| self.session_manager.get_session(id));
        let session = match existing {
            Some(session) => session,
            None => {
                let session = self.session_manager.create_session(&request.uri);
                self.session_ids.push(session.id.clone());
                session
            }
        };

        let transport = Transport {
            client_rtp_port,
            client_rtcp_port,
            // Every stream leaves from the one shared RTP socket; no RTCP is sent.
            server_rtp_port: self.rtp_port,
            server_rtcp_port: self.rtp_port.saturating_add(1),
            client_addr: SocketAddr::new(self.client_addr.ip(), client_rtp_port),
        };
        let transport_value = transport.header_value();
        session.set_transport(transport);
        session.touch();
        mount.subscribe(&session.id);

        tracing::info!(
            session_id = %session.id,
            mount = %mount.path(),
            client = %self.client_addr.ip(),
            client_rtp_port,
            "session set up"
        );

        RtspResponse::ok()
            .add_header("Transport", &transport_value)
            .add_header("Session", &session.session_header_value())
    }

    fn session_for(&self, request: &RtspRequest) -> Result<Arc<Session>, RtspResponse> {
        let Some(id) = request.session_id() else {
            tracing::warn!(method = %request.method, "missing Session header");
            return Err(RtspResponse::session_not_found());
        };
        self.session_manager.lookup(id).map_err(|e| {
            tracing::warn!(method = %request.method, error = %e, "unknown session");
            RtspResponse::session_not_found()
        })
    }

    fn handle_play(&mut self, request: &RtspRequest) -> RtspResponse {
        let session = match self.session_for(request) {
            Ok(session) => session,
            Err(response) => return response,
        };
        let Some(mount) = self.mounts.resolve_from_uri(&session.uri) else {
            return RtspResponse::not_found();
        };

        let rtp_info = format!(
            "url={};seq={};rtptime={}",
            session.uri,
            mount.next_sequence(),
            mount.next_rtp_timestamp()
        );
        session.set_state(SessionState::Playing);
        mount.refresh_delivery();
        tracing::info!(session_id = %session.id, mount = %mount.path(), "session playing");

        RtspResponse::ok()
            .add_header("Session", &session.session_header_value())
            .add_header("Range", "npt=0.000-")
            .add_header("RTP-Info", &rtp_info)
    }

    fn handle_pause(&mut self, request: &RtspRequest) -> RtspResponse {
        let session = match self.session_for(request) {
            Ok(session) => session,
            Err(response) => return response,
        };
        if session.get_state() == SessionState::Ready {
            return RtspResponse::method_not_valid_in_state();
        }

        session.set_state(SessionState::Paused);
        if let Some(mount) = self.mounts.resolve_from_uri(&session.uri) {
            mount.refresh_delivery();
        }
        tracing::info!(session_id = %session.id, "session paused");

        RtspResponse::ok().add_header("Session", &session.session_header_value())
    }

    fn handle_teardown(&mut self, request: &RtspRequest) -> RtspResponse {
        let Some(id) = request.session_id() else {
            return RtspResponse::session_not_found();
        };

        match self.session_manager.remove_session(id) {
            Some(_) => {
                self.mounts.unsubscribe_all(id);
                self.forget_session(id);
                tracing::info!(session_id = id, "session torn down");
                RtspResponse::ok()
            }
            None => {
                tracing::warn!(session_id = id, "TEARDOWN for unknown session");
                RtspResponse::session_not_found()
            }
        }
    }

    /// Keepalive used by most players (RFC 2326 §10.8).
    fn handle_get_parameter(&self, request: &RtspRequest) -> RtspResponse {
        let response = RtspResponse::ok();
        match request.session_id() {
            Some(id) => match self.session_manager.lookup(id) {
                Ok(session) => response.add_header("Session", &session.session_header_value()),
                Err(_) => RtspResponse::session_not_found(),
            },
            None => response,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::FrameBridge;
    use crate::config::CameraConfig;
    use crate::event_loop::EventLoop;
    use crate::fanout::StreamFanout;
    use crate::media::h264::H264Packetizer;
    use crate::mount::Mount;
    use crate::producer::{FrameFeeder, PushProducer};
    use crate::transport::UdpTransport;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    struct Fixture {
        _event_loop: EventLoop,
        feeder: FrameFeeder,
        bridge: Rc<RefCell<FrameBridge>>,
        sessions: SessionManager,
        handler: MethodHandler,
    }

    fn fixture() -> Fixture {
        let event_loop = EventLoop::new(Duration::from_millis(5));
        let sessions = SessionManager::new();
        let mounts = MountRegistry::new();

        let camera = CameraConfig::new("cam0");
        let (producer, feeder) = PushProducer::new(camera.clone());
        let bridge = FrameBridge::create(Box::new(producer), &event_loop, 0).unwrap();
        let fanout = StreamFanout::new(
            bridge.clone(),
            Box::new(H264Packetizer::new(96, 1)),
            sessions.clone(),
            UdpTransport::bind().unwrap(),
            2048,
        );
        mounts.add(Mount::new(camera, fanout));

        let handler = MethodHandler::new(
            sessions.clone(),
            "127.0.0.1:40000".parse().unwrap(),
            mounts,
            Arc::new(ServerConfig::default()),
            6970,
        );
        Fixture {
            _event_loop: event_loop,
            feeder,
            bridge,
            sessions,
            handler,
        }
    }

    fn request(raw: &str) -> RtspRequest {
        RtspRequest::parse(raw).unwrap()
    }

    fn setup(f: &mut Fixture) -> String {
        let resp = f.handler.handle(&request(
            "SETUP rtsp://127.0.0.1:8554/cam0/track1 RTSP/1.0\r\nCSeq: 3\r\nTransport: RTP/AVP;unicast;client_port=40002-40003\r\n\r\n",
        ));
        assert_eq!(resp.status_code, 200);
        f.handler.session_ids()[0].clone()
    }

    #[test]
    fn options_lists_methods_and_echoes_cseq() {
        let mut f = fixture();
        let s = f
            .handler
            .handle(&request("OPTIONS * RTSP/1.0\r\nCSeq: 7\r\n\r\n"))
            .serialize();
        assert!(s.contains("Public: OPTIONS, DESCRIBE, SETUP"));
        assert!(s.contains("CSeq: 7\r\n"));
    }

    #[test]
    fn describe_known_and_unknown_streams() {
        let mut f = fixture();
        let ok = f
            .handler
            .handle(&request("DESCRIBE rtsp://10.1.2.3:8554/cam0 RTSP/1.0\r\nCSeq: 2\r\n\r\n"));
        assert_eq!(ok.status_code, 200);
        let body = ok.body.as_deref().unwrap();
        assert!(body.contains("c=IN IP4 10.1.2.3\r\n"));
        assert!(body.contains("s=cam0\r\n"));

        let missing = f
            .handler
            .handle(&request("DESCRIBE rtsp://10.1.2.3:8554/nope RTSP/1.0\r\nCSeq: 2\r\n\r\n"));
        assert_eq!(missing.status_code, 404);
    }

    #[test]
    fn setup_advertises_shared_rtp_port() {
        let mut f = fixture();
        let resp = f.handler.handle(&request(
            "SETUP rtsp://h/cam0/track1 RTSP/1.0\r\nCSeq: 3\r\nTransport: RTP/AVP;unicast;client_port=40002-40003\r\n\r\n",
        ));
        let s = resp.serialize();
        assert!(
            s.contains("Transport: RTP/AVP;unicast;client_port=40002-40003;server_port=6970-6971\r\n"),
            "{s}"
        );
    }

    #[test]
    fn interleaved_transport_rejected() {
        let mut f = fixture();
        let resp = f.handler.handle(&request(
            "SETUP rtsp://h/cam0/track1 RTSP/1.0\r\nCSeq: 3\r\nTransport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
        ));
        assert_eq!(resp.status_code, 461);
        assert!(f.sessions.is_empty());
    }

    #[test]
    fn play_starts_delivery_and_pause_stops_it() {
        let mut f = fixture();
        let id = setup(&mut f);
        assert!(!f.bridge.borrow().is_awaiting_data());

        let play = f.handler.handle(&request(&format!(
            "PLAY rtsp://h/cam0 RTSP/1.0\r\nCSeq: 4\r\nSession: {id}\r\n\r\n"
        )));
        assert_eq!(play.status_code, 200);
        assert!(play.serialize().contains("RTP-Info: url=rtsp://127.0.0.1:8554/cam0/track1;seq=0;rtptime=0"));
        assert!(f.bridge.borrow().is_awaiting_data());
        assert!(f.feeder.push(vec![0, 0, 0, 1, 0x41, 1]));

        let pause = f.handler.handle(&request(&format!(
            "PAUSE rtsp://h/cam0 RTSP/1.0\r\nCSeq: 5\r\nSession: {id}\r\n\r\n"
        )));
        assert_eq!(pause.status_code, 200);
        assert!(!f.bridge.borrow().is_awaiting_data());
    }

    #[test]
    fn teardown_removes_session() {
        let mut f = fixture();
        let id = setup(&mut f);
        let resp = f.handler.handle(&request(&format!(
            "TEARDOWN rtsp://h/cam0 RTSP/1.0\r\nCSeq: 6\r\nSession: {id}\r\n\r\n"
        )));
        assert_eq!(resp.status_code, 200);
        assert!(f.sessions.get_session(&id).is_none());
        assert!(f.handler.session_ids().is_empty());

        let again = f.handler.handle(&request(&format!(
            "TEARDOWN rtsp://h/cam0 RTSP/1.0\r\nCSeq: 7\r\nSession: {id}\r\n\r\n"
        )));
        assert_eq!(again.status_code, 454);
    }

    #[test]
    fn release_sessions_on_disconnect() {
        let mut f = fixture();
        setup(&mut f);
        setup(&mut f);
        assert_eq!(f.sessions.len(), 2);
        assert_eq!(f.handler.release_sessions(), 2);
        assert!(f.sessions.is_empty());
    }

    #[test]
    fn keepalive_with_unknown_session() {
        let mut f = fixture();
        let resp = f.handler.handle(&request(
            "GET_PARAMETER rtsp://h/cam0 RTSP/1.0\r\nCSeq: 8\r\nSession: DEADBEEF\r\n\r\n",
        ));
        assert_eq!(resp.status_code, 454);
        let resp = f
            .handler
            .handle(&request("GET_PARAMETER rtsp://h/cam0 RTSP/1.0\r\nCSeq: 9\r\n\r\n"));
        assert_eq!(resp.status_code, 200);
    }
}

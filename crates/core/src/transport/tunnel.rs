//! RTSP-over-HTTP tunnelling (the QuickTime scheme).
//!
//! A client that cannot reach the RTSP port opens two HTTP connections to
//! the tunnel port, tied together by an `x-sessioncookie` header:
//!
//! ```text
//! GET  /cam0 HTTP/1.0     server -> client: plain RTSP responses
//! POST /cam0 HTTP/1.0     client -> server: base64-encoded RTSP requests
//! ```
//!
//! The GET connection stays open for the life of the tunnel. Clients may
//! close and reopen the POST side between requests.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::tcp::{self, Outbound, ReadStatus, RequestReader};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::mount::MountRegistry;
use crate::protocol::{MethodHandler, RtspRequest};
use crate::session::SessionManager;

/// Connections that have not sent a complete HTTP head by then are dropped.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_HEAD_SIZE: usize = 16 * 1024;

const TUNNEL_OK: &str = "HTTP/1.0 200 OK\r\n\
    Cache-Control: no-cache\r\n\
    Pragma: no-cache\r\n\
    Content-Type: application/x-rtsp-tunnelled\r\n\r\n";

const BAD_REQUEST: &str = "HTTP/1.0 400 Bad Request\r\nContent-Length: 0\r\n\r\n";

struct PendingHttp {
    stream: TcpStream,
    peer: SocketAddr,
    reader: RequestReader,
    accepted: Instant,
}

struct TunnelChannel {
    peer: SocketAddr,
    get: TcpStream,
    outbound: Outbound,
    post: Option<TcpStream>,
    encoded: Vec<u8>,
    reader: RequestReader,
    handler: MethodHandler,
}

enum Handshake {
    Incomplete,
    Done,
    Failed(&'static str),
}

/// Listener and live tunnels on the secondary HTTP port.
pub struct HttpTunnel {
    listener: TcpListener,
    local_addr: SocketAddr,
    sessions: SessionManager,
    mounts: MountRegistry,
    config: Arc<ServerConfig>,
    rtp_port: u16,
    pending: Vec<PendingHttp>,
    channels: HashMap<String, TunnelChannel>,
}

impl HttpTunnel {
    pub fn bind(
        port: u16,
        sessions: SessionManager,
        mounts: MountRegistry,
        config: Arc<ServerConfig>,
        rtp_port: u16,
    ) -> Result<Self> {
        let addr = format!("{}:{}", config.bind_host, port);
        let listener = TcpListener::bind(&addr).map_err(|source| Error::Bind {
            addr: addr.clone(),
            source,
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            sessions,
            mounts,
            config,
            rtp_port,
            pending: Vec::new(),
            channels: HashMap::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn poll(&mut self) {
        for (stream, peer) in tcp::accept_pending(&self.listener) {
            tracing::debug!(%peer, "HTTP tunnel connection accepted");
            self.pending.push(PendingHttp {
                stream,
                peer,
                reader: RequestReader::default(),
                accepted: Instant::now(),
            });
        }

        let pending = std::mem::take(&mut self.pending);
        for mut conn in pending {
            match self.advance_handshake(&mut conn) {
                Handshake::Incomplete => self.pending.push(conn),
                Handshake::Done => {}
                Handshake::Failed(reason) => {
                    tracing::debug!(peer = %conn.peer, reason, "HTTP tunnel handshake failed");
                }
            }
        }

        let mut finished = Vec::new();
        for (cookie, channel) in &mut self.channels {
            if let Some(reason) = channel.poll() {
                finished.push((cookie.clone(), reason));
            }
        }
        for (cookie, reason) in finished {
            if let Some(mut channel) = self.channels.remove(&cookie) {
                let removed = channel.handler.release_sessions();
                tracing::info!(peer = %channel.peer, reason, removed, "HTTP tunnel closed");
            }
        }
    }

    /// Drop every tunnel and its sessions.
    pub fn close(&mut self) {
        self.pending.clear();
        for (_, mut channel) in self.channels.drain() {
            channel.handler.release_sessions();
        }
    }

    /// Release sessions removed elsewhere from every tunnel's bookkeeping.
    pub fn forget_session(&mut self, id: &str) {
        for channel in self.channels.values_mut() {
            channel.handler.forget_session(id);
        }
    }

    fn advance_handshake(&mut self, conn: &mut PendingHttp) -> Handshake {
        let mut incoming = Vec::new();
        let status = match tcp::read_available(&mut conn.stream, &mut incoming) {
            Ok(status) => status,
            Err(_) => return Handshake::Failed("read error"),
        };
        conn.reader.push(&incoming);

        let Some(head) = conn.reader.next_message_head() else {
            return match status {
                ReadStatus::Closed => Handshake::Failed("closed before request"),
                _ if conn.reader.buffered() > MAX_HEAD_SIZE => {
                    Handshake::Failed("request too large")
                }
                _ if conn.accepted.elapsed() > HANDSHAKE_TIMEOUT => Handshake::Failed("timed out"),
                _ => Handshake::Incomplete,
            };
        };

        let request = match RtspRequest::parse(&head) {
            Ok(request) => request,
            Err(_) => return Self::reject(conn, "malformed request"),
        };
        let Some(cookie) = request.get_header("x-sessioncookie").map(str::to_string) else {
            return Self::reject(conn, "missing x-sessioncookie");
        };

        match request.method.as_str() {
            "GET" => self.open_channel(conn, cookie),
            "POST" => self.attach_post(conn, &cookie),
            _ => Self::reject(conn, "unsupported HTTP method"),
        }
    }

    fn open_channel(&mut self, conn: &mut PendingHttp, cookie: String) -> Handshake {
        if self.channels.contains_key(&cookie) {
            return Self::reject(conn, "duplicate session cookie");
        }

        let Ok(get) = conn.stream.try_clone() else {
            return Handshake::Failed("socket clone failed");
        };
        let mut outbound = Outbound::default();
        outbound.queue(TUNNEL_OK.as_bytes());

        let handler = MethodHandler::new(
            self.sessions.clone(),
            conn.peer,
            self.mounts.clone(),
            self.config.clone(),
            self.rtp_port,
        );
        tracing::info!(peer = %conn.peer, "HTTP tunnel opened");
        self.channels.insert(
            cookie,
            TunnelChannel {
                peer: conn.peer,
                get,
                outbound,
                post: None,
                encoded: Vec::new(),
                reader: RequestReader::default(),
                handler,
            },
        );
        Handshake::Done
    }

    fn attach_post(&mut self, conn: &mut PendingHttp, cookie: &str) -> Handshake {
        let Some(channel) = self.channels.get_mut(cookie) else {
            return Self::reject(conn, "POST without matching GET");
        };
        let Ok(post) = conn.stream.try_clone() else {
            return Handshake::Failed("socket clone failed");
        };

        // The first base64 chunk often arrives together with the POST head.
        channel.encoded.extend(conn.reader.take_remaining());
        channel.post = Some(post);
        tracing::debug!(peer = %conn.peer, "HTTP tunnel POST attached");
        Handshake::Done
    }

    fn reject(conn: &mut PendingHttp, reason: &'static str) -> Handshake {
        let mut outbound = Outbound::default();
        outbound.queue(BAD_REQUEST.as_bytes());
        let _ = outbound.flush(&mut conn.stream);
        Handshake::Failed(reason)
    }
}

impl TunnelChannel {
    fn poll(&mut self) -> Option<&'static str> {
        if let Some(post) = self.post.as_mut() {
            match tcp::read_available(post, &mut self.encoded) {
                Ok(ReadStatus::Open) => {}
                Ok(ReadStatus::Closed) | Err(_) => self.post = None,
            }
        }

        if let Err(reason) = self.decode_pending() {
            return Some(reason);
        }
        if let Err(reason) =
            tcp::serve_requests(&mut self.reader, &mut self.handler, &mut self.outbound, self.peer)
        {
            let _ = self.outbound.flush(&mut self.get);
            return Some(reason);
        }
        if self.reader.buffered() + self.encoded.len() > tcp::MAX_REQUEST_SIZE {
            return Some("request too large");
        }

        let mut ignored = Vec::new();
        match tcp::read_available(&mut self.get, &mut ignored) {
            Ok(ReadStatus::Open) => {}
            Ok(ReadStatus::Closed) => return Some("GET connection closed"),
            Err(_) => return Some("read error"),
        }

        if self.outbound.flush(&mut self.get).is_err() {
            return Some("write error");
        }
        None
    }

    /// Decode every complete base64 quantum received so far.
    fn decode_pending(&mut self) -> std::result::Result<(), &'static str> {
        self.encoded.retain(|b| !b.is_ascii_whitespace());
        let usable = self.encoded.len() / 4 * 4;
        if usable == 0 {
            return Ok(());
        }

        let decoded = BASE64_STANDARD
            .decode(&self.encoded[..usable])
            .map_err(|_| "invalid base64 in POST body")?;
        self.encoded.drain(..usable);
        self.reader.push(&decoded);
        Ok(())
    }
}

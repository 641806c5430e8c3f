use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};

use crate::protocol::{MethodHandler, RtspRequest, RtspResponse};

/// Requests larger than this close the connection.
pub(crate) const MAX_REQUEST_SIZE: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// Accumulates bytes from a stream and splits them into complete messages
/// (head terminated by an empty line, plus `Content-Length` body bytes).
#[derive(Debug, Default)]
pub(crate) struct RequestReader {
    buf: Vec<u8>,
}

impl RequestReader {
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Bytes received after the last complete message.
    pub(crate) fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Next message head, leaving any body bytes buffered.
    pub(crate) fn next_message_head(&mut self) -> Option<String> {
        let (head_end, sep_len) = find_head_end(&self.buf)?;
        let head = String::from_utf8_lossy(&self.buf[..head_end]).into_owned();
        self.buf.drain(..head_end + sep_len);
        Some(head)
    }

    /// Next complete message head as text, with its body discarded.
    ///
    /// `Ok(None)` means more bytes are needed. A declared body that can never
    /// fit in [`MAX_REQUEST_SIZE`] is a framing error; the stream cannot be
    /// resynchronised after it.
    pub(crate) fn next_message(&mut self) -> Result<Option<String>, &'static str> {
        let Some((head_end, sep_len)) = find_head_end(&self.buf) else {
            return Ok(None);
        };
        let head = String::from_utf8_lossy(&self.buf[..head_end]).into_owned();

        let body_len = content_length(&head);
        if body_len > MAX_REQUEST_SIZE {
            return Err("request too large");
        }
        let total = (head_end + sep_len)
            .checked_add(body_len)
            .ok_or("request too large")?;
        if self.buf.len() < total {
            return Ok(None);
        }
        self.buf.drain(..total);
        Ok(Some(head))
    }
}

fn find_head_end(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("Content-Length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

pub(crate) enum ReadStatus {
    Open,
    Closed,
}

/// Drain everything currently readable from a non-blocking stream.
pub(crate) fn read_available(stream: &mut TcpStream, sink: &mut Vec<u8>) -> io::Result<ReadStatus> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return Ok(ReadStatus::Closed),
            Ok(n) => sink.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadStatus::Open),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Bytes queued for a non-blocking stream that could not be written yet.
#[derive(Debug, Default)]
pub(crate) struct Outbound {
    pending: Vec<u8>,
}

impl Outbound {
    pub(crate) fn queue(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    pub(crate) fn flush(&mut self, stream: &mut TcpStream) -> io::Result<()> {
        while !self.pending.is_empty() {
            match stream.write(&self.pending) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Parse each complete request in `reader`, answer it and queue the reply.
///
/// Stops at the first framing error and returns it as the disconnect reason.
pub(crate) fn serve_requests(
    reader: &mut RequestReader,
    handler: &mut MethodHandler,
    outbound: &mut Outbound,
    peer: SocketAddr,
) -> Result<(), &'static str> {
    while let Some(text) = reader.next_message()? {
        if text.trim().is_empty() {
            continue;
        }
        let response = match RtspRequest::parse(&text) {
            Ok(request) => {
                tracing::debug!(%peer, method = %request.method, uri = %request.uri, "request");
                handler.handle(&request)
            }
            Err(e) => {
                tracing::warn!(%peer, error = %e, "parse error");
                RtspResponse::bad_request()
            }
        };
        tracing::debug!(%peer, status = response.status_code, "response");
        outbound.queue(response.serialize().as_bytes());
    }
    Ok(())
}

/// Accept every pending connection on a non-blocking listener.
pub(crate) fn accept_pending(listener: &TcpListener) -> Vec<(TcpStream, SocketAddr)> {
    let mut accepted = Vec::new();
    loop {
        match listener.accept() {
            Ok((stream, peer)) => match stream.set_nonblocking(true) {
                Ok(()) => {
                    let _ = stream.set_nodelay(true);
                    accepted.push((stream, peer));
                }
                Err(e) => tracing::warn!(%peer, error = %e, "could not make socket non-blocking"),
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                tracing::warn!(error = %e, "TCP accept error");
                break;
            }
        }
    }
    accepted
}

/// One RTSP client on a plain TCP connection.
///
/// Polled by the server on the event-loop thread; never blocks.
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    reader: RequestReader,
    outbound: Outbound,
    handler: MethodHandler,
}

impl Connection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, handler: MethodHandler) -> Self {
        tracing::info!(%peer_addr, "client connected");
        Self {
            stream,
            peer_addr,
            reader: RequestReader::default(),
            outbound: Outbound::default(),
            handler,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn handler_mut(&mut self) -> &mut MethodHandler {
        &mut self.handler
    }

    /// Serve whatever the client has sent. Returns the disconnect reason
    /// once the connection is finished.
    pub fn poll(&mut self) -> Option<&'static str> {
        let mut incoming = Vec::new();
        let status = match read_available(&mut self.stream, &mut incoming) {
            Ok(status) => status,
            Err(_) => return Some("read error"),
        };
        self.reader.push(&incoming);

        let served = serve_requests(
            &mut self.reader,
            &mut self.handler,
            &mut self.outbound,
            self.peer_addr,
        );
        if let Err(reason) = served {
            // Answers to earlier pipelined requests still go out.
            let _ = self.outbound.flush(&mut self.stream);
            return Some(reason);
        }
        if self.reader.buffered() > MAX_REQUEST_SIZE {
            return Some("request too large");
        }

        if self.outbound.flush(&mut self.stream).is_err() {
            return Some("write error");
        }

        match status {
            ReadStatus::Closed => Some("connection closed by client"),
            ReadStatus::Open => None,
        }
    }

    /// Release this connection's sessions. Called once, when it is dropped
    /// from the server.
    pub fn cleanup(&mut self, reason: &str) {
        let removed = self.handler.release_sessions();
        if removed > 0 {
            tracing::info!(peer = %self.peer_addr, removed, "cleaned up sessions on disconnect");
        }
        tracing::info!(peer = %self.peer_addr, reason, "client disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_splits_pipelined_requests() {
        let mut reader = RequestReader::default();
        reader.push(b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\nDESCRIBE rtsp://h/cam0 RTSP/1.0\r\nCSeq: 2\r\n");
        let first = reader.next_message().unwrap().unwrap();
        assert!(first.starts_with("OPTIONS"));
        assert_eq!(reader.next_message(), Ok(None));

        reader.push(b"\r\n");
        assert!(reader.next_message().unwrap().unwrap().contains("CSeq: 2"));
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn reader_waits_for_body() {
        let mut reader = RequestReader::default();
        reader.push(b"GET_PARAMETER rtsp://h/cam0 RTSP/1.0\r\nCSeq: 3\r\nContent-Length: 4\r\n\r\nab");
        assert_eq!(reader.next_message(), Ok(None));
        reader.push(b"cdOPTIONS");
        assert!(reader.next_message().unwrap().unwrap().contains("CSeq: 3"));
        assert_eq!(reader.take_remaining(), b"OPTIONS");
    }

    #[test]
    fn reader_accepts_bare_newlines() {
        let mut reader = RequestReader::default();
        reader.push(b"OPTIONS * RTSP/1.0\nCSeq: 1\n\n");
        assert!(reader.next_message().unwrap().is_some());
    }

    #[test]
    fn oversized_content_length_is_a_framing_error() {
        let mut reader = RequestReader::default();
        reader.push(b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\nContent-Length: 18446744073709551615\r\n\r\n");
        assert_eq!(reader.next_message(), Err("request too large"));

        let mut reader = RequestReader::default();
        let head = format!(
            "SET_PARAMETER * RTSP/1.0\r\nCSeq: 2\r\nContent-Length: {}\r\n\r\n",
            MAX_REQUEST_SIZE + 1
        );
        reader.push(head.as_bytes());
        assert_eq!(reader.next_message(), Err("request too large"));
    }

    #[test]
    fn connection_closes_on_huge_content_length() {
        use std::time::{Duration, Instant};

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();

        let handler = MethodHandler::new(
            crate::session::SessionManager::new(),
            peer,
            crate::mount::MountRegistry::new(),
            std::sync::Arc::new(crate::config::ServerConfig::default()),
            6970,
        );
        let mut conn = Connection::new(stream, peer, handler);

        client
            .write_all(b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\nOPTIONS * RTSP/1.0\r\nCSeq: 2\r\nContent-Length: 18446744073709551615\r\n\r\n")
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let reason = loop {
            if let Some(reason) = conn.poll() {
                break reason;
            }
            assert!(Instant::now() < deadline, "connection was never closed");
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(reason, "request too large");

        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 512];
        let n = client.read(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.starts_with("RTSP/1.0 200 OK"), "{text}");
        assert!(text.contains("CSeq: 1\r\n"));
    }
}

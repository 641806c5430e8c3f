//! Integration tests: a real `CameraServer` on loopback, driven by a plain
//! TCP/UDP client on another thread.
//!
//! The server's event loop runs on the test thread (it is not `Send`); the
//! client thread stops it when done, or when it panics.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

use livecam::{CameraConfig, CameraServer, ServerConfig, StopHandle, SyntheticProducer};

fn rtsp_request(stream: &mut TcpStream, request: &str) -> std::io::Result<String> {
    stream.write_all(request.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        response.push_str(&line);
        if line == "\r\n" || line == "\n" {
            break;
        }
    }

    if let Some(len) = response
        .lines()
        .find(|l| l.to_lowercase().starts_with("content-length:"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse::<usize>().ok())
        && len > 0
    {
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body)?;
        response.push_str(&String::from_utf8_lossy(&body));
    }

    Ok(response)
}

fn status_line(response: &str) -> &str {
    response.lines().next().unwrap_or("")
}

/// The server binds inside `run()`, so the client retries until it is up.
fn connect(addr: SocketAddr) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect_timeout(&addr, Duration::from_millis(200)) {
            Ok(stream) => {
                stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
                stream.set_write_timeout(Some(Duration::from_secs(2))).unwrap();
                return stream;
            }
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
            Err(e) => panic!("could not connect to {addr}: {e}"),
        }
    }
}

/// Stops the server even if the client thread panics.
struct StopOnDrop(StopHandle);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.stop();
    }
}

fn camera_server(port: u16) -> CameraServer {
    let config = ServerConfig::default()
        .bind_host("127.0.0.1")
        .rtsp_port(port)
        .poll_interval(Duration::from_millis(5));
    let mut server = CameraServer::new(config);
    let camera = CameraConfig::new("cam0").bitrate_kbps(200).fps(25);
    server
        .add_camera(Box::new(SyntheticProducer::new(camera)))
        .unwrap();
    server
}

/// Fixed ports: the client needs to know the address before `run()` binds.
const HANDSHAKE_PORT: u16 = 18554;
const ERRORS_PORT: u16 = 18555;

#[test]
fn full_handshake_delivers_rtp() {
    let mut server = camera_server(HANDSHAKE_PORT);
    let stop = StopOnDrop(server.stop_handle());

    let client = thread::spawn(move || {
        let _stop = stop;
        let addr: SocketAddr = ([127, 0, 0, 1], HANDSHAKE_PORT).into();
        let mut stream = connect(addr);
        let base_uri = format!("rtsp://127.0.0.1:{HANDSHAKE_PORT}/cam0");

        let opt_resp = rtsp_request(
            &mut stream,
            &format!("OPTIONS {base_uri} RTSP/1.0\r\nCSeq: 1\r\n\r\n"),
        )
        .expect("OPTIONS response");
        assert_eq!(status_line(&opt_resp), "RTSP/1.0 200 OK");
        assert!(opt_resp.contains("Public:"), "OPTIONS: missing Public header");

        let desc_resp = rtsp_request(
            &mut stream,
            &format!("DESCRIBE {base_uri} RTSP/1.0\r\nCSeq: 2\r\nAccept: application/sdp\r\n\r\n"),
        )
        .expect("DESCRIBE response");
        assert_eq!(status_line(&desc_resp), "RTSP/1.0 200 OK");
        assert!(desc_resp.contains("Content-Type: application/sdp"));
        assert!(desc_resp.contains("v=0"));
        assert!(desc_resp.contains("m=video 0 RTP/AVP 96"));
        assert!(desc_resp.contains("b=AS:200"));
        assert!(desc_resp.contains("a=rtpmap:96 H264/90000"));
        assert!(desc_resp.contains("a=fmtp:96 packetization-mode=1"));

        let rtp = UdpSocket::bind("127.0.0.1:0").unwrap();
        rtp.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        let rtp_port = rtp.local_addr().unwrap().port();

        let setup_resp = rtsp_request(
            &mut stream,
            &format!(
                "SETUP {base_uri}/track1 RTSP/1.0\r\nCSeq: 3\r\nTransport: RTP/AVP;unicast;client_port={}-{}\r\n\r\n",
                rtp_port,
                rtp_port + 1
            ),
        )
        .expect("SETUP response");
        assert_eq!(status_line(&setup_resp), "RTSP/1.0 200 OK");
        assert!(setup_resp.contains("Transport:"), "SETUP: missing Transport header");

        let session_id = setup_resp
            .lines()
            .find(|l| l.to_lowercase().starts_with("session:"))
            .and_then(|l| l.split(':').nth(1))
            .map(|v| v.trim().split(';').next().unwrap_or("").trim().to_string())
            .unwrap_or_default();
        assert!(!session_id.is_empty(), "SETUP: could not parse Session id");

        let play_resp = rtsp_request(
            &mut stream,
            &format!("PLAY {base_uri} RTSP/1.0\r\nCSeq: 4\r\nSession: {session_id}\r\n\r\n"),
        )
        .expect("PLAY response");
        assert_eq!(status_line(&play_resp), "RTSP/1.0 200 OK");
        assert!(play_resp.contains("RTP-Info:"), "PLAY: missing RTP-Info header");

        let mut packet = [0u8; 2048];
        let n = rtp.recv(&mut packet).expect("RTP packet after PLAY");
        assert!(n > 12, "RTP packet too short: {n} bytes");
        assert_eq!(packet[0] >> 6, 2, "RTP version");
        assert_eq!(packet[1] & 0x7f, 96, "RTP payload type");

        let teardown_resp = rtsp_request(
            &mut stream,
            &format!("TEARDOWN {base_uri} RTSP/1.0\r\nCSeq: 5\r\nSession: {session_id}\r\n\r\n"),
        )
        .expect("TEARDOWN response");
        assert_eq!(status_line(&teardown_resp), "RTSP/1.0 200 OK");
    });

    server.run().expect("server run");
    let stats = server.bridge_stats("cam0").expect("cam0 is published");
    server.shutdown();

    client.join().expect("client thread");
    assert!(stats.frames_delivered > 0, "no frame reached the fan-out: {stats:?}");
    assert_eq!(stats.truncated_frames, 0);
}

#[test]
fn error_responses() {
    let mut server = camera_server(ERRORS_PORT);
    let stop = StopOnDrop(server.stop_handle());

    let client = thread::spawn(move || {
        let _stop = stop;
        let addr: SocketAddr = ([127, 0, 0, 1], ERRORS_PORT).into();
        let mut stream = connect(addr);

        let missing = rtsp_request(
            &mut stream,
            &format!("DESCRIBE rtsp://127.0.0.1:{ERRORS_PORT}/nope RTSP/1.0\r\nCSeq: 1\r\n\r\n"),
        )
        .unwrap();
        assert!(status_line(&missing).starts_with("RTSP/1.0 404"), "{missing}");
        assert!(missing.contains("CSeq: 1"));

        let interleaved = rtsp_request(
            &mut stream,
            &format!(
                "SETUP rtsp://127.0.0.1:{ERRORS_PORT}/cam0/track1 RTSP/1.0\r\nCSeq: 2\r\nTransport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n"
            ),
        )
        .unwrap();
        assert!(status_line(&interleaved).starts_with("RTSP/1.0 461"), "{interleaved}");

        let no_session = rtsp_request(
            &mut stream,
            &format!(
                "PLAY rtsp://127.0.0.1:{ERRORS_PORT}/cam0 RTSP/1.0\r\nCSeq: 3\r\nSession: 12345678\r\n\r\n"
            ),
        )
        .unwrap();
        assert!(status_line(&no_session).starts_with("RTSP/1.0 454"), "{no_session}");
    });

    server.run().expect("server run");
    server.shutdown();
    client.join().expect("client thread");
}

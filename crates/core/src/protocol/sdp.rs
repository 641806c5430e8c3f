//! SDP generation for DESCRIBE responses (RFC 4566).
//!
//! ```text
//! v=0
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>
//! s=<camera name>
//! i=<camera description>
//! c=IN IP4 <addr>
//! t=0 0
//! a=tool:livecam
//! a=type:broadcast
//! a=control:*
//! a=sendonly
//! m=video 0 RTP/AVP 96
//! b=AS:<bitrate kbps>
//! a=rtpmap:96 H264/90000
//! a=fmtp:96 packetization-mode=1;...
//! a=control:track1
//! ```

use crate::config::ServerConfig;
use crate::mount::Mount;

pub fn generate_sdp(mount: &Mount, ip: &str, config: &ServerConfig) -> String {
    let camera = mount.camera();
    let mut sdp: Vec<String> = vec![
        "v=0".to_string(),
        format!(
            "o={} {} {} IN IP4 {}",
            config.sdp_username, config.sdp_session_id, config.sdp_session_version, ip
        ),
        format!("s={}", camera.name),
        format!("i={}", camera.description),
        format!("c=IN IP4 {ip}"),
        "t=0 0".to_string(),
        "a=tool:livecam".to_string(),
        "a=type:broadcast".to_string(),
        "a=control:*".to_string(),
        "a=sendonly".to_string(),
        format!("m=video 0 RTP/AVP {}", mount.payload_type()),
        format!("b=AS:{}", camera.bitrate_kbps),
    ];
    sdp.extend(mount.sdp_attributes());

    tracing::trace!(mount = %mount.path(), sdp = %sdp.join(" | "), "SDP generated");
    format!("{}\r\n", sdp.join("\r\n"))
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
    use crate::session::SessionManager;
    use crate::transport::UdpTransport;
    use std::time::Duration;

    #[test]
    fn generates_h264_sdp() {
        let event_loop = EventLoop::new(Duration::from_millis(5));
        let camera = CameraConfig::new("cam0")
            .description("lobby")
            .bitrate_kbps(800);
        let (producer, _feeder) = PushProducer::new(camera.clone());
        let bridge = FrameBridge::create(Box::new(producer), &event_loop, 0).unwrap();
        let fanout = StreamFanout::new(
            bridge,
            Box::new(H264Packetizer::new(96, 0x12345678)),
            SessionManager::new(),
            UdpTransport::bind().unwrap(),
            1024,
        );
        let mount = Mount::new(camera, fanout);

        let mut config = ServerConfig::default();
        config.sdp_username = "server".to_string();
        config.sdp_session_id = "1234567890".to_string();
        config.sdp_session_version = "1".to_string();

        let sdp = generate_sdp(&mount, "192.168.1.100", &config);
        assert!(sdp.starts_with("v=0\r\no=server 1234567890 1 IN IP4 192.168.1.100\r\n"));
        assert!(sdp.contains("s=cam0\r\ni=lobby\r\n"));
        assert!(sdp.contains("c=IN IP4 192.168.1.100\r\n"));
        assert!(sdp.contains("b=AS:800\r\n"));
        assert!(sdp.contains("a=fmtp:96 packetization-mode=1\r\n"));
        assert!(sdp.contains("a=control:track1\r\n"));

        let rtpmap = sdp.find("a=rtpmap:96 H264/90000").unwrap();
        let fmtp = sdp.find("a=fmtp").unwrap();
        let media = sdp.find("m=video 0 RTP/AVP 96").unwrap();
        let sendonly = sdp.find("a=sendonly").unwrap();
        assert!(sendonly < media && media < rtpmap && rtpmap < fmtp);
        assert!(sdp.ends_with("\r\n"));
    }
}

use std::io;
use std::process;
use std::thread;

use clap::Parser;
use livecam::config::{
    DEFAULT_MAX_BUFFER_SIZE, DEFAULT_MAX_PACKET_SIZE, DEFAULT_MAX_PENDING_FRAMES, DEFAULT_RTSP_PORT,
};
use livecam::{CameraConfig, CameraServer, Error, ServerConfig, SyntheticProducer};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "livecam-server",
    about = "Stream live camera feeds over RTSP",
    version
)]
struct Args {
    /// RTSP listening port
    #[arg(long, short, default_value_t = DEFAULT_RTSP_PORT)]
    port: u16,

    /// Also accept RTSP-over-HTTP tunnels on this port
    #[arg(long)]
    http_port: Option<u16>,

    /// Interface to bind
    #[arg(long, short, default_value = "0.0.0.0")]
    bind: String,

    /// Largest outbound RTP packet in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_PACKET_SIZE)]
    max_packet_size: usize,

    /// Largest frame forwarded intact; bigger frames are truncated
    #[arg(long, default_value_t = DEFAULT_MAX_BUFFER_SIZE)]
    max_buffer_size: usize,

    /// Frames staged per camera before the oldest is dropped (0 = unbounded)
    #[arg(long, default_value_t = DEFAULT_MAX_PENDING_FRAMES)]
    max_pending_frames: usize,

    /// Host advertised in stream URLs and SDP
    #[arg(long)]
    public_host: Option<String>,

    /// Camera to publish, as NAME[:BITRATE_KBPS[:FPS]]. Repeatable.
    #[arg(long = "camera", short = 'c', value_parser = parse_camera)]
    cameras: Vec<CameraConfig>,
}

fn parse_camera(spec: &str) -> Result<CameraConfig, String> {
    let mut parts = spec.split(':');
    let name = parts.next().unwrap_or_default().trim();
    if name.is_empty() {
        return Err("camera name must not be empty".to_string());
    }

    let mut camera = CameraConfig::new(name);
    if let Some(bitrate) = parts.next() {
        let kbps = bitrate
            .parse()
            .map_err(|_| format!("invalid bitrate '{bitrate}'"))?;
        camera = camera.bitrate_kbps(kbps);
    }
    if let Some(fps) = parts.next() {
        let fps = fps.parse().map_err(|_| format!("invalid frame rate '{fps}'"))?;
        camera = camera.fps(fps);
    }
    if parts.next().is_some() {
        return Err(format!("expected NAME[:BITRATE_KBPS[:FPS]], got '{spec}'"));
    }
    Ok(camera)
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let mut config = ServerConfig::default()
        .bind_host(args.bind)
        .rtsp_port(args.port)
        .max_packet_size(args.max_packet_size)
        .max_buffer_size(args.max_buffer_size)
        .max_pending_frames(args.max_pending_frames);
    if let Some(port) = args.http_port {
        config = config.http_tunnel_port(port);
    }
    if let Some(host) = args.public_host {
        config = config.public_host(host);
    }

    let cameras = if args.cameras.is_empty() {
        vec![CameraConfig::new("cam0")]
    } else {
        args.cameras
    };

    let mut server = CameraServer::new(config);
    for camera in cameras {
        if let Err(e) = server.add_camera(Box::new(SyntheticProducer::new(camera))) {
            tracing::error!(error = %e, "invalid camera configuration");
            process::exit(2);
        }
    }

    let stop = server.stop_handle();
    thread::spawn(move || {
        let mut input = String::new();
        // EOF (no terminal attached) keeps the server running.
        if matches!(io::stdin().read_line(&mut input), Ok(n) if n > 0) {
            stop.stop();
        }
    });
    tracing::info!("press Enter to stop");

    match server.run() {
        Ok(()) => server.shutdown(),
        Err(e @ Error::Bind { .. }) => {
            tracing::error!(error = %e, "failed to create RTSP server");
            process::exit(1);
        }
        Err(e) => {
            tracing::error!(error = %e, "server stopped with an error");
            server.shutdown();
            process::exit(1);
        }
    }
}

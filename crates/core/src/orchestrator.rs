//! Process-level owner of the event loop, the RTSP server and one frame
//! bridge per camera.
//!
//! Ownership is an explicit tree:
//!
//! ```text
//! CameraServer
//! ├── EventLoop
//! ├── RtspServer ── sessions, connections, mounts ── StreamFanout (consumer)
//! └── FrameBridge (one per camera) ── FrameProducer
//! ```
//!
//! Fan-outs only hold the bridge until they are detached, so tearing down in
//! the order implemented by [`CameraServer::shutdown`] never leaves a
//! consumer pointing at a closed bridge.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use crate::bridge::{BridgeStats, FrameBridge};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, RunState, StopHandle};
use crate::fanout::StreamFanout;
use crate::media::h264::H264Packetizer;
use crate::mount::Mount;
use crate::producer::FrameProducer;
use crate::server::{RtspServer, Viewer};

/// First dynamic RTP payload type (RFC 3551 §6), used for H.264.
const H264_PAYLOAD_TYPE: u8 = 96;

struct StreamEntry {
    camera: String,
    bridge: Rc<RefCell<FrameBridge>>,
    url: String,
}

/// Streams every registered camera over RTSP until stopped.
///
/// ```no_run
/// use livecam::{CameraConfig, CameraServer, ServerConfig, SyntheticProducer};
///
/// let mut server = CameraServer::new(ServerConfig::default());
/// server.add_camera(Box::new(SyntheticProducer::new(CameraConfig::new("cam0"))))?;
///
/// let stop = server.stop_handle();
/// std::thread::spawn(move || {
///     std::thread::sleep(std::time::Duration::from_secs(10));
///     stop.stop();
/// });
///
/// server.run()?;
/// server.shutdown();
/// # Ok::<(), livecam::Error>(())
/// ```
///
/// Not `Send`: the loop and everything it drives stay on the thread that
/// created the server. Use a [`StopHandle`] to stop it from elsewhere.
pub struct CameraServer {
    config: Arc<ServerConfig>,
    run_state: Arc<RunState>,
    stop: StopHandle,
    event_loop: Option<EventLoop>,
    server: Option<Rc<RefCell<RtspServer>>>,
    producers: Vec<Box<dyn FrameProducer>>,
    streams: Vec<StreamEntry>,
    shut_down: bool,
}

impl CameraServer {
    pub fn new(config: ServerConfig) -> Self {
        let event_loop = EventLoop::new(config.poll_interval);
        let run_state = Arc::new(RunState::new());
        let stop = event_loop.stop_handle(&run_state);
        Self {
            config: Arc::new(config),
            run_state,
            stop,
            event_loop: Some(event_loop),
            server: None,
            producers: Vec::new(),
            streams: Vec::new(),
            shut_down: false,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Register a camera. Only allowed before [`run`](Self::run).
    pub fn add_camera(&mut self, producer: Box<dyn FrameProducer>) -> Result<()> {
        if self.shut_down {
            return Err(Error::Closed);
        }
        if self.server.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let camera = producer.camera();
        let path = camera.mount_path();
        if self
            .producers
            .iter()
            .any(|p| p.camera().mount_path() == path)
        {
            return Err(Error::DuplicateCamera(camera.name.clone()));
        }

        tracing::debug!(camera = %camera.name, "camera registered");
        self.producers.push(producer);
        Ok(())
    }

    /// Bind the server, publish every registered camera and drive the event
    /// loop until a stop is requested.
    ///
    /// A second call after the server is up only logs a warning. A camera
    /// whose producer fails to start is skipped; the others keep streaming.
    pub fn run(&mut self) -> Result<()> {
        if self.shut_down {
            return Err(Error::Closed);
        }
        if self.server.is_some() {
            tracing::warn!("run() called while the server is already running, ignoring");
            return Ok(());
        }
        let Some(event_loop) = self.event_loop.clone() else {
            return Err(Error::Closed);
        };

        let server = Rc::new(RefCell::new(RtspServer::bind(self.config.clone())?));
        event_loop.add_io_source(&server);

        if let Some(port) = self.config.http_tunnel_port
            && let Err(e) = server.borrow_mut().enable_http_tunneling(port)
        {
            tracing::warn!(port, error = %e, "RTSP-over-HTTP tunnelling not available");
        }

        for producer in std::mem::take(&mut self.producers) {
            if let Some(entry) = self.start_stream(producer, &event_loop, &server) {
                self.streams.push(entry);
            }
        }
        self.server = Some(server);

        event_loop.run_until(&self.run_state);
        Ok(())
    }

    fn start_stream(
        &self,
        producer: Box<dyn FrameProducer>,
        event_loop: &EventLoop,
        server: &Rc<RefCell<RtspServer>>,
    ) -> Option<StreamEntry> {
        let camera = producer.camera().clone();
        let created = FrameBridge::create(producer, event_loop, self.config.max_pending_frames);
        let bridge = match created {
            Ok(bridge) => bridge,
            Err(e) => {
                tracing::error!(camera = %camera.name, error = %e, "camera not published");
                return None;
            }
        };

        let mut server = server.borrow_mut();
        let packetizer = H264Packetizer::with_random_ssrc(H264_PAYLOAD_TYPE)
            .max_packet_size(self.config.max_packet_size);
        let fanout = StreamFanout::new(
            bridge.clone(),
            Box::new(packetizer),
            server.sessions().clone(),
            server.udp().clone(),
            self.config.max_buffer_size,
        );
        let mount = server.publish(Mount::new(camera.clone(), fanout));
        let url = server.access_url(&mount);

        tracing::info!(camera = %camera.name, %url, "play the stream using URL");
        Some(StreamEntry {
            camera: camera.name,
            bridge,
            url,
        })
    }

    /// Request the running loop to exit. Does not tear anything down.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Handle for stopping [`run`](Self::run) from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Tear everything down: server and sessions first (detaching every
    /// consumer), then the bridges and their producers, then the event
    /// loop. Idempotent; also run on drop.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.run_state.request_stop();

        if let Some(server) = self.server.take() {
            server.borrow_mut().close();
            tracing::debug!("RTSP server released");
        }

        for stream in self.streams.drain(..) {
            stream.bridge.borrow_mut().close();
            tracing::debug!(camera = %stream.camera, "bridge released");
        }
        // Registered but never started.
        self.producers.clear();

        if let Some(event_loop) = self.event_loop.take() {
            event_loop.reclaim();
        }
        tracing::info!("camera server shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn stream_urls(&self) -> Vec<String> {
        self.streams.iter().map(|s| s.url.clone()).collect()
    }

    /// Address the RTSP listener is bound to, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.borrow().local_addr())
    }

    pub fn bridge_stats(&self, camera: &str) -> Option<BridgeStats> {
        self.streams
            .iter()
            .find(|s| s.camera == camera)
            .map(|s| s.bridge.borrow().stats())
    }

    pub fn viewers(&self) -> Vec<Viewer> {
        self.server
            .as_ref()
            .map(|s| s.borrow().get_viewers())
            .unwrap_or_default()
    }
}

impl Drop for CameraServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Weak;
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::config::CameraConfig;
    use crate::producer::{FrameFeeder, FrameSink, PushProducer};

    fn local_config() -> ServerConfig {
        ServerConfig::default()
            .bind_host("127.0.0.1")
            .rtsp_port(0)
            .poll_interval(Duration::from_millis(5))
    }

    fn push_camera(name: &str) -> (Box<dyn FrameProducer>, FrameFeeder) {
        let (producer, feeder) = PushProducer::new(CameraConfig::new(name));
        (Box::new(producer), feeder)
    }

    struct FailingProducer(CameraConfig);

    impl FrameProducer for FailingProducer {
        fn camera(&self) -> &CameraConfig {
            &self.0
        }

        fn start(&mut self, _sink: FrameSink) -> Result<()> {
            Err(Error::Producer {
                camera: self.0.name.clone(),
                reason: "device busy".to_string(),
            })
        }

        fn stop(&mut self) {}
    }

    #[test]
    fn second_run_is_a_no_op() {
        let mut server = CameraServer::new(local_config());
        let (cam0, _f0) = push_camera("cam0");
        let (cam1, _f1) = push_camera("cam1");
        server.add_camera(cam0).unwrap();
        server.add_camera(cam1).unwrap();

        server.stop();
        server.run().unwrap();
        let addr = server.local_addr().unwrap();
        assert_eq!(server.stream_count(), 2);

        server.run().unwrap();
        assert_eq!(server.stream_count(), 2);
        assert_eq!(server.local_addr(), Some(addr));

        let urls = server.stream_urls();
        assert!(urls.contains(&format!("rtsp://127.0.0.1:{}/cam0", addr.port())));
        assert!(urls.contains(&format!("rtsp://127.0.0.1:{}/cam1", addr.port())));
    }

    #[test]
    fn stop_from_another_thread_unblocks_run() {
        let mut server = CameraServer::new(local_config());
        let (cam0, feeder) = push_camera("cam0");
        server.add_camera(cam0).unwrap();

        let stop = server.stop_handle();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            stop.stop();
        });

        let started = Instant::now();
        server.run().unwrap();
        stopper.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(feeder.is_connected());

        let bridge: Weak<RefCell<FrameBridge>> = Rc::downgrade(&server.streams[0].bridge);
        server.shutdown();
        server.shutdown();
        assert!(server.is_shut_down());

        assert!(bridge.upgrade().is_none());
        assert!(!feeder.is_connected());
        assert!(!feeder.push(vec![0, 0, 0, 1, 0x65]));
        assert_eq!(server.stream_count(), 0);
        assert!(matches!(server.run(), Err(Error::Closed)));
    }

    #[test]
    fn duplicate_camera_is_rejected() {
        let mut server = CameraServer::new(local_config());
        let (a, _fa) = push_camera("cam0");
        let (b, _fb) = push_camera("/cam0");
        server.add_camera(a).unwrap();
        match server.add_camera(b) {
            Err(Error::DuplicateCamera(name)) => assert_eq!(name, "/cam0"),
            other => panic!("expected duplicate error, got {other:?}"),
        }
    }

    #[test]
    fn cameras_cannot_be_added_while_running() {
        let mut server = CameraServer::new(local_config());
        server.stop();
        server.run().unwrap();
        let (cam, _feeder) = push_camera("late");
        assert!(matches!(server.add_camera(cam), Err(Error::AlreadyRunning)));
    }

    #[test]
    fn bind_conflict_surfaces_as_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut server = CameraServer::new(local_config().rtsp_port(port));
        let (cam0, feeder) = push_camera("cam0");
        server.add_camera(cam0).unwrap();
        server.stop();

        assert!(matches!(server.run(), Err(Error::Bind { .. })));
        assert!(server.local_addr().is_none());
        assert!(!feeder.is_connected());
    }

    #[test]
    fn failed_producer_is_skipped() {
        let mut server = CameraServer::new(local_config());
        server
            .add_camera(Box::new(FailingProducer(CameraConfig::new("broken"))))
            .unwrap();
        let (cam, _feeder) = push_camera("cam0");
        server.add_camera(cam).unwrap();

        server.stop();
        server.run().unwrap();
        assert_eq!(server.stream_count(), 1);
        assert!(server.bridge_stats("cam0").is_some());
        assert!(server.bridge_stats("broken").is_none());
    }
}

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::config::CameraConfig;
use crate::fanout::StreamFanout;

/// A published camera stream, reachable at `rtsp://host:port/<name>`.
///
/// Routes RTSP-level events (SETUP, PLAY, PAUSE, TEARDOWN) to the camera's
/// [`StreamFanout`] and exposes the codec details DESCRIBE needs.
pub struct Mount {
    path: String,
    camera: CameraConfig,
    fanout: Rc<RefCell<StreamFanout>>,
}

impl Mount {
    pub fn new(camera: CameraConfig, fanout: Rc<RefCell<StreamFanout>>) -> Self {
        Self {
            path: camera.mount_path(),
            camera,
            fanout,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn camera(&self) -> &CameraConfig {
        &self.camera
    }

    pub fn payload_type(&self) -> u8 {
        self.fanout.borrow().packetizer().payload_type()
    }

    pub fn sdp_attributes(&self) -> Vec<String> {
        self.fanout.borrow().packetizer().sdp_attributes()
    }

    pub fn next_sequence(&self) -> u16 {
        self.fanout.borrow().packetizer().next_sequence()
    }

    pub fn next_rtp_timestamp(&self) -> u32 {
        self.fanout.borrow().packetizer().next_rtp_timestamp()
    }

    /// Called during SETUP.
    pub fn subscribe(&self, session_id: &str) {
        self.fanout.borrow_mut().subscribe(session_id);
    }

    /// Called during TEARDOWN or when the owning connection drops.
    pub fn unsubscribe(&self, session_id: &str) {
        self.fanout.borrow_mut().unsubscribe(session_id);
    }

    pub fn subscribed_session_ids(&self) -> Vec<String> {
        self.fanout.borrow().subscribed_session_ids()
    }

    /// Re-evaluate whether frames should flow after a session changed state.
    pub fn refresh_delivery(&self) {
        self.fanout.borrow_mut().refresh();
    }

    pub fn close(&self) {
        self.fanout.borrow_mut().close();
    }
}

/// Published streams keyed by mount path.
///
/// Shared between the server and every connection handler on the
/// event-loop thread.
#[derive(Clone, Default)]
pub struct MountRegistry {
    mounts: Rc<RefCell<HashMap<String, Rc<Mount>>>>,
}

impl MountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mount, replacing (and closing) any previous one at the
    /// same path.
    pub fn add(&self, mount: Mount) -> Rc<Mount> {
        let mount = Rc::new(mount);
        let previous = self
            .mounts
            .borrow_mut()
            .insert(mount.path().to_string(), mount.clone());
        if let Some(previous) = previous {
            tracing::warn!(path = %mount.path(), "replacing existing mount");
            previous.close();
        }
        tracing::debug!(path = %mount.path(), "mount registered");
        mount
    }

    pub fn get(&self, path: &str) -> Option<Rc<Mount>> {
        self.mounts.borrow().get(path).cloned()
    }

    /// Resolve the mount addressed by an RTSP request URI.
    pub fn resolve_from_uri(&self, uri: &str) -> Option<Rc<Mount>> {
        self.get(extract_mount_path(uri))
    }

    pub fn len(&self) -> usize {
        self.mounts.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.borrow().is_empty()
    }

    pub fn all(&self) -> Vec<Rc<Mount>> {
        self.mounts.borrow().values().cloned().collect()
    }

    pub fn unsubscribe_all(&self, session_id: &str) {
        for mount in self.all() {
            mount.unsubscribe(session_id);
        }
    }

    /// Detach every mount from its bridge and forget it.
    pub fn close_all(&self) {
        let mounts: Vec<Rc<Mount>> = self.mounts.borrow_mut().drain().map(|(_, m)| m).collect();
        for mount in &mounts {
            mount.close();
        }
        tracing::debug!(closed = mounts.len(), "mounts closed");
    }
}

/// Mount path addressed by an RTSP URI.
///
/// `rtsp://host:8554/cam0/track1` → `/cam0`
/// `rtsp://host:8554/cam0`        → `/cam0`
/// `rtsp://host:8554`             → `/`
/// `/cam0`                        → `/cam0`
/// `*`                            → `*`
pub fn extract_mount_path(uri: &str) -> &str {
    let path = if let Some(after) = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
        .or_else(|| uri.strip_prefix("http://"))
    {
        match after.find('/') {
            Some(slash) => &after[slash..],
            None => "/",
        }
    } else {
        uri
    };

    let path = path.split(['?', '#']).next().unwrap_or(path);
    let path = match path.rsplit_once('/') {
        Some((parent, last)) if !parent.is_empty() && is_track_segment(last) => parent,
        _ => path,
    };
    match path.strip_suffix('/') {
        Some(trimmed) if !trimmed.is_empty() => trimmed,
        _ => path,
    }
}

fn is_track_segment(segment: &str) -> bool {
    segment
        .strip_prefix("track")
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::FrameBridge;
    use crate::event_loop::EventLoop;
    use crate::media::h264::H264Packetizer;
    use crate::producer::PushProducer;
    use crate::session::SessionManager;
    use crate::transport::UdpTransport;
    use std::time::Duration;

    fn mount(event_loop: &EventLoop, name: &str) -> (Mount, Rc<RefCell<FrameBridge>>) {
        let camera = CameraConfig::new(name);
        let (producer, _feeder) = PushProducer::new(camera.clone());
        let bridge = FrameBridge::create(Box::new(producer), event_loop, 0).unwrap();
        let fanout = StreamFanout::new(
            bridge.clone(),
            Box::new(H264Packetizer::new(96, 0x1234)),
            SessionManager::new(),
            UdpTransport::bind().unwrap(),
            1024,
        );
        (Mount::new(camera, fanout), bridge)
    }

    #[test]
    fn extract_paths() {
        assert_eq!(extract_mount_path("rtsp://localhost:8554/cam0"), "/cam0");
        assert_eq!(extract_mount_path("rtsp://10.0.0.1:8554/cam1/track1"), "/cam1");
        assert_eq!(extract_mount_path("rtsp://localhost:8554/cam0/"), "/cam0");
        assert_eq!(extract_mount_path("rtsp://localhost:8554"), "/");
        assert_eq!(extract_mount_path("/cam0"), "/cam0");
        assert_eq!(extract_mount_path("rtsp://host/tracker"), "/tracker");
        assert_eq!(extract_mount_path("*"), "*");
    }

    #[test]
    fn subscribe_is_idempotent() {
        let event_loop = EventLoop::new(Duration::from_millis(5));
        let (mount, _bridge) = mount(&event_loop, "cam0");
        assert_eq!(mount.path(), "/cam0");

        mount.subscribe("s1");
        mount.subscribe("s1");
        mount.subscribe("s2");
        assert_eq!(mount.subscribed_session_ids().len(), 2);

        mount.unsubscribe("s1");
        assert_eq!(mount.subscribed_session_ids(), vec!["s2"]);
    }

    #[test]
    fn registry_resolves_by_camera_name() {
        let event_loop = EventLoop::new(Duration::from_millis(5));
        let registry = MountRegistry::new();
        registry.add(mount(&event_loop, "cam0").0);
        registry.add(mount(&event_loop, "cam1").0);

        assert_eq!(
            registry.resolve_from_uri("rtsp://localhost:8554/cam1/track1").unwrap().path(),
            "/cam1"
        );
        assert!(registry.resolve_from_uri("rtsp://localhost:8554/other").is_none());
        assert!(registry.resolve_from_uri("rtsp://localhost:8554").is_none());
    }

    #[test]
    fn unsubscribe_all_and_close() {
        let event_loop = EventLoop::new(Duration::from_millis(5));
        let registry = MountRegistry::new();
        let (m0, bridge0) = mount(&event_loop, "cam0");
        let (m1, _bridge1) = mount(&event_loop, "cam1");
        let m0 = registry.add(m0);
        let m1 = registry.add(m1);

        m0.subscribe("sess1");
        m1.subscribe("sess1");
        registry.unsubscribe_all("sess1");
        assert!(m0.subscribed_session_ids().is_empty());
        assert!(m1.subscribed_session_ids().is_empty());

        registry.close_all();
        assert!(registry.is_empty());
        assert!(!bridge0.borrow().is_attached());
    }
}

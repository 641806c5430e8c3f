use std::sync::Arc;

use parking_lot::Mutex;

use super::FrameProducer;
use crate::bridge::FrameSink;
use crate::config::CameraConfig;
use crate::error::Result;

/// Producer driven by an external encoder.
///
/// The encoder keeps a [`FrameFeeder`] and pushes access units from
/// whatever thread it runs on. Frames pushed before the stream is started
/// (or after it is stopped) are discarded.
pub struct PushProducer {
    camera: CameraConfig,
    sink: Arc<Mutex<Option<FrameSink>>>,
}

/// Thread-safe input side of a [`PushProducer`].
#[derive(Clone)]
pub struct FrameFeeder {
    camera: String,
    sink: Arc<Mutex<Option<FrameSink>>>,
}

impl PushProducer {
    pub fn new(camera: CameraConfig) -> (Self, FrameFeeder) {
        let sink = Arc::new(Mutex::new(None));
        let feeder = FrameFeeder {
            camera: camera.name.clone(),
            sink: sink.clone(),
        };
        (Self { camera, sink }, feeder)
    }
}

impl FrameProducer for PushProducer {
    fn camera(&self) -> &CameraConfig {
        &self.camera
    }

    fn start(&mut self, sink: FrameSink) -> Result<()> {
        *self.sink.lock() = Some(sink);
        tracing::debug!(camera = %self.camera.name, "push producer connected");
        Ok(())
    }

    fn stop(&mut self) {
        if self.sink.lock().take().is_some() {
            tracing::debug!(camera = %self.camera.name, "push producer disconnected");
        }
    }
}

impl FrameFeeder {
    /// Hand one encoded access unit to the stream.
    ///
    /// Returns `true` if the frame was staged for delivery, `false` if the
    /// stream is not running or no client is currently pulling.
    pub fn push(&self, frame: Vec<u8>) -> bool {
        // Clone out so the fire happens without our lock held.
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => sink.on_encoded_frame(frame),
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.sink.lock().is_some()
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }
}

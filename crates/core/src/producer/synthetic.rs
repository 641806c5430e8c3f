use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::FrameProducer;
use crate::bridge::FrameSink;
use crate::config::CameraConfig;
use crate::error::{Error, Result};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Baseline profile, level 3.1 (`profile-level-id=42001f`).
const SPS: [u8; 8] = [0x67, 0x42, 0x00, 0x1f, 0xe9, 0x02, 0xc1, 0x2c];
const PPS: [u8; 4] = [0x68, 0xce, 0x38, 0x80];

const NAL_IDR_SLICE: u8 = 0x65;
const NAL_NON_IDR_SLICE: u8 = 0x41;

/// Keyframes carry this many times the average frame budget.
const IDR_WEIGHT: usize = 4;

/// Test-pattern H.264 encoder.
///
/// Emits Annex B access units at the camera's frame rate on a dedicated
/// thread: SPS + PPS + IDR once per second, non-IDR slices in between.
/// Slice sizes follow the configured bitrate so downstream buffering and
/// truncation behave like they would with a real encoder. Payload bytes are
/// never zero, so no start code is ever emulated inside a slice.
pub struct SyntheticProducer {
    camera: CameraConfig,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SyntheticProducer {
    pub fn new(camera: CameraConfig) -> Self {
        Self {
            camera,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl FrameProducer for SyntheticProducer {
    fn camera(&self) -> &CameraConfig {
        &self.camera
    }

    fn start(&mut self, sink: FrameSink) -> Result<()> {
        if self.worker.is_some() {
            return Err(Error::Producer {
                camera: self.camera.name.clone(),
                reason: "already started".to_string(),
            });
        }

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let camera = self.camera.clone();

        let worker = thread::Builder::new()
            .name(format!("encoder-{}", camera.name))
            .spawn(move || encode_loop(camera, sink, running))
            .map_err(|e| Error::Producer {
                camera: self.camera.name.clone(),
                reason: e.to_string(),
            })?;

        self.worker = Some(worker);
        tracing::info!(
            camera = %self.camera.name,
            bitrate_kbps = self.camera.bitrate_kbps,
            fps = self.camera.fps,
            "synthetic encoder started"
        );
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!(camera = %self.camera.name, "encoder thread panicked");
            }
            tracing::info!(camera = %self.camera.name, "synthetic encoder stopped");
        }
    }
}

impl Drop for SyntheticProducer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn encode_loop(camera: CameraConfig, sink: FrameSink, running: Arc<AtomicBool>) {
    let frame_interval = Duration::from_secs(1) / camera.fps.max(1);
    let mut next_deadline = Instant::now();
    let mut index: u64 = 0;

    while running.load(Ordering::SeqCst) {
        let frame = access_unit(&camera, index);
        let size = frame.len();
        if !sink.on_encoded_frame(frame) {
            tracing::trace!(camera = %camera.name, index, size, "frame not consumed");
        }
        index += 1;

        next_deadline += frame_interval;
        let now = Instant::now();
        if next_deadline > now {
            thread::sleep(next_deadline - now);
        } else {
            // Fell behind; resync instead of bursting.
            next_deadline = now;
        }
    }

    tracing::debug!(camera = %camera.name, frames = index, "encode loop exited");
}

/// Build the `index`-th access unit of the test pattern.
pub(crate) fn access_unit(camera: &CameraConfig, index: u64) -> Vec<u8> {
    let fps = camera.fps.max(1) as u64;
    let budget = (camera.bitrate_kbps as usize * 1000 / 8) / fps as usize;
    let keyframe = index % fps == 0;

    let weight = if keyframe { IDR_WEIGHT } else { 1 };
    let slice_len = (budget * weight).max(16);

    let mut frame =
        Vec::with_capacity(slice_len + SPS.len() + PPS.len() + 3 * START_CODE.len() + 1);
    if keyframe {
        frame.extend_from_slice(&START_CODE);
        frame.extend_from_slice(&SPS);
        frame.extend_from_slice(&START_CODE);
        frame.extend_from_slice(&PPS);
    }

    frame.extend_from_slice(&START_CODE);
    frame.push(if keyframe {
        NAL_IDR_SLICE
    } else {
        NAL_NON_IDR_SLICE
    });
    let seed = index as u8;
    frame.extend((0..slice_len).map(|i| seed.wrapping_add(i as u8) | 0x01));
    frame
}

//! Frame delivery bridge: hands encoded frames from a producer thread to the
//! single-threaded event loop.
//!
//! The producer *pushes* frames whenever its encoder finishes one; the RTSP
//! side *pulls* one frame at a time, only when it is ready to send. The bridge
//! sits between the two:
//!
//! ```text
//! encoder thread          FrameSink                 event-loop thread
//! ──────────────          ─────────                 ─────────────────
//! on_encoded_frame(buf) → lock; push_back; unlock
//!                         token.fire() ───────────▶ consumer.on_frame_available()
//!                                                    └─ request_next_frame(&mut buf)
//!                                                         lock; pop_back; unlock
//!                                                         copy ≤ capacity bytes
//! ```
//!
//! ## Delivery order
//!
//! Frames are handed over **newest first**. Under backlog the most recently
//! encoded frame wins over older ones: a live viewer gets the freshest
//! picture at the cost of strict arrival order. This is intentional; it is
//! not FIFO.
//!
//! ## Capacity
//!
//! The consumer owns a fixed [`FrameBuffer`] and the bridge only ever copies
//! into it, never replacing it. A frame longer than the buffer is truncated
//! to fit; the excess is counted and logged, and delivery carries on.
//!
//! ## Locking
//!
//! One lock per bridge guards the staging queue. It is held for a single
//! append or removal and never across the wakeup fire, so contention never
//! crosses cameras and the loop thread is never stalled behind an encoder.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::config::CameraConfig;
use crate::error::Result;
use crate::event_loop::{EventLoop, WakeupToken};
use crate::producer::FrameProducer;

/// Pull side of a bridge, notified on the loop thread when frames may be
/// available.
///
/// Wakeups are "go look" hints: spurious ones are normal and must be
/// tolerated as no-ops when [`FrameBridge::request_next_frame`] finds the
/// queue empty.
pub trait FrameConsumer {
    fn on_frame_available(&mut self);
}

/// State shared between the producer thread and the loop thread.
struct Staging {
    camera: String,
    pending: Mutex<VecDeque<Vec<u8>>>,
    awaiting: AtomicBool,
    max_pending: usize,
    received: AtomicU64,
    ignored: AtomicU64,
    dropped: AtomicU64,
}

/// Producer-side handle of a [`FrameBridge`].
///
/// `Send + Sync + Clone`; the encoder thread calls
/// [`on_encoded_frame`](Self::on_encoded_frame) for every access unit.
#[derive(Clone)]
pub struct FrameSink {
    staging: Arc<Staging>,
    token: WakeupToken,
}

impl FrameSink {
    /// Stage one encoded frame and wake the loop.
    ///
    /// No-op (returns `false`) while the consumer is not pulling, so nothing
    /// accumulates when no client is watching. With a bounded queue the
    /// oldest staged frame is discarded to make room.
    pub fn on_encoded_frame(&self, frame: Vec<u8>) -> bool {
        let staging = &self.staging;
        if !staging.awaiting.load(Ordering::Acquire) {
            staging.ignored.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let overflowed = {
            let mut pending = staging.pending.lock();
            let overflowed = staging.max_pending > 0
                && pending.len() >= staging.max_pending
                && pending.pop_front().is_some();
            pending.push_back(frame);
            overflowed
        };

        staging.received.fetch_add(1, Ordering::Relaxed);
        if overflowed {
            let dropped = staging.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                camera = %staging.camera,
                max_pending = staging.max_pending,
                dropped,
                "staging queue full, oldest frame discarded"
            );
        }

        self.token.fire();
        true
    }

    pub fn camera(&self) -> &str {
        &self.staging.camera
    }
}

/// Consumer-owned destination for frame hand-off.
///
/// Allocated once with a fixed capacity; its storage address never changes
/// for its whole life. Each hand-off overwrites the contents and metadata.
#[derive(Debug)]
pub struct FrameBuffer {
    data: Box<[u8]>,
    frame_size: usize,
    truncated: usize,
    presentation_time: Option<SystemTime>,
}

impl FrameBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            frame_size: 0,
            truncated: 0,
            presentation_time: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes of the last delivered frame (empty if nothing was delivered).
    pub fn frame(&self) -> &[u8] {
        &self.data[..self.frame_size]
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Tail bytes dropped from the last frame because it did not fit.
    pub fn num_truncated_bytes(&self) -> usize {
        self.truncated
    }

    pub fn presentation_time(&self) -> Option<SystemTime> {
        self.presentation_time
    }

    /// Address of the backing storage, stable across hand-offs.
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    fn clear(&mut self) {
        self.frame_size = 0;
        self.truncated = 0;
    }
}

/// Result of one successful hand-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Bytes copied into the consumer's buffer: `min(frame length, capacity)`.
    pub frame_size: usize,
    /// Bytes cut off the end: `frame length - frame_size`.
    pub truncated: usize,
    /// Wall-clock time of the hand-off (producers do not supply capture time).
    pub presentation_time: SystemTime,
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Frames staged by the producer.
    pub frames_received: u64,
    /// Frames offered while no consumer was pulling.
    pub frames_ignored: u64,
    /// Staged frames discarded because the queue was full.
    pub frames_dropped: u64,
    /// Frames handed to the consumer.
    pub frames_delivered: u64,
    pub truncated_frames: u64,
    pub truncated_bytes: u64,
    /// Largest frame handed over so far, before truncation.
    pub max_frame_size: usize,
    /// Frames currently staged.
    pub pending: usize,
}

/// Per-camera bridge between a [`FrameProducer`] and a [`FrameConsumer`].
///
/// Lives on the event-loop thread inside an `Rc<RefCell<_>>`; only its
/// [`FrameSink`] crosses threads.
pub struct FrameBridge {
    camera: CameraConfig,
    staging: Arc<Staging>,
    token: WakeupToken,
    event_loop: EventLoop,
    producer: Option<Box<dyn FrameProducer>>,
    consumer: Option<Weak<RefCell<dyn FrameConsumer>>>,
    current: Vec<u8>,
    max_frame_size: usize,
    delivered: u64,
    truncated_frames: u64,
    truncated_bytes: u64,
    closed: bool,
}

impl FrameBridge {
    /// Build a bridge for `producer`, register its wakeup token with
    /// `event_loop`, and start the producer.
    ///
    /// `max_pending` bounds the staging queue (0 = unbounded).
    pub fn create(
        producer: Box<dyn FrameProducer>,
        event_loop: &EventLoop,
        max_pending: usize,
    ) -> Result<Rc<RefCell<Self>>> {
        let camera = producer.camera().clone();
        let staging = Arc::new(Staging {
            camera: camera.name.clone(),
            pending: Mutex::new(VecDeque::new()),
            awaiting: AtomicBool::new(false),
            max_pending,
            received: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let bridge = Rc::new_cyclic(|weak: &Weak<RefCell<FrameBridge>>| {
            let weak = weak.clone();
            let token = event_loop.create_wakeup_token(move || {
                if let Some(bridge) = weak.upgrade() {
                    FrameBridge::dispatch_wakeup(&bridge);
                }
            });
            RefCell::new(FrameBridge {
                camera,
                staging,
                token,
                event_loop: event_loop.clone(),
                producer: Some(producer),
                consumer: None,
                current: Vec::new(),
                max_frame_size: 0,
                delivered: 0,
                truncated_frames: 0,
                truncated_bytes: 0,
                closed: false,
            })
        });

        let started = {
            let mut this = bridge.borrow_mut();
            let sink = this.frame_sink();
            tracing::info!(
                camera = %this.camera.name,
                "starting to capture and encode video from camera"
            );
            match this.producer.as_mut() {
                Some(producer) => producer.start(sink),
                None => Ok(()),
            }
        };

        if let Err(e) = started {
            bridge.borrow_mut().close();
            return Err(e);
        }

        Ok(bridge)
    }

    pub fn camera(&self) -> &CameraConfig {
        &self.camera
    }

    /// A new producer-side handle for this bridge.
    pub fn frame_sink(&self) -> FrameSink {
        FrameSink {
            staging: self.staging.clone(),
            token: self.token.clone(),
        }
    }

    /// Consumer readiness as seen by the producer thread.
    pub fn is_awaiting_data(&self) -> bool {
        self.staging.awaiting.load(Ordering::Acquire)
    }

    pub fn pending_len(&self) -> usize {
        self.staging.pending.lock().len()
    }

    /// The frame most recently dequeued, untruncated.
    pub fn current_frame(&self) -> &[u8] {
        &self.current
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_attached(&self) -> bool {
        self.consumer
            .as_ref()
            .is_some_and(|consumer| consumer.strong_count() > 0)
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            frames_received: self.staging.received.load(Ordering::Relaxed),
            frames_ignored: self.staging.ignored.load(Ordering::Relaxed),
            frames_dropped: self.staging.dropped.load(Ordering::Relaxed),
            frames_delivered: self.delivered,
            truncated_frames: self.truncated_frames,
            truncated_bytes: self.truncated_bytes,
            max_frame_size: self.max_frame_size,
            pending: self.pending_len(),
        }
    }

    /// Route wakeups to `consumer`. Replaces any previous consumer.
    pub fn attach_consumer(&mut self, consumer: Weak<RefCell<dyn FrameConsumer>>) {
        self.consumer = Some(consumer);
        tracing::debug!(camera = %self.camera.name, "consumer attached");
    }

    /// Forget the consumer and stop accepting frames.
    pub fn detach_consumer(&mut self) {
        if self.consumer.take().is_some() {
            tracing::debug!(camera = %self.camera.name, "consumer detached");
        }
        self.stop_getting_frames();
    }

    /// Fire this bridge's wakeup token from the loop thread.
    pub fn wake(&self) {
        self.token.fire();
    }

    /// Hand over at most one frame into `dest`.
    ///
    /// Marks the consumer as pulling. With an empty queue this sets the
    /// delivered size to 0 and returns `None`: nothing is ready yet, and the
    /// next staged frame will fire a wakeup. Otherwise the newest staged
    /// frame is removed and copied, truncated to `dest.capacity()`.
    ///
    /// Must only be called from the event-loop thread, with no frame of this
    /// consumer still in flight.
    pub fn request_next_frame(&mut self, dest: &mut FrameBuffer) -> Option<Delivery> {
        if self.closed {
            dest.clear();
            return None;
        }

        self.staging.awaiting.store(true, Ordering::Release);

        let Some(frame) = self.staging.pending.lock().pop_back() else {
            dest.clear();
            return None;
        };

        self.current = frame;
        let size = self.current.len();
        self.max_frame_size = self.max_frame_size.max(size);

        let capacity = dest.capacity();
        let (frame_size, truncated) = if size > capacity {
            (capacity, size - capacity)
        } else {
            (size, 0)
        };

        if truncated > 0 {
            self.truncated_frames += 1;
            self.truncated_bytes += truncated as u64;
            tracing::warn!(
                camera = %self.camera.name,
                size,
                capacity,
                truncated,
                "frame exceeds consumer buffer, truncated"
            );
        }

        let presentation_time = SystemTime::now();
        dest.data[..frame_size].copy_from_slice(&self.current[..frame_size]);
        dest.frame_size = frame_size;
        dest.truncated = truncated;
        dest.presentation_time = Some(presentation_time);
        self.delivered += 1;

        tracing::trace!(
            camera = %self.camera.name,
            frame_size,
            pending = self.pending_len(),
            "frame handed over"
        );

        Some(Delivery {
            frame_size,
            truncated,
            presentation_time,
        })
    }

    /// The consumer stopped pulling; the producer's frames become no-ops.
    pub fn stop_getting_frames(&mut self) {
        if self.staging.awaiting.swap(false, Ordering::AcqRel) {
            tracing::debug!(camera = %self.camera.name, "stop getting frames from camera");
        }
    }

    /// Stop the producer, release the wakeup token and discard staged frames.
    ///
    /// Only call once the consumer has detached. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.staging.awaiting.store(false, Ordering::Release);
        self.consumer = None;

        if let Some(mut producer) = self.producer.take() {
            producer.stop();
        }
        self.event_loop.release_wakeup_token(&self.token);

        let discarded = {
            let mut pending = self.staging.pending.lock();
            let n = pending.len();
            pending.clear();
            pending.shrink_to_fit();
            n
        };
        self.current = Vec::new();

        let stats = self.stats();
        tracing::info!(
            camera = %self.camera.name,
            delivered = stats.frames_delivered,
            dropped = stats.frames_dropped,
            truncated_frames = stats.truncated_frames,
            truncated_bytes = stats.truncated_bytes,
            max_frame_size = stats.max_frame_size,
            discarded,
            "frame bridge closed"
        );
    }

    fn dispatch_wakeup(bridge: &RefCell<FrameBridge>) {
        let consumer = match bridge.try_borrow() {
            Ok(this) if this.is_awaiting_data() => this.consumer.as_ref().and_then(Weak::upgrade),
            Ok(_) => return,
            Err(_) => return,
        };

        match consumer {
            Some(consumer) => match consumer.try_borrow_mut() {
                Ok(mut consumer) => consumer.on_frame_available(),
                // Consumer is mid-call on this thread; let it come back around.
                Err(_) => {
                    if let Ok(this) = bridge.try_borrow() {
                        this.wake();
                    }
                }
            },
            None => tracing::trace!("wakeup with no consumer attached"),
        }
    }
}

impl Drop for FrameBridge {
    fn drop(&mut self) {
        self.close();
    }
}
